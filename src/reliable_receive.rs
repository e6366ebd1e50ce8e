use crate::message_id::MessageId;
use crate::sequence_window::SequenceWindow;
use bytes::Bytes;
use tracing::{debug, trace};

/// Classification of an inbound message. None of these are errors: stale and
///  duplicate data is a normal consequence of retransmission over an
///  unreliable transport, and a full window is backpressure.
#[derive(Debug, PartialEq, Eq)]
pub enum Accept {
    /// Newly buffered; the id must be acknowledged to the peer.
    Buffered,
    /// Already buffered but not yet delivered; acknowledge again.
    Duplicate,
    /// Behind the window - already delivered. Acknowledge again so the peer
    ///  stops retransmitting (our original ACK was evidently lost).
    Stale,
    /// Ahead of the window - the peer outran our delivery. Dropped; the peer
    ///  will retransmit once the window has advanced.
    WindowFull,
}

impl Accept {
    /// Whether the message id should be queued for acknowledgement.
    pub fn needs_ack(&self) -> bool {
        !matches!(self, Accept::WindowFull)
    }
}

/// Receive side of the reliability layer: reorders out-of-order messages and
///  hands them to the upper (TLS record) layer strictly in id order. A gap at
///  the window head blocks delivery of later-arrived messages until the gap
///  is filled by retransmission.
pub struct ReliableReceive {
    window: SequenceWindow<Bytes>,
}

impl ReliableReceive {
    pub fn new(start_id: MessageId, span: u32) -> ReliableReceive {
        ReliableReceive {
            window: SequenceWindow::new(start_id, span),
        }
    }

    pub fn head_id(&self) -> MessageId {
        self.window.head_id()
    }

    pub fn accept(&mut self, id: MessageId, payload: Bytes) -> Accept {
        if self.window.pre_window(id) {
            debug!("received message {} below the window head {} - already delivered", id, self.window.head_id());
            return Accept::Stale;
        }
        if !self.window.in_window(id) {
            debug!("received message {} beyond the window [{}, {}) - dropping", id, self.window.head_id(), self.window.head_id().plus(self.window.span()));
            return Accept::WindowFull;
        }

        let slot = self.window.slot_mut(id)
            .expect("id was checked to be in the window");
        if slot.is_some() {
            trace!("received duplicate of buffered message {}", id);
            return Accept::Duplicate;
        }
        *slot = Some(payload);
        Accept::Buffered
    }

    /// Takes the message at the window head if it has arrived, advancing the
    ///  window. Returns `None` while the head is a gap.
    pub fn next_ready(&mut self) -> Option<Bytes> {
        if !self.window.head_defined() {
            return None;
        }
        let head = self.window.head_id();
        self.window.remove(head)
            .expect("head is always inside the window")
    }

    pub fn n_buffered(&self) -> usize {
        self.window.n_defined()
    }
}
