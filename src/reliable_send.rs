use crate::message_id::MessageId;
use crate::sequence_window::SequenceWindow;
use anyhow::bail;
use bytes::BytesMut;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// One unacknowledged outgoing message: the bytes to retransmit, and the
///  deadline after which retransmission is due.
pub struct SendSlot {
    pub payload: BytesMut,
    retransmit_at: Instant,
}

impl SendSlot {
    pub fn ready_retransmit(&self, now: Instant) -> bool {
        now >= self.retransmit_at
    }

    /// Pushes the deadline back. The new deadline is always >= now.
    pub fn reset_retransmit(&mut self, now: Instant, timeout: Duration) {
        self.retransmit_at = now + timeout;
    }
}

/// Send side of the reliability layer: a sliding window of messages awaiting
///  acknowledgement. Slot lifecycle is `EMPTY -> PENDING -> ACKED (removed)`.
///
/// Retransmission policy lives with the caller: it scans [`Self::expired`],
///  resends each payload and calls [`SendSlot::reset_retransmit`] with
///  whatever timeout (e.g. exponential backoff) it chooses.
pub struct ReliableSend {
    window: SequenceWindow<SendSlot>,
    next: MessageId,
}

impl ReliableSend {
    pub fn new(start_id: MessageId, span: u32) -> ReliableSend {
        ReliableSend {
            window: SequenceWindow::new(start_id, span),
            next: start_id,
        }
    }

    pub fn head_id(&self) -> MessageId {
        self.window.head_id()
    }

    /// Id the next [`Self::send`] call will assign.
    pub fn next_id(&self) -> MessageId {
        self.next
    }

    /// True iff the send queue has room for another message. When false, the
    ///  upper layer must stall until an ACK arrives - backpressure, not an
    ///  error.
    pub fn ready(&self) -> bool {
        self.window.in_window(self.next)
    }

    /// Assigns the next id and registers an empty slot with a retransmit
    ///  deadline. The caller fills the returned slot's payload and transmits
    ///  it immediately. Fails if called while not [`Self::ready`].
    pub fn send(&mut self, now: Instant, retransmit_timeout: Duration) -> anyhow::Result<(MessageId, &mut SendSlot)> {
        if !self.ready() {
            bail!("send window full at {} (head {})", self.next, self.window.head_id());
        }
        let id = self.next;
        self.next = self.next.next();

        let slot = self.window.slot_mut(id)?;
        *slot = Some(SendSlot {
            payload: BytesMut::new(),
            retransmit_at: now + retransmit_timeout,
        });
        trace!("registered outgoing message {} for retransmission tracking", id);
        Ok((id, slot.as_mut().expect("slot was just filled")))
    }

    /// The peer confirmed receipt: frees the slot so the window can advance.
    ///  Stale ids (already acknowledged and purged) are ignored; ids the
    ///  peer cannot have seen yet are a protocol violation.
    pub fn ack(&mut self, id: MessageId) -> anyhow::Result<()> {
        if !self.window.pre_window(id) && !id.is_before(self.next) {
            bail!("peer acknowledged message {} which was never sent (next is {})", id, self.next);
        }
        if self.window.remove(id)?.is_some() {
            debug!("message {} acknowledged, {} still unacknowledged", id, self.n_unacked());
        }
        Ok(())
    }

    /// Minimum time until any pending message becomes due for
    ///  retransmission; `None` if nothing is pending. Never negative - a
    ///  deadline in the past yields `Duration::ZERO`.
    pub fn until_retransmit(&self, now: Instant) -> Option<Duration> {
        self.window
            .defined_ids()
            .filter_map(|id| self.window.get(id))
            .map(|slot| slot.retransmit_at.saturating_duration_since(now))
            .min()
    }

    /// All messages whose retransmit deadline has passed, in id order.
    pub fn expired(&mut self, now: Instant) -> impl Iterator<Item = (MessageId, &mut SendSlot)> + '_ {
        self.window
            .iter_defined_mut()
            .filter(move |(_, slot)| slot.ready_retransmit(now))
    }

    pub fn n_unacked(&self) -> usize {
        self.window.n_defined()
    }
}
