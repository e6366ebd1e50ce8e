use crate::message_id::MessageId;
use crate::reliable_send::ReliableSend;
use crate::safe_converter::PrecheckedCast;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::VecDeque;
use tracing::trace;

/// Maximum number of ACK ids in a dedicated ACK packet. Also the capacity of
///  the re-ACK cache - the two caps are intentionally shared.
pub const MAX_ACKS_ACK_PACKET: usize = 8;

/// Maximum number of ACK ids piggybacked on a data-carrying control packet.
pub const MAX_ACKS_PIGGYBACK: usize = 4;

/// Tracks which received message ids still need to be acknowledged to the
///  peer, and which were recently acknowledged.
///
/// The peer's receive window is the authority on what was received; re-sending
///  recent ACKs from `re_acks` defends against ACK packet loss without
///  requiring the peer to retransmit data that was already delivered.
pub struct AckAggregator {
    /// Received but not yet acknowledged, FIFO.
    pending: VecDeque<MessageId>,
    /// Most recently sent ACK ids, newest first, deduplicated, bounded by
    ///  [`MAX_ACKS_ACK_PACKET`].
    re_acks: VecDeque<MessageId>,
}

impl AckAggregator {
    pub fn new() -> AckAggregator {
        AckAggregator {
            pending: VecDeque::new(),
            re_acks: VecDeque::new(),
        }
    }

    /// Records an inbound message id as needing acknowledgement. Ids already
    ///  pending are not queued twice.
    pub fn push(&mut self, id: MessageId) {
        if self.pending.contains(&id) {
            return;
        }
        self.pending.push_back(id);
    }

    /// True iff a packet sent now would carry at least one ACK id. Used to
    ///  decide whether a dedicated ACK-only packet is due when no data packet
    ///  is otherwise pending.
    pub fn acks_ready(&self) -> bool {
        !self.pending.is_empty() || !self.re_acks.is_empty()
    }

    /// True iff there are ACK ids that were never sent yet. Unlike
    ///  [`Self::acks_ready`], this goes false once everything pending was
    ///  encoded at least once - the trigger for a dedicated ACK packet,
    ///  while `re_acks` only ever ride along.
    pub fn fresh_acks_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Parses a wire ACK list: `[count: u8][id: u32 BE] * count`.
    pub fn parse(buf: &mut impl Buf) -> anyhow::Result<Vec<MessageId>> {
        let count = buf.try_get_u8()?;
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ids.push(MessageId::from_raw(buf.try_get_u32()?));
        }
        Ok(ids)
    }

    /// Parses a wire ACK list and, if `live`, frees the acknowledged slots in
    ///  the send window. `live = false` validates the list without mutating
    ///  send state. Returns the number of ids parsed.
    pub fn process(rel_send: &mut ReliableSend, buf: &mut impl Buf, live: bool) -> anyhow::Result<usize> {
        let ids = Self::parse(buf)?;
        if live {
            for &id in &ids {
                rel_send.ack(id)?;
            }
        }
        Ok(ids.len())
    }

    /// Parses a wire ACK list into the local pending queue. Receive-side
    ///  counterpart of [`Self::process`], used when the ids to acknowledge
    ///  arrive pre-encoded.
    pub fn read(&mut self, buf: &mut impl Buf) -> anyhow::Result<usize> {
        let ids = Self::parse(buf)?;
        for &id in &ids {
            self.push(id);
        }
        Ok(ids.len())
    }

    /// Wire-encodes up to the cap of ACK ids into `buf`, count prefix first.
    ///  Must be called before the packet's payload is appended.
    ///
    /// Fresh, never-sent ids from `pending` go first and move into the front
    ///  of `re_acks` (deduplicated, oldest evicted beyond capacity). If
    ///  `pending` runs out before the cap is reached, the remainder is filled
    ///  with previously-sent-but-possibly-lost ACKs from `re_acks`, skipping
    ///  the prefix that was just pushed. Returns the number of ids encoded.
    pub fn prepend(&mut self, buf: &mut BytesMut, ack_only: bool) -> usize {
        let cap = if ack_only { MAX_ACKS_ACK_PACKET } else { MAX_ACKS_PIGGYBACK };

        let mut out: Vec<MessageId> = Vec::with_capacity(cap);
        while out.len() < cap {
            match self.pending.pop_front() {
                Some(id) => out.push(id),
                None => break,
            }
        }

        for &id in &out {
            self.re_acks.retain(|&cached| cached != id);
            self.re_acks.push_front(id);
        }
        self.re_acks.truncate(MAX_ACKS_ACK_PACKET);

        // NB: out[0..n_fresh] now occupy re_acks[0..n_fresh] in reverse order
        let n_fresh = out.len();
        let mut re_ack_cursor = n_fresh;
        while out.len() < cap && re_ack_cursor < self.re_acks.len() {
            out.push(self.re_acks[re_ack_cursor]);
            re_ack_cursor += 1;
        }

        trace!("encoding {} ACK ids ({} fresh)", out.len(), n_fresh);
        buf.put_u8(out.len().prechecked_cast());
        for &id in &out {
            buf.put_u32(id.to_raw());
        }
        out.len()
    }

}

impl Default for AckAggregator {
    fn default() -> Self {
        Self::new()
    }
}
