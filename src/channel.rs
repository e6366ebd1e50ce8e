use crate::ack::AckAggregator;
use crate::config::ChannelConfig;
use crate::message_id::MessageId;
use crate::packet::ControlPacket;
use crate::reliable_receive::ReliableReceive;
use crate::reliable_send::ReliableSend;
use crate::session_id::SessionId64;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Per-session reliability engine: one send window, one receive window and
///  one ACK aggregator, driven by a single control flow. Nothing here
///  blocks; waiting is expressed through [`Self::until_wakeup`].
///
/// Errors from any operation are fatal to the session: the driver must tear
///  the session down rather than continue on a protocol violation.
pub struct ControlChannel {
    config: Arc<ChannelConfig>,

    local_session: SessionId64,
    /// The peer's session id, learned from its first packet.
    remote_session: SessionId64,

    send: ReliableSend,
    receive: ReliableReceive,
    acks: AckAggregator,

    /// Current backoff timeout per unacknowledged message; entries exist
    ///  only for messages that have been retransmitted at least once.
    backoff: FxHashMap<MessageId, Duration>,
}

impl ControlChannel {
    pub fn new(config: Arc<ChannelConfig>, local_session: SessionId64) -> anyhow::Result<ControlChannel> {
        config.validate()?;
        Ok(ControlChannel {
            send: ReliableSend::new(MessageId::ZERO, config.window_span),
            receive: ReliableReceive::new(MessageId::ZERO, config.window_span),
            acks: AckAggregator::new(),
            backoff: FxHashMap::default(),
            config,
            local_session,
            remote_session: SessionId64::UNDEFINED,
        })
    }

    pub fn local_session(&self) -> SessionId64 {
        self.local_session
    }

    pub fn remote_session(&self) -> SessionId64 {
        self.remote_session
    }

    /// Backpressure signal: false means the send window is full and the
    ///  caller must hold the message until ACKs free a slot.
    pub fn ready(&self) -> bool {
        self.send.ready()
    }

    pub fn n_unacked(&self) -> usize {
        self.send.n_unacked()
    }

    /// Queues `payload` as the next outgoing control message and returns the
    ///  serialized packet to transmit. Pending ACKs are piggybacked on it.
    ///  Returns `None` when the send window is full.
    pub fn send(&mut self, now: Instant, payload: &[u8]) -> anyhow::Result<Option<Bytes>> {
        if !self.send.ready() {
            debug!("send window full, stalling message of {} bytes", payload.len());
            return Ok(None);
        }

        let id = self.send.next_id();
        let mut buf = BytesMut::new();
        buf.put_slice(self.local_session.as_bytes());
        let n_acks = self.acks.prepend(&mut buf, false);
        if n_acks > 0 {
            buf.put_slice(self.remote_session.as_bytes());
        }
        buf.put_u32(id.to_raw());
        buf.put_slice(payload);

        let (assigned_id, slot) = self.send.send(now, self.config.initial_retransmit_timeout)?;
        debug_assert_eq!(assigned_id, id);
        slot.payload = buf.clone();

        trace!("composed data packet {} with {} piggybacked ACKs", id, n_acks);
        Ok(Some(buf.freeze()))
    }

    /// Processes one inbound packet: frees acknowledged send slots, buffers
    ///  the payload for in-order delivery, and queues its id for
    ///  acknowledgement. Delivery happens via [`Self::next_delivery`].
    pub fn on_packet(&mut self, packet: ControlPacket) -> anyhow::Result<()> {
        self.check_session_ids(&packet)?;

        for &id in &packet.acks {
            self.send.ack(id)?;
            self.backoff.remove(&id);
        }

        if let Some((id, payload)) = packet.body {
            let accept = self.receive.accept(id, payload);
            // stale and duplicate ids are ACKed again: the peer only
            // retransmits because our earlier ACK was lost
            if accept.needs_ack() {
                self.acks.push(id);
            }
        }
        Ok(())
    }

    fn check_session_ids(&mut self, packet: &ControlPacket) -> anyhow::Result<()> {
        if !self.remote_session.defined() {
            if !packet.local_session.defined() {
                bail!("peer sent an undefined session id");
            }
            debug!("learned peer session id {}", packet.local_session);
            self.remote_session = packet.local_session;
        }
        else if packet.local_session != self.remote_session {
            bail!("packet session id {} does not match established peer session {}",
                packet.local_session, self.remote_session);
        }

        if let Some(echoed) = &packet.remote_session {
            // weak equality alone is not identity: a full mismatch here means
            // the packet belongs to a different (or forged) session
            if *echoed != self.local_session {
                warn!("peer echoed session id {} instead of ours", echoed);
                bail!("peer echoed a foreign session id");
            }
        }
        Ok(())
    }

    /// Next payload deliverable to the upper (TLS record) layer, strictly in
    ///  id order. Call repeatedly until `None`.
    pub fn next_delivery(&mut self) -> Option<Bytes> {
        self.receive.next_ready()
    }

    /// Collects everything due for transmission at `now`: retransmits of
    ///  expired messages (their deadlines pushed back with capped
    ///  exponential backoff) and, when fresh ACKs are pending with no data
    ///  packet to carry them, a dedicated ACK packet.
    pub fn outgoing(&mut self, now: Instant) -> Vec<Bytes> {
        let mut packets = Vec::new();

        let initial = self.config.initial_retransmit_timeout;
        let cap = self.config.max_retransmit_timeout;
        let backoff = &mut self.backoff;

        for (id, slot) in self.send.expired(now) {
            let timeout = backoff
                .get(&id)
                .map(|&prev| cap.min(prev * 2))
                .unwrap_or_else(|| cap.min(initial * 2));
            backoff.insert(id, timeout);
            slot.reset_retransmit(now, timeout);

            debug!("retransmitting message {} (next timeout {:?})", id, timeout);
            packets.push(Bytes::copy_from_slice(&slot.payload));
        }

        if self.acks.fresh_acks_pending() {
            packets.push(self.compose_ack_packet());
        }

        packets
    }

    fn compose_ack_packet(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(self.local_session.as_bytes());
        let n = self.acks.prepend(&mut buf, true);
        debug_assert!(n > 0);
        buf.put_slice(self.remote_session.as_bytes());
        trace!("composed dedicated ACK packet with {} ids", n);
        buf.freeze()
    }

    /// Time until the next retransmit deadline; `None` when nothing is
    ///  pending. The driver's timer schedules its wakeup from this.
    pub fn until_wakeup(&self, now: Instant) -> Option<Duration> {
        self.send.until_retransmit(now)
    }

    /// True iff [`Self::outgoing`] would emit a dedicated ACK packet.
    pub fn ack_packet_due(&self) -> bool {
        self.acks.fresh_acks_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const INITIAL: Duration = Duration::from_millis(100);

    fn config() -> Arc<ChannelConfig> {
        Arc::new(ChannelConfig {
            window_span: 8,
            initial_retransmit_timeout: INITIAL,
            max_retransmit_timeout: Duration::from_millis(400),
            max_frame_payload: 2048,
        })
    }

    fn session(tag: u8) -> SessionId64 {
        SessionId64::from_bytes(&[tag; 8]).unwrap()
    }

    fn channel(tag: u8) -> ControlChannel {
        ControlChannel::new(config(), session(tag)).unwrap()
    }

    fn parse(buf: Bytes) -> ControlPacket {
        let mut buf = buf;
        ControlPacket::deser(&mut buf).unwrap()
    }

    #[rstest]
    fn test_new_rejects_invalid_config() {
        let config = Arc::new(ChannelConfig {
            window_span: 0,
            initial_retransmit_timeout: INITIAL,
            max_retransmit_timeout: Duration::from_millis(400),
            max_frame_payload: 2048,
        });
        assert!(ControlChannel::new(config, session(1)).is_err());
    }

    #[rstest]
    fn test_send_composes_data_packet() {
        let mut ch = channel(1);
        let now = Instant::now();

        let packet = parse(ch.send(now, b"hello").unwrap().unwrap());
        assert_eq!(packet.local_session, session(1));
        assert!(packet.acks.is_empty());
        assert_eq!(packet.body, Some((MessageId::ZERO, Bytes::from_static(b"hello"))));
        assert_eq!(ch.n_unacked(), 1);
    }

    #[rstest]
    fn test_send_backpressure() {
        let mut ch = channel(1);
        let now = Instant::now();
        for _ in 0..8 {
            assert!(ch.send(now, b"m").unwrap().is_some());
        }
        assert!(!ch.ready());
        assert!(ch.send(now, b"overflow").unwrap().is_none());
    }

    #[rstest]
    fn test_round_trip_between_two_channels() {
        let mut a = channel(1);
        let mut b = channel(2);
        let now = Instant::now();

        let wire = a.send(now, b"handshake").unwrap().unwrap();
        b.on_packet(parse(wire)).unwrap();
        assert_eq!(b.next_delivery(), Some(Bytes::from_static(b"handshake")));
        assert_eq!(b.remote_session(), session(1));

        // b's reply piggybacks the ACK for a's message
        let reply = parse(b.send(now, b"reply").unwrap().unwrap());
        assert_eq!(reply.acks, vec![MessageId::ZERO]);
        assert_eq!(reply.remote_session, Some(session(1)));

        a.on_packet(reply).unwrap();
        assert_eq!(a.n_unacked(), 0);
        assert_eq!(a.next_delivery(), Some(Bytes::from_static(b"reply")));
    }

    #[rstest]
    fn test_ack_only_packet_when_no_data_due() {
        let mut a = channel(1);
        let mut b = channel(2);
        let now = Instant::now();

        let wire = a.send(now, b"data").unwrap().unwrap();
        b.on_packet(parse(wire)).unwrap();

        assert!(b.ack_packet_due());
        let outgoing = b.outgoing(now);
        assert_eq!(outgoing.len(), 1);

        let ack_packet = parse(outgoing[0].clone());
        assert_eq!(ack_packet.body, None);
        assert_eq!(ack_packet.acks, vec![MessageId::ZERO]);
        assert_eq!(ack_packet.remote_session, Some(session(1)));

        a.on_packet(ack_packet).unwrap();
        assert_eq!(a.n_unacked(), 0);

        // no fresh ACKs left: nothing more to emit
        assert!(!b.ack_packet_due());
        assert!(b.outgoing(now).is_empty());
    }

    #[rstest]
    fn test_retransmit_with_backoff_cap() {
        let mut ch = channel(1);
        let now = Instant::now();
        let wire = ch.send(now, b"m").unwrap().unwrap();

        // not yet due
        assert!(ch.outgoing(now).is_empty());
        assert_eq!(ch.until_wakeup(now), Some(INITIAL));

        let mut t = now + INITIAL;
        let retransmits = ch.outgoing(t);
        assert_eq!(retransmits.len(), 1);
        assert_eq!(retransmits[0], wire);

        // deadlines double per retransmission: 200, 400, then capped at 400
        for expected_millis in [200u64, 400, 400] {
            assert_eq!(ch.until_wakeup(t), Some(Duration::from_millis(expected_millis)));
            t += Duration::from_millis(expected_millis);
            assert_eq!(ch.outgoing(t).len(), 1);
        }
    }

    #[rstest]
    fn test_ack_stops_retransmission() {
        let mut a = channel(1);
        let mut b = channel(2);
        let now = Instant::now();

        let wire = a.send(now, b"m").unwrap().unwrap();
        b.on_packet(parse(wire)).unwrap();
        a.on_packet(parse(b.outgoing(now)[0].clone())).unwrap();

        assert_eq!(a.until_wakeup(now), None);
        assert!(a.outgoing(now + INITIAL * 10).is_empty());
    }

    #[rstest]
    fn test_out_of_order_delivery_is_reordered() {
        let mut a = channel(1);
        let mut b = channel(2);
        let now = Instant::now();

        let first = a.send(now, b"first").unwrap().unwrap();
        let second = a.send(now, b"second").unwrap().unwrap();

        b.on_packet(parse(second)).unwrap();
        assert_eq!(b.next_delivery(), None);

        b.on_packet(parse(first)).unwrap();
        assert_eq!(b.next_delivery(), Some(Bytes::from_static(b"first")));
        assert_eq!(b.next_delivery(), Some(Bytes::from_static(b"second")));
    }

    #[rstest]
    fn test_duplicate_data_is_re_acked_not_redelivered() {
        let mut a = channel(1);
        let mut b = channel(2);
        let now = Instant::now();

        let wire = a.send(now, b"m").unwrap().unwrap();
        b.on_packet(parse(wire.clone())).unwrap();
        assert_eq!(b.next_delivery(), Some(Bytes::from_static(b"m")));
        b.outgoing(now); // flush the first ACK

        // retransmit arrives although the message was delivered
        b.on_packet(parse(wire)).unwrap();
        assert!(b.ack_packet_due());
        assert_eq!(b.next_delivery(), None);
    }

    #[rstest]
    fn test_peer_session_id_change_is_fatal() {
        let mut a = channel(1);
        let mut b = channel(2);
        let now = Instant::now();

        b.on_packet(parse(a.send(now, b"m").unwrap().unwrap())).unwrap();

        let mut imposter = channel(3);
        let forged = imposter.send(now, b"evil").unwrap().unwrap();
        assert!(b.on_packet(parse(forged)).is_err());
    }

    #[rstest]
    fn test_foreign_echoed_session_id_is_fatal() {
        let mut a = channel(1);
        let now = Instant::now();

        let packet = ControlPacket {
            local_session: session(2),
            acks: vec![MessageId::ZERO],
            remote_session: Some(session(9)), // not a's id
            body: None,
        };
        a.send(now, b"m").unwrap();
        assert!(a.on_packet(packet).is_err());
    }
}
