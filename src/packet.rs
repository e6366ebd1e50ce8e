use crate::ack::AckAggregator;
use crate::message_id::MessageId;
use crate::session_id::SessionId64;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Parsed body of a control packet.
///
/// Layout (all integers BE):
/// ```ascii
/// 0: sender's session id (8 bytes raw)
/// 8: ACK list - count (u8) followed by count * message id (u32)
/// *: receiver's session id (8 bytes raw), present iff ACK count > 0
/// *: message id (u32), data packets only
/// *: payload, data packets only
/// ```
/// A packet whose body ends after the ACK section is a dedicated ACK packet.
#[derive(Debug, PartialEq, Eq)]
pub struct ControlPacket {
    /// The peer's session id (their cookie, echoed back to them in our
    ///  `remote_session` field).
    pub local_session: SessionId64,
    pub acks: Vec<MessageId>,
    /// Our own session id as the peer sees it; carried exactly when the ACK
    ///  list is non-empty so ACKs can be attributed to the right session.
    pub remote_session: Option<SessionId64>,
    /// Message id and payload; `None` for a dedicated ACK packet.
    pub body: Option<(MessageId, Bytes)>,
}

impl ControlPacket {
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        if self.acks.is_empty() != self.remote_session.is_none() {
            bail!("remote session id must be present exactly when the ACK list is non-empty");
        }
        if self.acks.len() > u8::MAX as usize {
            bail!("ACK list of {} ids does not fit the count byte", self.acks.len());
        }

        buf.put_slice(self.local_session.as_bytes());
        buf.put_u8(self.acks.len() as u8);
        for &id in &self.acks {
            buf.put_u32(id.to_raw());
        }
        if let Some(remote) = &self.remote_session {
            buf.put_slice(remote.as_bytes());
        }
        if let Some((id, payload)) = &self.body {
            buf.put_u32(id.to_raw());
            buf.put_slice(payload);
        }
        Ok(())
    }

    pub fn deser(buf: &mut Bytes) -> anyhow::Result<ControlPacket> {
        let local_session = Self::take_session_id(buf)?;
        let acks = AckAggregator::parse(buf)?;

        let remote_session = if acks.is_empty() {
            None
        }
        else {
            Some(Self::take_session_id(buf)?)
        };

        let body = if buf.has_remaining() {
            let id = MessageId::from_raw(buf.try_get_u32()?);
            Some((id, buf.split_to(buf.len())))
        }
        else {
            None
        };

        Ok(ControlPacket {
            local_session,
            acks,
            remote_session,
            body,
        })
    }

    fn take_session_id(buf: &mut Bytes) -> anyhow::Result<SessionId64> {
        if buf.remaining() < 8 {
            bail!("truncated session id");
        }
        SessionId64::from_bytes(&buf.split_to(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn session(tag: u8) -> SessionId64 {
        SessionId64::from_bytes(&[tag; 8]).unwrap()
    }

    #[rstest]
    #[case::data_no_acks(ControlPacket {
        local_session: session(1),
        acks: vec![],
        remote_session: None,
        body: Some((MessageId::from_raw(7), Bytes::from_static(b"hello"))),
    })]
    #[case::data_with_acks(ControlPacket {
        local_session: session(1),
        acks: vec![MessageId::from_raw(3), MessageId::from_raw(4)],
        remote_session: Some(session(2)),
        body: Some((MessageId::from_raw(8), Bytes::from_static(b"x"))),
    })]
    #[case::ack_only(ControlPacket {
        local_session: session(1),
        acks: vec![MessageId::from_raw(9)],
        remote_session: Some(session(2)),
        body: None,
    })]
    #[case::data_empty_payload(ControlPacket {
        local_session: session(1),
        acks: vec![],
        remote_session: None,
        body: Some((MessageId::ZERO, Bytes::new())),
    })]
    fn test_round_trip(#[case] original: ControlPacket) {
        let mut buf = BytesMut::new();
        original.ser(&mut buf).unwrap();
        let parsed = ControlPacket::deser(&mut buf.freeze()).unwrap();
        assert_eq!(parsed, original);
    }

    #[rstest]
    fn test_exact_wire_bytes() {
        let packet = ControlPacket {
            local_session: session(0xaa),
            acks: vec![MessageId::from_raw(5)],
            remote_session: Some(session(0xbb)),
            body: Some((MessageId::from_raw(2), Bytes::from_static(b"p"))),
        };
        let mut buf = BytesMut::new();
        packet.ser(&mut buf).unwrap();

        let mut expected = vec![0xaa; 8];
        expected.extend_from_slice(&[1, 0, 0, 0, 5]);
        expected.extend_from_slice(&[0xbb; 8]);
        expected.extend_from_slice(&[0, 0, 0, 2, b'p']);
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[rstest]
    fn test_ser_rejects_inconsistent_remote_session() {
        let mut buf = BytesMut::new();
        let missing = ControlPacket {
            local_session: session(1),
            acks: vec![MessageId::ZERO],
            remote_session: None,
            body: None,
        };
        assert!(missing.ser(&mut buf).is_err());

        let spurious = ControlPacket {
            local_session: session(1),
            acks: vec![],
            remote_session: Some(session(2)),
            body: None,
        };
        assert!(spurious.ser(&mut buf).is_err());
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::truncated_session(&[1, 2, 3])]
    #[case::truncated_ack_list(&[1, 1, 1, 1, 1, 1, 1, 1, 2, 0, 0, 0, 9])]
    fn test_deser_rejects_truncated(#[case] bytes: &[u8]) {
        assert!(ControlPacket::deser(&mut Bytes::copy_from_slice(bytes)).is_err());
    }
}
