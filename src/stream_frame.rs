use crate::safe_converter::PrecheckedCast;
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

/// Extracts length-prefixed protocol datagrams from a byte stream and adds
///  the prefix on the send path. Wire format: `[length: u16 BE][payload]`,
///  the length excluding the 2-byte prefix.
///
/// Partial state (a half-read prefix or an incomplete payload) is carried
///  across [`Self::put`] calls, so the caller can feed transport reads of
///  arbitrary fragmentation.
///
/// A declared length of 0 or above `max_payload` is a fatal protocol error:
///  a byte stream offers no datagram boundaries to resync on, so a corrupt
///  or adversarial length field must terminate the connection.
pub struct StreamReframer {
    max_payload: usize,
    declared_size: Option<u16>,
    accum: BytesMut,
}

impl StreamReframer {
    /// `max_payload` is the surrounding frame budget's maximum payload size;
    ///  see [`crate::config::ChannelConfig::max_frame_payload`].
    pub fn new(max_payload: usize) -> StreamReframer {
        assert!(max_payload > 0 && max_payload <= u16::MAX as usize);
        StreamReframer {
            max_payload,
            declared_size: None,
            accum: BytesMut::new(),
        }
    }

    /// Feeds newly-read stream bytes in. Fails on an invalid declared size,
    ///  even one belonging to a frame behind complete frames still buffered;
    ///  the session must be torn down in that case.
    pub fn put(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        self.accum.extend_from_slice(chunk);
        self.parse_prefix()?;
        self.validate_pending_prefixes()
    }

    fn parse_prefix(&mut self) -> anyhow::Result<()> {
        if self.declared_size.is_some() || self.accum.len() < 2 {
            return Ok(());
        }
        let declared = u16::from_be_bytes([self.accum[0], self.accum[1]]);
        Self::check_declared(declared, self.max_payload)?;
        trace!("stream frame declares {} payload bytes", declared);
        self.declared_size = Some(declared);
        Ok(())
    }

    /// Walks the length prefixes of frames queued behind the current one, so
    ///  a fatal size surfaces from [`Self::put`] as soon as it arrives.
    fn validate_pending_prefixes(&self) -> anyhow::Result<()> {
        let mut offset = match self.declared_size {
            Some(declared) => 2 + declared as usize,
            None => return Ok(()),
        };
        while self.accum.len() >= offset + 2 {
            let declared = u16::from_be_bytes([self.accum[offset], self.accum[offset + 1]]);
            Self::check_declared(declared, self.max_payload)?;
            offset += 2 + declared as usize;
        }
        Ok(())
    }

    fn check_declared(declared: u16, max_payload: usize) -> anyhow::Result<()> {
        if declared == 0 {
            bail!("embedded packet size 0 in stream frame");
        }
        if declared as usize > max_payload {
            bail!("embedded packet size {} exceeds maximum payload {}", declared, max_payload);
        }
        Ok(())
    }

    /// True iff a complete datagram is accumulated and [`Self::get`] may be
    ///  called.
    pub fn ready(&self) -> bool {
        match self.declared_size {
            Some(declared) => self.accum.len() >= 2 + declared as usize,
            None => false,
        }
    }

    /// Yields the complete datagram and resets to wait for the next prefix.
    ///  Calling this while not [`Self::ready`] is a contract violation.
    pub fn get(&mut self) -> anyhow::Result<BytesMut> {
        if !self.ready() {
            bail!("stream frame not complete");
        }
        let declared = self.declared_size.take().expect("ready implies a declared size");
        self.accum.advance(2);
        let frame = self.accum.split_to(declared as usize);

        // surplus bytes belong to the next frame; its prefix was already
        // validated on arrival, so this only shifts the parse state
        self.parse_prefix().expect("surplus prefixes were validated on arrival");
        Ok(frame)
    }

    /// Send path: writes the 2-byte length prefix followed by the payload,
    ///  matching the format [`Self::put`]/[`Self::get`] consume.
    pub fn prepend_size(&self, payload: &[u8], out: &mut BytesMut) -> anyhow::Result<()> {
        if payload.is_empty() {
            bail!("refusing to frame an empty payload");
        }
        if payload.len() > self.max_payload {
            bail!("payload of {} bytes exceeds maximum payload {}", payload.len(), self.max_payload);
        }
        out.put_u16(payload.len().prechecked_cast());
        out.put_slice(payload);
        Ok(())
    }
}
