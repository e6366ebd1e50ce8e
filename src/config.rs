use anyhow::bail;
use std::time::Duration;

/// Per-session configuration of the reliability engine.
pub struct ChannelConfig {
    /// Maximum number of in-flight message slots per direction. Must be far
    ///  below 2^31 so wrapping message ids never alias live slots.
    pub window_span: u32,

    /// Retransmit timeout assigned to a freshly sent message. Configure to
    ///  roughly 2x RTT.
    pub initial_retransmit_timeout: Duration,

    /// Upper bound for the exponential backoff applied on each
    ///  retransmission of the same message.
    pub max_retransmit_timeout: Duration,

    /// Maximum payload a stream frame may declare. This depends on the
    ///  surrounding transport's frame budget and is deliberately not a
    ///  protocol constant; align it with the configured MTU / frame budget
    ///  rather than guessing.
    pub max_frame_payload: usize,
}

impl ChannelConfig {
    /// Defaults for a datagram transport. `max_frame_payload` is sized to
    ///  comfortably hold a TLS-record-sized control payload; callers that
    ///  own a frame budget should set it explicitly.
    pub fn default_udp() -> ChannelConfig {
        ChannelConfig {
            window_span: 8,
            initial_retransmit_timeout: Duration::from_secs(2),
            max_retransmit_timeout: Duration::from_secs(16),
            max_frame_payload: 2048,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_span == 0 || self.window_span >= (1 << 31) {
            bail!("window span must be in (0, 2^31)");
        }
        if self.initial_retransmit_timeout.is_zero() {
            bail!("initial retransmit timeout must be positive");
        }
        if self.max_retransmit_timeout < self.initial_retransmit_timeout {
            bail!("maximum retransmit timeout must be >= the initial timeout");
        }
        if self.max_frame_payload == 0 || self.max_frame_payload > u16::MAX as usize {
            bail!("maximum frame payload must fit the u16 length prefix");
        }
        Ok(())
    }
}
