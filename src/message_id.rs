use std::fmt::{Display, Formatter};

/// Identifies one control-channel message within one direction of one
///  session. Ids are assigned strictly increasing and wrap modulo 2^32.
///  Window spans are far below 2^31, so wrapping arithmetic never aliases
///  live ids.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MessageId(u32);

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MessageId {
    pub const ZERO: MessageId = MessageId(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> MessageId {
        MessageId(self.0.wrapping_add(1))
    }

    pub fn plus(&self, offset: u32) -> MessageId {
        MessageId(self.0.wrapping_add(offset))
    }

    /// Wrapping distance from `origin` to `self`. For ids inside a window
    ///  starting at `origin`, this is the slot offset.
    pub fn offset_from(&self, origin: MessageId) -> u32 {
        self.0.wrapping_sub(origin.0)
    }

    /// True iff `self` is behind `origin` in wrapping order, i.e. the
    ///  wrapping distance from `self` up to `origin` is in `(0, 2^31)`.
    pub fn is_before(&self, origin: MessageId) -> bool {
        let behind = origin.0.wrapping_sub(self.0);
        behind != 0 && behind < (1 << 31)
    }
}
