use crate::error::{ProtocolError, Result};

/// SeedLink packet sequence number (6 hex digits on the wire).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceNumber(u32);

impl SequenceNumber {
    /// Largest value representable in a SeedLink v3 header.
    pub const MAX: u32 = 0xFF_FFFF;

    pub fn new(value: u32) -> Self {
        Self(value & Self::MAX)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Parse the header representation (6 hex digits, e.g. `"00001A"`).
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != 6 {
            return Err(ProtocolError::InvalidSequence(format!(
                "expected 6 hex chars, got {} ({hex:?})",
                hex.len()
            )));
        }
        let value = u32::from_str_radix(hex, 16)
            .map_err(|_| ProtocolError::InvalidSequence(format!("invalid hex: {hex:?}")))?;
        Ok(Self(value))
    }

    /// Serialize to 6 uppercase hex digits.
    pub fn to_hex(self) -> String {
        format!("{:06X}", self.0)
    }

    /// The sequence number that follows this one, wrapping at [`Self::MAX`].
    pub fn next(self) -> Self {
        Self((self.0 + 1) & Self::MAX)
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
