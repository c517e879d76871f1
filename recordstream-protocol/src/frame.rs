//! SeedLink packet framing: an 8-byte header (`SL` + 6 hex digit sequence)
//! followed by a 512-byte miniSEED record.

use crate::error::{ProtocolError, Result};
use crate::sequence::SequenceNumber;

pub const SIGNATURE: &[u8; 2] = b"SL";
pub const HEADER_LEN: usize = 8;
pub const PAYLOAD_LEN: usize = 512;
pub const FRAME_LEN: usize = HEADER_LEN + PAYLOAD_LEN;

/// Sent by the server instead of a packet once a requested time window is complete.
pub const TERM_TOKEN: &[u8] = b"END";
/// Sent by the server instead of a packet when the transfer fails.
pub const ERR_TOKEN: &[u8] = b"ERROR";

/// Zero-copy packet, borrows the payload from the input buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub sequence: SequenceNumber,
    pub payload: &'a [u8],
}

/// Parse a packet from at least [`FRAME_LEN`] bytes.
pub fn parse(data: &[u8]) -> Result<RawFrame<'_>> {
    if data.len() < FRAME_LEN {
        return Err(ProtocolError::FrameTooShort {
            expected: FRAME_LEN,
            actual: data.len(),
        });
    }

    if &data[0..2] != SIGNATURE.as_slice() {
        return Err(ProtocolError::InvalidSignature {
            expected: "SL",
            actual: [data[0], data[1]],
        });
    }

    let hex_str = std::str::from_utf8(&data[2..HEADER_LEN])
        .map_err(|_| ProtocolError::InvalidSequence("sequence bytes are not valid UTF-8".into()))?;
    let sequence = SequenceNumber::from_hex(hex_str)?;

    Ok(RawFrame {
        sequence,
        payload: &data[HEADER_LEN..FRAME_LEN],
    })
}

/// Write a packet from sequence number and a 512-byte record.
pub fn write(sequence: SequenceNumber, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() != PAYLOAD_LEN {
        return Err(ProtocolError::PayloadLengthMismatch {
            expected: PAYLOAD_LEN,
            actual: payload.len(),
        });
    }

    let mut frame = Vec::with_capacity(FRAME_LEN);
    frame.extend_from_slice(SIGNATURE);
    frame.extend_from_slice(sequence.to_hex().as_bytes());
    frame.extend_from_slice(payload);

    debug_assert_eq!(frame.len(), FRAME_LEN);
    Ok(frame)
}
