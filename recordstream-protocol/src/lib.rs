//! Wire-level types for SeedLink and Arclink record acquisition.
//!
//! This crate holds everything that can be tested without a socket:
//! command lines, single-line replies, SeedLink packet framing, wire
//! timestamps and miniSEED envelope inspection. The client crate drives
//! them over TCP.

pub mod command;
pub mod error;
pub mod frame;
pub mod mseed;
pub mod response;
pub mod sequence;
pub mod time;

pub use command::{ArclinkCommand, Command};
pub use error::{ProtocolError, Result};
pub use frame::RawFrame;
pub use mseed::RecordHeader;
pub use response::{Response, TransferSize};
pub use sequence::SequenceNumber;
