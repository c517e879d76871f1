use std::time::Duration;

use recordstream_rs_protocol::mseed::{self, RecordHeader};
use recordstream_rs_protocol::SequenceNumber;

use crate::error::Result;

/// Connection state of a protocol client.
///
/// Transitions: `Idle` → `Connecting` → `Handshaking` → `Streaming` → `Closed`,
/// with `Error` after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing attempted yet, or reset by `clear`.
    Idle,
    Connecting,
    Handshaking,
    /// Handshake complete; records are being read.
    Streaming,
    /// Transfer finished or closed by the caller.
    Closed,
    /// The last attempt failed.
    Error,
}

impl ConnectionState {
    /// Returns the state name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Handshaking => "Handshaking",
            Self::Streaming => "Streaming",
            Self::Closed => "Closed",
            Self::Error => "Error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for [`SeedLinkClient`](crate::SeedLinkClient).
#[derive(Clone, Debug)]
pub struct SeedLinkConfig {
    /// Bound for each socket wait. `None` waits forever. Default: 300 seconds.
    pub timeout: Option<Duration>,
    /// Reconnects allowed per failure series. `None` = unlimited. Default: `None`.
    pub max_retries: Option<u32>,
    /// Pause before each reconnect. Default: 500 ms.
    pub retry_delay: Duration,
}

impl Default for SeedLinkConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(300)),
            max_retries: None,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// What an Arclink request does with a selector lacking a start or end time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Skip the selector with a warning.
    #[default]
    Lenient,
    /// Fail the request with a configuration error.
    Strict,
}

/// Configuration for [`ArclinkClient`](crate::ArclinkClient).
#[derive(Clone, Debug)]
pub struct ArclinkConfig {
    /// Bound for each socket wait. `None` waits forever. Default: `None`.
    pub timeout: Option<Duration>,
    /// Default: `"guest@anywhere"`.
    pub user: String,
    pub password: Option<String>,
    pub window_policy: WindowPolicy,
}

impl Default for ArclinkConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user: "guest@anywhere".to_owned(),
            password: None,
            window_policy: WindowPolicy::Lenient,
        }
    }
}

/// Configuration for [`CombinedClient`](crate::CombinedClient).
#[derive(Clone, Debug)]
pub struct CombinedConfig {
    /// Data older than `now - slink_max` is fetched from the archive. Default: 1 hour.
    pub slink_max: chrono::Duration,
}

impl Default for CombinedConfig {
    fn default() -> Self {
        Self {
            slink_max: chrono::Duration::hours(1),
        }
    }
}

/// One miniSEED record as delivered by a server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Packet sequence number, for records received over SeedLink.
    pub sequence: Option<SequenceNumber>,
    pub data: Vec<u8>,
}

impl Record {
    /// Parse the record envelope (codes, start time, rate, length).
    pub fn header(&self) -> Result<RecordHeader> {
        Ok(RecordHeader::parse(&self.data)?)
    }

    /// Decode the full record, samples included.
    pub fn decode(&self) -> Result<miniseed_rs::MseedRecord> {
        Ok(mseed::decode(&self.data)?)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
