use std::time::Duration;

/// Errors that can occur while acquiring records.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// OS-level socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame, status line, byte count or record envelope.
    #[error("protocol error: {0}")]
    Protocol(#[from] recordstream_rs_protocol::ProtocolError),

    /// A wait exceeded the configured timeout.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The interrupt signal fired while waiting.
    #[error("interrupted")]
    Interrupted,

    /// Peer closed the connection (read returned 0 bytes).
    #[error("disconnected")]
    Disconnected,

    /// Address resolution or TCP connect failed.
    #[error("cannot connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// Server answered a command with `ERROR`.
    #[error("command rejected: {0}")]
    CommandRejected(String),

    /// Bad source address, parameter or request setup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation requires an open socket.
    #[error("not connected")]
    NotConnected,
}

impl ClientError {
    /// Whether a reconnect may cure this error.
    ///
    /// Connect failures, timeouts, EOF and OS errors are transient; protocol
    /// violations, rejections, configuration problems and interrupts are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout(_) | Self::Disconnected | Self::Connect { .. }
        )
    }
}

/// Convenience alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;
