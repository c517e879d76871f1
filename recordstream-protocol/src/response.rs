use crate::error::{ProtocolError, Result};

/// Literal token a server sends to reject the last command.
pub const ERROR_TOKEN: &str = "ERROR";

/// Single-line acknowledgement of a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ok,
    Error { description: String },
    End,
}

impl Response {
    /// Parse a single-line response: OK, ERROR, END.
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.eq_ignore_ascii_case("OK") {
            return Ok(Self::Ok);
        }

        if line.eq_ignore_ascii_case("END") {
            return Ok(Self::End);
        }

        if line
            .get(..ERROR_TOKEN.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(ERROR_TOKEN))
        {
            return Ok(Self::Error {
                description: line[ERROR_TOKEN.len()..].trim().to_owned(),
            });
        }

        Err(ProtocolError::InvalidResponse(format!(
            "unrecognized response: {line:?}"
        )))
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ok => b"OK\r\n".to_vec(),
            Self::Error { description } if description.is_empty() => b"ERROR\r\n".to_vec(),
            Self::Error { description } => format!("ERROR {description}\r\n").into_bytes(),
            Self::End => b"END\r\n".to_vec(),
        }
    }
}

/// Reply to an Arclink `BDOWNLOAD`/`BCDOWNLOAD` command, or a chunk header
/// in the middle of a chunked transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferSize {
    /// The server refused the download.
    Rejected,
    /// A chunk of `n` bytes follows; more chunk headers may come after it.
    Chunk(u64),
    /// The whole payload of `n` bytes follows in one block.
    Total(u64),
}

impl TransferSize {
    const CHUNK_PREFIX: &'static str = "CHUNK ";

    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line == ERROR_TOKEN {
            return Ok(Self::Rejected);
        }

        if let Some(count) = line.strip_prefix(Self::CHUNK_PREFIX) {
            return parse_count(count).map(Self::Chunk);
        }

        parse_count(line).map(Self::Total)
    }

    /// Whether the line announces a chunk (`CHUNK <n>`), regardless of
    /// whether `<n>` is valid.
    pub fn is_chunk_header(line: &str) -> bool {
        line.starts_with(Self::CHUNK_PREFIX)
    }

    pub fn to_line(&self) -> String {
        match self {
            Self::Rejected => ERROR_TOKEN.to_owned(),
            Self::Chunk(n) => format!("CHUNK {n}"),
            Self::Total(n) => n.to_string(),
        }
    }
}

fn parse_count(s: &str) -> Result<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidByteCount(s.to_owned()));
    }
    s.parse()
        .map_err(|_| ProtocolError::InvalidByteCount(s.to_owned()))
}
