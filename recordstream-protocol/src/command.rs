//! Text commands of the SeedLink (v3) and Arclink protocols.
//!
//! Both protocols are line based; [`Command::to_line`] and
//! [`ArclinkCommand::to_line`] produce the line without its terminator so the
//! socket layer can append its configured end-of-line marker.

use chrono::{DateTime, Utc};

use crate::error::{ProtocolError, Result};
use crate::time::format_time;

/// SeedLink client command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Hello,
    Batch,
    Station { station: String, network: String },
    Select { pattern: String },
    Data,
    Time { start: String, end: Option<String> },
    End,
    Bye,
}

impl Command {
    /// Parse a command from a text line.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');
        let mut parts = line.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| ProtocolError::InvalidCommand("empty command".into()))?;

        match keyword.to_uppercase().as_str() {
            "HELLO" => {
                reject_extra_args(&mut parts, "HELLO")?;
                Ok(Self::Hello)
            }
            "BATCH" => {
                reject_extra_args(&mut parts, "BATCH")?;
                Ok(Self::Batch)
            }
            "STATION" => {
                let station = parts.next();
                let network = parts.next();
                reject_extra_args(&mut parts, "STATION")?;
                match (station, network) {
                    (Some(station), Some(network)) => Ok(Self::Station {
                        station: station.to_owned(),
                        network: network.to_owned(),
                    }),
                    _ => Err(ProtocolError::InvalidCommand(
                        "STATION requires 'STA NET'".into(),
                    )),
                }
            }
            "SELECT" => {
                let pattern = parts.next().ok_or_else(|| {
                    ProtocolError::InvalidCommand("SELECT requires a pattern".into())
                })?;
                reject_extra_args(&mut parts, "SELECT")?;
                Ok(Self::Select {
                    pattern: pattern.to_owned(),
                })
            }
            "DATA" => Ok(Self::Data),
            "TIME" => {
                let start = parts
                    .next()
                    .ok_or_else(|| ProtocolError::InvalidCommand("TIME requires start".into()))?
                    .to_owned();
                let end = parts.next().map(|s| s.to_owned());
                reject_extra_args(&mut parts, "TIME")?;
                Ok(Self::Time { start, end })
            }
            "END" => {
                reject_extra_args(&mut parts, "END")?;
                Ok(Self::End)
            }
            "BYE" => {
                reject_extra_args(&mut parts, "BYE")?;
                Ok(Self::Bye)
            }
            _ => Err(ProtocolError::InvalidCommand(format!(
                "unknown command: {keyword:?}"
            ))),
        }
    }

    /// Build a `TIME` command from timestamps.
    pub fn time(start: &DateTime<Utc>, end: Option<&DateTime<Utc>>) -> Self {
        Self::Time {
            start: format_time(start),
            end: end.map(format_time),
        }
    }

    /// The command line without terminator.
    pub fn to_line(&self) -> String {
        match self {
            Self::Hello => "HELLO".into(),
            Self::Batch => "BATCH".into(),
            Self::Station { station, network } => format!("STATION {station} {network}"),
            Self::Select { pattern } => format!("SELECT {pattern}"),
            Self::Data => "DATA".into(),
            Self::Time { start, end } => match end {
                Some(e) => format!("TIME {start} {e}"),
                None => format!("TIME {start}"),
            },
            Self::End => "END".into(),
            Self::Bye => "BYE".into(),
        }
    }

    /// Serialize to wire bytes (`\r\n` terminated).
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}\r\n", self.to_line()).into_bytes()
    }
}

/// Arclink client command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArclinkCommand {
    Hello,
    User {
        name: String,
        password: Option<String>,
    },
    RequestWaveform,
    /// One stream line inside a `REQUEST` block.
    Stream {
        start: String,
        end: String,
        network: String,
        station: String,
        channel: String,
        location: String,
    },
    End,
    BDownload { request_id: String },
    BcDownload { request_id: String },
    Purge { request_id: String },
    Bye,
}

impl ArclinkCommand {
    /// Build a stream request line from concrete window bounds.
    pub fn stream(
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
        network: &str,
        station: &str,
        channel: &str,
        location: &str,
    ) -> Self {
        Self::Stream {
            start: format_time(start),
            end: format_time(end),
            network: network.to_owned(),
            station: station.to_owned(),
            channel: channel.to_owned(),
            location: location.to_owned(),
        }
    }

    /// Parse a command from a text line.
    ///
    /// Lines that do not start with a keyword are parsed as stream lines,
    /// which is only meaningful inside a `REQUEST` block.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(keyword) = parts.first() else {
            return Err(ProtocolError::InvalidCommand("empty command".into()));
        };

        let request_id = |name: &str| -> Result<String> {
            match parts.as_slice() {
                [_, id] => Ok((*id).to_owned()),
                _ => Err(ProtocolError::InvalidCommand(format!(
                    "{name} requires a request id"
                ))),
            }
        };

        match keyword.to_uppercase().as_str() {
            "HELLO" if parts.len() == 1 => Ok(Self::Hello),
            "USER" => match parts.as_slice() {
                [_, name] => Ok(Self::User {
                    name: (*name).to_owned(),
                    password: None,
                }),
                [_, name, password] => Ok(Self::User {
                    name: (*name).to_owned(),
                    password: Some((*password).to_owned()),
                }),
                _ => Err(ProtocolError::InvalidCommand(
                    "USER requires a name and optional password".into(),
                )),
            },
            "REQUEST" => match parts.as_slice() {
                [_, kind, format] if kind.eq_ignore_ascii_case("WAVEFORM") => {
                    if format.eq_ignore_ascii_case("format=MSEED") {
                        Ok(Self::RequestWaveform)
                    } else {
                        Err(ProtocolError::InvalidCommand(format!(
                            "unsupported waveform format: {format:?}"
                        )))
                    }
                }
                _ => Err(ProtocolError::InvalidCommand(format!(
                    "unsupported request: {line:?}"
                ))),
            },
            "END" if parts.len() == 1 => Ok(Self::End),
            "BYE" if parts.len() == 1 => Ok(Self::Bye),
            "BDOWNLOAD" => Ok(Self::BDownload {
                request_id: request_id("BDOWNLOAD")?,
            }),
            "BCDOWNLOAD" => Ok(Self::BcDownload {
                request_id: request_id("BCDOWNLOAD")?,
            }),
            "PURGE" => Ok(Self::Purge {
                request_id: request_id("PURGE")?,
            }),
            _ => match parts.as_slice() {
                [start, end, network, station, channel, location] => Ok(Self::Stream {
                    start: (*start).to_owned(),
                    end: (*end).to_owned(),
                    network: (*network).to_owned(),
                    station: (*station).to_owned(),
                    channel: (*channel).to_owned(),
                    location: (*location).to_owned(),
                }),
                _ => Err(ProtocolError::InvalidCommand(format!(
                    "unknown command: {keyword:?}"
                ))),
            },
        }
    }

    /// The command line without terminator.
    pub fn to_line(&self) -> String {
        match self {
            Self::Hello => "HELLO".into(),
            Self::User { name, password } => match password {
                Some(p) if !p.is_empty() => format!("USER {name} {p}"),
                _ => format!("USER {name}"),
            },
            Self::RequestWaveform => "REQUEST WAVEFORM format=MSEED".into(),
            Self::Stream {
                start,
                end,
                network,
                station,
                channel,
                location,
            } => {
                let location = if location.is_empty() { "." } else { location };
                format!("{start} {end} {network} {station} {channel} {location}")
            }
            Self::End => "END".into(),
            Self::BDownload { request_id } => format!("BDOWNLOAD {request_id}"),
            Self::BcDownload { request_id } => format!("BCDOWNLOAD {request_id}"),
            Self::Purge { request_id } => format!("PURGE {request_id}"),
            Self::Bye => "BYE".into(),
        }
    }

    /// Serialize to wire bytes (`\r\n` terminated).
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}\r\n", self.to_line()).into_bytes()
    }
}

fn reject_extra_args<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    command: &str,
) -> Result<()> {
    if parts.next().is_some() {
        return Err(ProtocolError::InvalidCommand(format!(
            "{command} takes no further arguments"
        )));
    }
    Ok(())
}
