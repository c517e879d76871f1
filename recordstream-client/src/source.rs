//! Source address parsing: `host:port[?key=value&...]`.

use std::time::Duration;

use crate::error::{ClientError, Result};

pub const DEFAULT_HOST: &str = "localhost";

/// A parsed source address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Source {
    /// Completed `host:port`.
    pub addr: String,
    pub params: Vec<(String, String)>,
}

impl Source {
    /// Parse an address, filling a missing host with `localhost` and a missing
    /// port with `default_port`.
    pub fn parse(address: &str, default_port: u16) -> Result<Self> {
        let (host_port, query) = match address.split_once('?') {
            Some((hp, q)) => (hp, Some(q)),
            None => (address, None),
        };

        let params = match query {
            Some(q) => parse_query(q)?,
            None => Vec::new(),
        };

        Ok(Self {
            addr: complete_host_port(host_port.trim(), default_port),
            params,
        })
    }
}

/// `"a=1&b=2"` into key/value pairs. Empty segments are ignored.
pub fn parse_query(query: &str) -> Result<Vec<(String, String)>> {
    query
        .split('&')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .split_once('=')
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .ok_or_else(|| ClientError::Config(format!("parameter without value: {segment:?}")))
        })
        .collect()
}

fn complete_host_port(host_port: &str, default_port: u16) -> String {
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => (host_port, ""),
    };
    let host = if host.is_empty() { DEFAULT_HOST } else { host };
    if port.is_empty() {
        format!("{host}:{default_port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Seconds as a float; zero or negative disables the bound.
pub fn parse_timeout(key: &str, value: &str) -> Result<Option<Duration>> {
    let invalid = || ClientError::Config(format!("{key}: expected seconds, got {value:?}"));
    let seconds: f64 = value.parse().map_err(|_| invalid())?;
    if !seconds.is_finite() {
        return Err(invalid());
    }
    if seconds <= 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(seconds)
        .map(Some)
        .map_err(|_| invalid())
}

/// The client-facing timeout convention: `<= 0` means wait forever.
pub fn timeout_from_seconds(seconds: i64) -> Option<Duration> {
    u64::try_from(seconds)
        .ok()
        .filter(|&s| s > 0)
        .map(Duration::from_secs)
}

pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ClientError::Config(format!("{key}: expected a boolean, got {value:?}"))),
    }
}
