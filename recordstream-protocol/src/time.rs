//! Timestamp formatting shared by the SeedLink `TIME` command and Arclink
//! request lines: `"YYYY,MM,DD,hh,mm,ss"`.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{ProtocolError, Result};

/// Format a timestamp for the wire. Sub-second precision is truncated.
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y,%m,%d,%H,%M,%S").to_string()
}

/// Parse a wire timestamp: `"2024,1,15,10,30,45"`.
///
/// Fields are year, month, day, hour, minute, second; hour/minute/second may
/// be omitted and default to zero.
pub fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    let invalid = || ProtocolError::InvalidTime(s.to_owned());

    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;
    if parts.len() < 3 || parts.len() > 6 {
        return Err(invalid());
    }

    let field = |i: usize| parts.get(i).copied().unwrap_or(0);
    let year = i32::try_from(parts[0]).map_err(|_| invalid())?;
    let naive = NaiveDate::from_ymd_opt(year, parts[1], parts[2])
        .and_then(|d| d.and_hms_opt(field(3), field(4), field(5)))
        .ok_or_else(invalid)?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Round a timestamp with a fractional second up to the next whole second.
///
/// The wire format has no sub-second field, so an end bound must be widened
/// rather than cut short.
pub fn ceil_to_second(time: DateTime<Utc>) -> DateTime<Utc> {
    if time.nanosecond() == 0 {
        return time;
    }
    let truncated = time.with_nanosecond(0).unwrap_or(time);
    truncated
        .checked_add_signed(Duration::seconds(1))
        .unwrap_or(truncated)
}
