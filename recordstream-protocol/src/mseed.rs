//! miniSEED v2 envelope inspection.
//!
//! Reads just enough of a record to delimit it and to attribute it to a
//! stream: the 48-byte fixed header plus Blockettes 100, 1000 and 1001.
//! Sample decoding is left to [`decode`].
//!
//! Fixed header layout (offsets in bytes):
//!
//! | offset | field |
//! |---|---|
//! | 0..6 | sequence number (ASCII) |
//! | 6 | data quality indicator |
//! | 8..13 / 13..15 / 15..18 / 18..20 | station / location / channel / network |
//! | 20..30 | BTIME start time |
//! | 30..32 | number of samples |
//! | 32..34 / 34..36 | sample rate factor / multiplier |
//! | 36 | activity flags |
//! | 39 | number of blockettes |
//! | 40..44 | time correction (0.0001 s) |
//! | 44..46 / 46..48 | data offset / first blockette offset |

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{ProtocolError, Result};

pub const FIXED_HEADER_LEN: usize = 48;
/// Smallest record length a Blockette 1000 may announce (2^7).
pub const MIN_RECORD_LEN: usize = 128;
/// Largest record length a Blockette 1000 may announce (2^20).
pub const MAX_RECORD_LEN: usize = 1 << 20;

const BLOCKETTE_SAMPLE_RATE: u16 = 100;
const BLOCKETTE_DATA_ONLY: u16 = 1000;
const BLOCKETTE_DATA_EXTENSION: u16 = 1001;

const ACTIVITY_TIME_CORRECTION_APPLIED: u8 = 0x02;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn u16(self, b: &[u8], at: usize) -> u16 {
        let raw = [b[at], b[at + 1]];
        match self {
            Self::Big => u16::from_be_bytes(raw),
            Self::Little => u16::from_le_bytes(raw),
        }
    }

    fn i16(self, b: &[u8], at: usize) -> i16 {
        self.u16(b, at) as i16
    }

    fn i32(self, b: &[u8], at: usize) -> i32 {
        let raw = [b[at], b[at + 1], b[at + 2], b[at + 3]];
        match self {
            Self::Big => i32::from_be_bytes(raw),
            Self::Little => i32::from_le_bytes(raw),
        }
    }

    fn f32(self, b: &[u8], at: usize) -> f32 {
        f32::from_bits(self.i32(b, at) as u32)
    }
}

/// Envelope fields of one miniSEED record.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordHeader {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub quality: u8,
    pub start_time: DateTime<Utc>,
    pub sample_count: u16,
    pub sample_rate_factor: i16,
    pub sample_rate_multiplier: i16,
    /// Sample rate from Blockette 100, which takes precedence when present.
    pub actual_sample_rate: Option<f64>,
    /// Record length from Blockette 1000.
    pub record_length: Option<usize>,
    pub byte_order: ByteOrder,
}

/// Cheap structural check of the fixed header, run before anything else.
///
/// Sequence digits, quality indicator, reserved byte and hour/minute/second
/// ranges must be plausible.
pub fn is_valid_header(data: &[u8]) -> bool {
    if data.len() < FIXED_HEADER_LEN {
        return false;
    }
    let sequence_ok = data[0..6]
        .iter()
        .all(|&b| b.is_ascii_digit() || b == b' ' || b == 0);
    sequence_ok
        && matches!(data[6], b'D' | b'R' | b'Q' | b'M')
        && (data[7] == b' ' || data[7] == 0)
        && data[24] <= 23
        && data[25] <= 59
        && data[26] <= 60
}

/// Record length announced by Blockette 1000, if the header is valid and
/// carries one within the inspected bytes.
pub fn find_record_length(data: &[u8]) -> Option<usize> {
    if !is_valid_header(data) {
        return None;
    }
    let order = detect_byte_order(data)?;
    blockettes(data, order)
        .find(|(kind, _)| *kind == BLOCKETTE_DATA_ONLY)
        .and_then(|(_, at)| record_length_at(data, at))
}

impl RecordHeader {
    /// Parse the envelope of a record.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !is_valid_header(data) {
            return Err(ProtocolError::InvalidRecord("fixed header failed validation"));
        }
        let order = detect_byte_order(data)
            .ok_or(ProtocolError::InvalidRecord("start year/day out of range"))?;

        let year = i32::from(order.u16(data, 20));
        let day = u32::from(order.u16(data, 22));
        let date = NaiveDate::from_yo_opt(year, day)
            .ok_or(ProtocolError::InvalidRecord("invalid start date"))?;
        let naive = date
            .and_hms_opt(u32::from(data[24]), u32::from(data[25]), 0)
            .ok_or(ProtocolError::InvalidRecord("invalid start time"))?;
        let mut start_time = Utc.from_utc_datetime(&naive)
            + Duration::seconds(i64::from(data[26]))
            + Duration::microseconds(i64::from(order.u16(data, 28)) * 100);

        let activity = data[36];
        let correction = order.i32(data, 40);
        if correction != 0 && activity & ACTIVITY_TIME_CORRECTION_APPLIED == 0 {
            start_time += Duration::microseconds(i64::from(correction) * 100);
        }

        let mut actual_sample_rate = None;
        let mut record_length = None;
        for (kind, at) in blockettes(data, order) {
            match kind {
                BLOCKETTE_SAMPLE_RATE if at + 8 <= data.len() => {
                    actual_sample_rate = Some(f64::from(order.f32(data, at + 4)));
                }
                BLOCKETTE_DATA_ONLY => record_length = record_length_at(data, at),
                BLOCKETTE_DATA_EXTENSION if at + 6 <= data.len() => {
                    start_time += Duration::microseconds(i64::from(data[at + 5] as i8));
                }
                _ => {}
            }
        }

        Ok(Self {
            station: text_field(&data[8..13]),
            location: text_field(&data[13..15]),
            channel: text_field(&data[15..18]),
            network: text_field(&data[18..20]),
            quality: data[6],
            start_time,
            sample_count: order.u16(data, 30),
            sample_rate_factor: order.i16(data, 32),
            sample_rate_multiplier: order.i16(data, 34),
            actual_sample_rate,
            record_length,
            byte_order: order,
        })
    }

    /// Nominal sample rate in Hz; Blockette 100 wins over factor/multiplier.
    pub fn sample_rate(&self) -> f64 {
        if let Some(rate) = self.actual_sample_rate {
            return rate;
        }
        let factor = f64::from(self.sample_rate_factor);
        let multiplier = f64::from(self.sample_rate_multiplier);
        let mut rate = if factor > 0.0 {
            factor
        } else if factor < 0.0 {
            -1.0 / factor
        } else {
            0.0
        };
        if multiplier > 0.0 {
            rate *= multiplier;
        } else if multiplier < 0.0 {
            rate = -rate / multiplier;
        }
        rate
    }

    /// Time just past the last sample: `start + samples / rate`.
    ///
    /// Records without samples or without a rate end where they start.
    /// `None` when the span does not fit in the representable time range.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        let rate = self.sample_rate();
        if rate <= 0.0 || self.sample_count == 0 {
            return Some(self.start_time);
        }
        let micros = (f64::from(self.sample_count) / rate * 1_000_000.0).round();
        if !micros.is_finite() || micros >= i64::MAX as f64 {
            return None;
        }
        self.start_time
            .checked_add_signed(Duration::microseconds(micros as i64))
    }

    /// Detection-only records carry neither a rate nor samples.
    pub fn is_end_of_detection(&self) -> bool {
        self.sample_rate_factor == 0 && self.sample_count == 0
    }

    /// Serialize a big-endian record of `record_length` bytes with this
    /// envelope, a Blockette 1000 and a zero-filled data section.
    ///
    /// Intended for simulators and tests; Blockettes 100 and 1001 are not
    /// written.
    pub fn write(&self, record_length: usize) -> Result<Vec<u8>> {
        if !record_length.is_power_of_two()
            || !(MIN_RECORD_LEN..=MAX_RECORD_LEN).contains(&record_length)
        {
            return Err(ProtocolError::InvalidRecord(
                "record length must be a power of two between 128 and 2^20",
            ));
        }

        let mut out = vec![0u8; record_length];
        out[0..6].copy_from_slice(b"000001");
        out[6] = self.quality;
        out[7] = b' ';
        put_text(&mut out[8..13], &self.station);
        put_text(&mut out[13..15], &self.location);
        put_text(&mut out[15..18], &self.channel);
        put_text(&mut out[18..20], &self.network);

        let t = self.start_time;
        let year = u16::try_from(t.year())
            .map_err(|_| ProtocolError::InvalidRecord("start year out of range"))?;
        out[20..22].copy_from_slice(&year.to_be_bytes());
        out[22..24].copy_from_slice(&(t.ordinal() as u16).to_be_bytes());
        out[24] = t.hour() as u8;
        out[25] = t.minute() as u8;
        out[26] = t.second() as u8;
        let ticks = (t.nanosecond() % 1_000_000_000) / 100_000;
        out[28..30].copy_from_slice(&(ticks as u16).to_be_bytes());

        out[30..32].copy_from_slice(&self.sample_count.to_be_bytes());
        out[32..34].copy_from_slice(&self.sample_rate_factor.to_be_bytes());
        out[34..36].copy_from_slice(&self.sample_rate_multiplier.to_be_bytes());
        out[39] = 1;
        out[44..46].copy_from_slice(&64u16.to_be_bytes());
        out[46..48].copy_from_slice(&(FIXED_HEADER_LEN as u16).to_be_bytes());

        // Blockette 1000: type, next (none), encoding, word order, length exponent
        out[48..50].copy_from_slice(&BLOCKETTE_DATA_ONLY.to_be_bytes());
        out[52] = 11;
        out[53] = 1;
        out[54] = record_length.trailing_zeros() as u8;

        Ok(out)
    }
}

/// Fully decode a record, samples included.
pub fn decode(data: &[u8]) -> Result<miniseed_rs::MseedRecord> {
    Ok(miniseed_rs::decode(data)?)
}

fn detect_byte_order(data: &[u8]) -> Option<ByteOrder> {
    [ByteOrder::Big, ByteOrder::Little]
        .into_iter()
        .find(|order| {
            let year = order.u16(data, 20);
            let day = order.u16(data, 22);
            (1900..=2100).contains(&year) && (1..=366).contains(&day)
        })
}

/// Walk the blockette chain, yielding `(type, offset)` for every blockette
/// whose 4-byte header lies inside `data`.
fn blockettes(data: &[u8], order: ByteOrder) -> impl Iterator<Item = (u16, usize)> + '_ {
    let mut next = usize::from(order.u16(data, 46));
    let mut remaining = usize::from(data[39]).max(1);
    std::iter::from_fn(move || {
        if remaining == 0 || next < FIXED_HEADER_LEN || next + 4 > data.len() {
            return None;
        }
        remaining -= 1;
        let at = next;
        let kind = order.u16(data, at);
        let following = usize::from(order.u16(data, at + 2));
        // Chains must move forward; anything else ends the walk.
        next = if following > at { following } else { 0 };
        Some((kind, at))
    })
}

fn record_length_at(data: &[u8], at: usize) -> Option<usize> {
    let exponent = u32::from(*data.get(at + 6)?);
    let length = 1usize.checked_shl(exponent)?;
    (MIN_RECORD_LEN..=MAX_RECORD_LEN)
        .contains(&length)
        .then_some(length)
}

fn text_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_owned()
}

fn put_text(dst: &mut [u8], value: &str) {
    dst.fill(b' ');
    for (d, s) in dst.iter_mut().zip(value.bytes()) {
        *d = s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(start: DateTime<Utc>, samples: u16, factor: i16, multiplier: i16) -> RecordHeader {
        RecordHeader {
            network: "XX".into(),
            station: "AAA".into(),
            location: "00".into(),
            channel: "BHZ".into(),
            quality: b'D',
            start_time: start,
            sample_count: samples,
            sample_rate_factor: factor,
            sample_rate_multiplier: multiplier,
            actual_sample_rate: None,
            record_length: Some(512),
            byte_order: ByteOrder::Big,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 30).unwrap() + Duration::milliseconds(250)
    }

    #[test]
    fn written_record_parses_back() {
        let h = header(t0(), 100, 20, 1);
        let bytes = h.write(512).unwrap();
        assert_eq!(bytes.len(), 512);
        assert!(is_valid_header(&bytes));
        assert_eq!(find_record_length(&bytes), Some(512));
        assert_eq!(RecordHeader::parse(&bytes).unwrap(), h);
    }

    #[test]
    fn end_time_uses_sample_count_over_rate() {
        let h = header(t0(), 100, 20, 1);
        assert_eq!(h.sample_rate(), 20.0);
        assert_eq!(h.end_time(), Some(t0() + Duration::seconds(5)));
    }

    #[test]
    fn sample_rate_factor_multiplier_combinations() {
        assert_eq!(header(t0(), 1, 10, 1).sample_rate(), 10.0);
        assert_eq!(header(t0(), 1, 1, -10).sample_rate(), 0.1);
        assert_eq!(header(t0(), 1, -10, 1).sample_rate(), 0.1);
        assert!((header(t0(), 1, -10, -10).sample_rate() - 0.01).abs() < 1e-12);
        assert_eq!(header(t0(), 1, 0, 0).sample_rate(), 0.0);
    }

    #[test]
    fn zero_rate_ends_at_start() {
        let h = header(t0(), 0, 0, 0);
        assert!(h.is_end_of_detection());
        assert_eq!(h.end_time(), Some(t0()));
    }

    #[test]
    fn unrepresentable_span_has_no_end() {
        let h = header(t0(), u16::MAX, -32768, -32768);
        assert!(h.sample_rate() > 0.0);
        assert_eq!(h.end_time(), None);

        let parsed = RecordHeader::parse(&h.write(512).unwrap()).unwrap();
        assert_eq!(parsed.end_time(), None);
    }

    #[test]
    fn little_endian_header_detected() {
        let mut bytes = header(t0(), 40, 40, 1).write(256).unwrap();
        for range in [20..22, 22..24, 28..30, 30..32, 32..34, 34..36, 44..46, 46..48, 48..50] {
            bytes[range].reverse();
        }
        let parsed = RecordHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.byte_order, ByteOrder::Little);
        assert_eq!(parsed.sample_count, 40);
        assert_eq!(parsed.record_length, Some(256));
        assert_eq!(parsed.start_time, t0());
    }

    #[test]
    fn time_correction_applied_unless_flagged() {
        let mut bytes = header(t0(), 1, 1, 1).write(512).unwrap();
        bytes[40..44].copy_from_slice(&10_000i32.to_be_bytes());
        let parsed = RecordHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.start_time, t0() + Duration::seconds(1));

        bytes[36] = ACTIVITY_TIME_CORRECTION_APPLIED;
        let parsed = RecordHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.start_time, t0());
    }

    #[test]
    fn blockette_100_overrides_rate() {
        let mut bytes = header(t0(), 10, 1, 1).write(512).unwrap();
        // chain B1000 -> B100 at offset 56
        bytes[39] = 2;
        bytes[50..52].copy_from_slice(&56u16.to_be_bytes());
        bytes[56..58].copy_from_slice(&100u16.to_be_bytes());
        bytes[60..64].copy_from_slice(&2.5f32.to_bits().to_be_bytes());
        let parsed = RecordHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.sample_rate(), 2.5);
        assert_eq!(parsed.end_time(), Some(t0() + Duration::seconds(4)));
    }

    #[test]
    fn invalid_headers_rejected() {
        assert!(!is_valid_header(&[0u8; 20]));

        let mut bytes = header(t0(), 1, 1, 1).write(512).unwrap();
        bytes[6] = b'X';
        assert!(!is_valid_header(&bytes));
        assert_eq!(find_record_length(&bytes), None);
        assert!(RecordHeader::parse(&bytes).is_err());

        let mut bytes = header(t0(), 1, 1, 1).write(512).unwrap();
        bytes[24] = 24;
        assert!(!is_valid_header(&bytes));
    }

    #[test]
    fn missing_blockette_1000_has_no_length() {
        let mut bytes = header(t0(), 1, 1, 1).write(512).unwrap();
        bytes[46..48].copy_from_slice(&0u16.to_be_bytes());
        assert!(is_valid_header(&bytes));
        assert_eq!(find_record_length(&bytes), None);
    }

    #[test]
    fn write_rejects_odd_lengths() {
        let h = header(t0(), 1, 1, 1);
        assert!(h.write(500).is_err());
        assert!(h.write(64).is_err());
    }
}
