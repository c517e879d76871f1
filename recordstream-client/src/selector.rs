use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use recordstream_rs_protocol::RecordHeader;

/// Identity of a requested stream. Location and channel may contain `?` and
/// `*` wildcards.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl StreamKey {
    pub fn new(
        network: impl Into<String>,
        station: impl Into<String>,
        location: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            station: station.into(),
            location: location.into(),
            channel: channel.into(),
        }
    }

    /// Whether a record with the given codes belongs to this stream.
    pub fn matches(&self, network: &str, station: &str, location: &str, channel: &str) -> bool {
        self.network == network
            && self.station == station
            && wildcard_match(&self.location, location)
            && wildcard_match(&self.channel, channel)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

/// Half-open time window `[start, end)`; either bound may be unset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::new(Some(start), Some(end))
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Fill unset bounds from `default`.
    pub fn or(&self, default: &TimeWindow) -> TimeWindow {
        TimeWindow {
            start: self.start.or(default.start),
            end: self.end.or(default.end),
        }
    }
}

/// A requested stream with its own window and resume point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    pub key: StreamKey,
    pub window: TimeWindow,
    /// End time of the newest record seen for this stream.
    pub resume: Option<DateTime<Utc>>,
}

/// Requested streams keyed by [`StreamKey`].
#[derive(Clone, Debug, Default)]
pub struct SelectorSet {
    entries: BTreeMap<StreamKey, Selector>,
}

impl SelectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a stream. Returns `true` if the key was not present; an existing
    /// key keeps its resume point and takes the new window.
    pub fn insert(&mut self, key: StreamKey, window: TimeWindow) -> bool {
        match self.entries.get_mut(&key) {
            Some(existing) => {
                existing.window = window;
                false
            }
            None => {
                self.entries.insert(
                    key.clone(),
                    Selector {
                        key,
                        window,
                        resume: None,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&mut self, key: &StreamKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn get(&self, key: &StreamKey) -> Option<&Selector> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Selector> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Advance the resume point of every stream matching the record.
    /// Resume points never move backwards. Returns the number of matching
    /// streams; a record without a representable end time is ignored.
    pub fn record_received(&mut self, header: &RecordHeader) -> usize {
        let Some(end) = header.end_time() else {
            return 0;
        };
        let mut matched = 0;
        for selector in self.entries.values_mut() {
            if !selector.key.matches(
                &header.network,
                &header.station,
                &header.location,
                &header.channel,
            ) {
                continue;
            }
            matched += 1;
            if selector.resume.is_none_or(|t| t < end) {
                selector.resume = Some(end);
            }
        }
        matched
    }
}

/// Glob match with `?` (one character) and `*` (any run).
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}
