//! Archive-then-live record stream composed of an Arclink and a SeedLink
//! client.
//!
//! Every requested window is split at the live availability horizon
//! `H = now - slinkMax`: data before `H` is fetched from the archive, data
//! from `H` on is streamed live. The archive is drained first, so for a given
//! channel archived records always precede live ones.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures_core::Stream;
use tracing::{debug, warn};

use crate::arclink::ArclinkClient;
use crate::error::{ClientError, Result};
use crate::recordstream::RecordStream;
use crate::seedlink::SeedLinkClient;
use crate::selector::{StreamKey, TimeWindow};
use crate::socket::Interrupter;
use crate::source;
use crate::state::{CombinedConfig, ConnectionState, Record};

/// Where one requested window is served from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    pub archive: Option<TimeWindow>,
    pub live: Option<TimeWindow>,
}

/// Split `window` at `horizon`.
///
/// An unset start or a start at or after the horizon is live only; an end at
/// or before the horizon is archive only; anything else becomes
/// `[start, horizon)` from the archive and `[horizon, end)` live.
pub fn partition(window: &TimeWindow, horizon: DateTime<Utc>) -> Partition {
    match (window.start, window.end) {
        (None, _) => Partition {
            archive: None,
            live: Some(*window),
        },
        (Some(start), _) if start >= horizon => Partition {
            archive: None,
            live: Some(*window),
        },
        (_, Some(end)) if end <= horizon => Partition {
            archive: Some(*window),
            live: None,
        },
        (start, end) => Partition {
            archive: Some(TimeWindow::new(start, Some(horizon))),
            live: Some(TimeWindow::new(Some(horizon), end)),
        },
    }
}

pub struct CombinedClient {
    seedlink: SeedLinkClient,
    arclink: ArclinkClient,
    config: CombinedConfig,
    horizon: DateTime<Utc>,
    window: TimeWindow,
    requested: BTreeSet<StreamKey>,
    /// Streams added without a window, routed at the first read.
    pending: BTreeSet<StreamKey>,
    started: bool,
    archive_active: bool,
}

impl Default for CombinedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CombinedClient {
    pub fn new() -> Self {
        Self::with_config(CombinedConfig::default())
    }

    pub fn with_config(config: CombinedConfig) -> Self {
        Self::from_parts(SeedLinkClient::new(), ArclinkClient::new(), config)
    }

    /// Compose preconfigured children.
    pub fn from_parts(seedlink: SeedLinkClient, arclink: ArclinkClient, config: CombinedConfig) -> Self {
        let horizon = Utc::now()
            .checked_sub_signed(config.slink_max)
            .unwrap_or(if config.slink_max > TimeDelta::zero() {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            });
        Self {
            seedlink,
            arclink,
            config,
            horizon,
            window: TimeWindow::default(),
            requested: BTreeSet::new(),
            pending: BTreeSet::new(),
            started: false,
            archive_active: false,
        }
    }

    /// Set both servers: `<seedlink>;<arclink>[??slinkMax=<seconds>]`.
    pub fn set_source(&mut self, address: &str) -> Result<()> {
        self.set_source_at(address, Utc::now())
    }

    /// [`set_source`](Self::set_source) with the horizon taken relative to `now`.
    pub fn set_source_at(&mut self, address: &str, now: DateTime<Utc>) -> Result<()> {
        let separator = address
            .find(';')
            .ok_or_else(|| ClientError::Config(format!("expected <seedlink>;<arclink>, got {address:?}")))?;
        let (addresses, params) = match address.find("??") {
            Some(at) if at < separator => {
                return Err(ClientError::Config(format!(
                    "parameters must follow both addresses: {address:?}"
                )));
            }
            Some(at) => (&address[..at], Some(&address[at + 2..])),
            None => (address, None),
        };
        let (slink, arclink) = addresses.split_at(separator);
        let arclink = &arclink[1..];

        let mut slink_max = self.config.slink_max;
        for (key, value) in source::parse_query(params.unwrap_or(""))? {
            match key.as_str() {
                "slinkMax" => slink_max = parse_slink_max(&value)?,
                _ => warn!(parameter = %key, "ignoring unknown combined source parameter"),
            }
        }
        let horizon = now.checked_sub_signed(slink_max).ok_or_else(|| {
            ClientError::Config(format!("slinkMax: {slink_max} puts the horizon out of range"))
        })?;

        self.seedlink.set_source(slink)?;
        self.arclink.set_source(arclink)?;
        self.config.slink_max = slink_max;
        self.horizon = horizon;
        debug!(horizon = %self.horizon, "combined source set");
        Ok(())
    }

    /// Request a stream with its own window, split at the horizon now.
    pub fn add_stream_window(&mut self, key: StreamKey, window: TimeWindow) -> bool {
        let is_new = self.forget(&key);
        self.route(key, window.or(&self.window));
        is_new
    }

    /// Request a stream with the default window, split at the first read.
    pub fn add_stream(&mut self, key: StreamKey) -> bool {
        let is_new = self.forget(&key);
        if self.started {
            self.route(key, self.window);
        } else {
            self.requested.insert(key.clone());
            self.pending.insert(key);
        }
        is_new
    }

    pub fn remove_stream(&mut self, key: &StreamKey) -> bool {
        !self.forget(key)
    }

    /// Drop `key` from both children. Returns `true` if it was unknown.
    fn forget(&mut self, key: &StreamKey) -> bool {
        self.seedlink.remove_stream(key);
        self.arclink.remove_stream(key);
        self.pending.remove(key);
        !self.requested.remove(key)
    }

    fn route(&mut self, key: StreamKey, window: TimeWindow) {
        let Partition { archive, live } = partition(&window, self.horizon);
        debug!(stream = %key, ?archive, ?live, "routing stream");
        if let Some(archive) = archive {
            self.arclink.add_stream_window(key.clone(), archive);
        }
        if let Some(live) = live {
            self.seedlink.add_stream_window(key.clone(), live);
        }
        self.requested.insert(key);
    }

    pub fn set_start_time(&mut self, start: Option<DateTime<Utc>>) {
        self.window.start = start;
    }

    pub fn set_end_time(&mut self, end: Option<DateTime<Utc>>) {
        self.window.end = end;
    }

    pub fn set_time_window(&mut self, window: TimeWindow) {
        self.window = window;
    }

    pub fn set_timeout(&mut self, seconds: i64) {
        self.seedlink.set_timeout(seconds);
        self.arclink.set_timeout(seconds);
    }

    pub fn set_user(&mut self, name: &str, password: Option<&str>) {
        self.arclink.set_user(name, password);
    }

    // -- Accessors --

    /// Boundary between archive and live data.
    pub fn horizon(&self) -> DateTime<Utc> {
        self.horizon
    }

    pub fn config(&self) -> &CombinedConfig {
        &self.config
    }

    pub fn seedlink(&self) -> &SeedLinkClient {
        &self.seedlink
    }

    pub fn arclink(&self) -> &ArclinkClient {
        &self.arclink
    }

    pub fn state(&self) -> ConnectionState {
        if !self.started {
            ConnectionState::Idle
        } else if self.archive_active {
            self.arclink.state()
        } else {
            self.seedlink.state()
        }
    }

    /// Interrupts whichever child is reading.
    pub fn interrupter(&self) -> Interrupter {
        self.seedlink.interrupter().merge(self.arclink.interrupter())
    }

    // -- Reading --

    /// Archive records first, then live records.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        if !self.started {
            self.start();
        }

        if self.archive_active {
            if let Some(record) = self.arclink.next_record().await? {
                return Ok(Some(record));
            }
            debug!("archive drained, switching to SeedLink");
            self.arclink.close();
            self.archive_active = false;
        }

        self.seedlink.next_record().await
    }

    fn start(&mut self) {
        self.started = true;
        for key in std::mem::take(&mut self.pending) {
            self.route(key, self.window);
        }
        self.archive_active = !self.arclink.streams().is_empty();
        debug!(
            archive = self.arclink.streams().len(),
            live = self.seedlink.streams().len(),
            horizon = %self.horizon,
            "combined request resolved"
        );
    }

    // -- Lifecycle --

    pub fn close(&mut self) {
        self.arclink.close();
        self.seedlink.close();
    }

    pub fn reconnect(&mut self) {
        self.arclink.reconnect();
        self.seedlink.reconnect();
    }

    /// Forget streams and windows in both children; sources and horizon stay.
    pub fn clear(&mut self) {
        self.arclink.clear();
        self.seedlink.clear();
        self.window = TimeWindow::default();
        self.requested.clear();
        self.pending.clear();
        self.started = false;
        self.archive_active = false;
    }

    /// Consume the client into a [`Stream`] of records.
    pub fn into_stream(self) -> impl Stream<Item = Result<Record>> {
        crate::stream::record_stream(Box::new(self))
    }
}

#[async_trait]
impl RecordStream for CombinedClient {
    fn set_source(&mut self, address: &str) -> Result<()> {
        Self::set_source(self, address)
    }

    fn add_stream(&mut self, key: StreamKey) -> bool {
        Self::add_stream(self, key)
    }

    fn add_stream_window(&mut self, key: StreamKey, window: TimeWindow) -> bool {
        Self::add_stream_window(self, key, window)
    }

    fn remove_stream(&mut self, key: &StreamKey) -> bool {
        Self::remove_stream(self, key)
    }

    fn set_start_time(&mut self, start: Option<DateTime<Utc>>) {
        Self::set_start_time(self, start)
    }

    fn set_end_time(&mut self, end: Option<DateTime<Utc>>) {
        Self::set_end_time(self, end)
    }

    fn set_time_window(&mut self, window: TimeWindow) {
        Self::set_time_window(self, window)
    }

    fn set_timeout(&mut self, seconds: i64) {
        Self::set_timeout(self, seconds)
    }

    fn set_user(&mut self, name: &str, password: Option<&str>) {
        Self::set_user(self, name, password)
    }

    async fn next_record(&mut self) -> Result<Option<Record>> {
        Self::next_record(self).await
    }

    fn close(&mut self) {
        Self::close(self)
    }

    fn reconnect(&mut self) {
        Self::reconnect(self)
    }

    fn clear(&mut self) {
        Self::clear(self)
    }

    fn state(&self) -> ConnectionState {
        Self::state(self)
    }

    fn interrupter(&self) -> Interrupter {
        Self::interrupter(self)
    }
}

/// `slinkMax` in (fractional) seconds, kept to millisecond precision.
fn parse_slink_max(value: &str) -> Result<TimeDelta> {
    let invalid = || ClientError::Config(format!("slinkMax: expected seconds, got {value:?}"));
    let seconds: f64 = value.parse().map_err(|_| invalid())?;
    let millis = (seconds * 1000.0).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return Err(invalid());
    }
    TimeDelta::try_milliseconds(millis as i64).ok_or_else(invalid)
}
