use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use futures_core::Stream;
use recordstream_rs_protocol::frame::{self, ERR_TOKEN, FRAME_LEN, TERM_TOKEN};
use recordstream_rs_protocol::mseed;
use recordstream_rs_protocol::time::ceil_to_second;
use recordstream_rs_protocol::{Command, RecordHeader, Response};
use tracing::{debug, error, info, trace, warn};

use crate::error::{ClientError, Result};
use crate::recordstream::RecordStream;
use crate::selector::{Selector, SelectorSet, StreamKey, TimeWindow};
use crate::socket::{Interrupter, Socket};
use crate::source::{self, Source};
use crate::state::{ConnectionState, Record, SeedLinkConfig};

pub const DEFAULT_PORT: u16 = 18000;

/// SeedLink v3 client delivering 512-byte records for a set of streams.
///
/// Connects lazily on the first [`next_record`](Self::next_record), negotiates
/// every requested stream and then reads packets until the server ends the
/// transmission. Transient failures (connect, timeout, EOF, OS errors) are
/// retried within the configured budget; each reconnect resumes every stream
/// one second after the end of the newest record received for it.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> recordstream_rs_client::Result<()> {
/// use recordstream_rs_client::{SeedLinkClient, StreamKey};
///
/// let mut client = SeedLinkClient::new();
/// client.set_source("geofon.gfz-potsdam.de:18000")?;
/// client.add_stream(StreamKey::new("GE", "APE", "", "BHZ"));
///
/// while let Some(record) = client.next_record().await? {
///     println!("{:?} {} bytes", record.sequence, record.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct SeedLinkClient {
    socket: Socket,
    addr: Option<String>,
    config: SeedLinkConfig,
    selectors: SelectorSet,
    window: TimeWindow,
    state: ConnectionState,
    batch: bool,
    /// A handshake completed; a closed socket now means end of stream.
    reading: bool,
    /// Reconnects spent in the current failure series.
    retries_used: u32,
}

impl Default for SeedLinkClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SeedLinkClient {
    pub fn new() -> Self {
        Self::with_config(SeedLinkConfig::default())
    }

    pub fn with_config(config: SeedLinkConfig) -> Self {
        let mut socket = Socket::new();
        socket.set_timeout(config.timeout);
        Self {
            socket,
            addr: None,
            config,
            selectors: SelectorSet::new(),
            window: TimeWindow::default(),
            state: ConnectionState::Idle,
            batch: false,
            reading: false,
            retries_used: 0,
        }
    }

    // -- Configuration --

    /// Set the server: `host:port[?timeout=<s>&retries=<n>]`.
    ///
    /// Host defaults to `localhost` and port to 18000. A negative `retries`
    /// means unlimited.
    pub fn set_source(&mut self, address: &str) -> Result<()> {
        let source = Source::parse(address, DEFAULT_PORT)?;
        for (key, value) in &source.params {
            match key.as_str() {
                "timeout" => self.config.timeout = source::parse_timeout(key, value)?,
                "retries" => {
                    let n: i64 = value.parse().map_err(|_| {
                        ClientError::Config(format!("retries: expected an integer, got {value:?}"))
                    })?;
                    self.config.max_retries = u32::try_from(n).ok();
                }
                _ => warn!(parameter = %key, "ignoring unknown SeedLink source parameter"),
            }
        }
        self.socket.set_timeout(self.config.timeout);
        debug!(addr = %source.addr, "SeedLink source set");
        self.addr = Some(source.addr);
        Ok(())
    }

    pub fn source(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    pub fn add_stream(&mut self, key: StreamKey) -> bool {
        self.selectors.insert(key, TimeWindow::default())
    }

    pub fn add_stream_window(&mut self, key: StreamKey, window: TimeWindow) -> bool {
        self.selectors.insert(key, window)
    }

    pub fn remove_stream(&mut self, key: &StreamKey) -> bool {
        self.selectors.remove(key)
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

    /// Socket timeout in seconds; zero or negative waits forever.
    pub fn set_timeout(&mut self, seconds: i64) {
        self.config.timeout = source::timeout_from_seconds(seconds);
        self.socket.set_timeout(self.config.timeout);
    }

    /// Reconnects allowed per failure series; `None` is unlimited.
    pub fn set_retries(&mut self, retries: Option<u32>) {
        self.config.max_retries = retries;
    }

    // -- Accessors --

    pub fn config(&self) -> &SeedLinkConfig {
        &self.config
    }

    pub fn streams(&self) -> &SelectorSet {
        &self.selectors
    }

    /// End time of the newest record received for `key`.
    pub fn resume_time(&self, key: &StreamKey) -> Option<DateTime<Utc>> {
        self.selectors.get(key).and_then(|s| s.resume)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the server accepted `BATCH` on the current connection.
    pub fn is_batch(&self) -> bool {
        self.batch
    }

    pub fn interrupter(&self) -> Interrupter {
        self.socket.interrupter()
    }

    // -- Reading --

    /// Next record, or `None` once the server ended the transmission.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let err = match self.read_record().await {
                Ok(record) => return Ok(record),
                Err(e) => e,
            };

            if !err.is_transient() || !self.may_retry() {
                error!(error = %err, "SeedLink read failed");
                self.socket.close();
                self.state = ConnectionState::Error;
                self.reading = false;
                self.retries_used = 0;
                return Err(err);
            }

            if self.retries_used == 0 {
                error!(error = %err, "SeedLink connection lost, reconnecting");
            } else {
                warn!(error = %err, attempt = self.retries_used + 1, "SeedLink reconnecting");
            }
            tokio::time::sleep(self.config.retry_delay).await;
            if self.socket.is_interrupted() {
                self.socket.close();
                self.state = ConnectionState::Closed;
                self.reading = false;
                return Err(ClientError::Interrupted);
            }
            self.socket.shutdown();
            self.reading = false;
            self.retries_used += 1;
        }
    }

    fn may_retry(&self) -> bool {
        self.config
            .max_retries
            .is_none_or(|max| self.retries_used < max)
    }

    async fn read_record(&mut self) -> Result<Option<Record>> {
        if self.reading && !self.socket.is_open() {
            return Ok(None);
        }
        if self.selectors.is_empty() {
            warn!("no streams requested");
            return Ok(None);
        }
        if !self.socket.is_open() {
            self.connect().await?;
        }

        loop {
            let mut packet = self.socket.read(TERM_TOKEN.len()).await?;
            if packet == TERM_TOKEN {
                debug!("end of transmission");
                self.finish();
                return Ok(None);
            }
            packet.extend(self.socket.read(ERR_TOKEN.len() - TERM_TOKEN.len()).await?);
            if packet == ERR_TOKEN {
                warn!("server reported an error, closing connection");
                self.finish();
                return Ok(None);
            }
            packet.extend(self.socket.read(FRAME_LEN - packet.len()).await?);

            let raw = match frame::parse(&packet) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "skipping malformed packet");
                    continue;
                }
            };
            if !mseed::is_valid_header(raw.payload) {
                warn!(sequence = %raw.sequence, "skipping packet with invalid miniSEED header");
                continue;
            }
            let header = match RecordHeader::parse(raw.payload) {
                Ok(header) => header,
                Err(e) => {
                    warn!(sequence = %raw.sequence, error = %e, "skipping unreadable record");
                    continue;
                }
            };

            if header.end_time().is_none() {
                warn!(
                    sequence = %raw.sequence,
                    rate = header.sample_rate(),
                    samples = header.sample_count,
                    "skipping record with unrepresentable time span"
                );
                continue;
            }

            self.selectors.record_received(&header);
            if header.is_end_of_detection() {
                trace!(sequence = %raw.sequence, "skipping end-of-detection record");
                continue;
            }

            trace!(sequence = %raw.sequence, station = %header.station, channel = %header.channel, "record");
            return Ok(Some(Record {
                sequence: Some(raw.sequence),
                data: raw.payload.to_vec(),
            }));
        }
    }

    async fn connect(&mut self) -> Result<()> {
        let addr = self
            .addr
            .clone()
            .ok_or_else(|| ClientError::Config("no SeedLink source address set".into()))?;

        self.state = ConnectionState::Connecting;
        info!(%addr, "connecting to SeedLink server");
        self.socket.open(&addr).await?;

        self.state = ConnectionState::Handshaking;
        let started = std::time::Instant::now();
        self.handshake().await?;
        debug!(elapsed = ?started.elapsed(), streams = self.selectors.len(), "SeedLink handshake done");

        self.state = ConnectionState::Streaming;
        self.reading = true;
        self.retries_used = 0;
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        self.socket.send_request(&Command::Batch.to_line(), false).await?;
        let reply = self.socket.read_line().await?;
        self.batch = matches!(Response::parse_line(&reply), Ok(Response::Ok));
        if self.batch {
            info!("BATCH mode enabled");
        } else {
            debug!(%reply, "BATCH mode not supported");
        }

        let now = Utc::now();
        let selectors: Vec<Selector> = self.selectors.iter().cloned().collect();
        for selector in &selectors {
            match self.request_stream(selector, now).await {
                Ok(()) => {}
                Err(ClientError::CommandRejected(command)) => {
                    warn!(stream = %selector.key, %command, "stream rejected, dropped for this connection");
                }
                Err(e) => return Err(e),
            }
        }

        self.socket.send_request(&Command::End.to_line(), false).await?;
        Ok(())
    }

    async fn request_stream(&mut self, selector: &Selector, now: DateTime<Utc>) -> Result<()> {
        let wait = !self.batch;
        let key = &selector.key;

        let station = Command::Station {
            station: key.station.clone(),
            network: key.network.clone(),
        };
        self.socket.send_request(&station.to_line(), wait).await?;

        let select = Command::Select {
            pattern: format!("{}{}", key.location, key.channel),
        };
        self.socket.send_request(&select.to_line(), wait).await?;

        let command = time_command(selector, &self.window, now);
        trace!(stream = %key, command = %command.to_line(), "requesting");
        self.socket.send_request(&command.to_line(), wait).await?;
        Ok(())
    }

    fn finish(&mut self) {
        self.socket.close();
        self.state = ConnectionState::Closed;
        self.retries_used = 0;
    }

    // -- Lifecycle --

    pub fn close(&mut self) {
        self.finish();
    }

    /// Drop the connection; the next read connects again and spends one retry.
    pub fn reconnect(&mut self) {
        self.socket.close();
        self.reading = false;
        self.retries_used += 1;
    }

    /// Forget streams, windows and connection state. The source address and
    /// configuration stay.
    pub fn clear(&mut self) {
        self.socket.close();
        self.selectors.clear();
        self.window = TimeWindow::default();
        self.state = ConnectionState::Idle;
        self.batch = false;
        self.reading = false;
        self.retries_used = 0;
    }

    /// Consume the client into a [`Stream`] of records.
    pub fn into_stream(self) -> impl Stream<Item = Result<Record>> {
        crate::stream::record_stream(Box::new(self))
    }
}

#[async_trait]
impl RecordStream for SeedLinkClient {
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

/// `TIME` or `DATA` for one stream, in order of preference: resume after the
/// last record, the requested start, now until a future end, or open-ended.
fn time_command(selector: &Selector, default: &TimeWindow, now: DateTime<Utc>) -> Command {
    let window = selector.window.or(default);
    let end = window.end.map(ceil_to_second);

    if let Some(resume) = selector.resume {
        let after = resume.checked_add_signed(TimeDelta::seconds(1)).unwrap_or(resume);
        Command::time(&after, end.as_ref())
    } else if let Some(start) = window.start {
        Command::time(&start, end.as_ref())
    } else if let Some(end) = end.filter(|end| *end > now) {
        Command::time(&now, Some(&end))
    } else {
        Command::Data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockServer, SeedLinkScript, Trailer, packet, record};
    use chrono::TimeZone;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn key() -> StreamKey {
        StreamKey::new("XX", "AAA", "", "BHZ")
    }

    fn client_for(server: &MockServer) -> SeedLinkClient {
        let mut client = SeedLinkClient::with_config(SeedLinkConfig {
            timeout: Some(Duration::from_secs(5)),
            max_retries: Some(0),
            retry_delay: Duration::from_millis(10),
        });
        client.set_source(&server.addr()).unwrap();
        client
    }

    fn selector(window: TimeWindow, resume: Option<DateTime<Utc>>) -> Selector {
        Selector {
            key: key(),
            window,
            resume,
        }
    }

    #[test]
    fn time_command_preference() {
        let now = t0();
        let open = TimeWindow::default();
        let hour = TimeDelta::hours(1);

        assert_eq!(time_command(&selector(open, None), &open, now), Command::Data);

        let resumed = time_command(&selector(open, Some(now - hour)), &open, now);
        assert_eq!(resumed.to_line(), "TIME 2024,04,30,23,00,01");

        let window = TimeWindow::between(now - hour, now + hour);
        assert_eq!(
            time_command(&selector(window, None), &open, now).to_line(),
            "TIME 2024,04,30,23,00,00 2024,05,01,01,00,00"
        );

        let future_end = TimeWindow::new(None, Some(now + hour));
        assert_eq!(
            time_command(&selector(open, None), &future_end, now).to_line(),
            "TIME 2024,05,01,00,00,00 2024,05,01,01,00,00"
        );

        let past_end = TimeWindow::new(None, Some(now - hour));
        assert_eq!(time_command(&selector(past_end, None), &open, now), Command::Data);
    }

    #[test]
    fn fractional_end_rounds_up() {
        let window = TimeWindow::between(t0(), t0() + TimeDelta::milliseconds(1500));
        assert_eq!(
            time_command(&selector(window, None), &TimeWindow::default(), t0()).to_line(),
            "TIME 2024,05,01,00,00,00 2024,05,01,00,00,02"
        );
    }

    #[test]
    fn source_parameters() {
        let mut client = SeedLinkClient::new();
        client.set_source("geofon?timeout=2&retries=3").unwrap();
        assert_eq!(client.source(), Some("geofon:18000"));
        assert_eq!(client.config().timeout, Some(Duration::from_secs(2)));
        assert_eq!(client.config().max_retries, Some(3));

        client.set_source(":18500?retries=-1").unwrap();
        assert_eq!(client.source(), Some("localhost:18500"));
        assert_eq!(client.config().max_retries, None);

        assert!(matches!(
            client.set_source("host?retries=many"),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            client.set_source("geofon?timeout=1e300"),
            Err(ClientError::Config(_))
        ));

        client.set_timeout(i64::MAX);
        assert_eq!(client.config().timeout, Some(Duration::from_secs(i64::MAX as u64)));
        client.set_timeout(-5);
        assert_eq!(client.config().timeout, None);
    }

    #[tokio::test]
    async fn batch_handshake_and_records() {
        let packets = vec![
            packet(1, &record("AAA", "BHZ", t0(), 100, 512)),
            packet(2, &record("AAA", "BHZ", t0() + TimeDelta::seconds(5), 100, 512)),
        ];
        let server = MockServer::seedlink(SeedLinkScript::new(packets)).await;
        let mut client = client_for(&server);
        client.add_stream(key());

        let first = client.next_record().await.unwrap().unwrap();
        assert_eq!(first.sequence.map(|s| s.value()), Some(1));
        assert_eq!(first.len(), 512);
        assert!(client.is_batch());
        assert_eq!(client.state(), ConnectionState::Streaming);

        let second = client.next_record().await.unwrap().unwrap();
        assert_eq!(second.header().unwrap().start_time, t0() + TimeDelta::seconds(5));
        assert_eq!(client.resume_time(&key()), Some(t0() + TimeDelta::seconds(10)));

        assert!(client.next_record().await.unwrap().is_none());
        assert_eq!(client.state(), ConnectionState::Closed);
        // finished transfer stays finished
        assert!(client.next_record().await.unwrap().is_none());
        assert_eq!(server.journal().connections(), 1);

        assert_eq!(
            server.journal().commands(),
            ["BATCH", "STATION AAA XX", "SELECT BHZ", "DATA", "END"]
        );
    }

    #[tokio::test]
    async fn rejected_stream_is_dropped() {
        let mut script = SeedLinkScript::new(vec![packet(7, &record("BBB", "HHZ", t0(), 10, 512))]);
        script.batch = false;
        script.reject = vec!["STATION AAA".into()];
        let server = MockServer::seedlink(script).await;

        let mut client = client_for(&server);
        client.add_stream(key());
        client.add_stream(StreamKey::new("XX", "BBB", "", "HHZ"));

        let record = client.next_record().await.unwrap().unwrap();
        assert_eq!(record.header().unwrap().station, "BBB");
        assert!(!client.is_batch());

        let commands = server.journal().commands();
        assert!(commands.contains(&"STATION BBB XX".to_owned()));
        assert_eq!(commands.last().map(String::as_str), Some("END"));
    }

    #[tokio::test]
    async fn error_token_ends_stream() {
        let mut script = SeedLinkScript::new(vec![]);
        script.trailer = Trailer::Error;
        let server = MockServer::seedlink(script).await;

        let mut client = client_for(&server);
        client.add_stream(key());
        assert!(client.next_record().await.unwrap().is_none());
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn invalid_and_detection_records_are_skipped() {
        let mut garbage = record("AAA", "BHZ", t0(), 10, 512);
        garbage[6] = b'X';
        let detection = record("AAA", "BHZ", t0(), 0, 512);
        let mut detection = detection;
        detection[32..34].copy_from_slice(&0i16.to_be_bytes());
        let good = record("AAA", "BHZ", t0(), 10, 512);

        let server = MockServer::seedlink(SeedLinkScript::new(vec![
            packet(1, &garbage),
            packet(2, &detection),
            packet(3, &good),
        ]))
        .await;
        let mut client = client_for(&server);
        client.add_stream(key());

        let record = client.next_record().await.unwrap().unwrap();
        assert_eq!(record.sequence.map(|s| s.value()), Some(3));
    }

    #[tokio::test]
    async fn record_spanning_past_time_range_is_skipped() {
        let mut extreme = record("AAA", "BHZ", t0(), u16::MAX, 512);
        extreme[32..34].copy_from_slice(&i16::MIN.to_be_bytes());
        extreme[34..36].copy_from_slice(&i16::MIN.to_be_bytes());
        let good = record("AAA", "BHZ", t0(), 10, 512);

        let server = MockServer::seedlink(SeedLinkScript::new(vec![
            packet(1, &extreme),
            packet(2, &good),
        ]))
        .await;
        let mut client = client_for(&server);
        client.add_stream(key());

        let record = client.next_record().await.unwrap().unwrap();
        assert_eq!(record.sequence.map(|s| s.value()), Some(2));
        assert_eq!(
            client.resume_time(&key()),
            Some(t0() + TimeDelta::milliseconds(500))
        );
    }

    #[tokio::test]
    async fn retries_bound_attempts() {
        let mut script = SeedLinkScript::new(vec![]);
        script.drop_on_accept = true;
        let server = MockServer::seedlink(script).await;

        let mut client = client_for(&server);
        client.set_retries(Some(2));
        client.add_stream(key());

        let err = client.next_record().await.unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert_eq!(server.journal().connections(), 3);
        assert_eq!(client.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn reconnect_resumes_after_last_record() {
        let mut script = SeedLinkScript::new(vec![packet(1, &record("AAA", "BHZ", t0(), 100, 512))]);
        script.trailer = Trailer::Close;
        let server = MockServer::seedlink(script).await;

        let mut client = client_for(&server);
        client.set_retries(Some(1));
        client.add_stream(key());

        assert!(client.next_record().await.unwrap().is_some());
        // connection closes, client reconnects and resumes at end + 1 s
        assert!(client.next_record().await.unwrap().is_some());
        assert_eq!(server.journal().connections(), 2);
        assert!(
            server
                .journal()
                .commands()
                .contains(&"TIME 2024,05,01,00,00,06".to_owned())
        );
    }

    #[tokio::test]
    async fn interrupt_stops_blocked_read() {
        let mut script = SeedLinkScript::new(vec![]);
        script.trailer = Trailer::Hold;
        let server = MockServer::seedlink(script).await;

        let mut client = client_for(&server);
        client.set_timeout(0);
        client.add_stream(key());
        let interrupter = client.interrupter();

        let reader = tokio::spawn(async move { client.next_record().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        interrupter.interrupt();

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ClientError::Interrupted)));
    }

    #[tokio::test]
    async fn no_streams_is_end_of_stream() {
        let mut client = SeedLinkClient::new();
        client.set_source("localhost:1").unwrap();
        assert!(client.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_keeps_source() {
        let mut client = SeedLinkClient::new();
        client.set_source("geofon").unwrap();
        client.add_stream(key());
        client.set_start_time(Some(t0()));
        client.clear();
        assert!(client.streams().is_empty());
        assert_eq!(client.source(), Some("geofon:18000"));
        assert_eq!(client.state(), ConnectionState::Idle);
    }
}
