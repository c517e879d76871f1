use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use recordstream_rs_protocol::mseed;
use recordstream_rs_protocol::{ArclinkCommand, ProtocolError, Response, TransferSize};
use tracing::{debug, error, info, trace, warn};

use crate::error::{ClientError, Result};
use crate::recordstream::RecordStream;
use crate::selector::{SelectorSet, StreamKey, TimeWindow};
use crate::socket::{Interrupter, Socket};
use crate::source::{self, Source};
use crate::state::{ArclinkConfig, ConnectionState, Record, WindowPolicy};

pub const DEFAULT_PORT: u16 = 18001;

/// Bytes inspected to find a record's length.
const RECORD_PREFIX_LEN: usize = 128;
/// Record length assumed when no Blockette 1000 is found.
const FALLBACK_RECORD_LEN: usize = 512;

/// Arclink client retrieving archived records for fixed time windows.
///
/// The whole request is sent on the first [`next_record`](Self::next_record);
/// records are then cut out of the download by their Blockette 1000 length.
/// After the last record the request is purged on the server. Failures are
/// never retried.
pub struct ArclinkClient {
    socket: Socket,
    addr: Option<String>,
    config: ArclinkConfig,
    selectors: SelectorSet,
    window: TimeWindow,
    state: ConnectionState,
    request_id: Option<String>,
    /// Bytes left in the whole download, or in the current chunk.
    remaining: u64,
    chunked: bool,
    /// A download started; a closed socket now means end of stream.
    reading: bool,
}

impl Default for ArclinkClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ArclinkClient {
    pub fn new() -> Self {
        Self::with_config(ArclinkConfig::default())
    }

    pub fn with_config(config: ArclinkConfig) -> Self {
        let mut socket = Socket::new();
        socket.set_timeout(config.timeout);
        Self {
            socket,
            addr: None,
            config,
            selectors: SelectorSet::new(),
            window: TimeWindow::default(),
            state: ConnectionState::Idle,
            request_id: None,
            remaining: 0,
            chunked: false,
            reading: false,
        }
    }

    // -- Configuration --

    /// Set the server: `host:port[?user=<u>&pwd=<p>&timeout=<s>&strict=<bool>]`.
    ///
    /// Host defaults to `localhost` and port to 18001.
    pub fn set_source(&mut self, address: &str) -> Result<()> {
        let source = Source::parse(address, DEFAULT_PORT)?;
        for (key, value) in &source.params {
            match key.as_str() {
                "user" => self.config.user = value.clone(),
                "pwd" => self.config.password = Some(value.clone()),
                "timeout" => self.config.timeout = source::parse_timeout(key, value)?,
                "strict" => {
                    self.config.window_policy = if source::parse_bool(key, value)? {
                        WindowPolicy::Strict
                    } else {
                        WindowPolicy::Lenient
                    }
                }
                _ => warn!(parameter = %key, "ignoring unknown Arclink source parameter"),
            }
        }
        self.socket.set_timeout(self.config.timeout);
        debug!(addr = %source.addr, user = %self.config.user, "Arclink source set");
        self.addr = Some(source.addr);
        Ok(())
    }

    pub fn source(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    pub fn set_user(&mut self, name: &str, password: Option<&str>) {
        self.config.user = name.to_owned();
        self.config.password = password.map(str::to_owned);
    }

    pub fn set_window_policy(&mut self, policy: WindowPolicy) {
        self.config.window_policy = policy;
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

    // -- Accessors --

    pub fn config(&self) -> &ArclinkConfig {
        &self.config
    }

    pub fn streams(&self) -> &SelectorSet {
        &self.selectors
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Request id assigned by the server for the running download.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn interrupter(&self) -> Interrupter {
        self.socket.interrupter()
    }

    // -- Reading --

    /// Next record, or `None` once the download is exhausted.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        match self.read_record().await {
            Ok(record) => Ok(record),
            Err(e) => {
                error!(error = %e, "Arclink read failed");
                self.socket.close();
                self.state = ConnectionState::Error;
                self.reading = false;
                self.request_id = None;
                Err(e)
            }
        }
    }

    async fn read_record(&mut self) -> Result<Option<Record>> {
        if self.reading && !self.socket.is_open() {
            return Ok(None);
        }
        if !self.socket.is_open() {
            if self.selectors.is_empty() {
                warn!("no streams requested");
                return Ok(None);
            }
            self.connect().await?;
        }

        if self.remaining == 0 {
            self.purge().await;
            self.finish();
            return Ok(None);
        }

        // a record never extends past the current chunk or block
        let available = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        let mut data = self.socket.read(RECORD_PREFIX_LEN.min(available)).await?;
        let length = match mseed::find_record_length(&data) {
            Some(length) if length <= available => length,
            Some(length) => {
                warn!(length, available, "record overruns the transfer, truncating");
                available
            }
            None => {
                error!(
                    fallback = FALLBACK_RECORD_LEN,
                    available, "cannot determine record length, using fallback"
                );
                FALLBACK_RECORD_LEN.min(available)
            }
        };
        if length > data.len() {
            let rest = self.socket.read(length - data.len()).await?;
            data.extend(rest);
        }

        self.remaining = self.remaining.saturating_sub(data.len() as u64);
        if self.chunked && self.remaining == 0 {
            self.next_chunk().await?;
        }

        trace!(length = data.len(), remaining = self.remaining, "record");
        Ok(Some(Record {
            sequence: None,
            data,
        }))
    }

    /// Read the header following an exhausted chunk.
    async fn next_chunk(&mut self) -> Result<()> {
        let line = self.socket.read_line().await?;
        if TransferSize::is_chunk_header(&line)
            && let TransferSize::Chunk(size) = TransferSize::parse(&line)?
        {
            debug!(size, "next chunk");
            self.remaining = size;
        } else {
            debug!(%line, "end of chunked transfer");
        }
        Ok(())
    }

    /// One request line per stream with a complete window.
    fn request_lines(&self) -> Result<Vec<ArclinkCommand>> {
        let mut lines = Vec::with_capacity(self.selectors.len());
        for selector in self.selectors.iter() {
            let window = selector.window.or(&self.window);
            let key = &selector.key;
            match (window.start, window.end) {
                (Some(start), Some(end)) => lines.push(ArclinkCommand::stream(
                    &start,
                    &end,
                    &key.network,
                    &key.station,
                    &key.channel,
                    &key.location,
                )),
                _ if self.config.window_policy == WindowPolicy::Strict => {
                    return Err(ClientError::Config(format!(
                        "stream {key} has no complete time window"
                    )));
                }
                _ => warn!(stream = %key, "skipping stream without complete time window"),
            }
        }
        Ok(lines)
    }

    async fn connect(&mut self) -> Result<()> {
        let addr = self
            .addr
            .clone()
            .ok_or_else(|| ClientError::Config("no Arclink source address set".into()))?;
        let lines = self.request_lines()?;

        self.state = ConnectionState::Connecting;
        info!(%addr, "connecting to Arclink server");
        self.socket.open(&addr).await?;

        self.state = ConnectionState::Handshaking;
        self.handshake(&lines).await?;

        self.state = ConnectionState::Streaming;
        self.reading = true;
        Ok(())
    }

    async fn handshake(&mut self, lines: &[ArclinkCommand]) -> Result<()> {
        self.socket
            .send_request(&ArclinkCommand::Hello.to_line(), false)
            .await?;
        let software = self.socket.read_line().await?;
        if let Ok(Response::Error { description }) = Response::parse_line(&software) {
            let reason = format!("HELLO rejected: {description}");
            return Err(ProtocolError::InvalidResponse(reason).into());
        }
        let organization = self.socket.read_line().await?;
        info!(%software, %organization, "Arclink server");

        let user = ArclinkCommand::User {
            name: self.config.user.clone(),
            password: self.config.password.clone(),
        };
        self.socket.send_request(&user.to_line(), true).await?;
        self.socket
            .send_request(&ArclinkCommand::RequestWaveform.to_line(), true)
            .await?;
        for line in lines {
            self.socket.send_request(&line.to_line(), false).await?;
        }
        let request_id = self
            .socket
            .send_request(&ArclinkCommand::End.to_line(), true)
            .await?
            .unwrap_or_default();
        debug!(%request_id, streams = lines.len(), "request submitted");

        let download = ArclinkCommand::BDownload {
            request_id: request_id.clone(),
        };
        let mut size = self.download(&download).await?;
        if size == TransferSize::Rejected {
            debug!(%request_id, "BDOWNLOAD rejected, trying BCDOWNLOAD");
            let fallback = ArclinkCommand::BcDownload {
                request_id: request_id.clone(),
            };
            size = self.download(&fallback).await?;
        }

        (self.chunked, self.remaining) = match size {
            TransferSize::Rejected => {
                warn!(%request_id, "download rejected, no data");
                (false, 0)
            }
            TransferSize::Chunk(n) => (true, n),
            TransferSize::Total(n) => (false, n),
        };
        debug!(chunked = self.chunked, bytes = self.remaining, "download started");
        self.request_id = Some(request_id);
        Ok(())
    }

    async fn download(&mut self, command: &ArclinkCommand) -> Result<TransferSize> {
        self.socket.send_request(&command.to_line(), false).await?;
        let line = self.socket.read_line().await?;
        Ok(TransferSize::parse(&line)?)
    }

    /// Best-effort removal of the finished request from the server.
    async fn purge(&mut self) {
        let Some(request_id) = self.request_id.take() else {
            return;
        };
        let purge = ArclinkCommand::Purge {
            request_id: request_id.clone(),
        };
        match self.socket.send_request(&purge.to_line(), true).await {
            Ok(_) => debug!(%request_id, "request purged"),
            Err(e) => warn!(%request_id, error = %e, "purge failed"),
        }
    }

    fn finish(&mut self) {
        self.socket.close();
        self.state = ConnectionState::Closed;
        self.remaining = 0;
        self.chunked = false;
    }

    // -- Lifecycle --

    pub fn close(&mut self) {
        self.finish();
    }

    /// Drop the connection; the next read submits the request again.
    pub fn reconnect(&mut self) {
        self.finish();
        self.reading = false;
        self.request_id = None;
    }

    /// Forget streams, windows and connection state. The source address and
    /// credentials stay.
    pub fn clear(&mut self) {
        self.reconnect();
        self.selectors.clear();
        self.window = TimeWindow::default();
        self.state = ConnectionState::Idle;
    }

    /// Consume the client into a [`Stream`] of records.
    pub fn into_stream(self) -> impl Stream<Item = Result<Record>> {
        crate::stream::record_stream(Box::new(self))
    }
}

#[async_trait]
impl RecordStream for ArclinkClient {
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
