//! Buffered TCP client socket with per-operation timeouts and a sticky,
//! cross-thread interrupt signal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use recordstream_rs_protocol::{ProtocolError, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{ClientError, Result};

/// Capacity of the receive arena.
pub const BUFFER_CAPACITY: usize = 4096;

/// Connect bound used when the socket timeout is disabled.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle that interrupts pending and future waits of one or more sockets.
///
/// Cheap to clone and usable from any thread. The signal stays raised until
/// the owning socket is closed.
#[derive(Clone, Debug, Default)]
pub struct Interrupter {
    signals: Vec<Arc<watch::Sender<bool>>>,
}

impl Interrupter {
    fn new(signal: Arc<watch::Sender<bool>>) -> Self {
        Self {
            signals: vec![signal],
        }
    }

    /// An interrupter that raises every signal of both handles.
    pub fn merge(mut self, other: Interrupter) -> Self {
        self.signals.extend(other.signals);
        self
    }

    pub fn interrupt(&self) {
        for signal in &self.signals {
            signal.send_replace(true);
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.signals.iter().any(|s| *s.borrow())
    }
}

/// Fixed-capacity receive buffer: `read <= write <= buf.len()`.
struct Arena {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
}

impl Arena {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    fn filled(&self) -> &[u8] {
        &self.buf[self.read..self.write]
    }

    fn len(&self) -> usize {
        self.write - self.read
    }

    fn is_full(&self) -> bool {
        self.len() == self.buf.len()
    }

    fn consume(&mut self, n: usize) {
        self.read += n;
        debug_assert!(self.read <= self.write);
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
    }

    /// Move unread bytes to the front to reclaim consumed space.
    fn compact(&mut self) {
        if self.read > 0 {
            self.buf.copy_within(self.read..self.write, 0);
            self.write -= self.read;
            self.read = 0;
        }
    }

    fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.write..]
    }

    fn commit(&mut self, n: usize) {
        self.write += n;
        debug_assert!(self.write <= self.buf.len());
    }

    fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

/// Deadline of one public operation together with the bound it came from.
type Deadline = Option<(Instant, Duration)>;

/// TCP client connection used by both protocol clients.
///
/// Every public wait honours the configured timeout (`None` waits forever)
/// and the interrupt signal. Timeout, EOF and OS errors flag the socket as
/// needing a reconnect.
pub struct Socket {
    stream: Option<TcpStream>,
    arena: Arena,
    timeout: Option<Duration>,
    eol: Vec<u8>,
    interrupt: Arc<watch::Sender<bool>>,
    needs_reconnect: bool,
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket {
    pub fn new() -> Self {
        let (interrupt, _) = watch::channel(false);
        Self {
            stream: None,
            arena: Arena::new(BUFFER_CAPACITY),
            timeout: None,
            eol: b"\r\n".to_vec(),
            interrupt: Arc::new(interrupt),
            needs_reconnect: false,
        }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set the end-of-line marker used by [`read_line`](Self::read_line)
    /// and [`send_request`](Self::send_request).
    pub fn set_eol(&mut self, eol: impl Into<Vec<u8>>) {
        self.eol = eol.into();
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn needs_reconnect(&self) -> bool {
        self.needs_reconnect
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupt.borrow()
    }

    pub fn interrupt(&self) {
        self.interrupt.send_replace(true);
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter::new(Arc::clone(&self.interrupt))
    }

    /// Connect to `host:port`, closing a stale connection first.
    pub async fn open(&mut self, addr: &str) -> Result<()> {
        if self.stream.take().is_some() {
            warn!(addr, "socket still open, closing previous connection");
        }
        self.arena.clear();

        let result = self.connect(addr).await;
        match result {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                self.stream = Some(stream);
                self.needs_reconnect = false;
                debug!(addr, "connected");
                Ok(())
            }
            Err(e) => {
                self.needs_reconnect = true;
                Err(e)
            }
        }
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let connect_error = |reason: String| ClientError::Connect {
            addr: addr.to_owned(),
            reason,
        };

        let Some((host, port)) = addr.rsplit_once(':') else {
            return Err(connect_error("expected host:port".into()));
        };
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(connect_error(format!("invalid host or port in {addr:?}")));
        }

        let limit = self.timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let deadline = Some((Instant::now() + limit, limit));

        let addrs: Vec<_> = guarded(
            self.interrupt.subscribe(),
            deadline,
            tokio::net::lookup_host(addr),
        )
        .await
        .map_err(|e| match e {
            ClientError::Io(io) => connect_error(io.to_string()),
            other => other,
        })?
        .collect();
        if addrs.is_empty() {
            return Err(connect_error("no addresses resolved".into()));
        }

        trace!(addr, resolved = ?addrs, "connecting");
        guarded(
            self.interrupt.subscribe(),
            deadline,
            TcpStream::connect(&addrs[..]),
        )
        .await
        .map_err(|e| match e {
            ClientError::Io(io) => connect_error(io.to_string()),
            other => other,
        })
    }

    /// Drop the connection, reset the buffer and clear the interrupt and
    /// reconnect flags. Idempotent.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("socket closed");
        }
        self.arena.clear();
        self.needs_reconnect = false;
        self.interrupt.send_replace(false);
    }

    /// Drop the connection and buffered bytes; a raised interrupt stays raised.
    pub fn shutdown(&mut self) {
        if self.stream.take().is_some() {
            debug!("connection dropped");
        }
        self.arena.clear();
    }

    /// Read exactly `n` bytes.
    pub async fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let deadline = self.deadline();
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if self.arena.len() == 0 {
                self.fill(deadline).await?;
            }
            let take = (n - out.len()).min(self.arena.len());
            out.extend_from_slice(&self.arena.filled()[..take]);
            self.arena.consume(take);
        }
        Ok(out)
    }

    /// Read one line, without its end-of-line marker.
    pub async fn read_line(&mut self) -> Result<String> {
        let deadline = self.deadline();
        loop {
            let filled = self.arena.filled();
            if let Some(pos) = find(filled, &self.eol) {
                let line = String::from_utf8_lossy(&filled[..pos]).into_owned();
                self.arena.consume(pos + self.eol.len());
                trace!(%line, "line received");
                return Ok(line);
            }
            if self.arena.is_full() {
                return Err(ProtocolError::LineTooLong(BUFFER_CAPACITY).into());
            }
            self.fill(deadline).await?;
        }
    }

    /// Write all of `data`.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let deadline = self.deadline();
        let rx = self.interrupt.subscribe();
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let result = guarded(rx, deadline, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await;
        self.note_failure(&result);
        result
    }

    /// Send `text` followed by the end-of-line marker and, when asked, read
    /// the one-line reply. An `ERROR` reply is a [`ClientError::CommandRejected`].
    pub async fn send_request(&mut self, text: &str, wait_for_response: bool) -> Result<Option<String>> {
        trace!(command = text, "sending");
        let mut line = Vec::with_capacity(text.len() + self.eol.len());
        line.extend_from_slice(text.as_bytes());
        line.extend_from_slice(&self.eol);
        self.write(&line).await?;

        if !wait_for_response {
            return Ok(None);
        }
        let reply = self.read_line().await?;
        if let Ok(Response::Error { description }) = Response::parse_line(&reply) {
            debug!(command = %text, %description, "command rejected");
            return Err(ClientError::CommandRejected(text.to_owned()));
        }
        Ok(Some(reply))
    }

    fn deadline(&self) -> Deadline {
        self.timeout.map(|t| (Instant::now() + t, t))
    }

    /// Wait for more bytes and append them to the arena.
    async fn fill(&mut self, deadline: Deadline) -> Result<()> {
        self.arena.compact();
        let rx = self.interrupt.subscribe();
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let spare = self.arena.spare_mut();

        let result = match guarded(rx, deadline, stream.read(spare)).await {
            Ok(0) => Err(ClientError::Disconnected),
            other => other,
        };
        self.note_failure(&result);
        let n = result?;
        self.arena.commit(n);
        Ok(())
    }

    fn note_failure<T>(&mut self, result: &Result<T>) {
        if let Err(e) = result
            && e.is_transient()
        {
            debug!(error = %e, "socket needs reconnect");
            self.needs_reconnect = true;
        }
    }
}

/// Run `fut` until it completes, the deadline passes or the interrupt fires.
async fn guarded<T>(
    rx: watch::Receiver<bool>,
    deadline: Deadline,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T> {
    let work = async {
        match deadline {
            Some((at, limit)) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| ClientError::Timeout(limit))?
                .map_err(ClientError::Io),
            None => fut.await.map_err(ClientError::Io),
        }
    };

    tokio::select! {
        biased;
        _ = interrupted(rx) => Err(ClientError::Interrupted),
        result = work => result,
    }
}

/// Resolve once the signal is raised.
async fn interrupted(mut rx: watch::Receiver<bool>) {
    loop {
        let raised = *rx.borrow_and_update();
        if raised {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
