//! Scripted loopback SeedLink and Arclink servers for tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use recordstream_rs_protocol::mseed::ByteOrder;
use recordstream_rs_protocol::time::parse_time;
use recordstream_rs_protocol::{
    ArclinkCommand, Command, RecordHeader, Response, SequenceNumber, TransferSize, frame,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

/// A big-endian miniSEED record at 20 Hz.
pub fn record(
    station: &str,
    channel: &str,
    start: DateTime<Utc>,
    samples: u16,
    length: usize,
) -> Vec<u8> {
    RecordHeader {
        network: "XX".into(),
        station: station.into(),
        location: "".into(),
        channel: channel.into(),
        quality: b'D',
        start_time: start,
        sample_count: samples,
        sample_rate_factor: 20,
        sample_rate_multiplier: 1,
        actual_sample_rate: None,
        record_length: Some(length),
        byte_order: ByteOrder::Big,
    }
    .write(length)
    .unwrap()
}

/// A SeedLink packet carrying a 512-byte record.
pub fn packet(sequence: u32, record: &[u8]) -> Vec<u8> {
    frame::write(SequenceNumber::new(sequence), record).unwrap()
}

/// Connection count and received command lines, shared with the server task.
#[derive(Clone, Default)]
pub struct Journal {
    connections: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn push(&self, line: &str) {
        self.commands.lock().unwrap().push(line.to_owned());
    }
}

/// What the SeedLink mock does after the packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trailer {
    End,
    Error,
    Close,
    /// Keep the connection open without sending anything.
    Hold,
}

#[derive(Clone)]
pub struct SeedLinkScript {
    /// Answer `OK` to `BATCH` (and then stay silent), or `ERROR`.
    pub batch: bool,
    /// Command prefixes answered with `ERROR` outside batch mode.
    pub reject: Vec<String>,
    pub packets: Vec<Vec<u8>>,
    pub trailer: Trailer,
    /// Close every connection right after accepting it.
    pub drop_on_accept: bool,
}

impl SeedLinkScript {
    pub fn new(packets: Vec<Vec<u8>>) -> Self {
        Self {
            batch: true,
            reject: Vec::new(),
            packets,
            trailer: Trailer::End,
            drop_on_accept: false,
        }
    }
}

#[derive(Clone)]
pub enum Transfer {
    /// `CHUNK <n>` per block, then `END`.
    Chunks(Vec<Vec<u8>>),
    /// One byte count, then all bytes.
    Block(Vec<u8>),
    /// A literal reply line.
    Line(String),
}

#[derive(Clone)]
pub struct ArclinkScript {
    pub hello_error: bool,
    pub request_id: String,
    pub bdownload_rejected: bool,
    pub bcdownload_rejected: bool,
    pub transfer: Transfer,
}

impl ArclinkScript {
    pub fn new(transfer: Transfer) -> Self {
        Self {
            hello_error: false,
            request_id: "42".into(),
            bdownload_rejected: false,
            bcdownload_rejected: false,
            transfer,
        }
    }
}

pub struct MockServer {
    addr: SocketAddr,
    journal: Journal,
}

impl MockServer {
    pub async fn seedlink(script: SeedLinkScript) -> Self {
        Self::start(move |stream, journal| {
            let script = script.clone();
            async move { serve_seedlink(stream, script, journal).await }
        })
        .await
    }

    pub async fn arclink(script: ArclinkScript) -> Self {
        Self::start(move |stream, journal| {
            let script = script.clone();
            async move { serve_arclink(stream, script, journal).await }
        })
        .await
    }

    async fn start<F, Fut>(handler: F) -> Self
    where
        F: Fn(TcpStream, Journal) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let journal = Journal::default();

        let shared = journal.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handler(stream, shared.clone()));
            }
        });

        Self { addr, journal }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

async fn send(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> bool {
    writer.write_all(bytes).await.is_ok()
}

async fn reply(writer: &mut OwnedWriteHalf, line: &str) -> bool {
    send(writer, format!("{line}\r\n").as_bytes()).await
}

fn rejected() -> Vec<u8> {
    Response::Error {
        description: String::new(),
    }
    .to_bytes()
}

async fn serve_seedlink(stream: TcpStream, script: SeedLinkScript, journal: Journal) {
    if script.drop_on_accept {
        return;
    }
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut batch = false;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim().to_owned();
        journal.push(&command);

        let ok = match Command::parse(&command) {
            Ok(Command::Batch) => {
                batch = script.batch;
                let answer = if batch { Response::Ok.to_bytes() } else { rejected() };
                send(&mut writer, &answer).await
            }
            Ok(Command::End) => {
                for p in &script.packets {
                    if !send(&mut writer, p).await {
                        return;
                    }
                }
                match script.trailer {
                    Trailer::End => send(&mut writer, b"END").await,
                    Trailer::Error => send(&mut writer, b"ERROR").await,
                    Trailer::Close => return,
                    Trailer::Hold => true,
                }
            }
            Ok(Command::Bye) => return,
            _ if batch => true,
            parsed => {
                let refused = parsed.is_err()
                    || script.reject.iter().any(|r| command.starts_with(r.as_str()));
                let answer = if refused { rejected() } else { Response::Ok.to_bytes() };
                send(&mut writer, &answer).await
            }
        };
        if !ok {
            return;
        }
    }
}

/// Both bounds are wire timestamps and the window is not empty.
fn valid_window(start: &str, end: &str) -> bool {
    matches!((parse_time(start), parse_time(end)), (Ok(s), Ok(e)) if s < e)
}

async fn serve_arclink(stream: TcpStream, script: ArclinkScript, journal: Journal) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut bad_lines = 0;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim().to_owned();
        journal.push(&command);

        let ok = match ArclinkCommand::parse(&command) {
            Ok(ArclinkCommand::Hello) if script.hello_error => send(&mut writer, &rejected()).await,
            Ok(ArclinkCommand::Hello) => {
                reply(&mut writer, "ArcLink v1.0 (mock)").await
                    && reply(&mut writer, "Mock Data Centre").await
            }
            Ok(
                ArclinkCommand::User { .. }
                | ArclinkCommand::RequestWaveform
                | ArclinkCommand::Purge { .. },
            ) => send(&mut writer, &Response::Ok.to_bytes()).await,
            // stream lines are not acknowledged
            Ok(ArclinkCommand::Stream { start, end, .. }) => {
                if !valid_window(&start, &end) {
                    bad_lines += 1;
                }
                true
            }
            Ok(ArclinkCommand::End) if bad_lines > 0 => send(&mut writer, &rejected()).await,
            Ok(ArclinkCommand::End) => reply(&mut writer, &script.request_id).await,
            Ok(ArclinkCommand::BDownload { .. }) if script.bdownload_rejected => {
                reply(&mut writer, &TransferSize::Rejected.to_line()).await
            }
            Ok(ArclinkCommand::BcDownload { .. }) if script.bcdownload_rejected => {
                reply(&mut writer, &TransferSize::Rejected.to_line()).await
            }
            Ok(ArclinkCommand::BDownload { .. } | ArclinkCommand::BcDownload { .. }) => {
                send_transfer(&mut writer, &script.transfer).await
            }
            Ok(ArclinkCommand::Bye) => return,
            Err(_) => send(&mut writer, &rejected()).await,
        };
        if !ok {
            return;
        }
    }
}

async fn send_transfer(writer: &mut OwnedWriteHalf, transfer: &Transfer) -> bool {
    match transfer {
        Transfer::Chunks(chunks) => {
            for chunk in chunks {
                let header = TransferSize::Chunk(chunk.len() as u64);
                if !reply(writer, &header.to_line()).await || !send(writer, chunk).await {
                    return false;
                }
            }
            send(writer, &Response::End.to_bytes()).await
        }
        Transfer::Block(bytes) => {
            let size = TransferSize::Total(bytes.len() as u64);
            reply(writer, &size.to_line()).await && send(writer, bytes).await
        }
        Transfer::Line(text) => reply(writer, text).await,
    }
}
