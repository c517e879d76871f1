//! The record-source capability shared by every protocol client, and the
//! registry that creates sources by protocol name.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::selector::{StreamKey, TimeWindow};
use crate::socket::Interrupter;
use crate::state::{ConnectionState, Record};
use crate::{ArclinkClient, CombinedClient, SeedLinkClient};

/// A source of miniSEED records selected by stream and time window.
///
/// `next_record` yields `Ok(Some(record))` per record, `Ok(None)` at end of
/// stream and `Err` on failure.
#[async_trait]
pub trait RecordStream: Send {
    /// Configure the server address (protocol-specific syntax).
    fn set_source(&mut self, address: &str) -> Result<()>;

    /// Request a stream with the default time window. Returns `true` if the
    /// stream was not requested before.
    fn add_stream(&mut self, key: StreamKey) -> bool;

    /// Request a stream with its own time window, which overrides the default
    /// window bound by bound.
    fn add_stream_window(&mut self, key: StreamKey, window: TimeWindow) -> bool;

    fn remove_stream(&mut self, key: &StreamKey) -> bool;

    fn set_start_time(&mut self, start: Option<DateTime<Utc>>);

    fn set_end_time(&mut self, end: Option<DateTime<Utc>>);

    fn set_time_window(&mut self, window: TimeWindow);

    /// Socket timeout in seconds; zero or negative waits forever.
    fn set_timeout(&mut self, seconds: i64);

    /// Credentials for protocols that authenticate. Ignored by the others.
    fn set_user(&mut self, _name: &str, _password: Option<&str>) {}

    async fn next_record(&mut self) -> Result<Option<Record>>;

    fn close(&mut self);

    /// Drop the connection so the next read connects again.
    fn reconnect(&mut self);

    /// Forget streams, windows and connection state; the source address stays.
    fn clear(&mut self);

    fn state(&self) -> ConnectionState;

    /// Handle to interrupt a blocked `next_record` from another task or thread.
    fn interrupter(&self) -> Interrupter;
}

type Factory = Box<dyn Fn() -> Box<dyn RecordStream> + Send + Sync>;

/// Maps protocol names to record-source constructors.
#[derive(Default)]
pub struct Registry {
    factories: BTreeMap<String, Factory>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("services", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry knowing `slink`, `arclink` and `combined`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("slink", || Box::new(SeedLinkClient::new()));
        registry.register("arclink", || Box::new(ArclinkClient::new()));
        registry.register("combined", || Box::new(CombinedClient::new()));
        registry
    }

    /// Register (or replace) a constructor under `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn RecordStream> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_owned(), Box::new(factory));
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Create an unconfigured source for `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn RecordStream>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ClientError::Config(format!("unknown record stream service {name:?}")))?;
        Ok(factory())
    }

    /// Create a source from `service://address` and apply the address.
    pub fn open(&self, url: &str) -> Result<Box<dyn RecordStream>> {
        let (service, address) = url
            .split_once("://")
            .ok_or_else(|| ClientError::Config(format!("expected service://address, got {url:?}")))?;
        debug!(service, address, "opening record stream");
        let mut stream = self.create(service)?;
        stream.set_source(address)?;
        Ok(stream)
    }
}
