//! Async record-stream clients for seismic waveform acquisition.
//!
//! Three sources share the [`RecordStream`] capability:
//!
//! - [`SeedLinkClient`] streams near-real-time records and reconnects within a
//!   retry budget, resuming after the last record seen;
//! - [`ArclinkClient`] downloads archived records for fixed time windows;
//! - [`CombinedClient`] splits each request at the live availability horizon
//!   and serves archive records first, then live ones.
//!
//! [`Registry`] creates sources from `service://address` strings.
//!
//! ```no_run
//! # async fn example() -> recordstream_rs_client::Result<()> {
//! use recordstream_rs_client::{RecordStream, Registry, StreamKey};
//!
//! let mut source = Registry::with_defaults()
//!     .open("combined://geofon:18000;geofon:18001??slinkMax=3600")?;
//! source.add_stream(StreamKey::new("GE", "APE", "", "BHZ"));
//! while let Some(record) = source.next_record().await? {
//!     let header = record.header()?;
//!     println!("{}.{} {}", header.network, header.station, header.start_time);
//! }
//! # Ok(())
//! # }
//! ```

pub mod arclink;
pub mod combined;
pub mod error;
pub mod recordstream;
pub mod seedlink;
pub mod selector;
pub mod socket;
pub mod source;
pub mod state;
pub mod stream;

#[cfg(test)]
mod mock;

pub use arclink::ArclinkClient;
pub use combined::CombinedClient;
pub use error::{ClientError, Result};
pub use recordstream::{RecordStream, Registry};
pub use seedlink::SeedLinkClient;
pub use selector::{StreamKey, TimeWindow};
pub use socket::{Interrupter, Socket};
pub use state::{ArclinkConfig, CombinedConfig, ConnectionState, Record, SeedLinkConfig, WindowPolicy};
pub use stream::record_stream;
