use futures_core::Stream;

use crate::error::ClientError;
use crate::recordstream::RecordStream;
use crate::state::Record;

/// Convert any [`RecordStream`] into a [`Stream`] of records.
///
/// The stream yields `Ok(Record)` for each record, ends when the source
/// reports end of stream and yields the error once if reading fails.
pub fn record_stream<S>(mut source: Box<S>) -> impl Stream<Item = Result<Record, ClientError>>
where
    S: RecordStream + ?Sized,
{
    async_stream::try_stream! {
        while let Some(record) = source.next_record().await? {
            yield record;
        }
    }
}
