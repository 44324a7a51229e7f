//! Shared plumbing for the durable event streams.
//!
//! Every stream RPC follows the same shape: open the delivery stream at
//! the caller's `unacked_from`, deserialize each pending record into
//! its typed event, convert to the proto message (carrying the assigned
//! sequence ID), and forward until the client hangs up.

use std::pin::Pin;
use std::sync::Arc;

use rvchat_client::delivery::Delivery;
use rvchat_storage::PendingRecord;
use rvchat_types::StreamKind;
use serde::de::DeserializeOwned;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;

use crate::err_to_status;

/// Boxed response stream type used by all streaming RPCs.
pub type EventStream<P> = Pin<Box<dyn Stream<Item = Result<P, Status>> + Send>>;

/// Opens `kind` at `unacked_from` and maps each record through
/// `convert`, which receives the deserialized event and its sequence
/// ID.
pub fn open_stream<E, P, F>(
    delivery: &Arc<Delivery>,
    kind: StreamKind,
    unacked_from: u64,
    convert: F,
) -> Result<EventStream<P>, Status>
where
    E: DeserializeOwned,
    P: Send + 'static,
    F: Fn(E, u64) -> P + Send + 'static,
{
    let rx = delivery
        .subscribe(kind, unacked_from)
        .map_err(err_to_status)?;

    let stream = ReceiverStream::new(rx).map(move |record: PendingRecord| {
        let seq = record.sequence_id;
        match serde_json::from_value::<E>(record.payload) {
            Ok(event) => Ok(convert(event, seq)),
            Err(e) => Err(Status::internal(format!(
                "corrupt stream record {seq}: {e}"
            ))),
        }
    });

    Ok(Box::pin(stream))
}
