//! Receive loops for device events and delivery feedback.
//!
//! Each decoded item is handed to the user handler on its own task so a slow
//! handler never stalls the link. Handlers may therefore run concurrently and
//! out of arrival order.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::protocol::{address, decode_feedback, decode_message};
use crate::redirect::RedirectTarget;
use crate::transport::{EventPosition, ReceiverLink, ReceiverOptions, Session, TransportError};
use crate::types::{Feedback, Message};

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Spawns handler futures, optionally bounded by a semaphore.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    limit: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub(crate) fn new(max_in_flight: Option<usize>) -> Self {
        Self {
            limit: max_in_flight.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// Spawn `fut`. With a bound configured this waits for a free slot first.
    pub(crate) async fn dispatch<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let permit = match &self.limit {
            Some(sem) => Arc::clone(sem).acquire_owned().await.ok(),
            None => None,
        };
        tokio::spawn(async move {
            fut.await;
            drop(permit);
        });
    }
}

// ---------------------------------------------------------------------------
// Device events
// ---------------------------------------------------------------------------

/// Consumer settings for the partition receivers.
pub(crate) struct PartitionConsumer<'a> {
    pub target: &'a RedirectTarget,
    pub consumer_group: &'a str,
    pub position: EventPosition,
}

/// Receive from every partition of the redirected event hub until `cancel`
/// fires or one partition fails. Returns the reason the loops stopped.
pub(crate) async fn receive_events<F, Fut>(
    session: &dyn Session,
    consumer: PartitionConsumer<'_>,
    cancel: &CancellationToken,
    handler: Arc<F>,
    dispatcher: Dispatcher,
) -> Error
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let group = consumer.target.group.as_str();
    let ids = match session.partition_ids(group).await {
        Ok(ids) if ids.is_empty() => {
            return Error::InvalidRedirect(format!("event hub {group:?} reports no partitions"));
        }
        Ok(ids) => ids,
        Err(e) => return e.into(),
    };

    let stop = cancel.child_token();
    let mut tasks = JoinSet::new();
    let options = ReceiverOptions {
        selector: Some(consumer.position.selector().to_string()),
    };
    let mut open_error = None;
    for id in ids {
        let source = address::partition(group, consumer.consumer_group, &id);
        match session.receiver(&source, options.clone()).await {
            Ok(receiver) => {
                debug!(partition = %id, "partition receiver attached");
                tasks.spawn(receive_partition(
                    id,
                    receiver,
                    stop.clone(),
                    Arc::clone(&handler),
                    dispatcher.clone(),
                ));
            }
            Err(e) => {
                open_error = Some(Error::from(e));
                break;
            }
        }
    }

    let first = match open_error {
        Some(e) => e,
        None => match tasks.join_next().await {
            Some(Ok(e)) => e,
            Some(Err(join_err)) => Error::Transport(TransportError::Other(Box::new(join_err))),
            None => Error::Cancelled,
        },
    };
    stop.cancel();
    while tasks.join_next().await.is_some() {}
    first
}

async fn receive_partition<F, Fut>(
    partition: String,
    mut receiver: Box<dyn ReceiverLink>,
    stop: CancellationToken,
    handler: Arc<F>,
    dispatcher: Dispatcher,
) -> Error
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let reason = loop {
        let wire = tokio::select! {
            _ = stop.cancelled() => break Error::Cancelled,
            r = receiver.receive() => match r {
                Ok(wire) => wire,
                Err(e) => break e.into(),
            },
        };
        if let Err(e) = receiver.accept(&wire).await {
            break e.into();
        }
        let msg = decode_message(wire);
        debug!(
            partition = %partition,
            device_id = msg.connection_device_id.as_deref().unwrap_or("-"),
            "event received"
        );
        tokio::select! {
            _ = stop.cancelled() => break Error::Cancelled,
            _ = dispatcher.dispatch(handler(msg)) => {}
        }
    };

    if !matches!(reason, Error::Cancelled) {
        warn!(partition = %partition, "partition receive loop stopped: {reason}");
    }
    if let Err(e) = receiver.close().await {
        debug!(partition = %partition, "closing partition receiver: {e}");
    }
    reason
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

/// Receive feedback batches until `cancel` fires, the connection becomes
/// unusable, or the link fails. Every batch is accepted before its records
/// are dispatched.
pub(crate) async fn receive_feedback<F, Fut>(
    mut receiver: Box<dyn ReceiverLink>,
    cancel: &CancellationToken,
    connection_done: &CancellationToken,
    handler: &F,
    dispatcher: &Dispatcher,
) -> Error
where
    F: Fn(Feedback) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    let reason = 'outer: loop {
        let wire = tokio::select! {
            _ = cancel.cancelled() => break Error::Cancelled,
            _ = connection_done.cancelled() => break Error::ConnectionClosed,
            r = receiver.receive() => match r {
                Ok(wire) => wire,
                Err(e) => break e.into(),
            },
        };
        if let Err(e) = receiver.accept(&wire).await {
            break e.into();
        }
        let records = match decode_feedback(&wire) {
            Ok(records) => records,
            Err(e) => break e,
        };
        debug!(records = records.len(), "feedback batch received");
        for record in records {
            tokio::select! {
                _ = cancel.cancelled() => break 'outer Error::Cancelled,
                _ = dispatcher.dispatch(handler(record)) => {}
            }
        }
    };

    if let Err(e) = receiver.close().await {
        debug!("closing feedback receiver: {e}");
    }
    reason
}
