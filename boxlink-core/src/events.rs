//! Event subscriptions
//!
//! [`subscribe`] registers a set of events on a fresh channel, then hands
//! the channel to a background task that owns its read side for the rest
//! of the subscription. Notifications reach the caller through a small
//! bounded queue. Whatever ends the loop, the task still runs the close
//! handshake before the queue closes.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, ResultExt};
use crate::protocol::{Action, EventDescription, SocketEnvelope, SocketRequest};
use crate::realtime::{Channel, Correlation, next_request_id};

/// Capacity of the notification queue
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 10;

/// One event pushed by the device
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub source: String,
    pub event: String,
    pub result: serde_json::Value,
}

impl Notification {
    /// Decode the payload into a typed record
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.result.clone())?)
    }

    pub fn is(&self, description: &EventDescription) -> bool {
        self.source == description.source && self.event == description.name
    }
}

impl From<SocketEnvelope> for Notification {
    fn from(envelope: SocketEnvelope) -> Self {
        Self {
            source: envelope.source.unwrap_or_default(),
            event: envelope.event.unwrap_or_default(),
            result: envelope.result.unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Live notification queue of one subscription
///
/// Ends once the background loop has shut the socket down. An `Err` item
/// reports why the loop stopped or why the shutdown itself failed.
pub struct EventStream {
    rx: mpsc::Receiver<Result<Notification>>,
    task: JoinHandle<()>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<Result<Notification>> {
        self.rx.recv().await
    }

    /// Wait for the background loop to finish its shutdown
    pub async fn finished(self) {
        drop(self.rx);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Event loop task failed");
        }
    }
}

impl Stream for EventStream {
    type Item = Result<Notification>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Register `events` on `channel` and start the notification loop
///
/// A failed registration closes the channel and is returned as is.
/// Cancelling `cancel` afterwards is the normal way to end the
/// subscription.
pub async fn subscribe(
    mut channel: Channel,
    events: &[EventDescription],
    cancel: CancellationToken,
) -> Result<EventStream> {
    let request_id = next_request_id();
    let register = SocketRequest::Register {
        request_id,
        events: events.iter().map(EventDescription::wire_name).collect(),
    };

    let registered = channel
        .send_and_wait_for::<_, serde_json::Value>(&register, request_id, Action::Register, &cancel)
        .await;

    if let Err(e) = registered {
        if let Err(close_err) = channel.close().await {
            warn!(error = %close_err, "Failed to close channel after rejected registration");
        }
        return Err(e).context("register events");
    }

    info!(count = events.len(), "Registered for events");

    let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY);
    let task = tokio::spawn(event_loop(channel, tx, cancel));

    Ok(EventStream { rx, task })
}

async fn event_loop(
    mut channel: Channel,
    tx: mpsc::Sender<Result<Notification>>,
    cancel: CancellationToken,
) {
    let failure = loop {
        let waited = tokio::select! {
            _ = tx.closed() => {
                debug!("Notification consumer went away");
                break None;
            }
            waited = channel.wait_for_envelope(Correlation::action(Action::Notification), &cancel) => waited,
        };

        let envelope = match waited {
            Ok(envelope) => envelope,
            Err(Error::Cancelled) => break None,
            Err(e) => break Some(e),
        };

        let notification = Notification::from(envelope);
        debug!(source = %notification.source, event = %notification.event, "Notification received");

        tokio::select! {
            _ = cancel.cancelled() => break None,
            sent = tx.send(Ok(notification)) => {
                if sent.is_err() {
                    debug!("Notification consumer went away");
                    break None;
                }
            }
        }
    };

    if let Some(e) = failure {
        warn!(error = %e, "Event loop stopped");
        push_final(&tx, Err(e), &cancel).await;
    }

    if let Err(e) = channel.close().await {
        warn!(error = %e, "Failed to close event channel");
        push_final(&tx, Err(e).context("close event channel"), &cancel).await;
    }

    debug!("Event loop finished");
}

/// Queue a last item unless the consumer is gone or the subscription was cancelled
async fn push_final(
    tx: &mpsc::Sender<Result<Notification>>,
    item: Result<Notification>,
    cancel: &CancellationToken,
) {
    tokio::select! {
        biased;
        sent = tx.send(item) => {
            if sent.is_err() {
                debug!("Notification consumer went away, final item dropped");
            }
        }
        _ = cancel.cancelled() => warn!("Notification queue full after cancel, final item dropped"),
    }
}
