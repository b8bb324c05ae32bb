//! Stream relay: republishes writes to a single live consumer.
//!
//! The relay is a rendezvous channel. [`RelaySender::publish`] does not
//! return until the consumer has taken the event, so a slow consumer
//! applies backpressure to every write of the export it is attached to.
//!
//! # Architecture
//!
//! - [`channel`] creates a connected [`RelaySender`] / [`RelayReceiver`] pair
//! - [`RelayEvent`] is either a whole [`WriteNotification`] or the end marker
//! - [`wire`] encodes events into the consumer byte stream
//! - [`pump`] drains a receiver into any `AsyncWrite`
//!
//! A publish that is abandoned (its future dropped, or the configured send
//! deadline elapsed) is never delivered afterwards: the receiver discards
//! events whose publisher stopped waiting.

mod pump;
pub mod wire;

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::RelayError;

pub use pump::pump;

/// One event waits in the queue at a time; the publisher then waits for the
/// consumer's acknowledgement.
const QUEUE_CAPACITY: usize = 1;

/// A write republished to the consumer.
///
/// Carries the whole (offset, length, payload) triple as one message so no
/// other write can interleave with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteNotification {
    pub offset: u64,
    pub payload: Bytes,
}

impl WriteNotification {
    pub fn new(offset: u64, payload: Bytes) -> Self {
        Self { offset, payload }
    }

    #[inline]
    pub fn length(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Event carried by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Write(WriteNotification),
    /// The device session ended. Nothing follows.
    End,
}

struct Delivery {
    event: RelayEvent,
    ack: oneshot::Sender<()>,
}

/// Create a connected relay pair.
///
/// `send_timeout` bounds how long a single publish waits for the consumer.
/// `None` waits until the consumer takes the event or disconnects.
pub fn channel(send_timeout: Option<Duration>) -> (RelaySender, RelayReceiver) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    (
        RelaySender { tx, send_timeout },
        RelayReceiver { rx, ended: false },
    )
}

/// Publishing half of the relay.
#[derive(Clone)]
pub struct RelaySender {
    tx: mpsc::Sender<Delivery>,
    send_timeout: Option<Duration>,
}

impl RelaySender {
    /// Hand `event` to the consumer, waiting until it has been taken.
    ///
    /// Publishes are delivered in the order they start. Cancel-safe: if the
    /// returned future is dropped before completion the event is discarded.
    pub async fn publish(&self, event: RelayEvent) -> Result<(), RelayError> {
        let (ack_tx, mut ack_rx) = oneshot::channel();
        let delivery = Delivery { event, ack: ack_tx };

        let Some(timeout) = self.send_timeout else {
            return handoff(&self.tx, delivery, &mut ack_rx).await;
        };

        let outcome = tokio::time::timeout(timeout, handoff(&self.tx, delivery, &mut ack_rx)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // The consumer may have acknowledged right at the deadline.
                // Closing first makes the outcome final for both sides.
                ack_rx.close();
                if ack_rx.try_recv().is_ok() {
                    return Ok(());
                }
                let timeout_ms = timeout.as_millis() as u64;
                warn!(timeout_ms, "relay consumer did not take event in time");
                Err(RelayError::Timeout { timeout_ms })
            }
        }
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout
    }

    /// Returns true once the receiver has been dropped or has seen the end
    /// marker.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn handoff(
    tx: &mpsc::Sender<Delivery>,
    delivery: Delivery,
    ack_rx: &mut oneshot::Receiver<()>,
) -> Result<(), RelayError> {
    tx.send(delivery)
        .await
        .map_err(|_| RelayError::Disconnected)?;
    // The receiver acknowledges before it closes after the end marker, so
    // the ack wins over `closed` for every event it actually took.
    tokio::select! {
        biased;
        ack = ack_rx => ack.map_err(|_| RelayError::Disconnected),
        _ = tx.closed() => Err(RelayError::Disconnected),
    }
}

/// Consuming half of the relay. There is exactly one per export.
pub struct RelayReceiver {
    rx: mpsc::Receiver<Delivery>,
    ended: bool,
}

impl RelayReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` after the end marker has been received, or if every
    /// sender was dropped without publishing one.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        if self.ended {
            self.close_and_drain();
            return None;
        }

        while let Some(Delivery { event, ack }) = self.rx.recv().await {
            if ack.send(()).is_err() {
                debug!("discarding abandoned relay event");
                continue;
            }
            if event == RelayEvent::End {
                self.ended = true;
                self.close_and_drain();
            }
            return Some(event);
        }
        None
    }

    /// Stop accepting events and fail anything that slipped into the queue
    /// after the end marker.
    fn close_and_drain(&mut self) {
        self.rx.close();
        while let Ok(late) = self.rx.try_recv() {
            debug!(event = ?late.event, "dropping event published after end marker");
        }
    }

    /// Returns true once the end marker has been received.
    pub fn is_ended(&self) -> bool {
        self.ended
    }
}
