//! Headless, topic-based publish/subscribe status bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others, and without a slow observer ever stalling a device loop.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Status`] | A device's published status changed |
//! | [`Topic::Faults`] | A loop step or control cycle failed and was skipped |

use lablink_types::{Event, EventPayload};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Status-change notifications, one per distinct publish.
    Status,
    /// Swallowed loop errors, for operators and logs.
    Faults,
}

/// Shared status bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct StatusBus {
    status: broadcast::Sender<Event>,
    faults: broadcast::Sender<Event>,
}

impl StatusBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (status, _) = broadcast::channel(capacity);
        let (faults, _) = broadcast::channel(capacity);
        Self { status, faults }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event;
    /// `0` when nobody is listening, which is a normal condition.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        self.topic_sender(topic).send(event).unwrap_or(0)
    }

    /// Announce a new status of `device`.
    pub fn publish_status(&self, device: &str, status: Value) -> usize {
        self.publish_to(Topic::Status, Event::new(device, EventPayload::Status(status)))
    }

    /// Announce a swallowed failure of `device`.
    pub fn publish_fault(&self, device: &str, message: impl Into<String>) -> usize {
        self.publish_to(
            Topic::Faults,
            Event::new(
                device,
                EventPayload::Fault {
                    message: message.into(),
                },
            ),
        )
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn receiver_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Status => &self.status,
            Topic::Faults => &self.faults,
        }
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`StatusBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Wait for the next event concerning `device`, skipping lag gaps.
    ///
    /// Returns `None` when the bus is closed.
    pub async fn recv_from(&mut self, device: &str) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.device == device => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "status subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain every event already buffered, without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "status subscriber lagged");
                }
                Err(_) => return events,
            }
        }
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}
