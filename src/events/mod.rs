//! Event system for state notifications
//!
//! Camera and stream components publish their transitions here so that a
//! CLI, a status page or a log sink can follow them without holding
//! references to the components themselves.

pub mod types;

pub use types::{FaceInfo, SystemEvent};

use tokio::sync::broadcast;
use tracing::debug;

/// Ring buffer size. Bitrate samples arrive once a second and face updates
/// once per frame, so a slow subscriber falls behind on faces first.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcasts [`SystemEvent`]s to any number of subscribers
///
/// Slow subscribers receive a `Lagged` error and skip ahead instead of
/// blocking publishers.
///
/// ```no_run
/// use livecast::events::EventBus;
///
/// # async fn run(bus: EventBus) {
/// let mut stream_events = bus.subscribe_topic("stream.*");
/// while let Some(event) = stream_events.recv().await {
///     println!("{}", event.event_name());
/// }
/// # }
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Events published with no subscribers are dropped
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    /// Every future event, lag reported to the caller
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    /// Future events whose name matches `topic` (see [`SystemEvent::matches_topic`])
    pub fn subscribe_topic(&self, topic: impl Into<String>) -> TopicReceiver {
        TopicReceiver {
            topic: topic.into(),
            rx: self.tx.subscribe(),
            skipped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Filtered subscription that absorbs lag
pub struct TopicReceiver {
    topic: String,
    rx: broadcast::Receiver<SystemEvent>,
    skipped: u64,
}

impl TopicReceiver {
    /// Next matching event, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<SystemEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.matches_topic(&self.topic) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.skipped += n;
                    debug!("Subscriber for {} lagged, {} events skipped", self.topic, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events lost to lag so far, matching or not
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
