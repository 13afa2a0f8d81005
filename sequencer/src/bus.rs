//! In-process message bus
//!
//! Topic-addressed JSON messages over a tokio broadcast channel. Every
//! payload is a flat object stamped with a `time` field on publish.
//!
//! # Topics
//!
//! - `telescope`: device state changes (`event` names the change)
//! - `pipeline`: post-processing handoff
//! - `queue`: operator control and executor state
//! - `notify`: email and chat notifications

use crate::store::Observation;
use atlas_device::TelescopeEvent;
use chrono::Utc;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default bus buffer size
pub const DEFAULT_BUS_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Telescope,
    Pipeline,
    Queue,
    Notify,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::Telescope => "telescope",
            Topic::Pipeline => "pipeline",
            Topic::Queue => "queue",
            Topic::Notify => "notify",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: Topic,
    pub payload: Value,
}

/// Inbound messages on the `queue` topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueueCommand {
    /// Ask the executor to report its state
    Request,
    /// Start a session now
    Start,
    /// Enable or disable the executor
    State { enabled: bool },
    /// A new observation was submitted
    Create { observation: Observation },
}

/// Statistics about the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub subscribers: usize,
}

pub struct MessageBus {
    sender: broadcast::Sender<BusMessage>,
    published: AtomicU64,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Publish a payload. Objects get a `time` field; other values are
    /// wrapped as `{"value": ..}` first.
    pub fn publish(&self, topic: Topic, payload: Value) {
        let mut payload = match payload {
            Value::Object(map) => Value::Object(map),
            other => json!({ "value": other }),
        };
        if let Some(map) = payload.as_object_mut() {
            map.entry("time")
                .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        debug!("bus {} <- {}", topic, payload);
        // No receivers is fine
        let _ = self.sender.send(BusMessage { topic, payload });
    }

    /// Serialize and publish
    pub fn publish_serialized<T: Serialize>(&self, topic: Topic, message: &T) {
        match serde_json::to_value(message) {
            Ok(value) => self.publish(topic, value),
            Err(e) => warn!("Dropping unserializable {} message: {}", topic, e),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    /// Payloads published on one topic, from now on
    pub fn topic_stream(&self, topic: Topic) -> impl Stream<Item = Value> + Send + 'static {
        stream::unfold(self.subscribe(), move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) if message.topic == topic => return Some((message.payload, rx)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("{} subscriber lagged; skipped {} messages", topic, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Republish device events on the `telescope` topic until the device
    /// channel goes away
    pub fn forward_telescope_events(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<TelescopeEvent>,
    ) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => bus.publish_serialized(Topic::Telescope, &event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Telescope event forwarder skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
