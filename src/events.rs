//! In-process pub/sub keyed by topic.
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

/// Topic the gateway publishes table writes on.
pub const DATA_CHANGED: &str = "data:changed";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default)]
pub struct EventBus {
    channels: Arc<DashMap<String, broadcast::Sender<Event>>>,
}

/// Receiving half of a topic; dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Next event, skipping over any lag. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let sender = self
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        Subscription {
            rx: sender.subscribe(),
        }
    }

    /// Publish to every live subscriber of `topic`; returns how many received it.
    pub fn emit(&self, topic: &str, payload: Value) -> usize {
        let Some(sender) = self.channels.get(topic).map(|s| s.clone()) else {
            return 0;
        };
        let event = Event {
            topic: topic.to_string(),
            payload,
        };
        match sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                self.channels
                    .remove_if(topic, |_, s| s.receiver_count() == 0);
                0
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.channels
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    pub fn emit_data_changed(&self, table: &str, op: WriteOp) -> usize {
        self.emit(
            DATA_CHANGED,
            serde_json::json!({ "table": table, "op": op }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_topic_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("school:updated");
        let mut b = bus.subscribe("school:updated");
        let mut other = bus.subscribe("class:updated");

        assert_eq!(bus.emit("school:updated", json!({"id": 1})), 2);
        assert_eq!(a.recv().await.unwrap().payload, json!({"id": 1}));
        assert_eq!(b.recv().await.unwrap().topic, "school:updated");
        assert!(other.try_recv().is_none());
    }

    #[test]
    fn emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.emit("nobody", json!(null)), 0);
        assert_eq!(bus.subscriber_count("nobody"), 0);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe("t");
        assert_eq!(bus.subscriber_count("t"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("t"), 0);
        assert_eq!(bus.emit("t", json!(1)), 0);
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[test]
    fn data_changed_payload() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(DATA_CHANGED);
        bus.emit_data_changed("classes", WriteOp::Update);
        let event = sub.try_recv().unwrap();
        assert_eq!(event.payload, json!({"table": "classes", "op": "update"}));
    }
}
