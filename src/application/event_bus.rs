//! In-process event fan-out
//!
//! One `broadcast` channel per topic plus a firehose carrying every event.
//! Publishing never waits: a subscriber that falls behind loses its oldest
//! events, and an event with no subscriber is dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

pub mod topics {
    pub const ENGINE_STATE: &str = "engine.state";
    pub const ENGINE_STAGE: &str = "engine.stage";
    pub const TRADE_EXECUTED: &str = "trade.executed";
    pub const POSITION_CLOSED: &str = "position.closed";
    pub const ENGINE_STATUS: &str = "engine.status";
}

/// Wire shape of every event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(event_type: &str, run_id: Option<&str>) -> Self {
        EventEnvelope {
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            run_id: run_id.map(str::to_string),
            stage: None,
            reason: None,
            payload: Value::Null,
        }
    }

    pub fn with_stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_string());
        self
    }

    pub fn with_reason(mut self, reason: Option<&str>) -> Self {
        self.reason = reason.map(str::to_string);
        self
    }

    /// Attaches any serializable payload; values that fail to serialize
    /// become `null`.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        self
    }
}

/// Clone-able via internal Arc.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<EventEnvelope>>>>,
    firehose: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (firehose, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            firehose,
        }
    }

    /// Subscribe to one topic. Only events published afterwards are seen.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<EventEnvelope> {
        {
            let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = channels.get(topic) {
                return tx.subscribe();
            }
        }

        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to every topic.
    pub fn subscribe_all(&self) -> broadcast::Receiver<EventEnvelope> {
        self.firehose.subscribe()
    }

    /// Fire-and-forget publish. Returns how many receivers got the event.
    pub fn publish(&self, event: EventEnvelope) -> usize {
        let topic_receivers = {
            let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
            channels
                .get(&event.event_type)
                .map(|tx| tx.send(event.clone()).unwrap_or(0))
                .unwrap_or(0)
        };
        let firehose_receivers = self.firehose.send(event).unwrap_or(0);
        let delivered = topic_receivers + firehose_receivers;
        if delivered == 0 {
            debug!("Event dropped, no subscribers");
        }
        delivered
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[tokio::test]
    async fn test_topic_and_firehose_delivery() {
        let bus = EventBus::new();
        let mut trades = bus.subscribe(topics::TRADE_EXECUTED);
        let mut all = bus.subscribe_all();

        bus.publish(EventEnvelope::new(topics::ENGINE_STATE, Some("run-1")));
        bus.publish(
            EventEnvelope::new(topics::TRADE_EXECUTED, Some("run-1"))
                .with_payload(&json!({"units": 1000})),
        );

        let trade = trades.recv().await.unwrap();
        assert_eq!(trade.payload["units"], 1000);
        assert!(matches!(trades.try_recv(), Err(TryRecvError::Empty)));

        assert_eq!(all.recv().await.unwrap().event_type, topics::ENGINE_STATE);
        assert_eq!(all.recv().await.unwrap().event_type, topics::TRADE_EXECUTED);
    }

    #[tokio::test]
    async fn test_late_subscribers_see_only_new_events() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(EventEnvelope::new(topics::ENGINE_STATUS, None)), 0);

        let mut rx = bus.subscribe(topics::ENGINE_STATUS);
        bus.publish(EventEnvelope::new(topics::ENGINE_STATUS, None).with_reason(Some("idle")));
        assert_eq!(rx.recv().await.unwrap().reason.as_deref(), Some("idle"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();
        for _ in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish(EventEnvelope::new(topics::ENGINE_STAGE, None));
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(10))));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let event = EventEnvelope::new(topics::ENGINE_STAGE, Some("r"))
            .with_stage("risk")
            .with_reason(Some("leverage_cap"));
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "engine.stage");
        assert_eq!(wire["stage"], "risk");
        assert_eq!(wire["reason"], "leverage_cap");
        assert_eq!(wire["run_id"], "r");
        assert!(wire.get("payload").is_some());

        let bare = serde_json::to_value(EventEnvelope::new(topics::ENGINE_STATE, None)).unwrap();
        assert!(bare.get("stage").is_none());
    }
}
