use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{FlowgateError, Result};
use crate::types::*;

/// Routing topic. Observers subscribe to a set of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Runtime,
    Execution,
    Bridge,
    Approvals,
    Logs,
    System,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Runtime,
        Topic::Execution,
        Topic::Bridge,
        Topic::Approvals,
        Topic::Logs,
        Topic::System,
    ];
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Runtime => "runtime",
            Self::Execution => "execution",
            Self::Bridge => "bridge",
            Self::Approvals => "approvals",
            Self::Logs => "logs",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

/// Self-describing event wrapper delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub topics: Vec<Topic>,
}

impl EventEnvelope {
    /// Validate `payload` against the schema registered for `event` and wrap it.
    pub fn build(event: &str, payload: Value) -> Result<Self> {
        let schema = lookup(event).ok_or_else(|| FlowgateError::UnknownEvent(event.to_string()))?;
        (schema.validate)(&payload).map_err(|message| FlowgateError::InvalidPayload {
            event: event.to_string(),
            message,
        })?;

        let execution_id = payload
            .get(schema.execution_id_field)
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(Self {
            event: event.to_string(),
            payload,
            execution_id,
            timestamp: Utc::now(),
            topics: schema.topics.to_vec(),
        })
    }

    pub fn matches(&self, topics: &[Topic]) -> bool {
        self.topics.iter().any(|t| topics.contains(t))
    }
}

struct EventSchema {
    name: &'static str,
    topics: &'static [Topic],
    /// Payload field holding the execution id, if any.
    execution_id_field: &'static str,
    validate: fn(&Value) -> std::result::Result<(), String>,
}

fn shape<T: DeserializeOwned>(value: &Value) -> std::result::Result<(), String> {
    T::deserialize(value).map(|_| ()).map_err(|e| e.to_string())
}

const EXEC: &[Topic] = &[Topic::Execution];
const BRIDGE: &[Topic] = &[Topic::Bridge];

const REGISTRY: &[EventSchema] = &[
    EventSchema { name: "runtime:state", topics: &[Topic::Runtime, Topic::System], execution_id_field: "", validate: shape::<RuntimeStatePayload> },
    EventSchema { name: "execution:started", topics: EXEC, execution_id_field: "id", validate: shape::<ExecutionRecord> },
    EventSchema { name: "execution:completed", topics: EXEC, execution_id_field: "id", validate: shape::<ExecutionRecord> },
    EventSchema { name: "execution:failed", topics: EXEC, execution_id_field: "id", validate: shape::<ExecutionRecord> },
    EventSchema { name: "execution:cancelled", topics: EXEC, execution_id_field: "id", validate: shape::<ExecutionRecord> },
    EventSchema { name: "execution:queued", topics: EXEC, execution_id_field: "id", validate: shape::<ExecutionRecord> },
    EventSchema { name: "execution:node", topics: EXEC, execution_id_field: "executionId", validate: shape::<NodeEventPayload> },
    EventSchema { name: "approval:requested", topics: &[Topic::Approvals], execution_id_field: "executionId", validate: shape::<PendingApprovalEntry> },
    EventSchema { name: "approval:decided", topics: &[Topic::Approvals], execution_id_field: "executionId", validate: shape::<CompletedApprovalEntry> },
    EventSchema { name: "bridge:connecting", topics: BRIDGE, execution_id_field: "", validate: shape::<BridgeEventPayload> },
    EventSchema { name: "bridge:connected", topics: BRIDGE, execution_id_field: "", validate: shape::<BridgeEventPayload> },
    EventSchema { name: "bridge:disconnected", topics: BRIDGE, execution_id_field: "", validate: shape::<BridgeEventPayload> },
    EventSchema { name: "bridge:reconnecting", topics: BRIDGE, execution_id_field: "", validate: shape::<BridgeEventPayload> },
    EventSchema { name: "bridge:error", topics: BRIDGE, execution_id_field: "", validate: shape::<BridgeEventPayload> },
    EventSchema { name: "bridge:message", topics: BRIDGE, execution_id_field: "", validate: shape::<BridgeEventPayload> },
    EventSchema { name: "toolstream:chunk", topics: &[Topic::Bridge, Topic::Logs], execution_id_field: "executionId", validate: shape::<ToolStreamChunk> },
    EventSchema { name: "toolstream:summary", topics: BRIDGE, execution_id_field: "", validate: shape::<ToolStreamSummaryPayload> },
    EventSchema { name: "log:line", topics: &[Topic::Logs], execution_id_field: "executionId", validate: shape::<LogLinePayload> },
    EventSchema { name: "system:notice", topics: &[Topic::System], execution_id_field: "", validate: shape::<SystemNoticePayload> },
];

fn lookup(event: &str) -> Option<&'static EventSchema> {
    REGISTRY.iter().find(|s| s.name == event)
}

/// Topics an event is routed to, or None for unregistered names.
pub fn topics_for(event: &str) -> Option<&'static [Topic]> {
    lookup(event).map(|s| s.topics)
}

/// Every registered event name.
pub fn event_names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|s| s.name)
}

/// In-process event bus using a tokio broadcast channel.
/// Every subscriber receives every envelope; topic filtering happens downstream.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Validate and broadcast. Unknown names and malformed payloads are rejected here.
    pub fn publish<P: Serialize>(&self, event: &str, payload: &P) -> Result<EventEnvelope> {
        let envelope = EventEnvelope::build(event, serde_json::to_value(payload)?)?;
        // No receivers is fine
        let _ = self.tx.send(envelope.clone());
        Ok(envelope)
    }

    /// Publish from a call site that cannot act on a rejection; logs instead.
    pub fn emit<P: Serialize>(&self, event: &str, payload: &P) {
        if let Err(e) = self.publish(event, payload) {
            warn!(event, error = %e, "Dropping invalid event");
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_event_is_rejected() {
        let err = EventEnvelope::build("execution:exploded", json!({})).unwrap_err();
        assert!(matches!(err, FlowgateError::UnknownEvent(name) if name == "execution:exploded"));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let err = EventEnvelope::build("log:line", json!({"level": "loud"})).unwrap_err();
        assert!(matches!(err, FlowgateError::InvalidPayload { .. }));
    }

    #[test]
    fn envelope_carries_topics_and_execution_id() {
        let record = ExecutionRecord::new("plan-a");
        let env = EventEnvelope::build("execution:started", serde_json::to_value(&record).unwrap())
            .unwrap();
        assert_eq!(env.topics, vec![Topic::Execution]);
        assert_eq!(env.execution_id.as_deref(), Some(record.id.as_str()));

        let chunk = ToolStreamChunk::new("c1", "search", ChunkStatus::Start, "");
        let env = EventEnvelope::build("toolstream:chunk", serde_json::to_value(&chunk).unwrap())
            .unwrap();
        assert!(env.matches(&[Topic::Logs]));
        assert!(!env.matches(&[Topic::Approvals]));
        assert!(env.execution_id.is_none());
    }

    #[test]
    fn envelope_serializes_self_describing() {
        let env = EventEnvelope::build("system:notice", json!({"message": "hi"})).unwrap();
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["event"], "system:notice");
        assert_eq!(v["payload"]["message"], "hi");
        assert_eq!(v["topics"], json!(["system"]));
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn every_event_has_a_topic() {
        for name in event_names() {
            assert!(!topics_for(name).unwrap().is_empty(), "{}", name);
        }
    }

    #[tokio::test]
    async fn bus_delivers_valid_envelopes() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish("system:notice", &SystemNoticePayload { message: "up".into() })
            .unwrap();
        assert!(bus.publish("nope", &json!({})).is_err());
        let env = rx.recv().await.unwrap();
        assert_eq!(env.event, "system:notice");
        assert!(rx.try_recv().is_err());
    }
}
