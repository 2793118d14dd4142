//! Envelope types exchanged through the router.
//!
//! [`Message`] is the immutable envelope agents exchange; [`Event`] is the
//! superset routed by the engine, covering service traffic and lifecycle
//! announcements. Envelopes are serde-serializable and carry the router's
//! monotonic tick in `timestamp`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;
use uuid::Uuid;

use crate::identifier::Identifier;

/// Role of the message author in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(format!("msg_{}", Uuid::now_v7()))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(String);

impl InvocationId {
    pub fn new() -> Self {
        Self(format!("inv_{}", Uuid::now_v7()))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named tool call carried inside a message or service request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Classification of a failed service invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceErrorKind {
    Timeout,
    DuplicateInvocation,
    Cancelled,
    Execution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ServiceFailure {
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ServiceFailure {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Cancelled, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Execution, message)
    }
}

/// Outcome of one tool invocation, as observed by the requesting agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolObservation {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceFailure>,
}

impl ToolObservation {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(failure: ServiceFailure) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(failure),
        }
    }

    pub fn error_kind(&self) -> Option<ServiceErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

fn default_role() -> Role {
    Role::Assistant
}

/// Metadata key the centralized policy uses to remember the external
/// requester when relaying team traffic to the coordinator.
pub const ORIGIN_METADATA_KEY: &str = "origin";

/// Metadata key marking a human stop signal.
pub const STOP_METADATA_KEY: &str = "stop";

/// The immutable envelope exchanged between principals.
///
/// Exactly one of `destination` or `channel` is set. `timestamp` is the
/// router's monotonic tick, stamped on send; a value of 0 means the message
/// has not been routed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message_id: MessageId,
    pub source: Identifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Identifier>,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observations: Vec<ToolObservation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

impl Message {
    /// A direct message addressed to a single principal.
    pub fn direct(
        source: impl Into<Identifier>,
        destination: impl Into<Identifier>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            source: source.into(),
            destination: Some(destination.into()),
            channel: None,
            content: content.into(),
            role: Role::Assistant,
            actions: Vec::new(),
            observations: Vec::new(),
            metadata: BTreeMap::new(),
            timestamp: 0,
            reply_to: None,
        }
    }

    /// A publication to every member of a channel except the source.
    pub fn publication(
        source: impl Into<Identifier>,
        channel: impl Into<Identifier>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            source: source.into(),
            destination: None,
            channel: Some(channel.into()),
            content: content.into(),
            role: Role::Assistant,
            actions: Vec::new(),
            observations: Vec::new(),
            metadata: BTreeMap::new(),
            timestamp: 0,
            reply_to: None,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_reply_to(mut self, reply_to: MessageId) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// A reply addressed to this message's source, correlated via
    /// `reply_to` and preserving any `origin` routing metadata.
    pub fn reply(&self, source: impl Into<Identifier>, content: impl Into<String>) -> Self {
        let mut reply = Message::direct(source, self.source.clone(), content)
            .with_reply_to(self.message_id.clone());
        if let Some(origin) = self.metadata.get(ORIGIN_METADATA_KEY) {
            reply.metadata.insert(ORIGIN_METADATA_KEY.into(), origin.clone());
        }
        reply
    }

    /// A fresh envelope carrying the same content re-addressed to `target`,
    /// correlated with this message via `reply_to`. Used by collaboration
    /// policies when rewriting team-addressed traffic.
    pub fn forwarded_to(&self, target: Identifier) -> Self {
        let mut forwarded = self.clone();
        forwarded.message_id = MessageId::new();
        forwarded.reply_to = Some(self.message_id.clone());
        forwarded.timestamp = 0;
        if target.is_channel() {
            forwarded.channel = Some(target);
            forwarded.destination = None;
        } else {
            forwarded.destination = Some(target);
            forwarded.channel = None;
        }
        forwarded
    }

    /// The identifier named in the `origin` metadata, if present.
    pub fn origin(&self) -> Option<Identifier> {
        self.metadata
            .get(ORIGIN_METADATA_KEY)
            .and_then(|v| v.as_str())
            .map(Identifier::from)
    }

    /// Whether this message is the human's stop sentinel.
    pub fn is_stop_signal(&self) -> bool {
        self.source.is_human()
            && self
                .metadata
                .get(STOP_METADATA_KEY)
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }
}

/// A request for a team service, addressed to `service:<team>/<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub invocation_id: InvocationId,
    pub source: Identifier,
    pub service: Identifier,
    pub invocation: ToolInvocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub timestamp: u64,
}

/// The single response a service emits per request. `reply_to` carries the
/// request's invocation id so agents can correlate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub reply_to: InvocationId,
    pub source: Identifier,
    pub destination: Identifier,
    pub observation: ToolObservation,
    #[serde(default)]
    pub timestamp: u64,
}

/// Everything that flows through the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Message(Message),
    TeamServiceRequest(ServiceRequest),
    TeamServiceResponse(ServiceResponse),
    AgentStarted {
        agent: Identifier,
        #[serde(default)]
        timestamp: u64,
    },
    AgentStopped {
        agent: Identifier,
        #[serde(default)]
        timestamp: u64,
    },
    Snapshot {
        path: String,
        #[serde(default)]
        timestamp: u64,
    },
}

impl Event {
    pub fn timestamp(&self) -> u64 {
        match self {
            Event::Message(m) => m.timestamp,
            Event::TeamServiceRequest(r) => r.timestamp,
            Event::TeamServiceResponse(r) => r.timestamp,
            Event::AgentStarted { timestamp, .. }
            | Event::AgentStopped { timestamp, .. }
            | Event::Snapshot { timestamp, .. } => *timestamp,
        }
    }

    pub(crate) fn set_timestamp(&mut self, tick: u64) {
        match self {
            Event::Message(m) => m.timestamp = tick,
            Event::TeamServiceRequest(r) => r.timestamp = tick,
            Event::TeamServiceResponse(r) => r.timestamp = tick,
            Event::AgentStarted { timestamp, .. }
            | Event::AgentStopped { timestamp, .. }
            | Event::Snapshot { timestamp, .. } => *timestamp = tick,
        }
    }

    pub fn source(&self) -> Option<&Identifier> {
        match self {
            Event::Message(m) => Some(&m.source),
            Event::TeamServiceRequest(r) => Some(&r.source),
            Event::TeamServiceResponse(r) => Some(&r.source),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Event::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Event::Message(m) => Some(m),
            _ => None,
        }
    }
}

impl From<Message> for Event {
    fn from(message: Message) -> Self {
        Event::Message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_serde_round_trip() {
        let message = Message::direct("planner", "worker", "split the task")
            .with_role(Role::User)
            .with_metadata("priority", json!("high"));
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn event_kind_tags_are_snake_case() {
        let event = Event::Message(Message::direct("a", "b", "hi"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "message");

        let started = Event::AgentStarted {
            agent: Identifier::new("a"),
            timestamp: 3,
        };
        let value = serde_json::to_value(&started).unwrap();
        assert_eq!(value["kind"], "agent_started");
    }

    #[test]
    fn stop_signal_requires_human_source_and_flag() {
        let stop = Message::direct("human", "planner", "")
            .with_role(Role::User)
            .with_metadata(STOP_METADATA_KEY, json!(true));
        assert!(stop.is_stop_signal());

        let not_human = Message::direct("planner", "worker", "")
            .with_metadata(STOP_METADATA_KEY, json!(true));
        assert!(!not_human.is_stop_signal());

        let no_flag = Message::direct("human", "planner", "");
        assert!(!no_flag.is_stop_signal());
    }

    #[test]
    fn forwarded_message_keeps_source_and_links_original() {
        let original = Message::direct("human", "team:research", "q");
        let forwarded = original.forwarded_to(Identifier::new("coordinator"));
        assert_eq!(forwarded.source, original.source);
        assert_eq!(forwarded.destination, Some(Identifier::new("coordinator")));
        assert_eq!(forwarded.reply_to, Some(original.message_id.clone()));
        assert_ne!(forwarded.message_id, original.message_id);

        let published = original.forwarded_to(Identifier::channel("research"));
        assert_eq!(published.channel, Some(Identifier::channel("research")));
        assert_eq!(published.destination, None);
    }

    #[test]
    fn reply_preserves_origin_metadata() {
        let inbound = Message::direct("coordinator", "worker", "sub")
            .with_metadata(ORIGIN_METADATA_KEY, json!("human"));
        let reply = inbound.reply("worker", "done");
        assert_eq!(reply.destination, Some(Identifier::new("coordinator")));
        assert_eq!(reply.origin(), Some(Identifier::human()));
        assert_eq!(reply.reply_to, Some(inbound.message_id));
    }
}
