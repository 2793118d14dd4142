//! Agent capability surface and per-agent runtimes.

mod context;
mod runtime;

pub use context::{ChorusContext, TeamServices};
pub use runtime::{
    spawn_agent_runtime, AgentLifecycle, AgentRuntimeHandle, AgentSnapshot, RuntimeError,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;

use crate::message::Message;

/// How an agent's runtime schedules it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentKind {
    /// Driven by a periodic `iterate` step.
    Active,
    /// Driven only by inbound messages.
    Passive,
}

/// Result of one handler step. `Unchanged` lets handlers skip re-serializing
/// untouched state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    Updated(Value),
    Unchanged,
}

/// A failure inside `respond`/`iterate`. The runtime aborts the step,
/// leaves state untouched, and reports a `HandlerCrash` diagnostic.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<crate::router::RouterError> for HandlerError {
    fn from(error: crate::router::RouterError) -> Self {
        Self::new(error.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error.to_string())
    }
}

/// The capability set an agent implementation exposes to the engine.
///
/// State is an opaque serializable value owned by the behavior; the runtime
/// stores it between steps and commits updates atomically after a step
/// returns. Implementations register under a type name in the embedding
/// program's registry, never by ambient discovery.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    fn kind(&self) -> AgentKind {
        AgentKind::Passive
    }

    /// Called exactly once when the runtime starts.
    fn init_state(&self) -> Value {
        Value::Null
    }

    /// Handle one inbound message. Only invoked for passive agents.
    async fn respond(
        &self,
        _ctx: &ChorusContext,
        _state: &Value,
        _message: &Message,
    ) -> Result<StateUpdate, HandlerError> {
        Ok(StateUpdate::Unchanged)
    }

    /// One periodic step. Only invoked for active agents.
    async fn iterate(&self, _ctx: &ChorusContext, _state: &Value) -> Result<StateUpdate, HandlerError> {
        Ok(StateUpdate::Unchanged)
    }
}

/// A named agent bound to its behavior, as held by a workspace.
#[derive(Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub behavior: Arc<dyn AgentBehavior>,
    /// Overrides the engine-wide iterate cadence for this agent.
    pub iterate_interval: Option<Duration>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, behavior: Arc<dyn AgentBehavior>) -> Self {
        Self {
            name: name.into(),
            behavior,
            iterate_interval: None,
        }
    }

    pub fn with_iterate_interval(mut self, interval: Duration) -> Self {
        self.iterate_interval = Some(interval);
        self
    }
}

impl std::fmt::Debug for AgentDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDefinition")
            .field("name", &self.name)
            .field("kind", &self.behavior.kind())
            .finish_non_exhaustive()
    }
}
