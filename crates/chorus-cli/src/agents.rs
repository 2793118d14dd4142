//! Builtin demo agent types available to workspace definitions.

use std::sync::Arc;

use async_trait::async_trait;
use chorus_core::agent::ChorusContext;
use chorus_core::workspace::AgentTypeRegistry;
use chorus_core::{AgentBehavior, HandlerError, Message, Role, StateUpdate};
use serde_json::Value;

/// Passive agent replying to every inbound message, either with a canned
/// reply (the definition's `instruction` field) or by echoing the content
/// back.
pub struct EchoAgent {
    reply: Option<String>,
}

#[async_trait]
impl AgentBehavior for EchoAgent {
    async fn respond(
        &self,
        ctx: &ChorusContext,
        _state: &Value,
        message: &Message,
    ) -> Result<StateUpdate, HandlerError> {
        let content = self
            .reply
            .clone()
            .unwrap_or_else(|| message.content.clone());
        ctx.send(
            message
                .reply(ctx.agent().clone(), content)
                .with_role(Role::Assistant),
        )?;
        Ok(StateUpdate::Unchanged)
    }
}

/// Registry with every builtin agent type.
pub fn builtin_registry() -> AgentTypeRegistry {
    let mut registry = AgentTypeRegistry::new();
    registry.register("echo", |spec| {
        Ok(Arc::new(EchoAgent {
            reply: spec.instruction.clone(),
        }) as Arc<dyn AgentBehavior>)
    });
    registry
}
