//! A team service exposing a set of named tools to team members.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::message::{ServiceFailure, ToolInvocation};

use super::service::TeamService;

/// Reserved invocation name answering with the schemas of every registered
/// tool.
pub const LIST_TOOLS_INVOCATION: &str = "list_tools";

/// Self-describing contract of one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSchema {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// Derive the input schema from a `JsonSchema` parameter struct.
    pub fn for_params<P: JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let schema = schemars::schema_for!(P);
        Self::new(
            name,
            description,
            serde_json::to_value(schema).unwrap_or_default(),
        )
    }
}

/// One executable tool hosted by a [`TeamToolbox`].
#[async_trait]
pub trait TeamTool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    async fn run(
        &self,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ServiceFailure>;
}

/// Dispatches invocations by tool name over its registered tools.
pub struct TeamToolbox {
    name: String,
    tools: BTreeMap<String, Arc<dyn TeamTool>>,
}

impl TeamToolbox {
    pub const DEFAULT_NAME: &'static str = "toolbox";

    pub fn new(tools: Vec<Arc<dyn TeamTool>>) -> Self {
        Self::with_name(Self::DEFAULT_NAME, tools)
    }

    pub fn with_name(name: impl Into<String>, tools: Vec<Arc<dyn TeamTool>>) -> Self {
        let tools = tools
            .into_iter()
            .map(|tool| (tool.schema().name, tool))
            .collect();
        Self {
            name: name.into(),
            tools,
        }
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|tool| tool.schema()).collect()
    }
}

#[async_trait]
impl TeamService for TeamToolbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<Value, ServiceFailure> {
        if invocation.name == LIST_TOOLS_INVOCATION {
            return serde_json::to_value(self.schemas())
                .map_err(|e| ServiceFailure::execution(e.to_string()));
        }
        match self.tools.get(&invocation.name) {
            Some(tool) => tool.run(invocation.arguments.clone(), cancel).await,
            None => Err(ServiceFailure::execution(format!(
                "tool not found in toolbox: {}",
                invocation.name
            ))),
        }
    }
}
