//! The declarative workspace definition and the registries that resolve it.
//!
//! The definition format is JSON (spec'd as a JSON-compatible superset; any
//! serde front-end producing these structs works). The engine is agnostic
//! to agent `type` values: it looks them up in the registry the embedding
//! program provides, never through ambient discovery.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::agent::{AgentBehavior, AgentDefinition};
use crate::message::Message;
use crate::stop::StopCondition;
use crate::team::{
    CentralizedCollaboration, CollaborationPolicy, DecentralizedCollaboration, Team, TeamError,
    TeamService,
};

use super::Workspace;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("unknown agent type: {0}")]
    UnknownAgentType(String),
    #[error("unknown team service: {0}")]
    UnknownService(String),
    #[error("duplicate agent name: {0}")]
    DuplicateAgent(String),
    #[error("team {team} references unknown agent {member}")]
    UnknownMember { team: String, member: String },
    #[error("unknown collaboration type: {0}")]
    UnknownCollaboration(String),
    #[error("centralized collaboration for team {0} requires a coordinator")]
    MissingCoordinator(String),
    #[error("unknown stop condition type: {0}")]
    UnknownStopCondition(String),
    #[error("stop condition {condition} is missing parameter {parameter}")]
    MissingParameter {
        condition: String,
        parameter: String,
    },
    #[error("workspace holds {count} agents and teams, over the limit of {limit}")]
    InstanceLimitExceeded { count: usize, limit: usize },
    #[error(transparent)]
    Team(#[from] TeamError),
    #[error("invalid agent spec for {name}: {message}")]
    InvalidAgentSpec { name: String, message: String },
}

/// Top-level workspace definition document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_channel: Option<String>,
    #[serde(default)]
    pub start_messages: Vec<Message>,
    #[serde(default)]
    pub stop_conditions: Vec<StopConditionSpec>,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub teams: Vec<TeamSpec>,
}

impl WorkspaceSpec {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&text)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopConditionSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Declarative description of one agent. Fields beyond `type` and `name`
/// are interpreted by the registered factory, not by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reachable_agents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterate_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamSpec {
    #[serde(rename = "type", default = "default_team_type")]
    pub kind: String,
    pub name: String,
    pub agents: Vec<String>,
    pub collaboration: CollaborationSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

fn default_team_type() -> String {
    "team".to_string()
}

type AgentFactory =
    Box<dyn Fn(&AgentSpec) -> Result<Arc<dyn AgentBehavior>, DefinitionError> + Send + Sync>;

/// Explicit factory mapping agent `type` names to behavior constructors.
#[derive(Default)]
pub struct AgentTypeRegistry {
    factories: HashMap<String, AgentFactory>,
}

impl AgentTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&AgentSpec) -> Result<Arc<dyn AgentBehavior>, DefinitionError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn build(&self, spec: &AgentSpec) -> Result<Arc<dyn AgentBehavior>, DefinitionError> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| DefinitionError::UnknownAgentType(spec.kind.clone()))?;
        factory(spec)
    }
}

type ServiceFactory =
    Box<dyn Fn(&TeamSpec) -> Result<Arc<dyn TeamService>, DefinitionError> + Send + Sync>;

/// Factory mapping team service names to implementations.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&TeamSpec) -> Result<Arc<dyn TeamService>, DefinitionError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn build(
        &self,
        name: &str,
        team: &TeamSpec,
    ) -> Result<Arc<dyn TeamService>, DefinitionError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| DefinitionError::UnknownService(name.to_string()))?;
        factory(team)
    }
}

fn build_stop_condition(spec: &StopConditionSpec) -> Result<StopCondition, DefinitionError> {
    let u64_param = |key: &str| -> Result<u64, DefinitionError> {
        spec.parameters
            .get(key)
            .and_then(Value::as_u64)
            .ok_or_else(|| DefinitionError::MissingParameter {
                condition: spec.kind.clone(),
                parameter: key.to_string(),
            })
    };
    match spec.kind.as_str() {
        "no_activity" => Ok(StopCondition::NoActivity {
            window_ms: u64_param("window_ms")?,
        }),
        "message_count_reached" => Ok(StopCondition::MessageCountReached {
            count: u64_param("count")?,
        }),
        "human_signal" => Ok(StopCondition::HumanSignal),
        other => Err(DefinitionError::UnknownStopCondition(other.to_string())),
    }
}

fn build_collaboration(
    team: &TeamSpec,
) -> Result<Arc<dyn CollaborationPolicy>, DefinitionError> {
    match team.collaboration.kind.as_str() {
        "centralized" => {
            let coordinator = team
                .collaboration
                .coordinator
                .as_deref()
                .ok_or_else(|| DefinitionError::MissingCoordinator(team.name.clone()))?;
            Ok(Arc::new(CentralizedCollaboration::new(coordinator)))
        }
        "decentralized" => Ok(Arc::new(DecentralizedCollaboration::new())),
        other => Err(DefinitionError::UnknownCollaboration(other.to_string())),
    }
}

/// Resolve a declarative definition into a runnable [`Workspace`].
pub fn build_workspace(
    spec: &WorkspaceSpec,
    agents: &AgentTypeRegistry,
    services: &ServiceRegistry,
) -> Result<Workspace, DefinitionError> {
    let mut definitions = Vec::with_capacity(spec.agents.len());
    for agent_spec in &spec.agents {
        if definitions
            .iter()
            .any(|d: &AgentDefinition| d.name == agent_spec.name)
        {
            return Err(DefinitionError::DuplicateAgent(agent_spec.name.clone()));
        }
        let behavior = agents.build(agent_spec)?;
        let mut definition = AgentDefinition::new(&agent_spec.name, behavior);
        if let Some(ms) = agent_spec.iterate_interval_ms {
            definition = definition.with_iterate_interval(Duration::from_millis(ms));
        }
        definitions.push(definition);
    }

    let mut teams = Vec::with_capacity(spec.teams.len());
    for team_spec in &spec.teams {
        for member in &team_spec.agents {
            if !definitions.iter().any(|d| &d.name == member) {
                return Err(DefinitionError::UnknownMember {
                    team: team_spec.name.clone(),
                    member: member.clone(),
                });
            }
        }
        let policy = build_collaboration(team_spec)?;
        let mut team_services: Vec<Arc<dyn TeamService>> =
            Vec::with_capacity(team_spec.services.len());
        for service_name in &team_spec.services {
            team_services.push(services.build(service_name, team_spec)?);
        }
        let members = team_spec
            .agents
            .iter()
            .map(|name| crate::identifier::Identifier::new(name.clone()))
            .collect();
        teams.push(Team::new(
            team_spec.name.clone(),
            members,
            policy,
            team_services,
        )?);
    }

    let stop_conditions = spec
        .stop_conditions
        .iter()
        .map(build_stop_condition)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Workspace {
        title: spec.title.clone(),
        description: spec.description.clone(),
        main_channel: spec.main_channel.clone(),
        start_messages: spec.start_messages.clone(),
        stop_conditions,
        agents: definitions,
        teams,
    })
}
