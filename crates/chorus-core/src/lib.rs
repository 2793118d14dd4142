// Core chorus engine without CLI dependencies

pub mod agent;
pub mod config;
pub mod error;
pub mod identifier;
pub mod inbox;
pub mod message;
pub mod router;
pub mod stop;
pub mod team;
pub mod workspace;

pub use agent::{AgentBehavior, AgentDefinition, AgentKind, HandlerError, StateUpdate};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use identifier::Identifier;
pub use message::{
    Event, InvocationId, Message, MessageId, Role, ServiceErrorKind, ServiceFailure,
    ToolInvocation, ToolObservation,
};
pub use router::{Channel, Diagnostic, Router, RouterError};
pub use stop::StopCondition;
pub use team::{CollaborationPolicy, Team, TeamInfo, TeamService, TeamTool, TeamToolbox};
pub use workspace::{Workspace, WorkspaceController};
