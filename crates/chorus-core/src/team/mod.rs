//! Teams: named groups of agents bound to a collaboration policy and a set
//! of team services.

mod policy;
mod service;
mod toolbox;

pub use policy::{
    CentralizedCollaboration, CollaborationPolicy, DecentralizedCollaboration, Route,
};
pub use service::{spawn_service_runtime, ServiceRuntimeHandle, TeamService};
pub use toolbox::{TeamTool, TeamToolbox, ToolSchema, LIST_TOOLS_INVOCATION};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::identifier::Identifier;
use crate::inbox::Inbox;
use crate::message::Event;
use crate::router::{Router, RouterError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TeamError {
    #[error("team {team} has duplicate member {member}")]
    DuplicateMember { team: String, member: String },
    #[error("coordinator {coordinator} is not a member of team {team}")]
    CoordinatorNotMember { team: String, coordinator: String },
    #[error("team {team} has duplicate service {service}")]
    DuplicateService { team: String, service: String },
}

/// Static team configuration, shared with member agents through their
/// context so behaviors can discover their coordinator and services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamInfo {
    pub name: String,
    pub identifier: Identifier,
    pub members: Vec<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<Identifier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Identifier>,
    pub channel: Identifier,
}

impl TeamInfo {
    pub fn is_member(&self, identifier: &Identifier) -> bool {
        self.members.contains(identifier)
    }
}

/// A team of agents, a collaboration policy, and its services.
#[derive(Clone)]
pub struct Team {
    pub name: String,
    pub members: Vec<Identifier>,
    pub policy: Arc<dyn CollaborationPolicy>,
    pub services: Vec<Arc<dyn TeamService>>,
}

impl Team {
    pub fn new(
        name: impl Into<String>,
        members: Vec<Identifier>,
        policy: Arc<dyn CollaborationPolicy>,
        services: Vec<Arc<dyn TeamService>>,
    ) -> Result<Self, TeamError> {
        let name = name.into();
        for (i, member) in members.iter().enumerate() {
            if members[..i].contains(member) {
                return Err(TeamError::DuplicateMember {
                    team: name,
                    member: member.to_string(),
                });
            }
        }
        if let Some(coordinator) = policy.coordinator() {
            if !members.contains(coordinator) {
                return Err(TeamError::CoordinatorNotMember {
                    team: name,
                    coordinator: coordinator.to_string(),
                });
            }
        }
        for (i, service) in services.iter().enumerate() {
            if services[..i].iter().any(|s| s.name() == service.name()) {
                return Err(TeamError::DuplicateService {
                    team: name,
                    service: service.name().to_string(),
                });
            }
        }
        Ok(Self {
            name,
            members,
            policy,
            services,
        })
    }

    pub fn identifier(&self) -> Identifier {
        Identifier::team(&self.name)
    }

    pub fn info(&self) -> TeamInfo {
        TeamInfo {
            name: self.name.clone(),
            identifier: self.identifier(),
            members: self.members.clone(),
            coordinator: self.policy.coordinator().cloned(),
            services: self
                .services
                .iter()
                .map(|s| Identifier::service(&self.name, s.name()))
                .collect(),
            channel: Identifier::channel(&self.name),
        }
    }
}

impl std::fmt::Debug for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Team")
            .field("name", &self.name)
            .field("members", &self.members)
            .field("policy", &self.policy.name())
            .finish_non_exhaustive()
    }
}

/// Control handle for a spawned team runtime.
#[derive(Debug)]
pub struct TeamRuntimeHandle {
    identifier: Identifier,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TeamRuntimeHandle {
    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Register the team identifier and spawn the runtime that applies its
/// collaboration policy to team-addressed traffic.
pub fn spawn_team_runtime(
    info: TeamInfo,
    policy: Arc<dyn CollaborationPolicy>,
    router: Router,
    parent_cancel: &CancellationToken,
) -> Result<TeamRuntimeHandle, RouterError> {
    let identifier = info.identifier.clone();
    let inbox = router.register(identifier.clone())?;
    let cancel = parent_cancel.child_token();
    let task = tokio::spawn(team_loop(info, policy, router, inbox, cancel.clone()));
    Ok(TeamRuntimeHandle {
        identifier,
        cancel,
        task,
    })
}

async fn team_loop(
    info: TeamInfo,
    policy: Arc<dyn CollaborationPolicy>,
    router: Router,
    mut inbox: Inbox,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = inbox.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            Event::Message(message) => {
                let routes = if info.is_member(&message.source) {
                    policy.on_member_outbound(&info, &message)
                } else {
                    policy.on_inbound(&info, &message)
                };
                if routes.is_empty() {
                    router.dead_letter(info.identifier.clone(), Event::Message(message));
                    continue;
                }
                for route in routes {
                    tracing::debug!(
                        team = %info.identifier,
                        target = %route.target,
                        policy = policy.name(),
                        "rewrote team-addressed message"
                    );
                    if let Err(error) = router.send(Event::Message(route.message)).await {
                        tracing::warn!(
                            team = %info.identifier,
                            error = %error,
                            "failed to deliver rewritten message"
                        );
                    }
                }
            }
            other => {
                tracing::debug!(team = %info.identifier, "ignoring non-message event: {other:?}");
            }
        }
    }

    let _ = router.unregister(&info.identifier);
    for event in inbox.drain() {
        router.dead_letter(info.identifier.clone(), event);
    }
    tracing::debug!(team = %info.identifier, "team runtime stopped");
}
