//! Collaboration policies: pure rewrites of team-addressed traffic.

use serde_json::json;

use crate::identifier::Identifier;
use crate::message::{Message, ORIGIN_METADATA_KEY};

use super::TeamInfo;

/// One rewritten delivery produced by a policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub target: Identifier,
    pub message: Message,
}

impl Route {
    pub fn new(target: Identifier, message: Message) -> Self {
        Self { target, message }
    }
}

/// Rules turning team-addressed messages into per-member deliveries.
///
/// Implementations must be pure functions of the message plus the team's
/// static configuration; the engine may call them from any task and never
/// provides a place to stash state between calls.
pub trait CollaborationPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// The member all external traffic is funneled to, if this policy has
    /// one. Must be a team member.
    fn coordinator(&self) -> Option<&Identifier> {
        None
    }

    /// Rewrite a message that reached the team identifier from outside the
    /// team.
    fn on_inbound(&self, team: &TeamInfo, message: &Message) -> Vec<Route>;

    /// Rewrite a message a member addressed to its own team identifier.
    fn on_member_outbound(&self, team: &TeamInfo, message: &Message) -> Vec<Route>;
}

/// All team traffic funnels through a coordinator member.
///
/// External traffic is relayed to the coordinator with the source preserved
/// and the external sender recorded under the `origin` metadata key.
/// Coordinator messages addressed back to the team return to that origin;
/// other members' team-addressed messages go to the coordinator.
pub struct CentralizedCollaboration {
    coordinator: Identifier,
}

impl CentralizedCollaboration {
    pub fn new(coordinator: impl Into<Identifier>) -> Self {
        Self {
            coordinator: coordinator.into(),
        }
    }
}

impl CollaborationPolicy for CentralizedCollaboration {
    fn name(&self) -> &'static str {
        "centralized"
    }

    fn coordinator(&self) -> Option<&Identifier> {
        Some(&self.coordinator)
    }

    fn on_inbound(&self, _team: &TeamInfo, message: &Message) -> Vec<Route> {
        let relayed = message
            .forwarded_to(self.coordinator.clone())
            .with_metadata(ORIGIN_METADATA_KEY, json!(message.source.as_str()));
        vec![Route::new(self.coordinator.clone(), relayed)]
    }

    fn on_member_outbound(&self, _team: &TeamInfo, message: &Message) -> Vec<Route> {
        if message.source == self.coordinator {
            // Returning traffic: route to the original external sender. A
            // coordinator reply without origin metadata has nowhere to go
            // and is dead-lettered by the team runtime.
            match message.origin() {
                Some(origin) => vec![Route::new(origin.clone(), message.forwarded_to(origin))],
                None => Vec::new(),
            }
        } else {
            vec![Route::new(
                self.coordinator.clone(),
                message.forwarded_to(self.coordinator.clone()),
            )]
        }
    }
}

/// Every team-addressed message is broadcast to all members through the
/// team's internal channel; channel fan-out keeps it away from the source.
#[derive(Default)]
pub struct DecentralizedCollaboration;

impl DecentralizedCollaboration {
    pub fn new() -> Self {
        Self
    }
}

impl CollaborationPolicy for DecentralizedCollaboration {
    fn name(&self) -> &'static str {
        "decentralized"
    }

    fn on_inbound(&self, team: &TeamInfo, message: &Message) -> Vec<Route> {
        vec![Route::new(
            team.channel.clone(),
            message.forwarded_to(team.channel.clone()),
        )]
    }

    fn on_member_outbound(&self, team: &TeamInfo, message: &Message) -> Vec<Route> {
        self.on_inbound(team, message)
    }
}
