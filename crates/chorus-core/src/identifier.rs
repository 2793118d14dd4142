//! The flat naming space for routable principals.
//!
//! An [`Identifier`] names an agent (`planner`), a team (`team:research`),
//! a channel (`channel:news`), a team service (`service:research/toolbox`),
//! or the human principal (`human`). Identifiers are case-sensitive and
//! compared byte-wise.

use std::fmt;

use serde::{Deserialize, Serialize};

const TEAM_PREFIX: &str = "team:";
const CHANNEL_PREFIX: &str = "channel:";
const SERVICE_PREFIX: &str = "service:";

/// Name of the principal representing the human user.
pub const HUMAN: &str = "human";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn human() -> Self {
        Self(HUMAN.to_string())
    }

    pub fn team(name: &str) -> Self {
        Self(format!("{TEAM_PREFIX}{name}"))
    }

    pub fn channel(name: &str) -> Self {
        Self(format!("{CHANNEL_PREFIX}{name}"))
    }

    pub fn service(team: &str, service: &str) -> Self {
        Self(format!("{SERVICE_PREFIX}{team}/{service}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_human(&self) -> bool {
        self.0 == HUMAN
    }

    pub fn is_team(&self) -> bool {
        self.0.starts_with(TEAM_PREFIX)
    }

    pub fn is_channel(&self) -> bool {
        self.0.starts_with(CHANNEL_PREFIX)
    }

    pub fn is_service(&self) -> bool {
        self.0.starts_with(SERVICE_PREFIX)
    }

    /// The bare team name, if this identifier names a team.
    pub fn team_name(&self) -> Option<&str> {
        self.0.strip_prefix(TEAM_PREFIX)
    }

    /// The bare channel name, if this identifier names a channel.
    pub fn channel_name(&self) -> Option<&str> {
        self.0.strip_prefix(CHANNEL_PREFIX)
    }

    /// The `(team, service)` pair, if this identifier names a team service.
    pub fn service_parts(&self) -> Option<(&str, &str)> {
        self.0.strip_prefix(SERVICE_PREFIX)?.split_once('/')
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
