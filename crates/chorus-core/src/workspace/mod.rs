//! Workspace lifecycle: construct, start, run, snapshot, stop.

mod snapshot;
mod spec;

pub use snapshot::{load_snapshot, SnapshotData, SNAPSHOT_FILE_NAME};
pub use spec::{
    build_workspace, AgentSpec, AgentTypeRegistry, CollaborationSpec, DefinitionError,
    ServiceRegistry, StopConditionSpec, TeamSpec, WorkspaceSpec,
};

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{
    spawn_agent_runtime, AgentDefinition, AgentLifecycle, AgentRuntimeHandle, AgentSnapshot,
};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::identifier::Identifier;
use crate::inbox::Inbox;
use crate::message::{Event, Message};
use crate::router::{Channel, Diagnostic, Router};
use crate::stop::{wait_until_stopped, ActivityMonitor, StopCondition};
use crate::team::{
    spawn_service_runtime, spawn_team_runtime, ServiceRuntimeHandle, Team, TeamInfo,
    TeamRuntimeHandle,
};

/// A complete runnable collective: agents, teams, channels, start traffic,
/// and the conditions under which it stops.
#[derive(Debug, Default, Clone)]
pub struct Workspace {
    pub title: String,
    pub description: String,
    pub main_channel: Option<String>,
    pub start_messages: Vec<Message>,
    pub stop_conditions: Vec<StopCondition>,
    pub agents: Vec<AgentDefinition>,
    pub teams: Vec<Team>,
}

impl Workspace {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_team(mut self, team: Team) -> Self {
        self.teams.push(team);
        self
    }

    pub fn with_main_channel(mut self, channel: impl Into<String>) -> Self {
        self.main_channel = Some(channel.into());
        self
    }

    pub fn with_start_message(mut self, message: Message) -> Self {
        self.start_messages.push(message);
        self
    }

    pub fn with_stop_condition(mut self, condition: StopCondition) -> Self {
        self.stop_conditions.push(condition);
        self
    }

    fn validate(&self, config: &EngineConfig) -> std::result::Result<(), DefinitionError> {
        let count = self.agents.len() + self.teams.len();
        if count > config.instance_limit {
            return Err(DefinitionError::InstanceLimitExceeded {
                count,
                limit: config.instance_limit,
            });
        }
        for (i, agent) in self.agents.iter().enumerate() {
            if self.agents[..i].iter().any(|a| a.name == agent.name) {
                return Err(DefinitionError::DuplicateAgent(agent.name.clone()));
            }
        }
        for team in &self.teams {
            for member in &team.members {
                if !self.agents.iter().any(|a| a.name == member.as_str()) {
                    return Err(DefinitionError::UnknownMember {
                        team: team.name.clone(),
                        member: member.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Stopped,
}

/// Cloneable handle for requesting a stop from outside `run()` (signal
/// handlers, embedding UIs).
#[derive(Clone)]
pub struct ControllerHandle {
    stop_requested: CancellationToken,
}

impl ControllerHandle {
    pub fn request_stop(&self) {
        self.stop_requested.cancel();
    }
}

/// Owns the router, every runtime, and the stop evaluation loop.
#[derive(Debug)]
pub struct WorkspaceController {
    workspace: Workspace,
    config: EngineConfig,
    activity: ActivityMonitor,
    router: Router,
    cancel: CancellationToken,
    stop_requested: CancellationToken,
    agents: Vec<AgentRuntimeHandle>,
    teams: Vec<TeamRuntimeHandle>,
    services: Vec<ServiceRuntimeHandle>,
    monitors: Vec<JoinHandle<()>>,
    human_inbox: Option<Inbox>,
    restored: Option<SnapshotData>,
    snapshot_on_stop: Option<std::path::PathBuf>,
    phase: Phase,
}

impl WorkspaceController {
    pub fn new(workspace: Workspace) -> Result<Self> {
        Self::with_config(workspace, EngineConfig::default())
    }

    pub fn with_config(workspace: Workspace, config: EngineConfig) -> Result<Self> {
        workspace.validate(&config)?;
        let activity = ActivityMonitor::new();
        let router = Router::new(&config, activity.clone());
        Ok(Self {
            workspace,
            config,
            activity,
            router,
            cancel: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            agents: Vec::new(),
            teams: Vec::new(),
            services: Vec::new(),
            monitors: Vec::new(),
            human_inbox: None,
            restored: None,
            snapshot_on_stop: None,
            phase: Phase::Created,
        })
    }

    /// Write a snapshot to `path` as the first step of `stop`, while all
    /// runtimes are still alive.
    pub fn snapshot_on_stop(&mut self, path: impl Into<std::path::PathBuf>) {
        self.snapshot_on_stop = Some(path.into());
    }

    /// Seed agent states and pending traffic from a prior snapshot. Must be
    /// called before `start`; the workspace's start messages are skipped on
    /// a restored run, since the original run already delivered them.
    pub fn restore(&mut self, snapshot: SnapshotData) {
        self.restored = Some(snapshot);
    }

    /// Clone of the router, for injecting external traffic (e.g. messages
    /// from `human`) and inspecting history.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            stop_requested: self.stop_requested.clone(),
        }
    }

    /// Observer tap over all routed events; best-effort copies, never
    /// authoritative.
    pub fn add_message_listener(&self) -> broadcast::Receiver<Event> {
        self.router.subscribe()
    }

    /// The diagnostic channel carrying `DeadLetter` and `HandlerCrash`.
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.router.subscribe_diagnostics()
    }

    /// Take ownership of the `human` principal's inbox. Available after
    /// `start`.
    pub fn take_human_inbox(&mut self) -> Option<Inbox> {
        self.human_inbox.take()
    }

    pub fn agent_lifecycles(&self) -> HashMap<Identifier, AgentLifecycle> {
        self.agents
            .iter()
            .map(|h| (h.name().clone(), h.lifecycle()))
            .collect()
    }

    /// Register every principal, spin up all runtimes, and deliver start
    /// traffic. Non-blocking: returns once the workspace is live.
    pub async fn start(&mut self) -> Result<()> {
        if self.phase != Phase::Created {
            return Ok(());
        }
        tracing::info!(title = %self.workspace.title, "starting workspace");

        let restored = self.restored.take();
        let mut initial_states: HashMap<String, Value> = restored
            .as_ref()
            .map(|s| s.states.clone().into_iter().collect())
            .unwrap_or_default();

        self.human_inbox = Some(self.router.register(Identifier::human())?);

        if let Some(main_channel) = &self.workspace.main_channel {
            let members = self
                .workspace
                .agents
                .iter()
                .map(|a| Identifier::new(a.name.clone()));
            self.router
                .register_channel(Channel::new(main_channel, members))?;
        }
        for team in &self.workspace.teams {
            self.router
                .register_channel(Channel::new(&team.name, team.members.iter().cloned()))?;
        }

        for team in &self.workspace.teams {
            for service in &team.services {
                let identifier = Identifier::service(&team.name, service.name());
                self.services.push(spawn_service_runtime(
                    service.clone(),
                    identifier,
                    self.router.clone(),
                    self.config.clone(),
                    &self.cancel,
                )?);
            }
            self.teams.push(spawn_team_runtime(
                team.info(),
                team.policy.clone(),
                self.router.clone(),
                &self.cancel,
            )?);
        }

        let memberships: HashMap<String, TeamInfo> = self
            .workspace
            .teams
            .iter()
            .flat_map(|team| {
                let info = team.info();
                team.members
                    .iter()
                    .map(move |m| (m.to_string(), info.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        for definition in &self.workspace.agents {
            let mut handle = spawn_agent_runtime(
                definition.clone(),
                memberships.get(&definition.name).cloned(),
                initial_states.remove(&definition.name),
                self.router.clone(),
                self.config.clone(),
                &self.cancel,
            )?;
            if let Some(task) = handle.take_task() {
                self.monitors.push(Self::monitor_runtime(
                    task,
                    handle.name().clone(),
                    self.router.clone(),
                    self.cancel.clone(),
                    self.config.fail_fast,
                ));
            }
            self.agents.push(handle);
        }

        if let Some(snapshot) = restored {
            for event in snapshot.events {
                if let Err(error) = self.router.send(event).await {
                    tracing::warn!(error = %error, "dropped event while replaying snapshot");
                }
            }
        } else {
            for message in self.workspace.start_messages.clone() {
                self.router.send(Event::Message(message)).await?;
            }
        }

        self.phase = Phase::Running;
        Ok(())
    }

    /// Isolate an unrecoverable runtime crash: mark the agent stopped and
    /// keep the rest of the workspace alive unless fail-fast is on.
    fn monitor_runtime(
        task: JoinHandle<()>,
        name: Identifier,
        router: Router,
        cancel: CancellationToken,
        fail_fast: bool,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(error) = task.await {
                tracing::error!(agent = %name, error = %error, "agent runtime crashed");
                router.report(Diagnostic::HandlerCrash {
                    agent: name.clone(),
                    error: error.to_string(),
                    timestamp: router.current_tick(),
                });
                let _ = router.unregister(&name);
                router.announce(Event::AgentStopped {
                    agent: name,
                    timestamp: 0,
                });
                if fail_fast {
                    cancel.cancel();
                }
            }
        })
    }

    /// Start, then block until a stop condition fires or a stop is
    /// requested, then shut down.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        wait_until_stopped(
            &self.workspace.stop_conditions,
            &self.activity,
            &self.stop_requested,
        )
        .await;
        self.stop().await;
        Ok(())
    }

    /// Signal shutdown and wait for every runtime to exit. Agent runtimes
    /// finish their current step (bounded by the step grace); services
    /// drain up to the drain grace and cancel the rest.
    pub async fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        tracing::info!(title = %self.workspace.title, "stopping workspace");
        self.phase = Phase::Stopped;
        if let Some(path) = self.snapshot_on_stop.take() {
            if let Err(error) = self.snapshot(&path).await {
                tracing::error!(error = %error, "failed to write shutdown snapshot");
            }
        }
        self.cancel.cancel();

        let join_grace = self.config.step_grace + self.config.drain_grace;
        for monitor in self.monitors.drain(..) {
            if tokio::time::timeout(join_grace, monitor).await.is_err() {
                tracing::error!("agent runtime did not exit within the shutdown grace");
            }
        }
        for team in self.teams.drain(..) {
            team.stop();
            team.join().await;
        }
        for service in self.services.drain(..) {
            service.stop();
            if tokio::time::timeout(join_grace, service.join())
                .await
                .is_err()
            {
                tracing::error!("service runtime did not exit within the shutdown grace");
            }
        }
        tracing::info!("workspace stopped");
    }

    /// Serialize each agent's state and pending inbox to `path` in the
    /// newline-delimited JSON snapshot format.
    pub async fn snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut snapshots: Vec<AgentSnapshot> = Vec::with_capacity(self.agents.len());
        for handle in &self.agents {
            // A runtime stuck in a long step (e.g. awaiting a hung service)
            // only answers between steps; don't let it stall the snapshot.
            let capture = tokio::time::timeout(self.config.step_grace, handle.snapshot()).await;
            match capture {
                Ok(Ok(snapshot)) => snapshots.push(snapshot),
                Ok(Err(error)) => {
                    tracing::warn!(agent = %handle.name(), error = %error, "agent skipped in snapshot");
                }
                Err(_) => {
                    tracing::warn!(agent = %handle.name(), "agent busy, skipped in snapshot");
                }
            }
        }
        snapshot::write_snapshot(path.as_ref(), &snapshots)?;
        self.router.announce(Event::Snapshot {
            path: path.as_ref().display().to_string(),
            timestamp: 0,
        });
        Ok(())
    }
}
