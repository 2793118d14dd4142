//! One runtime per agent: owns its state and inbox, drives its steps.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::identifier::Identifier;
use crate::inbox::Inbox;
use crate::message::{Event, Message};
use crate::router::{Diagnostic, Router, RouterError};
use crate::team::TeamInfo;

use super::context::ChorusContext;
use super::{AgentDefinition, AgentKind, StateUpdate};

const CMD_CHANNEL_CAPACITY: usize = 8;

/// Lifecycle of an agent runtime, observable through its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentLifecycle {
    Created,
    Initializing,
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("agent runtime not reachable: {0}")]
    NotRunning(Identifier),
    #[error("channel closed")]
    ChannelClosed,
}

/// Point-in-time capture of one agent: committed state plus undelivered
/// inbox events.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub agent: Identifier,
    pub state: Value,
    pub pending: Vec<Event>,
}

enum RuntimeCmd {
    Snapshot {
        reply: oneshot::Sender<AgentSnapshot>,
    },
}

/// Control handle for a spawned agent runtime.
#[derive(Debug)]
pub struct AgentRuntimeHandle {
    name: Identifier,
    cmd_tx: mpsc::Sender<RuntimeCmd>,
    lifecycle: watch::Receiver<AgentLifecycle>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AgentRuntimeHandle {
    pub fn name(&self) -> &Identifier {
        &self.name
    }

    pub fn lifecycle(&self) -> AgentLifecycle {
        *self.lifecycle.borrow()
    }

    /// Capture the agent's committed state and pending inbox. Processed
    /// between steps, so the capture is always consistent.
    pub async fn snapshot(&self) -> Result<AgentSnapshot, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| RuntimeError::NotRunning(self.name.clone()))?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Signal shutdown. The runtime finishes the current step (bounded by
    /// the configured grace period) and exits.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait until the runtime reports `Stopped`.
    pub async fn stopped(&self) {
        let mut lifecycle = self.lifecycle.clone();
        while *lifecycle.borrow() != AgentLifecycle::Stopped {
            if lifecycle.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

enum Step {
    Respond(Message),
    Iterate,
}

struct AgentRuntime {
    name: Identifier,
    definition: AgentDefinition,
    team: Option<TeamInfo>,
    router: Router,
    config: EngineConfig,
    inbox: Arc<tokio::sync::Mutex<Inbox>>,
    state: Value,
    lifecycle: watch::Sender<AgentLifecycle>,
    cancel: CancellationToken,
}

impl AgentRuntime {
    fn set(&self, state: AgentLifecycle) {
        self.lifecycle.send_replace(state);
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RuntimeCmd>, initial_state: Option<Value>) {
        self.set(AgentLifecycle::Initializing);
        self.state = initial_state.unwrap_or_else(|| self.definition.behavior.init_state());
        self.router.announce(Event::AgentStarted {
            agent: self.name.clone(),
            timestamp: 0,
        });
        self.set(AgentLifecycle::Idle);

        let kind = self.definition.behavior.kind();
        let iterate_interval = self
            .definition
            .iterate_interval
            .unwrap_or(self.config.iterate_interval);
        let mut next_iterate = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(cmd) = cmd_rx.recv() => {
                    self.handle_cmd(cmd).await;
                    continue;
                }
                step = Self::next_step(kind, &self.inbox, next_iterate) => step,
            };

            self.execute_step(&step).await;
            if matches!(step, Step::Iterate) {
                next_iterate = Instant::now() + iterate_interval;
            }
        }

        self.shutdown().await;
    }

    /// The scheduling rule: passive agents pop the oldest unread message,
    /// active agents iterate on their cadence, otherwise the runtime parks
    /// until traffic or shutdown.
    async fn next_step(
        kind: AgentKind,
        inbox: &Arc<tokio::sync::Mutex<Inbox>>,
        next_iterate: Instant,
    ) -> Step {
        match kind {
            AgentKind::Passive => {
                let mut guard = inbox.lock().await;
                match guard.next_message().await {
                    Some(message) => Step::Respond(message),
                    // Sender side gone; park until shutdown wins the select.
                    None => std::future::pending().await,
                }
            }
            AgentKind::Active => {
                tokio::time::sleep_until(next_iterate).await;
                Step::Iterate
            }
        }
    }

    async fn execute_step(&mut self, step: &Step) {
        self.set(AgentLifecycle::Running);
        let ctx = ChorusContext::new(
            self.name.clone(),
            self.router.clone(),
            self.inbox.clone(),
            self.team.clone(),
            self.cancel.clone(),
            self.config.drain_grace,
        );
        let behavior = self.definition.behavior.clone();

        let outcome = {
            let handler = async {
                match step {
                    Step::Respond(message) => behavior.respond(&ctx, &self.state, message).await,
                    Step::Iterate => behavior.iterate(&ctx, &self.state).await,
                }
            };
            tokio::select! {
                result = handler => Some(result),
                _ = Self::abandon_after(&self.cancel, self.config.step_grace) => None,
            }
        };

        match outcome {
            Some(Ok(update)) => {
                // Sends are committed in call order, only now that the step
                // has succeeded.
                for event in ctx.take_outbox() {
                    if let Err(error) = self.router.send(event).await {
                        tracing::warn!(
                            agent = %self.name,
                            error = %error,
                            "dropped outbound message at commit"
                        );
                    }
                }
                if let StateUpdate::Updated(next) = update {
                    self.state = next;
                }
                self.router.activity().record_step();
            }
            Some(Err(error)) => {
                tracing::warn!(agent = %self.name, error = %error, "handler step failed");
                self.router.report(Diagnostic::HandlerCrash {
                    agent: self.name.clone(),
                    error: error.to_string(),
                    timestamp: self.router.current_tick(),
                });
                self.router.activity().record_step();
            }
            None => {
                tracing::warn!(agent = %self.name, "step abandoned at shutdown grace");
            }
        }
        self.set(AgentLifecycle::Idle);
    }

    async fn abandon_after(cancel: &CancellationToken, grace: Duration) {
        cancel.cancelled().await;
        tokio::time::sleep(grace).await;
    }

    async fn handle_cmd(&mut self, cmd: RuntimeCmd) {
        match cmd {
            RuntimeCmd::Snapshot { reply } => {
                let pending = self.inbox.lock().await.unread();
                let _ = reply.send(AgentSnapshot {
                    agent: self.name.clone(),
                    state: self.state.clone(),
                    pending,
                });
            }
        }
    }

    async fn shutdown(&mut self) {
        self.set(AgentLifecycle::Stopping);
        let _ = self.router.unregister(&self.name);
        let dropped = self.inbox.lock().await.drain();
        for event in dropped {
            self.router.dead_letter(self.name.clone(), event);
        }
        self.router.announce(Event::AgentStopped {
            agent: self.name.clone(),
            timestamp: 0,
        });
        self.set(AgentLifecycle::Stopped);
        tracing::debug!(agent = %self.name, "agent runtime stopped");
    }
}

/// Register the agent with the router and spawn its runtime task.
pub fn spawn_agent_runtime(
    definition: AgentDefinition,
    team: Option<TeamInfo>,
    initial_state: Option<Value>,
    router: Router,
    config: EngineConfig,
    parent_cancel: &CancellationToken,
) -> Result<AgentRuntimeHandle, RouterError> {
    let name = Identifier::new(definition.name.clone());
    let inbox = router.register(name.clone())?;
    let cancel = parent_cancel.child_token();
    let (lifecycle_tx, lifecycle_rx) = watch::channel(AgentLifecycle::Created);
    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);

    let runtime = AgentRuntime {
        name: name.clone(),
        definition,
        team,
        router,
        config,
        inbox: Arc::new(tokio::sync::Mutex::new(inbox)),
        state: Value::Null,
        lifecycle: lifecycle_tx,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(runtime.run(cmd_rx, initial_state));

    Ok(AgentRuntimeHandle {
        name,
        cmd_tx,
        lifecycle: lifecycle_rx,
        cancel,
        task: Some(task),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentBehavior, HandlerError};
    use crate::message::Role;
    use crate::stop::ActivityMonitor;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl AgentBehavior for Echo {
        fn init_state(&self) -> Value {
            json!({ "responses": 0 })
        }

        async fn respond(
            &self,
            ctx: &ChorusContext,
            state: &Value,
            message: &Message,
        ) -> Result<StateUpdate, HandlerError> {
            if message.content == "boom" {
                return Err(HandlerError::new("boom"));
            }
            ctx.send(message.reply(ctx.agent().clone(), "Hello.").with_role(Role::Assistant))?;
            let responses = state["responses"].as_u64().unwrap_or(0) + 1;
            Ok(StateUpdate::Updated(json!({ "responses": responses })))
        }
    }

    fn test_setup() -> (Router, CancellationToken) {
        let router = Router::new(&EngineConfig::default(), ActivityMonitor::new());
        (router, CancellationToken::new())
    }

    #[tokio::test]
    async fn passive_agent_responds_and_commits_state() {
        let (router, cancel) = test_setup();
        let mut human = router.register(Identifier::human()).unwrap();
        let handle = spawn_agent_runtime(
            AgentDefinition::new("echo", Arc::new(Echo)),
            None,
            None,
            router.clone(),
            EngineConfig::default(),
            &cancel,
        )
        .unwrap();

        router
            .send(Message::direct("human", "echo", "hi").with_role(Role::User).into())
            .await
            .unwrap();

        let reply = human.next_message().await.unwrap();
        assert_eq!(reply.content, "Hello.");
        assert_eq!(reply.source, Identifier::new("echo"));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state["responses"], 1);

        handle.stop();
        handle.stopped().await;
    }

    #[tokio::test]
    async fn crashed_step_leaves_state_untouched_and_reports() {
        let (router, cancel) = test_setup();
        let _human = router.register(Identifier::human()).unwrap();
        let mut diagnostics = router.subscribe_diagnostics();
        let handle = spawn_agent_runtime(
            AgentDefinition::new("echo", Arc::new(Echo)),
            None,
            None,
            router.clone(),
            EngineConfig::default(),
            &cancel,
        )
        .unwrap();

        router
            .send(Message::direct("human", "echo", "boom").with_role(Role::User).into())
            .await
            .unwrap();

        let crash = tokio::time::timeout(Duration::from_secs(1), diagnostics.recv())
            .await
            .unwrap()
            .unwrap();
        match crash {
            Diagnostic::HandlerCrash { agent, error, .. } => {
                assert_eq!(agent, Identifier::new("echo"));
                assert_eq!(error, "boom");
            }
            other => panic!("unexpected diagnostic: {other:?}"),
        }

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, json!({ "responses": 0 }));

        handle.stop();
        handle.stopped().await;
    }

    struct Ticker;

    #[async_trait]
    impl AgentBehavior for Ticker {
        fn kind(&self) -> AgentKind {
            AgentKind::Active
        }

        fn init_state(&self) -> Value {
            json!(0)
        }

        async fn iterate(
            &self,
            _ctx: &ChorusContext,
            state: &Value,
        ) -> Result<StateUpdate, HandlerError> {
            Ok(StateUpdate::Updated(json!(state.as_u64().unwrap_or(0) + 1)))
        }
    }

    #[tokio::test]
    async fn active_agent_iterations_are_rate_limited() {
        let (router, cancel) = test_setup();
        let config = EngineConfig {
            iterate_interval: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let handle = spawn_agent_runtime(
            AgentDefinition::new("ticker", Arc::new(Ticker)),
            None,
            None,
            router.clone(),
            config,
            &cancel,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let snapshot = handle.snapshot().await.unwrap();
        let ticks = snapshot.state.as_u64().unwrap();
        assert!(ticks >= 2, "expected at least 2 iterations, got {ticks}");
        assert!(ticks <= 4, "iterations not rate limited, got {ticks}");

        handle.stop();
        handle.stopped().await;
    }

    #[tokio::test]
    async fn stopped_runtime_dead_letters_pending_inbox() {
        let (router, cancel) = test_setup();
        let mut diagnostics = router.subscribe_diagnostics();
        // An active agent that never reads its inbox.
        let handle = spawn_agent_runtime(
            AgentDefinition::new("idle", Arc::new(Ticker)),
            None,
            None,
            router.clone(),
            EngineConfig {
                iterate_interval: Duration::from_secs(60),
                ..EngineConfig::default()
            },
            &cancel,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        router
            .send(Message::direct("human", "idle", "never read").into())
            .await
            .unwrap();
        handle.stop();
        handle.stopped().await;

        let mut saw_dead_letter = false;
        while let Ok(diagnostic) = diagnostics.try_recv() {
            if let Diagnostic::DeadLetter { target, .. } = diagnostic {
                assert_eq!(target, Identifier::new("idle"));
                saw_dead_letter = true;
            }
        }
        assert!(saw_dead_letter);
    }
}
