//! The engine facade handed to agent behaviors.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::identifier::Identifier;
use crate::inbox::Inbox;
use crate::message::{
    Event, InvocationId, Message, ServiceFailure, ServiceRequest, ToolInvocation, ToolObservation,
};
use crate::router::{Channel, Router, RouterError};
use crate::team::TeamInfo;

/// Read/write facade an agent uses to talk to the engine. Bound to exactly
/// one agent and one runtime session.
///
/// `send` is validated eagerly but committed lazily: buffered envelopes are
/// routed, in call order, only after the handler step returns successfully.
/// A crashed step therefore emits nothing.
pub struct ChorusContext {
    agent: Identifier,
    router: Router,
    inbox: Arc<tokio::sync::Mutex<Inbox>>,
    outbox: Mutex<Vec<Event>>,
    team: Option<TeamInfo>,
    cancel: CancellationToken,
    drain_grace: Duration,
}

impl ChorusContext {
    pub(crate) fn new(
        agent: Identifier,
        router: Router,
        inbox: Arc<tokio::sync::Mutex<Inbox>>,
        team: Option<TeamInfo>,
        cancel: CancellationToken,
        drain_grace: Duration,
    ) -> Self {
        Self {
            agent,
            router,
            inbox,
            outbox: Mutex::new(Vec::new()),
            team,
            cancel,
            drain_grace,
        }
    }

    /// The agent this context is bound to.
    pub fn agent(&self) -> &Identifier {
        &self.agent
    }

    /// Queue an outbound message. The envelope and its target are checked
    /// immediately; delivery happens when the step commits.
    pub fn send(&self, message: Message) -> Result<(), RouterError> {
        let event = Event::Message(message);
        self.router.check_routable(&event)?;
        self.outbox
            .lock()
            .map_err(|_| RouterError::LockPoisoned)?
            .push(event);
        Ok(())
    }

    /// Channels this agent is a member of.
    pub fn list_channels(&self) -> Result<Vec<Channel>, RouterError> {
        self.router.channels_for(&self.agent)
    }

    /// Copies of unread inbox messages, oldest first, without consuming.
    pub async fn list_inbox(&self) -> Vec<Message> {
        self.inbox.lock().await.unread_messages()
    }

    /// Remove and return unread inbox messages, oldest first. This is how
    /// active agents consume traffic from inside `iterate`.
    pub async fn fetch_inbox(&self) -> Vec<Message> {
        self.inbox.lock().await.take_messages()
    }

    /// The router's current tick.
    pub fn now(&self) -> u64 {
        self.router.current_tick()
    }

    /// Team configuration, when this agent is a team member.
    pub fn team(&self) -> Option<&TeamInfo> {
        self.team.as_ref()
    }

    /// Client for this agent's team services.
    pub fn team_services(&self) -> TeamServices<'_> {
        TeamServices { ctx: self }
    }

    /// Whether workspace shutdown has been signaled. Handlers must check
    /// this at their own suspension points and return without mutating
    /// state once it is set.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the shutdown signal.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn take_outbox(&self) -> Vec<Event> {
        match self.outbox.lock() {
            Ok(mut outbox) => std::mem::take(&mut *outbox),
            Err(_) => {
                tracing::warn!(agent = %self.agent, "outbox poisoned, dropping buffered sends");
                Vec::new()
            }
        }
    }
}

/// Request/response client over the agent's team services.
pub struct TeamServices<'a> {
    ctx: &'a ChorusContext,
}

impl TeamServices<'_> {
    /// Identifiers of every service available to this agent's team.
    pub fn list(&self) -> Vec<Identifier> {
        self.ctx
            .team
            .as_ref()
            .map(|t| t.services.clone())
            .unwrap_or_default()
    }

    fn resolve(&self, service: &str) -> Result<Identifier, RouterError> {
        let team = self
            .ctx
            .team
            .as_ref()
            .ok_or_else(|| RouterError::UnknownIdentifier(Identifier::new(service)))?;
        let identifier = Identifier::service(&team.name, service);
        if self.ctx.router.is_registered(&identifier)? {
            Ok(identifier)
        } else {
            Err(RouterError::UnknownIdentifier(identifier))
        }
    }

    /// Fire a request and return its invocation id without waiting. The
    /// request is routed immediately, not buffered with the step's sends.
    pub async fn submit(
        &self,
        service: &str,
        invocation: ToolInvocation,
        deadline: Option<Duration>,
    ) -> Result<InvocationId, RouterError> {
        let invocation_id = InvocationId::new();
        self.submit_with_id(invocation_id.clone(), service, invocation, deadline)
            .await?;
        Ok(invocation_id)
    }

    /// `submit` with a caller-chosen invocation id. Reusing an id that the
    /// service has already seen yields a `DuplicateInvocation` response.
    pub async fn submit_with_id(
        &self,
        invocation_id: InvocationId,
        service: &str,
        invocation: ToolInvocation,
        deadline: Option<Duration>,
    ) -> Result<(), RouterError> {
        let service_id = self.resolve(service)?;
        let request = ServiceRequest {
            invocation_id,
            source: self.ctx.agent.clone(),
            service: service_id,
            invocation,
            deadline_ms: deadline.map(|d| d.as_millis() as u64),
            timestamp: 0,
        };
        self.ctx
            .router
            .send(Event::TeamServiceRequest(request))
            .await
            .map(|_| ())
    }

    /// Invoke a service and wait for its observation.
    pub async fn invoke(
        &self,
        service: &str,
        invocation: ToolInvocation,
        deadline: Option<Duration>,
    ) -> Result<ToolObservation, RouterError> {
        self.invoke_with_id(InvocationId::new(), service, invocation, deadline)
            .await
    }

    pub async fn invoke_with_id(
        &self,
        invocation_id: InvocationId,
        service: &str,
        invocation: ToolInvocation,
        deadline: Option<Duration>,
    ) -> Result<ToolObservation, RouterError> {
        self.submit_with_id(invocation_id.clone(), service, invocation, deadline)
            .await?;
        Ok(self.collect(&invocation_id).await)
    }

    /// Wait for the response correlated with `invocation_id`. On shutdown
    /// the wait extends through the service drain window; if nothing
    /// arrives the observation degrades to `Cancelled`.
    pub async fn collect(&self, invocation_id: &InvocationId) -> ToolObservation {
        let mut inbox = self.ctx.inbox.lock().await;
        if !self.ctx.cancel.is_cancelled() {
            tokio::select! {
                response = inbox.next_response(invocation_id) => {
                    return match response {
                        Some(response) => response.observation,
                        None => ToolObservation::failure(ServiceFailure::cancelled(
                            "inbox closed while awaiting service response",
                        )),
                    };
                }
                _ = self.ctx.cancel.cancelled() => {}
            }
        }
        match tokio::time::timeout(self.ctx.drain_grace, inbox.next_response(invocation_id)).await {
            Ok(Some(response)) => response.observation,
            _ => ToolObservation::failure(ServiceFailure::cancelled(
                "workspace stopped before the service responded",
            )),
        }
    }
}
