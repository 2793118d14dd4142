//! Team service runtimes: asynchronous tool execution on behalf of agents.
//!
//! Every service runs in its own task, separate from any agent runtime.
//! Requests execute concurrently up to the service's parallelism; each
//! request gets exactly one response, correlated through `reply_to`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::identifier::Identifier;
use crate::inbox::Inbox;
use crate::message::{
    Event, InvocationId, ServiceErrorKind, ServiceFailure, ServiceRequest, ServiceResponse,
    ToolInvocation, ToolObservation,
};
use crate::router::{Router, RouterError};

/// A named executor of tool invocations owned by a team.
///
/// Implementations may hold shared resources (HTTP clients, caches) behind
/// their own synchronization; the engine only ever drives them through
/// `execute`. The cancellation token fires when the workspace gives up on
/// the invocation; implementations should return promptly once it is set.
#[async_trait]
pub trait TeamService: Send + Sync {
    fn name(&self) -> &str;

    /// Concurrent invocations this service allows; `None` uses the engine
    /// default.
    fn parallelism(&self) -> Option<usize> {
        None
    }

    async fn execute(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<Value, ServiceFailure>;
}

/// Control handle for a spawned service runtime.
#[derive(Debug)]
pub struct ServiceRuntimeHandle {
    identifier: Identifier,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ServiceRuntimeHandle {
    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Stop accepting requests and begin the drain.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Register the service identifier and spawn its runtime.
pub fn spawn_service_runtime(
    service: Arc<dyn TeamService>,
    identifier: Identifier,
    router: Router,
    config: EngineConfig,
    parent_cancel: &CancellationToken,
) -> Result<ServiceRuntimeHandle, RouterError> {
    let inbox = router.register(identifier.clone())?;
    let cancel = parent_cancel.child_token();
    let task = tokio::spawn(service_loop(
        service,
        identifier.clone(),
        router,
        inbox,
        config,
        cancel.clone(),
    ));
    Ok(ServiceRuntimeHandle {
        identifier,
        cancel,
        task,
    })
}

async fn service_loop(
    service: Arc<dyn TeamService>,
    identifier: Identifier,
    router: Router,
    mut inbox: Inbox,
    config: EngineConfig,
    cancel: CancellationToken,
) {
    let parallelism = service.parallelism().unwrap_or(config.service_parallelism);
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut seen: HashSet<(Identifier, InvocationId)> = HashSet::new();
    let mut inflight: JoinSet<()> = JoinSet::new();
    // Cancelling the runtime starts the drain; invocations themselves are
    // only cancelled once the drain grace runs out.
    let work_cancel = CancellationToken::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = inbox.recv() => match event {
                Some(Event::TeamServiceRequest(request)) => {
                    let key = (request.source.clone(), request.invocation_id.clone());
                    if !seen.insert(key) {
                        tracing::warn!(
                            service = %identifier,
                            invocation = %request.invocation_id,
                            "rejected duplicate invocation"
                        );
                        let response = failure_response(
                            &identifier,
                            &request,
                            ServiceFailure::new(
                                ServiceErrorKind::DuplicateInvocation,
                                format!("invocation {} was already submitted", request.invocation_id),
                            ),
                        );
                        send_response(&router, response).await;
                        continue;
                    }
                    let received_at = Instant::now();
                    let semaphore = semaphore.clone();
                    let service = service.clone();
                    let router = router.clone();
                    let identifier = identifier.clone();
                    let work_cancel = work_cancel.clone();
                    inflight.spawn(async move {
                        let _permit = match semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return,
                        };
                        let observation =
                            execute_request(&*service, &request, received_at, &work_cancel).await;
                        let response = ServiceResponse {
                            reply_to: request.invocation_id.clone(),
                            source: identifier,
                            destination: request.source.clone(),
                            observation,
                            timestamp: 0,
                        };
                        send_response(&router, response).await;
                    });
                }
                Some(_) => {}
                None => break,
            },
            Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
        }
    }

    // Drain: outstanding invocations get the grace period to finish
    // naturally, then are cancelled and answered with `Cancelled`.
    let deadline = Instant::now() + config.drain_grace;
    while !inflight.is_empty() {
        match tokio::time::timeout_at(deadline, inflight.join_next()).await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => break,
        }
    }
    if !inflight.is_empty() {
        work_cancel.cancel();
        while inflight.join_next().await.is_some() {}
    }

    // Requests that never started still owe a response.
    let queued = inbox.drain();
    for event in queued {
        if let Event::TeamServiceRequest(request) = event {
            let response = failure_response(
                &identifier,
                &request,
                ServiceFailure::cancelled("service shut down before execution"),
            );
            send_response(&router, response).await;
        }
    }
    let _ = router.unregister(&identifier);
    tracing::debug!(service = %identifier, "service runtime stopped");
}

async fn execute_request(
    service: &dyn TeamService,
    request: &ServiceRequest,
    received_at: Instant,
    cancel: &CancellationToken,
) -> ToolObservation {
    let work = async {
        match request.deadline_ms {
            Some(ms) => {
                let deadline = received_at + Duration::from_millis(ms);
                match tokio::time::timeout_at(deadline, service.execute(&request.invocation, cancel))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ServiceFailure::timeout(format!(
                        "deadline of {ms} ms exceeded"
                    ))),
                }
            }
            None => service.execute(&request.invocation, cancel).await,
        }
    };
    let result = tokio::select! {
        result = work => result,
        _ = cancel.cancelled() => Err(ServiceFailure::cancelled("invocation cancelled at shutdown")),
    };
    match result {
        Ok(value) => ToolObservation::success(value),
        Err(failure) => ToolObservation::failure(failure),
    }
}

fn failure_response(
    identifier: &Identifier,
    request: &ServiceRequest,
    failure: ServiceFailure,
) -> ServiceResponse {
    ServiceResponse {
        reply_to: request.invocation_id.clone(),
        source: identifier.clone(),
        destination: request.source.clone(),
        observation: ToolObservation::failure(failure),
        timestamp: 0,
    }
}

async fn send_response(router: &Router, response: ServiceResponse) {
    let destination = response.destination.clone();
    if let Err(error) = router.send(Event::TeamServiceResponse(response)).await {
        tracing::debug!(
            destination = %destination,
            error = %error,
            "service response undeliverable"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::ActivityMonitor;
    use serde_json::json;

    struct SleepyEcho {
        delay: Duration,
    }

    #[async_trait]
    impl TeamService for SleepyEcho {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            invocation: &ToolInvocation,
            _cancel: &CancellationToken,
        ) -> Result<Value, ServiceFailure> {
            tokio::time::sleep(self.delay).await;
            Ok(invocation.arguments.clone())
        }
    }

    fn setup(delay: Duration) -> (Router, Inbox, ServiceRuntimeHandle, CancellationToken) {
        let router = Router::new(&EngineConfig::default(), ActivityMonitor::new());
        let agent_inbox = router.register(Identifier::new("agent")).unwrap();
        let cancel = CancellationToken::new();
        let handle = spawn_service_runtime(
            Arc::new(SleepyEcho { delay }),
            Identifier::service("t", "echo"),
            router.clone(),
            EngineConfig {
                drain_grace: Duration::from_millis(200),
                ..EngineConfig::default()
            },
            &cancel,
        )
        .unwrap();
        (router, agent_inbox, handle, cancel)
    }

    fn request(invocation_id: &InvocationId, deadline_ms: Option<u64>) -> ServiceRequest {
        ServiceRequest {
            invocation_id: invocation_id.clone(),
            source: Identifier::new("agent"),
            service: Identifier::service("t", "echo"),
            invocation: ToolInvocation::new("echo", json!(["a", "b"])),
            deadline_ms,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn request_gets_exactly_one_response() {
        let (router, mut inbox, handle, _cancel) = setup(Duration::from_millis(10));
        let id = InvocationId::new();
        router
            .send(Event::TeamServiceRequest(request(&id, Some(500))))
            .await
            .unwrap();

        let response = inbox.next_response(&id).await.unwrap();
        assert!(response.observation.ok);
        assert_eq!(response.observation.result, Some(json!(["a", "b"])));

        // No second response shows up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(inbox.try_recv().is_none());
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn missed_deadline_yields_timeout() {
        let (router, mut inbox, handle, _cancel) = setup(Duration::from_millis(200));
        let id = InvocationId::new();
        router
            .send(Event::TeamServiceRequest(request(&id, Some(40))))
            .await
            .unwrap();

        let response = inbox.next_response(&id).await.unwrap();
        assert!(!response.observation.ok);
        assert_eq!(
            response.observation.error_kind(),
            Some(ServiceErrorKind::Timeout)
        );
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn duplicate_invocation_is_rejected() {
        let (router, mut inbox, handle, _cancel) = setup(Duration::from_millis(5));
        let id = InvocationId::new();
        router
            .send(Event::TeamServiceRequest(request(&id, None)))
            .await
            .unwrap();
        let first = inbox.next_response(&id).await.unwrap();
        assert!(first.observation.ok);

        router
            .send(Event::TeamServiceRequest(request(&id, None)))
            .await
            .unwrap();
        let second = inbox.next_response(&id).await.unwrap();
        assert_eq!(
            second.observation.error_kind(),
            Some(ServiceErrorKind::DuplicateInvocation)
        );
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_outstanding_invocations() {
        let (router, mut inbox, handle, _cancel) = setup(Duration::from_secs(30));
        let id = InvocationId::new();
        router
            .send(Event::TeamServiceRequest(request(&id, None)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.stop();
        let response = tokio::time::timeout(Duration::from_secs(1), inbox.next_response(&id))
            .await
            .expect("no cancellation response within the drain window")
            .unwrap();
        assert_eq!(
            response.observation.error_kind(),
            Some(ServiceErrorKind::Cancelled)
        );
        handle.join().await;
    }
}
