use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::timeout;

use chorus_core::agent::ChorusContext;
use chorus_core::{
    AgentBehavior, AgentDefinition, Diagnostic, EngineConfig, HandlerError, Identifier, Message,
    Role, StateUpdate, StopCondition, Workspace, WorkspaceController,
};

struct EchoBot;

#[async_trait]
impl AgentBehavior for EchoBot {
    async fn respond(
        &self,
        ctx: &ChorusContext,
        _state: &Value,
        message: &Message,
    ) -> Result<StateUpdate, HandlerError> {
        ctx.send(message.reply(ctx.agent().clone(), "Hello."))?;
        Ok(StateUpdate::Unchanged)
    }
}

struct Brittle;

#[async_trait]
impl AgentBehavior for Brittle {
    async fn respond(
        &self,
        ctx: &ChorusContext,
        _state: &Value,
        message: &Message,
    ) -> Result<StateUpdate, HandlerError> {
        if message.content == "boom" {
            return Err(HandlerError::new("boom"));
        }
        ctx.send(message.reply(ctx.agent().clone(), "ok"))?;
        Ok(StateUpdate::Unchanged)
    }
}

#[tokio::test]
async fn hello_workspace_runs_to_quiescence() {
    let workspace = Workspace::new("hello")
        .with_agent(AgentDefinition::new("testbot", Arc::new(EchoBot)))
        .with_start_message(Message::direct("testbot", "human", "Hello."))
        .with_stop_condition(StopCondition::NoActivity { window_ms: 200 });

    let mut controller = WorkspaceController::new(workspace).unwrap();
    let mut tap = controller.add_message_listener();
    controller.start().await.unwrap();
    let router = controller.router();
    let mut human = controller.take_human_inbox().unwrap();

    router
        .send(
            Message::direct("human", "testbot", "hi")
                .with_role(Role::User)
                .into(),
        )
        .await
        .unwrap();

    let start_message = human.next_message().await.unwrap();
    assert_eq!(start_message.content, "Hello.");
    let reply = timeout(Duration::from_secs(1), human.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.content, "Hello.");
    assert_eq!(reply.source, Identifier::new("testbot"));

    // The workspace quiesces on its own within a bounded time.
    timeout(Duration::from_secs(3), controller.run())
        .await
        .expect("run did not return after the no-activity window")
        .unwrap();

    // Routed message trace: start message, the human's "hi", the reply.
    let mut contents = Vec::new();
    while let Ok(event) = tap.try_recv() {
        if let Some(message) = event.as_message() {
            contents.push((message.source.clone(), message.content.clone()));
        }
    }
    assert_eq!(
        contents,
        vec![
            (Identifier::new("testbot"), "Hello.".to_string()),
            (Identifier::human(), "hi".to_string()),
            (Identifier::new("testbot"), "Hello.".to_string()),
        ]
    );
}

#[tokio::test]
async fn crashed_handler_is_isolated_from_the_workspace() {
    let workspace = Workspace::new("crash isolation")
        .with_agent(AgentDefinition::new("fragile", Arc::new(Brittle)))
        .with_agent(AgentDefinition::new("steady", Arc::new(EchoBot)));

    let mut controller = WorkspaceController::new(workspace).unwrap();
    let mut diagnostics = controller.diagnostics();
    controller.start().await.unwrap();
    let router = controller.router();
    let mut human = controller.take_human_inbox().unwrap();

    router
        .send(Message::direct("human", "fragile", "boom").with_role(Role::User).into())
        .await
        .unwrap();

    let crash = timeout(Duration::from_secs(1), diagnostics.recv())
        .await
        .unwrap()
        .unwrap();
    match crash {
        Diagnostic::HandlerCrash { agent, error, .. } => {
            assert_eq!(agent, Identifier::new("fragile"));
            assert_eq!(error, "boom");
        }
        other => panic!("unexpected diagnostic: {other:?}"),
    }

    // Other agents keep working.
    router
        .send(Message::direct("human", "steady", "ping").with_role(Role::User).into())
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(1), human.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.source, Identifier::new("steady"));

    // So does the crashed agent itself; only the step was aborted.
    router
        .send(Message::direct("human", "fragile", "hello").with_role(Role::User).into())
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(1), human.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.content, "ok");

    controller.stop().await;
}

#[tokio::test]
async fn human_stop_signal_terminates_run() {
    let workspace = Workspace::new("signal")
        .with_agent(AgentDefinition::new("testbot", Arc::new(EchoBot)))
        .with_stop_condition(StopCondition::HumanSignal);

    let mut controller = WorkspaceController::new(workspace).unwrap();
    controller.start().await.unwrap();
    let router = controller.router();

    let stop = Message::direct("human", "testbot", "that's enough")
        .with_role(Role::User)
        .with_metadata("stop", json!(true));
    router.send(stop.into()).await.unwrap();

    timeout(Duration::from_secs(3), controller.run())
        .await
        .expect("run did not observe the stop sentinel")
        .unwrap();
}

#[tokio::test]
async fn message_count_stop_condition() {
    let workspace = Workspace::new("count")
        .with_agent(AgentDefinition::new("testbot", Arc::new(EchoBot)))
        .with_start_message(Message::direct("testbot", "human", "one"))
        .with_start_message(Message::direct("testbot", "human", "two"))
        .with_stop_condition(StopCondition::MessageCountReached { count: 2 });

    let mut controller = WorkspaceController::new(workspace).unwrap();
    timeout(Duration::from_secs(3), controller.run())
        .await
        .expect("run did not stop at the message count")
        .unwrap();
}

#[tokio::test]
async fn external_stop_request_shuts_the_workspace_down() {
    let workspace =
        Workspace::new("manual").with_agent(AgentDefinition::new("testbot", Arc::new(EchoBot)));

    let mut controller = WorkspaceController::new(workspace).unwrap();
    let handle = controller.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.request_stop();
    });
    timeout(Duration::from_secs(3), controller.run())
        .await
        .expect("run did not honor the stop request")
        .unwrap();
}

#[tokio::test]
async fn instance_limit_is_enforced_at_construction() {
    let workspace = Workspace::new("too big")
        .with_agent(AgentDefinition::new("a", Arc::new(EchoBot)))
        .with_agent(AgentDefinition::new("b", Arc::new(EchoBot)))
        .with_agent(AgentDefinition::new("c", Arc::new(EchoBot)));

    let config = EngineConfig {
        instance_limit: 2,
        ..EngineConfig::default()
    };
    let error = WorkspaceController::with_config(workspace, config).unwrap_err();
    assert!(error.to_string().contains("over the limit"));
}

#[tokio::test]
async fn duplicate_agent_names_are_rejected() {
    let workspace = Workspace::new("dup")
        .with_agent(AgentDefinition::new("same", Arc::new(EchoBot)))
        .with_agent(AgentDefinition::new("same", Arc::new(EchoBot)));

    let error = WorkspaceController::new(workspace).unwrap_err();
    assert!(error.to_string().contains("duplicate agent name"));
}
