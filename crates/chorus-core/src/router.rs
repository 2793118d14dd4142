//! Name-addressed event delivery.
//!
//! The router is the single in-process broker: principals register an inbox
//! under their identifier, senders address events by identifier or channel,
//! and the router stamps each accepted event with a monotonically increasing
//! tick. Delivery is reliable in-process and at-most-once; ordering is FIFO
//! per (source, destination) pair with no cross-pair guarantee.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::identifier::Identifier;
use crate::inbox::{inbox_pair, EnqueueError, Inbox, InboxSender};
use crate::message::Event;
use crate::stop::ActivityMonitor;

const LISTENER_CAPACITY: usize = 256;
const DIAGNOSTIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouterError {
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(Identifier),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("inbox full: {0}")]
    InboxFull(Identifier),
    #[error("inbox closed: {0}")]
    InboxClosed(Identifier),
    #[error("router lock poisoned")]
    LockPoisoned,
}

/// A named multicast group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: Identifier,
    pub members: BTreeSet<Identifier>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Channel {
    pub fn new(name: &str, members: impl IntoIterator<Item = Identifier>) -> Self {
        Self {
            name: Identifier::channel(name),
            members: members.into_iter().collect(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn contains(&self, member: &Identifier) -> bool {
        self.members.contains(member)
    }
}

/// Out-of-band failure reports. Diagnostics ride a dedicated broadcast
/// channel, not inboxes, so they can never be confused with delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// An event could not be delivered and was dropped.
    DeadLetter {
        target: Identifier,
        event: Box<Event>,
        #[serde(default)]
        timestamp: u64,
    },
    /// A handler step failed; the agent's state was left unchanged.
    HandlerCrash {
        agent: Identifier,
        error: String,
        #[serde(default)]
        timestamp: u64,
    },
}

#[derive(Debug)]
struct RouterInner {
    clock: AtomicU64,
    inbox_capacity: usize,
    enqueue_timeout: Duration,
    history_limit: usize,
    registry: RwLock<HashMap<Identifier, InboxSender>>,
    channels: RwLock<HashMap<Identifier, Channel>>,
    history: Mutex<VecDeque<Event>>,
    listeners: broadcast::Sender<Event>,
    diagnostics: broadcast::Sender<Diagnostic>,
    activity: ActivityMonitor,
}

#[derive(Debug, Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(config: &EngineConfig, activity: ActivityMonitor) -> Self {
        let (listeners, _) = broadcast::channel(LISTENER_CAPACITY);
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);
        Self {
            inner: Arc::new(RouterInner {
                clock: AtomicU64::new(0),
                inbox_capacity: config.inbox_capacity,
                enqueue_timeout: config.enqueue_timeout,
                history_limit: config.history_limit,
                registry: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                listeners,
                diagnostics,
                activity,
            }),
        }
    }

    fn registry_read(
        &self,
    ) -> Result<RwLockReadGuard<'_, HashMap<Identifier, InboxSender>>, RouterError> {
        self.inner.registry.read().map_err(|_| RouterError::LockPoisoned)
    }

    fn registry_write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<Identifier, InboxSender>>, RouterError> {
        self.inner.registry.write().map_err(|_| RouterError::LockPoisoned)
    }

    fn channels_read(
        &self,
    ) -> Result<RwLockReadGuard<'_, HashMap<Identifier, Channel>>, RouterError> {
        self.inner.channels.read().map_err(|_| RouterError::LockPoisoned)
    }

    fn channels_write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<Identifier, Channel>>, RouterError> {
        self.inner.channels.write().map_err(|_| RouterError::LockPoisoned)
    }

    fn history_lock(&self) -> Result<MutexGuard<'_, VecDeque<Event>>, RouterError> {
        self.inner.history.lock().map_err(|_| RouterError::LockPoisoned)
    }

    /// Register a principal and hand back the receiving half of its inbox.
    /// Re-registering an identifier replaces the previous inbox.
    pub fn register(&self, identifier: Identifier) -> Result<Inbox, RouterError> {
        let (sender, inbox) = inbox_pair(self.inner.inbox_capacity);
        let previous = self.registry_write()?.insert(identifier.clone(), sender);
        if previous.is_some() {
            tracing::warn!(identifier = %identifier, "replaced existing inbox registration");
        }
        tracing::debug!(identifier = %identifier, "registered principal");
        Ok(inbox)
    }

    /// Remove a principal. Events already queued to it are dropped by the
    /// owning runtime, which reports them back here as dead letters.
    pub fn unregister(&self, identifier: &Identifier) -> Result<bool, RouterError> {
        let removed = self.registry_write()?.remove(identifier).is_some();
        if removed {
            tracing::debug!(identifier = %identifier, "unregistered principal");
        }
        Ok(removed)
    }

    pub fn is_registered(&self, identifier: &Identifier) -> Result<bool, RouterError> {
        Ok(self.registry_read()?.contains_key(identifier))
    }

    pub fn register_channel(&self, channel: Channel) -> Result<(), RouterError> {
        self.channels_write()?.insert(channel.name.clone(), channel);
        Ok(())
    }

    pub fn channel(&self, name: &Identifier) -> Result<Option<Channel>, RouterError> {
        Ok(self.channels_read()?.get(name).cloned())
    }

    /// Channels the given principal is a member of.
    pub fn channels_for(&self, member: &Identifier) -> Result<Vec<Channel>, RouterError> {
        Ok(self
            .channels_read()?
            .values()
            .filter(|c| c.contains(member))
            .cloned()
            .collect())
    }

    /// Validate an envelope against the current registry without routing it.
    pub fn check_routable(&self, event: &Event) -> Result<(), RouterError> {
        match event {
            Event::Message(message) => match (&message.destination, &message.channel) {
                (Some(_), Some(_)) => Err(RouterError::MalformedEnvelope(
                    "both destination and channel set".into(),
                )),
                (None, None) => Err(RouterError::MalformedEnvelope(
                    "neither destination nor channel set".into(),
                )),
                (Some(destination), None) => {
                    if self.is_registered(destination)? {
                        Ok(())
                    } else {
                        Err(RouterError::UnknownIdentifier(destination.clone()))
                    }
                }
                (None, Some(channel)) => {
                    if self.channel(channel)?.is_some() {
                        Ok(())
                    } else {
                        Err(RouterError::UnknownIdentifier(channel.clone()))
                    }
                }
            },
            Event::TeamServiceRequest(request) => {
                if self.is_registered(&request.service)? {
                    Ok(())
                } else {
                    Err(RouterError::UnknownIdentifier(request.service.clone()))
                }
            }
            Event::TeamServiceResponse(response) => {
                if self.is_registered(&response.destination)? {
                    Ok(())
                } else {
                    Err(RouterError::UnknownIdentifier(response.destination.clone()))
                }
            }
            _ => Ok(()),
        }
    }

    /// Stamp and deliver one event. Returns the assigned tick.
    ///
    /// Channel publications resolve the member set at this point and exclude
    /// the source. Delivery commits in two phases: a slot is reserved on
    /// every target inbox first, then all copies are enqueued, so a
    /// publication reaches all members or none.
    pub async fn send(&self, mut event: Event) -> Result<u64, RouterError> {
        let tick = self.inner.clock.fetch_add(1, Ordering::SeqCst) + 1;
        event.set_timestamp(tick);

        let deliveries: Vec<(Identifier, Event)> = match &event {
            Event::Message(message) => match (&message.destination, &message.channel) {
                (Some(_), Some(_)) => {
                    return Err(RouterError::MalformedEnvelope(
                        "both destination and channel set".into(),
                    ));
                }
                (None, None) => {
                    return Err(RouterError::MalformedEnvelope(
                        "neither destination nor channel set".into(),
                    ));
                }
                (Some(destination), None) => vec![(destination.clone(), event.clone())],
                (None, Some(channel_name)) => {
                    let channel = self.channel(channel_name)?.ok_or_else(|| {
                        RouterError::UnknownIdentifier(channel_name.clone())
                    })?;
                    channel
                        .members
                        .iter()
                        .filter(|member| **member != message.source)
                        .map(|member| (member.clone(), event.clone()))
                        .collect()
                }
            },
            Event::TeamServiceRequest(request) => vec![(request.service.clone(), event.clone())],
            Event::TeamServiceResponse(response) => {
                vec![(response.destination.clone(), event.clone())]
            }
            // Lifecycle events have no inbox target; they only reach
            // listeners and the history.
            _ => {
                self.record(&event)?;
                return Ok(tick);
            }
        };

        // Phase one: resolve every target.
        let mut pending = Vec::with_capacity(deliveries.len());
        for (target, copy) in deliveries {
            let sender = self.registry_read()?.get(&target).cloned();
            let sender = match sender {
                Some(sender) if !sender.is_closed() => sender,
                Some(_) => {
                    self.dead_letter(target.clone(), copy);
                    return Err(RouterError::InboxClosed(target));
                }
                None => {
                    self.dead_letter(target.clone(), copy);
                    return Err(RouterError::UnknownIdentifier(target));
                }
            };
            pending.push((target, sender, copy));
        }

        // Phase two: reserve a slot on every inbox before committing any
        // copy. An unused permit releases its slot on drop.
        let mut reserved = Vec::with_capacity(pending.len());
        for (target, sender, copy) in pending {
            match sender.reserve(self.inner.enqueue_timeout).await {
                Ok(permit) => reserved.push((permit, copy)),
                Err(EnqueueError::Full) => return Err(RouterError::InboxFull(target)),
                Err(EnqueueError::Closed) => {
                    self.dead_letter(target.clone(), copy);
                    return Err(RouterError::InboxClosed(target));
                }
            }
        }
        for (permit, copy) in reserved {
            let _ = permit.send(copy);
        }

        self.record(&event)?;
        Ok(tick)
    }

    /// Stamp and publish a lifecycle event that has no inbox target.
    pub fn announce(&self, mut event: Event) -> u64 {
        let tick = self.inner.clock.fetch_add(1, Ordering::SeqCst) + 1;
        event.set_timestamp(tick);
        if let Err(error) = self.record(&event) {
            tracing::warn!(error = %error, "failed to record announcement");
        }
        tick
    }

    fn record(&self, event: &Event) -> Result<(), RouterError> {
        if let Event::Message(message) = event {
            if message.is_stop_signal() {
                self.inner.activity.flag_human_stop();
            }
        }
        {
            let mut history = self.history_lock()?;
            history.push_back(event.clone());
            while history.len() > self.inner.history_limit {
                history.pop_front();
            }
        }
        match event {
            Event::Message(_) | Event::TeamServiceRequest(_) | Event::TeamServiceResponse(_) => {
                self.inner.activity.record_message();
            }
            _ => self.inner.activity.record_lifecycle(),
        }
        // Listener failures never affect delivery.
        let _ = self.inner.listeners.send(event.clone());
        Ok(())
    }

    /// Report an undeliverable event on the diagnostic channel.
    pub fn dead_letter(&self, target: Identifier, event: Event) {
        tracing::warn!(target_id = %target, "dead letter");
        self.report(Diagnostic::DeadLetter {
            target,
            event: Box::new(event),
            timestamp: self.current_tick(),
        });
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        let _ = self.inner.diagnostics.send(diagnostic);
    }

    /// Non-authoritative observer tap; receivers get best-effort copies of
    /// every recorded event.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.listeners.subscribe()
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.inner.diagnostics.subscribe()
    }

    /// The tick most recently assigned.
    pub fn current_tick(&self) -> u64 {
        self.inner.clock.load(Ordering::SeqCst)
    }

    /// Bounded copy of the routed event history, oldest first.
    pub fn history(&self) -> Result<Vec<Event>, RouterError> {
        Ok(self.history_lock()?.iter().cloned().collect())
    }

    pub(crate) fn activity(&self) -> &ActivityMonitor {
        &self.inner.activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Role};
    use serde_json::json;

    fn router() -> Router {
        Router::new(&EngineConfig::default(), ActivityMonitor::new())
    }

    #[tokio::test]
    async fn per_pair_fifo_delivery() {
        let router = router();
        let mut inbox = router.register(Identifier::new("b")).unwrap();
        for i in 0..10 {
            router
                .send(Message::direct("a", "b", format!("m{i}")).into())
                .await
                .unwrap();
        }
        for i in 0..10 {
            let message = inbox.next_message().await.unwrap();
            assert_eq!(message.content, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn ticks_are_strictly_increasing() {
        let router = router();
        let _inbox = router.register(Identifier::new("b")).unwrap();
        let t1 = router
            .send(Message::direct("a", "b", "one").into())
            .await
            .unwrap();
        let t2 = router
            .send(Message::direct("a", "b", "two").into())
            .await
            .unwrap();
        assert!(t2 > t1);
    }

    #[tokio::test]
    async fn channel_fan_out_excludes_source() {
        let router = router();
        let mut a = router.register(Identifier::new("a")).unwrap();
        let mut b = router.register(Identifier::new("b")).unwrap();
        let mut c = router.register(Identifier::new("c")).unwrap();
        router
            .register_channel(Channel::new("news", ["a", "b", "c"].map(Identifier::new)))
            .unwrap();

        router
            .send(Message::publication("a", Identifier::channel("news"), "update").into())
            .await
            .unwrap();

        let got_b = b.next_message().await.unwrap();
        assert_eq!(got_b.content, "update");
        assert_eq!(got_b.channel, Some(Identifier::channel("news")));
        assert_eq!(got_b.destination, None);
        let got_c = c.next_message().await.unwrap();
        assert_eq!(got_c.content, "update");

        assert!(a.try_recv().is_none());
    }

    #[tokio::test]
    async fn unknown_destination_is_dead_lettered() {
        let router = router();
        let mut diagnostics = router.subscribe_diagnostics();
        let err = router
            .send(Message::direct("a", "nobody", "hello").into())
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::UnknownIdentifier(Identifier::new("nobody")));
        match diagnostics.try_recv().unwrap() {
            Diagnostic::DeadLetter { target, .. } => {
                assert_eq!(target, Identifier::new("nobody"));
            }
            other => panic!("unexpected diagnostic: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_envelopes_are_rejected() {
        let router = router();
        let _inbox = router.register(Identifier::new("b")).unwrap();

        let mut both = Message::direct("a", "b", "x");
        both.channel = Some(Identifier::channel("news"));
        assert!(matches!(
            router.send(both.into()).await,
            Err(RouterError::MalformedEnvelope(_))
        ));

        let mut neither = Message::direct("a", "b", "x");
        neither.destination = None;
        assert!(matches!(
            router.send(neither.into()).await,
            Err(RouterError::MalformedEnvelope(_))
        ));
    }

    #[tokio::test]
    async fn full_inbox_surfaces_to_sender() {
        let config = EngineConfig {
            inbox_capacity: 1,
            enqueue_timeout: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        let router = Router::new(&config, ActivityMonitor::new());
        let _inbox = router.register(Identifier::new("slow")).unwrap();

        router
            .send(Message::direct("a", "slow", "first").into())
            .await
            .unwrap();
        let err = router
            .send(Message::direct("a", "slow", "second").into())
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::InboxFull(Identifier::new("slow")));
    }

    #[tokio::test]
    async fn backpressured_publication_reaches_no_member() {
        let config = EngineConfig {
            inbox_capacity: 1,
            enqueue_timeout: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        let router = Router::new(&config, ActivityMonitor::new());
        let mut fast = router.register(Identifier::new("fast")).unwrap();
        let _slow = router.register(Identifier::new("slow")).unwrap();
        router
            .register_channel(Channel::new(
                "news",
                ["a", "fast", "slow"].map(Identifier::new),
            ))
            .unwrap();

        // Saturate one member's inbox.
        router
            .send(Message::direct("a", "slow", "fill").into())
            .await
            .unwrap();

        let err = router
            .send(Message::publication("a", Identifier::channel("news"), "update").into())
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::InboxFull(Identifier::new("slow")));

        // The member with room got nothing either: all or none.
        assert!(fast.try_recv().is_none());
    }

    #[tokio::test]
    async fn listener_receives_copies_after_enqueue() {
        let router = router();
        let _inbox = router.register(Identifier::new("b")).unwrap();
        let mut tap = router.subscribe();
        router
            .send(Message::direct("a", "b", "observed").into())
            .await
            .unwrap();
        let event = tap.recv().await.unwrap();
        assert_eq!(event.as_message().unwrap().content, "observed");
        assert!(event.timestamp() > 0);
    }

    #[tokio::test]
    async fn human_stop_sentinel_flags_activity() {
        let router = router();
        let _inbox = router.register(Identifier::new("planner")).unwrap();
        let stop = Message::direct("human", "planner", "stop")
            .with_role(Role::User)
            .with_metadata("stop", json!(true));
        router.send(stop.into()).await.unwrap();
        assert!(router.activity().human_stop_requested());
    }
}
