//! Stop conditions and the activity bookkeeping that feeds them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared view of observed system activity. The router bumps it on every
/// routed event; agent runtimes bump it after every committed step. The
/// stop evaluator watches it to decide quiescence.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    inner: Arc<ActivityInner>,
}

#[derive(Debug)]
struct ActivityInner {
    epoch: Instant,
    last_activity_ms: AtomicU64,
    message_count: AtomicU64,
    human_stop: AtomicBool,
    notify: watch::Sender<u64>,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            inner: Arc::new(ActivityInner {
                epoch: Instant::now(),
                last_activity_ms: AtomicU64::new(0),
                message_count: AtomicU64::new(0),
                human_stop: AtomicBool::new(false),
                notify,
            }),
        }
    }

    fn bump(&self) {
        let elapsed = self.inner.epoch.elapsed().as_millis() as u64;
        self.inner.last_activity_ms.store(elapsed, Ordering::Relaxed);
        self.inner.notify.send_modify(|n| *n += 1);
    }

    /// Record one routed message or service event.
    pub fn record_message(&self) {
        self.inner.message_count.fetch_add(1, Ordering::Relaxed);
        self.bump();
    }

    /// Record a lifecycle announcement: resets the idle window without
    /// counting toward message totals.
    pub fn record_lifecycle(&self) {
        self.bump();
    }

    /// Record one completed agent step.
    pub fn record_step(&self) {
        self.bump();
    }

    /// Record the human's stop sentinel.
    pub fn flag_human_stop(&self) {
        self.inner.human_stop.store(true, Ordering::Relaxed);
        self.bump();
    }

    pub fn message_count(&self) -> u64 {
        self.inner.message_count.load(Ordering::Relaxed)
    }

    pub fn human_stop_requested(&self) -> bool {
        self.inner.human_stop.load(Ordering::Relaxed)
    }

    /// How long the system has been quiet.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.inner.last_activity_ms.load(Ordering::Relaxed));
        self.inner.epoch.elapsed().saturating_sub(last)
    }

    fn last_activity(&self) -> Instant {
        self.inner.epoch + Duration::from_millis(self.inner.last_activity_ms.load(Ordering::Relaxed))
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.notify.subscribe()
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// A predicate over observed activity; the workspace stops when any of its
/// conditions holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopCondition {
    /// No event routed and no step executed for `window_ms`.
    NoActivity { window_ms: u64 },
    /// Total routed event count reached `count`.
    MessageCountReached { count: u64 },
    /// The human sent a sentinel message with `metadata["stop"] = true`.
    HumanSignal,
}

impl StopCondition {
    pub fn is_met(&self, activity: &ActivityMonitor) -> bool {
        match self {
            StopCondition::NoActivity { window_ms } => {
                activity.idle_for() >= Duration::from_millis(*window_ms)
            }
            StopCondition::MessageCountReached { count } => activity.message_count() >= *count,
            StopCondition::HumanSignal => activity.human_stop_requested(),
        }
    }

    /// The earliest instant at which this condition could newly hold, if it
    /// is time-driven.
    fn next_deadline(&self, activity: &ActivityMonitor) -> Option<Instant> {
        match self {
            StopCondition::NoActivity { window_ms } => {
                Some(activity.last_activity() + Duration::from_millis(*window_ms))
            }
            _ => None,
        }
    }
}

/// Block until any condition holds or `cancel` fires. With no conditions
/// configured the workspace runs until an explicit stop.
pub(crate) async fn wait_until_stopped(
    conditions: &[StopCondition],
    activity: &ActivityMonitor,
    cancel: &CancellationToken,
) {
    if conditions.is_empty() {
        cancel.cancelled().await;
        return;
    }
    let mut changes = activity.subscribe();
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if conditions.iter().any(|c| c.is_met(activity)) {
            return;
        }
        let deadline = conditions
            .iter()
            .filter_map(|c| c.next_deadline(activity))
            .min();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = changes.changed() => {}
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_activity_holds_after_window() {
        let activity = ActivityMonitor::new();
        let condition = StopCondition::NoActivity { window_ms: 30 };
        activity.record_message();
        assert!(!condition.is_met(&activity));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(condition.is_met(&activity));
    }

    #[tokio::test]
    async fn activity_resets_the_idle_window() {
        let activity = ActivityMonitor::new();
        let condition = StopCondition::NoActivity { window_ms: 50 };
        tokio::time::sleep(Duration::from_millis(30)).await;
        activity.record_step();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!condition.is_met(&activity));
    }

    #[test]
    fn message_count_threshold() {
        let activity = ActivityMonitor::new();
        let condition = StopCondition::MessageCountReached { count: 2 };
        activity.record_message();
        assert!(!condition.is_met(&activity));
        activity.record_message();
        assert!(condition.is_met(&activity));
    }

    #[tokio::test]
    async fn evaluator_returns_once_any_condition_holds() {
        let activity = ActivityMonitor::new();
        let cancel = CancellationToken::new();
        let conditions = vec![
            StopCondition::HumanSignal,
            StopCondition::MessageCountReached { count: 1000 },
        ];
        let waiter = {
            let activity = activity.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                wait_until_stopped(&conditions, &activity, &cancel).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        activity.flag_human_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("evaluator did not observe the signal")
            .unwrap();
    }

    #[test]
    fn stop_condition_serde_tags() {
        let condition: StopCondition =
            serde_json::from_str(r#"{"type":"no_activity","window_ms":200}"#).unwrap();
        assert_eq!(condition, StopCondition::NoActivity { window_ms: 200 });
    }
}
