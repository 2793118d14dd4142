//! Engine tuning knobs.

use std::time::Duration;

/// Runtime configuration shared by the router, agent runtimes, and team
/// service runtimes. The defaults match the documented engine behavior;
/// embedders can override any knob before constructing the controller.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Soft capacity of every inbox.
    pub inbox_capacity: usize,
    /// How long an enqueue may block on a full inbox before `InboxFull`.
    pub enqueue_timeout: Duration,
    /// Minimum interval between consecutive `iterate` steps of one agent.
    pub iterate_interval: Duration,
    /// Concurrent invocations allowed per team service.
    pub service_parallelism: usize,
    /// How long a handler step may keep running after stop is signaled.
    pub step_grace: Duration,
    /// How long services drain outstanding invocations before cancelling.
    pub drain_grace: Duration,
    /// Bound on the router's in-memory event history.
    pub history_limit: usize,
    /// Maximum number of agents plus teams in one workspace.
    pub instance_limit: usize,
    /// Tear the whole workspace down when a single runtime crashes.
    pub fail_fast: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            enqueue_timeout: Duration::from_millis(500),
            iterate_interval: Duration::from_millis(100),
            service_parallelism: 4,
            step_grace: Duration::from_secs(2),
            drain_grace: Duration::from_secs(5),
            history_limit: 4096,
            instance_limit: 500,
            fail_fast: false,
        }
    }
}
