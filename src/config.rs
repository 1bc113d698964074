use crate::time::Duration;

/// Maximum segment lifetime assumed for the endpoint under test.
pub const MAX_MSL: Duration = Duration::from_millis(120_000);

/// Shortest sleep of the state polling loop.
pub const MIN_POLL: Duration = Duration::from_millis(1);

/// Timing and sizing knobs of a session.
///
/// The defaults match the documented behaviour; every field can be
/// overridden through the `with_*` setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// First sleep of the state polling loop.
    pub poll_initial: Duration,
    /// Factor applied to the poll step after every poll.
    pub poll_multiplier: u32,
    /// Bound on waits for packet-driven transitions.
    pub ordinary_budget: Duration,
    /// Bound on waits for timer-driven transitions.
    pub timeout_budget: Duration,
    /// Sleep after an ARP change so the hosts pick it up.
    pub settle_delay: Duration,
    /// Sleep between retries of a non-blocking `accept` or `connect`.
    pub retry_step: Duration,
    /// Backlog passed to `listen`.
    pub listen_backlog: i32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_initial: Duration::from_millis(100),
            poll_multiplier: 2,
            ordinary_budget: Duration::from_millis(10_000),
            timeout_budget: MAX_MSL * 2,
            settle_delay: Duration::from_millis(2_000),
            retry_step: Duration::from_millis(10),
            listen_backlog: 1,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn with_poll_initial(mut self, step: Duration) -> Config {
        self.poll_initial = step.max(MIN_POLL);
        self
    }

    pub fn with_poll_multiplier(mut self, multiplier: u32) -> Config {
        self.poll_multiplier = multiplier.max(1);
        self
    }

    pub fn with_ordinary_budget(mut self, budget: Duration) -> Config {
        self.ordinary_budget = budget;
        self
    }

    pub fn with_timeout_budget(mut self, budget: Duration) -> Config {
        self.timeout_budget = budget;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Config {
        self.settle_delay = delay;
        self
    }

    pub fn with_retry_step(mut self, step: Duration) -> Config {
        self.retry_step = step;
        self
    }

    pub fn with_listen_backlog(mut self, backlog: i32) -> Config {
        self.listen_backlog = backlog;
        self
    }
}
