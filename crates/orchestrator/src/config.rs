use std::time::Duration;

/// Bounded exponential backoff for transient dispatch failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Re-attempts after the first try.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before the given retry (0-based), doubling up to `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Tunables for the orchestrator. Defaults are production values; tests
/// shrink the time-based ones.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    /// Wall-clock budget per dispatch.
    pub default_max_duration: Duration,
    /// Context token budget per dispatch.
    pub default_max_context_tokens: usize,
    /// Compaction kicks in when assembled context exceeds this estimate.
    pub compaction_threshold_tokens: usize,
    /// A unit failing this many dispatch rounds stops being re-dispatched.
    pub max_unit_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_max_duration: Duration::from_secs(120),
            default_max_context_tokens: 8_000,
            compaction_threshold_tokens: 6_000,
            max_unit_attempts: 3,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.default_max_duration = duration;
        self
    }

    pub fn with_max_context_tokens(mut self, tokens: usize) -> Self {
        self.default_max_context_tokens = tokens;
        self
    }

    pub fn with_compaction_threshold(mut self, tokens: usize) -> Self {
        self.compaction_threshold_tokens = tokens;
        self
    }

    pub fn with_max_unit_attempts(mut self, attempts: u32) -> Self {
        self.max_unit_attempts = attempts;
        self
    }
}
