use crate::breaker::BreakerConfig;
use crate::retry::RetryPolicy;
use std::time::Duration;

/// Tuning for the processing pipeline. None of these are fixed by the
/// pipeline itself; the defaults are conventional values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessorConfig {
    /// Number of concurrent workers. Fixed for the life of the pool.
    pub workers: u16,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    /// Upper bound for one backend call.
    pub attempt_timeout: Duration,
    /// Trimmed text shorter than this makes the pipeline try the next strategy.
    pub min_text_chars: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            workers: 3,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            attempt_timeout: Duration::from_secs(60),
            min_text_chars: 16,
        }
    }
}
