//! Runtime configuration
//!
//! Every loop is notification-driven with interval polling as the fallback,
//! so the intervals here bound staleness after a missed notification rather
//! than steady-state latency.

use std::time::Duration;

/// Executor runtime configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Fallback poll interval when no wake-up arrives
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Job scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Fallback poll interval when no `jobs` notification arrives
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Liveness reaper configuration
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often `clean_executors` runs
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

impl ReaperConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(ExecutorConfig::default().poll_interval, Duration::from_secs(5));
        assert_eq!(
            SchedulerConfig::default().poll_interval,
            Duration::from_secs(15)
        );
        assert_eq!(ReaperConfig::default().interval, Duration::from_secs(30));
    }

    #[test]
    fn test_builders() {
        let config = ExecutorConfig::new().with_poll_interval(Duration::from_millis(50));
        assert_eq!(config.poll_interval, Duration::from_millis(50));

        let config = SchedulerConfig::new().with_poll_interval(Duration::from_millis(100));
        assert_eq!(config.poll_interval, Duration::from_millis(100));

        let config = ReaperConfig::new().with_interval(Duration::from_millis(200));
        assert_eq!(config.interval, Duration::from_millis(200));
    }
}
