use std::time::Duration;

use uuid::Uuid;

/// Category of recurring bucketed work.
///
/// Each service kind has its own bucket count, its own assignment map and
/// its own leader election path, so two kinds never contend with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Retention,
    Watermarking,
}

impl ServiceKind {
    /// Stable name used to namespace store roots and election paths.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Retention => "retention",
            ServiceKind::Watermarking => "watermarking",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-service configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub kind: ServiceKind,
    /// Number of buckets for this service kind. Buckets are `0..bucket_count`.
    pub bucket_count: u32,
}

impl ServiceConfig {
    pub fn new(kind: ServiceKind, bucket_count: u32) -> Self {
        Self { kind, bucket_count }
    }
}

/// Backoff shape for indefinite ownership re-acquisition retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
        }
    }
}

/// Per-process coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Unique id for this controller process. Stable for the process
    /// lifetime, never reused concurrently by two live processes.
    pub process_id: String,
    /// Minimum interval between two rebalance passes within one leadership
    /// tenure. Not enforced across leadership handoffs.
    pub min_rebalance_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            process_id: Uuid::new_v4().to_string(),
            min_rebalance_interval: Duration::ZERO,
            retry: RetryPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(process_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            ..Default::default()
        }
    }

    pub fn with_min_rebalance_interval(mut self, interval: Duration) -> Self {
        self.min_rebalance_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_kind_names() {
        assert_eq!(ServiceKind::Retention.name(), "retention");
        assert_eq!(ServiceKind::Watermarking.name(), "watermarking");
        assert_eq!(ServiceKind::Retention.to_string(), "retention");
    }

    #[test]
    fn service_config_new() {
        let cfg = ServiceConfig::new(ServiceKind::Retention, 16);
        assert_eq!(cfg.kind, ServiceKind::Retention);
        assert_eq!(cfg.bucket_count, 16);
    }

    #[test]
    fn retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
        assert_eq!(policy.multiplier, 2);
    }

    #[test]
    fn coordinator_config_default_has_unique_process_id() {
        let a = CoordinatorConfig::default();
        let b = CoordinatorConfig::default();
        assert!(!a.process_id.is_empty());
        assert_ne!(a.process_id, b.process_id);
        assert_eq!(a.min_rebalance_interval, Duration::ZERO);
    }

    #[test]
    fn coordinator_config_builders() {
        let cfg = CoordinatorConfig::new("controller-1")
            .with_min_rebalance_interval(Duration::from_secs(5));
        assert_eq!(cfg.process_id, "controller-1");
        assert_eq!(cfg.min_rebalance_interval, Duration::from_secs(5));
    }
}
