//! Delivery tuning knobs shared by the outbox store and the engine.
//!
//! The retry budget and the `in-process` lease are deployment decisions;
//! the only hard requirement is that both exist and are finite. The
//! defaults here are the values used in production unless overridden.

use crate::event::EventStatus;
use std::time::Duration;

/// Retry, lease and batching configuration for event delivery.
///
/// # Default Values
///
/// - `retry_budget`: 5 failed attempts before quarantine
/// - `lease`: 10 minutes before an `in-process` claim is reclaimable
/// - `batch_size`: 50 events claimed per tick
/// - `subscriber_timeout`: 30 seconds per subscriber invocation
#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    /// Failed attempts allowed before an event is quarantined.
    pub retry_budget: u32,
    /// How long a claim holds before a crashed worker's events become
    /// reclaimable.
    pub lease: Duration,
    /// Maximum events claimed per engine tick.
    pub batch_size: usize,
    /// Per-subscriber invocation timeout.
    pub subscriber_timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            retry_budget: 5,
            lease: Duration::from_secs(600),
            batch_size: 50,
            subscriber_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> DeliveryPolicyBuilder {
        DeliveryPolicyBuilder {
            retry_budget: None,
            lease: None,
            batch_size: None,
            subscriber_timeout: None,
        }
    }

    /// The status an event moves to after one more failed attempt.
    ///
    /// `attempts` is the cumulative count *including* the attempt being
    /// recorded. The count is non-decreasing until the event reaches
    /// `published` or quarantine.
    #[must_use]
    pub const fn status_after_failure(&self, attempts: u32) -> EventStatus {
        if attempts >= self.retry_budget {
            EventStatus::FailedTooManyTimes
        } else {
            EventStatus::FailedButWillRetry
        }
    }
}

/// Builder for [`DeliveryPolicy`].
#[derive(Debug, Clone)]
pub struct DeliveryPolicyBuilder {
    retry_budget: Option<u32>,
    lease: Option<Duration>,
    batch_size: Option<usize>,
    subscriber_timeout: Option<Duration>,
}

impl DeliveryPolicyBuilder {
    /// Set the number of failed attempts allowed before quarantine.
    #[must_use]
    pub const fn retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = Some(retry_budget);
        self
    }

    /// Set the `in-process` lease duration.
    #[must_use]
    pub const fn lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Set the maximum number of events claimed per tick.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Set the per-subscriber invocation timeout.
    #[must_use]
    pub const fn subscriber_timeout(mut self, timeout: Duration) -> Self {
        self.subscriber_timeout = Some(timeout);
        self
    }

    /// Build the [`DeliveryPolicy`], falling back to defaults.
    #[must_use]
    pub fn build(self) -> DeliveryPolicy {
        let defaults = DeliveryPolicy::default();
        DeliveryPolicy {
            retry_budget: self.retry_budget.unwrap_or(defaults.retry_budget),
            lease: self.lease.unwrap_or(defaults.lease),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            subscriber_timeout: self
                .subscriber_timeout
                .unwrap_or(defaults.subscriber_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_below_budget_schedules_a_retry() {
        let policy = DeliveryPolicy::builder().retry_budget(5).build();
        assert_eq!(
            policy.status_after_failure(1),
            EventStatus::FailedButWillRetry
        );
        assert_eq!(
            policy.status_after_failure(4),
            EventStatus::FailedButWillRetry
        );
    }

    #[test]
    fn exhausted_budget_quarantines() {
        let policy = DeliveryPolicy::builder().retry_budget(5).build();
        assert_eq!(
            policy.status_after_failure(5),
            EventStatus::FailedTooManyTimes
        );
        assert_eq!(
            policy.status_after_failure(6),
            EventStatus::FailedTooManyTimes
        );
    }

    #[test]
    fn builder_falls_back_to_defaults() {
        let policy = DeliveryPolicy::builder().batch_size(10).build();
        assert_eq!(policy.batch_size, 10);
        assert_eq!(policy.retry_budget, DeliveryPolicy::default().retry_budget);
        assert_eq!(policy.lease, DeliveryPolicy::default().lease);
    }
}
