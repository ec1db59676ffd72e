//! Subscriber contract and the static topic-to-subscribers registry.
//!
//! A subscriber is a single-purpose capability reacting to events of a
//! topic: send an email, notify the partner system, update a read model.
//! The registry is built once at process start and passed by reference;
//! there is no module-level singleton, which keeps the delivery engine
//! testable with a registry full of fakes.
//!
//! # Idempotency
//!
//! Delivery is at-least-once: any subscriber may run more than once for the
//! same event (lease expiry, crash between invocation and bookkeeping,
//! operator replay). Every registered handler MUST be idempotent: invoking
//! it twice with the same payload must have the same external effect as
//! invoking it once.

use crate::event::{ConventionEvent, Topic};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a subscriber invocation failed.
///
/// Subscriber failures are expected and routine (network partition, partner
/// outage); the engine records them and retries up to the configured
/// budget. They never propagate to the caller of the original business
/// operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    /// The subscriber reported a failure.
    #[error("subscriber call failed: {0}")]
    Call(String),

    /// The subscriber did not answer within the configured timeout.
    #[error("subscriber timed out after {0:?}")]
    Timeout(Duration),
}

/// A named, idempotent handler for events of a topic.
///
/// The contract is success-or-error: no return value is consumed besides
/// the outcome. Implementations perform their own I/O; the registry itself
/// never does.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn` to
/// stay object-safe (`Arc<dyn Subscriber>` is how the engine holds them).
pub trait Subscriber: Send + Sync {
    /// Stable name identifying this subscriber in failure rows and
    /// diagnostics.
    fn name(&self) -> &str;

    /// Deliver one event to this subscriber.
    fn deliver(
        &self,
        event: &ConventionEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriberError>> + Send + '_>>;
}

/// Static mapping from topic to an ordered list of subscribers.
///
/// Pure lookup: building it is the only write, and `subscribers_for`
/// preserves registration order. Topics with no subscription return an
/// empty slice; such events are published trivially (nothing is owed).
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    by_topic: HashMap<Topic, Vec<Arc<dyn Subscriber>>>,
}

impl SubscriptionRegistry {
    /// Create a registry builder.
    #[must_use]
    pub fn builder() -> SubscriptionRegistryBuilder {
        SubscriptionRegistryBuilder {
            by_topic: HashMap::new(),
        }
    }

    /// The subscribers registered for `topic`, in registration order.
    #[must_use]
    pub fn subscribers_for(&self, topic: Topic) -> &[Arc<dyn Subscriber>] {
        self.by_topic.get(&topic).map_or(&[], Vec::as_slice)
    }

    /// Number of distinct topics with at least one subscription.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.by_topic.len()
    }
}

/// Builder for [`SubscriptionRegistry`].
pub struct SubscriptionRegistryBuilder {
    by_topic: HashMap<Topic, Vec<Arc<dyn Subscriber>>>,
}

impl SubscriptionRegistryBuilder {
    /// Register `subscriber` for `topic`, after any already registered.
    #[must_use]
    pub fn subscribe(mut self, topic: Topic, subscriber: Arc<dyn Subscriber>) -> Self {
        self.by_topic.entry(topic).or_default().push(subscriber);
        self
    }

    /// Register `subscriber` for every topic in `topics`.
    #[must_use]
    pub fn subscribe_all(mut self, topics: &[Topic], subscriber: Arc<dyn Subscriber>) -> Self {
        for topic in topics {
            self.by_topic
                .entry(*topic)
                .or_default()
                .push(Arc::clone(&subscriber));
        }
        self
    }

    /// Finish building the registry.
    #[must_use]
    pub fn build(self) -> SubscriptionRegistry {
        SubscriptionRegistry {
            by_topic: self.by_topic,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Subscriber for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn deliver(
            &self,
            _event: &ConventionEvent,
        ) -> Pin<Box<dyn Future<Output = Result<(), SubscriberError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn lookup_preserves_registration_order() {
        let registry = SubscriptionRegistry::builder()
            .subscribe(Topic::ConventionFullySigned, Arc::new(Named("email")))
            .subscribe(Topic::ConventionFullySigned, Arc::new(Named("sms")))
            .subscribe(Topic::ConventionFullySigned, Arc::new(Named("partner")))
            .build();

        let names: Vec<&str> = registry
            .subscribers_for(Topic::ConventionFullySigned)
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(names, vec!["email", "sms", "partner"]);
    }

    #[test]
    fn unsubscribed_topic_yields_an_empty_slice() {
        let registry = SubscriptionRegistry::builder()
            .subscribe(Topic::ConventionFullySigned, Arc::new(Named("email")))
            .build();

        assert!(registry.subscribers_for(Topic::ConventionRejected).is_empty());
        assert_eq!(registry.topic_count(), 1);
    }

    #[test]
    fn subscribe_all_registers_one_handler_on_many_topics() {
        let registry = SubscriptionRegistry::builder()
            .subscribe_all(
                &[Topic::BeneficiarySigned, Topic::ConventionFullySigned],
                Arc::new(Named("read-model")),
            )
            .build();

        assert_eq!(registry.subscribers_for(Topic::BeneficiarySigned).len(), 1);
        assert_eq!(
            registry.subscribers_for(Topic::ConventionFullySigned).len(),
            1
        );
    }
}
