//! The delivery engine: claims due events and fans them out to subscribers.
//!
//! # Run model
//!
//! The engine is a recurring task, not request-triggered. Each tick it
//! claims a bounded batch of due events, resolves each event's subscribers
//! in the registry, invokes them one by one under a per-subscriber timeout,
//! and records the aggregated outcome back into the store. Callers of the
//! business operation that produced an event never wait on any of this.
//!
//! # Failure semantics
//!
//! Subscriber failures are routine: they are recorded and retried up to the
//! policy's budget, after which the event is quarantined and reported to
//! the diagnostics sink. One subscriber's failure never prevents the
//! others from running for the same event. Failures of the engine's own
//! bookkeeping abort the tick; the affected events stay `in-process` and
//! become reclaimable once their lease expires, so nothing is dropped.
//!
//! # Concurrency
//!
//! Several engine instances may poll the same store: the store's `claim`
//! guarantees they never pick the same event. No lock is held across a
//! tick, and a tick abandoned mid-batch (shutdown, crash) is recovered by
//! lease expiry.

use chrono::Utc;
use conventions_core::diagnostics::{Diagnostic, DiagnosticsSink};
use conventions_core::outbox::{
    ClaimedEvent, DeliveryOutcome, OutboxError, OutboxStore, SubscriberFailure,
};
use conventions_core::event::EventStatus;
use conventions_core::policy::DeliveryPolicy;
use conventions_core::registry::{SubscriberError, SubscriptionRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Service name stamped on diagnostics this engine produces.
const SERVICE_NAME: &str = "delivery-engine";

/// What one tick did, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// Events claimed this tick.
    pub claimed: usize,
    /// Events whose fan-out fully succeeded.
    pub published: usize,
    /// Events scheduled for another attempt.
    pub retried: usize,
    /// Events that exhausted their budget this tick.
    pub quarantined: usize,
}

/// Recurring delivery task over an outbox store and a registry.
pub struct DeliveryEngine {
    store: Arc<dyn OutboxStore>,
    registry: Arc<SubscriptionRegistry>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    policy: DeliveryPolicy,
    tick_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl DeliveryEngine {
    /// Create an engine.
    ///
    /// Returns the engine and a shutdown sender; send `true` to stop
    /// [`DeliveryEngine::run`] gracefully. Events claimed by an
    /// interrupted tick are reclaimed by lease expiry.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        registry: Arc<SubscriptionRegistry>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        policy: DeliveryPolicy,
        tick_interval: Duration,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = Self {
            store,
            registry,
            diagnostics,
            policy,
            tick_interval,
            shutdown: shutdown_rx,
        };
        (engine, shutdown_tx)
    }

    /// Run ticks until the shutdown signal arrives.
    ///
    /// A failed tick is logged and the loop continues: transient storage
    /// trouble must not kill the delivery task.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.tick_interval.as_millis(),
            batch_size = self.policy.batch_size,
            "Delivery engine started"
        );

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(summary) if summary.claimed > 0 => {
                            tracing::info!(
                                claimed = summary.claimed,
                                published = summary.published,
                                retried = summary.retried,
                                quarantined = summary.quarantined,
                                "Delivery tick completed"
                            );
                        }
                        Ok(_) => {}
                        Err(error) => {
                            tracing::error!(%error, "Delivery tick aborted");
                        }
                    }
                }
            }
        }

        tracing::info!("Delivery engine stopped");
    }

    /// Run one delivery cycle: claim, fan out, record outcomes.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] when claiming or outcome bookkeeping fails;
    /// the affected events remain `in-process` and are reclaimed after the
    /// lease expires.
    pub async fn tick(&self) -> Result<TickSummary, OutboxError> {
        let claimed = self.store.claim(self.policy.batch_size, Utc::now()).await?;
        let mut summary = TickSummary {
            claimed: claimed.len(),
            ..TickSummary::default()
        };
        metrics::counter!("outbox.claimed").increment(claimed.len() as u64);

        for event in claimed {
            let outcome = self.fan_out(&event).await;
            let event_id = event.record.id;
            let topic = event.record.topic();
            let status = self.store.record_outcome(event_id, outcome.clone()).await?;

            match status {
                EventStatus::Published => {
                    summary.published += 1;
                    metrics::counter!("outbox.delivered", "topic" => topic.as_str())
                        .increment(1);
                    tracing::debug!(event_id = %event_id, topic = %topic, "Event delivered");
                }
                EventStatus::FailedButWillRetry => {
                    summary.retried += 1;
                    metrics::counter!("outbox.retry_scheduled", "topic" => topic.as_str())
                        .increment(1);
                    tracing::warn!(
                        event_id = %event_id,
                        topic = %topic,
                        attempts = event.record.attempts + 1,
                        "Delivery failed, will retry"
                    );
                }
                EventStatus::FailedTooManyTimes => {
                    summary.quarantined += 1;
                    metrics::counter!("outbox.quarantined", "topic" => topic.as_str())
                        .increment(1);
                    self.report_quarantine(&event, &outcome).await;
                }
                other => {
                    tracing::error!(
                        event_id = %event_id,
                        status = %other,
                        "Unexpected status after recording an outcome"
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Invoke every subscriber owed this event, isolating failures.
    ///
    /// On a retry only the subscribers named by the claim run; a name no
    /// longer present in the registry is considered no longer owed.
    async fn fan_out(&self, event: &ClaimedEvent) -> DeliveryOutcome {
        let subscribers = self.registry.subscribers_for(event.record.topic());
        let mut failures = Vec::new();

        for subscriber in subscribers {
            if let Some(pending) = &event.pending_subscribers {
                if !pending.iter().any(|name| name == subscriber.name()) {
                    continue;
                }
            }

            let result = tokio::time::timeout(
                self.policy.subscriber_timeout,
                subscriber.deliver(&event.record.payload),
            )
            .await
            .unwrap_or(Err(SubscriberError::Timeout(
                self.policy.subscriber_timeout,
            )));

            if let Err(error) = result {
                tracing::warn!(
                    event_id = %event.record.id,
                    subscriber = subscriber.name(),
                    %error,
                    "Subscriber failed"
                );
                failures.push(SubscriberFailure {
                    subscription_id: subscriber.name().to_owned(),
                    error_message: error.to_string(),
                });
            }
        }

        let at = Utc::now();
        if failures.is_empty() {
            DeliveryOutcome::Delivered { at }
        } else {
            DeliveryOutcome::Failed { failures, at }
        }
    }

    /// Report each still-failing subscriber of a quarantined event.
    ///
    /// Best effort: a sink failure is logged but does not abort the tick,
    /// since the event is already quarantined and inspectable in the store.
    async fn report_quarantine(&self, event: &ClaimedEvent, outcome: &DeliveryOutcome) {
        let DeliveryOutcome::Failed { failures, at } = outcome else {
            return;
        };
        tracing::error!(
            event_id = %event.record.id,
            topic = %event.record.topic(),
            failing = failures.len(),
            "Event quarantined after exhausting its retry budget"
        );

        for failure in failures {
            let diagnostic = Diagnostic {
                service_name: SERVICE_NAME.to_owned(),
                event_id: event.record.id,
                subscription_id: failure.subscription_id.clone(),
                http_status: None,
                message: failure.error_message.clone(),
                params: serde_json::json!({
                    "topic": event.record.topic().as_str(),
                    "attempts": event.record.attempts + 1,
                }),
                occurred_at: *at,
            };
            if let Err(error) = self.diagnostics.report(diagnostic).await {
                tracing::error!(
                    event_id = %event.record.id,
                    %error,
                    "Failed to persist a quarantine diagnostic"
                );
            }
        }
    }
}
