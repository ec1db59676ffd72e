//! # Conventions Testing
//!
//! Testing utilities for the convention workflow: an in-memory store
//! implementing the same contracts as the postgres one, scripted
//! subscribers with observable behavior, and an in-memory diagnostics
//! sink. Fast and deterministic: no database, no network.

use chrono::{DateTime, TimeDelta, Utc};
use conventions_core::convention::{
    Convention, ConventionId, ConventionStatus, Signatories, Signatory,
};
use conventions_core::diagnostics::{Diagnostic, DiagnosticsSink};
use conventions_core::event::{
    ConventionEvent, DeliveryFailure, EventId, EventStatus, OutboxRecord, Publication, Topic,
};
use conventions_core::outbox::{
    ClaimedEvent, DeliveryOutcome, OutboxError, OutboxStore, StoreFuture, TransitionStore,
};
use conventions_core::policy::DeliveryPolicy;
use conventions_core::registry::{Subscriber, SubscriberError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Initialize a compact tracing subscriber for tests. Safe to call from
/// several tests; only the first call installs it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// A convention fixture with two mandatory signatories and no
/// representative, in the given status.
#[must_use]
pub fn sample_convention(status: ConventionStatus) -> Convention {
    Convention {
        id: ConventionId::generate(),
        status,
        agency_id: Uuid::new_v4(),
        establishment_name: "Boulangerie Martin".into(),
        immersion_objective: "Discover the baker trade".into(),
        start_date: Utc::now(),
        end_date: Utc::now() + TimeDelta::days(5),
        signatories: Signatories {
            beneficiary: Signatory::new("Ada Martin".into(), "ada@example.com".into()),
            beneficiary_representative: None,
            establishment_representative: Signatory::new(
                "Linus Petit".into(),
                "linus@example.com".into(),
            ),
        },
        status_justification: None,
    }
}

#[derive(Default)]
struct Inner {
    conventions: HashMap<ConventionId, Convention>,
    records: Vec<OutboxRecord>,
    publications: HashMap<EventId, Publication>,
    failures: Vec<DeliveryFailure>,
}

/// In-memory [`TransitionStore`] + [`OutboxStore`].
///
/// A single mutex makes every operation atomic, which matches the
/// contracts exactly: persist-transition is one unit of work, and two
/// concurrent claims serialize and therefore never overlap.
pub struct InMemoryStore {
    policy: DeliveryPolicy,
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    /// Creates an empty store using `policy` for retry and lease decisions.
    #[must_use]
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Recover rather than panic if a test thread poisoned the lock.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lease(&self) -> TimeDelta {
        TimeDelta::from_std(self.policy.lease).unwrap_or(TimeDelta::MAX)
    }

    /// Direct read of an event's current record, for assertions.
    #[must_use]
    pub fn record(&self, event_id: EventId) -> Option<OutboxRecord> {
        self.lock().records.iter().find(|r| r.id == event_id).cloned()
    }

    /// Every stored record, in append order, for assertions.
    #[must_use]
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.lock().records.clone()
    }
}

impl TransitionStore for InMemoryStore {
    fn persist_transition(
        &self,
        convention: Convention,
        events: Vec<ConventionEvent>,
    ) -> StoreFuture<'_, Vec<EventId>> {
        Box::pin(async move {
            let now = Utc::now();
            let mut inner = self.lock();
            inner.conventions.insert(convention.id, convention);
            let ids = events
                .into_iter()
                .map(|payload| {
                    let record = OutboxRecord::new(payload, now);
                    let id = record.id;
                    inner.records.push(record);
                    id
                })
                .collect();
            Ok(ids)
        })
    }

    fn load_convention(&self, id: ConventionId) -> StoreFuture<'_, Option<Convention>> {
        Box::pin(async move { Ok(self.lock().conventions.get(&id).cloned()) })
    }
}

impl OutboxStore for InMemoryStore {
    fn claim(&self, batch_size: usize, now: DateTime<Utc>) -> StoreFuture<'_, Vec<ClaimedEvent>> {
        Box::pin(async move {
            let lease = self.lease();
            let mut inner = self.lock();
            let mut claimed = Vec::new();
            let mut pending_lookups: Vec<(usize, EventStatus)> = Vec::new();

            for (index, record) in inner.records.iter_mut().enumerate() {
                if claimed.len() + pending_lookups.len() >= batch_size {
                    break;
                }
                let expired_lease = record.status == EventStatus::InProcess
                    && record
                        .claimed_at
                        .is_some_and(|claimed_at| claimed_at + lease <= now);
                if record.status.is_eligible_for_claim() || expired_lease {
                    pending_lookups.push((index, record.status));
                    record.status = EventStatus::InProcess;
                    record.claimed_at = Some(now);
                }
            }

            for (index, prior_status) in pending_lookups {
                let record = inner.records[index].clone();
                // Only the most recent attempt's failures are still owed:
                // earlier subscribers may have succeeded since.
                let pending_subscribers = (prior_status == EventStatus::FailedButWillRetry)
                    .then(|| {
                        let latest = inner
                            .failures
                            .iter()
                            .filter(|failure| failure.event_id == record.id)
                            .map(|failure| failure.occurred_at)
                            .max();
                        let mut names: Vec<String> = Vec::new();
                        for failure in inner
                            .failures
                            .iter()
                            .filter(|failure| failure.event_id == record.id)
                            .filter(|failure| Some(failure.occurred_at) == latest)
                        {
                            if !names.contains(&failure.subscription_id) {
                                names.push(failure.subscription_id.clone());
                            }
                        }
                        names
                    });
                claimed.push(ClaimedEvent {
                    record,
                    pending_subscribers,
                });
            }
            Ok(claimed)
        })
    }

    fn record_outcome(
        &self,
        event_id: EventId,
        outcome: DeliveryOutcome,
    ) -> StoreFuture<'_, EventStatus> {
        Box::pin(async move {
            let policy = self.policy;
            let mut inner = self.lock();
            let record = inner
                .records
                .iter_mut()
                .find(|record| record.id == event_id)
                .ok_or(OutboxError::EventNotFound(event_id))?;

            let status = match outcome {
                DeliveryOutcome::Delivered { at } => {
                    record.status = EventStatus::Published;
                    record.claimed_at = None;
                    let publication = Publication {
                        id: Uuid::new_v4(),
                        event_id,
                        published_at: at,
                    };
                    inner.publications.entry(event_id).or_insert(publication);
                    EventStatus::Published
                }
                DeliveryOutcome::Failed { failures, at } => {
                    record.attempts += 1;
                    let status = policy.status_after_failure(record.attempts);
                    record.status = status;
                    record.claimed_at = None;
                    let rows: Vec<DeliveryFailure> = failures
                        .into_iter()
                        .map(|failure| DeliveryFailure {
                            id: Uuid::new_v4(),
                            event_id,
                            subscription_id: failure.subscription_id,
                            error_message: failure.error_message,
                            occurred_at: at,
                        })
                        .collect();
                    inner.failures.extend(rows);
                    status
                }
            };
            Ok(status)
        })
    }

    fn requeue(&self, event_id: EventId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            let record = inner
                .records
                .iter_mut()
                .find(|record| record.id == event_id)
                .ok_or(OutboxError::EventNotFound(event_id))?;
            record.status = EventStatus::ToRepublish;
            record.attempts = 0;
            record.claimed_at = None;
            inner.failures.retain(|failure| failure.event_id != event_id);
            Ok(())
        })
    }

    fn list_republish_candidates(&self) -> StoreFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .records
                .iter()
                .filter(|record| record.status == EventStatus::ToRepublish)
                .cloned()
                .collect())
        })
    }

    fn quarantined(&self) -> StoreFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .records
                .iter()
                .filter(|record| record.status == EventStatus::FailedTooManyTimes)
                .cloned()
                .collect())
        })
    }

    fn publication_of(&self, event_id: EventId) -> StoreFuture<'_, Option<Publication>> {
        Box::pin(async move { Ok(self.lock().publications.get(&event_id).cloned()) })
    }

    fn failures_for(&self, event_id: EventId) -> StoreFuture<'_, Vec<DeliveryFailure>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .failures
                .iter()
                .filter(|failure| failure.event_id == event_id)
                .cloned()
                .collect())
        })
    }
}

/// A subscriber that always succeeds and records what it saw.
pub struct RecordingSubscriber {
    name: String,
    seen: Mutex<Vec<Topic>>,
}

impl RecordingSubscriber {
    /// Creates a recording subscriber named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// How many deliveries this subscriber received.
    #[must_use]
    pub fn delivery_count(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// The topics delivered, in order.
    #[must_use]
    pub fn topics_seen(&self) -> Vec<Topic> {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Subscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(
        &self,
        event: &ConventionEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriberError>> + Send + '_>> {
        let topic = event.topic();
        Box::pin(async move {
            self.seen
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(topic);
            Ok(())
        })
    }
}

/// A subscriber that always fails with the same error.
pub struct FailingSubscriber {
    name: String,
    error: String,
    calls: AtomicUsize,
}

impl FailingSubscriber {
    /// Creates a failing subscriber named `name` reporting `error`.
    #[must_use]
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// How many times the subscriber was invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Subscriber for FailingSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(
        &self,
        _event: &ConventionEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriberError>> + Send + '_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let error = self.error.clone();
        Box::pin(async move { Err(SubscriberError::Call(error)) })
    }
}

/// A subscriber that fails its first N calls, then succeeds.
pub struct FlakySubscriber {
    name: String,
    failures_before_success: usize,
    calls: AtomicUsize,
}

impl FlakySubscriber {
    /// Creates a subscriber whose first `failures_before_success` calls
    /// fail.
    #[must_use]
    pub fn new(name: impl Into<String>, failures_before_success: usize) -> Self {
        Self {
            name: name.into(),
            failures_before_success,
            calls: AtomicUsize::new(0),
        }
    }

    /// How many times the subscriber was invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Subscriber for FlakySubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(
        &self,
        _event: &ConventionEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriberError>> + Send + '_>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = call < self.failures_before_success;
        Box::pin(async move {
            if fail {
                Err(SubscriberError::Call("transient outage".into()))
            } else {
                Ok(())
            }
        })
    }
}

/// A subscriber that sleeps before succeeding, to exercise timeouts.
pub struct SlowSubscriber {
    name: String,
    delay: std::time::Duration,
}

impl SlowSubscriber {
    /// Creates a subscriber that takes `delay` to answer.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: std::time::Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }
}

impl Subscriber for SlowSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(
        &self,
        _event: &ConventionEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriberError>> + Send + '_>> {
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(())
        })
    }
}

/// An in-memory [`DiagnosticsSink`] that keeps every report.
#[derive(Default)]
pub struct RecordingDiagnostics {
    reports: Mutex<Vec<Diagnostic>>,
}

impl RecordingDiagnostics {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every diagnostic reported so far, in order.
    #[must_use]
    pub fn reports(&self) -> Vec<Diagnostic> {
        self.reports
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl DiagnosticsSink for RecordingDiagnostics {
    fn report(
        &self,
        diagnostic: Diagnostic,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            self.reports
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(diagnostic);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use conventions_core::outbox::SubscriberFailure;

    fn event() -> ConventionEvent {
        ConventionEvent::ConventionFullySigned {
            convention: sample_convention(ConventionStatus::InReview),
        }
    }

    #[tokio::test]
    async fn persist_transition_appends_never_published_records() {
        let store = InMemoryStore::new(DeliveryPolicy::default());
        let convention = sample_convention(ConventionStatus::InReview);
        let ids = store
            .persist_transition(convention.clone(), vec![event()])
            .await
            .unwrap();

        assert_eq!(ids.len(), 1);
        let record = store.record(ids[0]).unwrap();
        assert_eq!(record.status, EventStatus::NeverPublished);
        assert_eq!(
            store.load_convention(convention.id).await.unwrap().unwrap(),
            convention
        );
    }

    #[tokio::test]
    async fn claim_moves_events_to_in_process_and_excludes_them_afterwards() {
        let store = InMemoryStore::new(DeliveryPolicy::default());
        store
            .persist_transition(sample_convention(ConventionStatus::InReview), vec![event()])
            .await
            .unwrap();

        let now = Utc::now();
        let first = store.claim(10, now).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].record.status, EventStatus::InProcess);
        assert!(first[0].pending_subscribers.is_none());

        // Still leased: a second claim sees nothing.
        let second = store.claim(10, now).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_partition_the_due_events() {
        use std::collections::HashSet;

        let store = InMemoryStore::new(DeliveryPolicy::default());
        let mut seeded = HashSet::new();
        for _ in 0..6 {
            let ids = store
                .persist_transition(sample_convention(ConventionStatus::InReview), vec![event()])
                .await
                .unwrap();
            seeded.extend(ids);
        }

        let now = Utc::now();
        let (first, second) = tokio::join!(store.claim(4, now), store.claim(4, now));
        let first: HashSet<EventId> = first.unwrap().iter().map(|c| c.record.id).collect();
        let second: HashSet<EventId> = second.unwrap().iter().map(|c| c.record.id).collect();

        // The two claims never overlap, and together they drain the due set.
        assert!(first.is_disjoint(&second));
        assert_eq!(first.len() + second.len(), seeded.len());
        let union: HashSet<EventId> = first.union(&second).copied().collect();
        assert_eq!(union, seeded);
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimable() {
        let policy = DeliveryPolicy::builder()
            .lease(std::time::Duration::from_secs(60))
            .build();
        let store = InMemoryStore::new(policy);
        store
            .persist_transition(sample_convention(ConventionStatus::InReview), vec![event()])
            .await
            .unwrap();

        let t0 = Utc::now();
        assert_eq!(store.claim(10, t0).await.unwrap().len(), 1);
        // Before the lease expires, nothing to reclaim.
        assert!(store.claim(10, t0 + TimeDelta::seconds(30)).await.unwrap().is_empty());
        // After it, the event is claimable again.
        assert_eq!(
            store.claim(10, t0 + TimeDelta::seconds(61)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_outcome_records_failures_and_schedules_retry() {
        let store = InMemoryStore::new(DeliveryPolicy::builder().retry_budget(2).build());
        let ids = store
            .persist_transition(sample_convention(ConventionStatus::InReview), vec![event()])
            .await
            .unwrap();
        let id = ids[0];

        store.claim(10, Utc::now()).await.unwrap();
        let status = store
            .record_outcome(
                id,
                DeliveryOutcome::Failed {
                    failures: vec![SubscriberFailure {
                        subscription_id: "sms".into(),
                        error_message: "gateway 502".into(),
                    }],
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();

        assert_eq!(status, EventStatus::FailedButWillRetry);
        assert_eq!(store.failures_for(id).await.unwrap().len(), 1);
        assert!(store.publication_of(id).await.unwrap().is_none());

        // A retry claim names the subscriber still owed.
        let retry = store.claim(10, Utc::now()).await.unwrap();
        assert_eq!(
            retry[0].pending_subscribers.as_deref(),
            Some(&["sms".to_string()][..])
        );
    }

    #[tokio::test]
    async fn requeue_resets_the_budget() {
        let store = InMemoryStore::new(DeliveryPolicy::builder().retry_budget(1).build());
        let ids = store
            .persist_transition(sample_convention(ConventionStatus::InReview), vec![event()])
            .await
            .unwrap();
        let id = ids[0];

        store.claim(10, Utc::now()).await.unwrap();
        let status = store
            .record_outcome(
                id,
                DeliveryOutcome::Failed {
                    failures: vec![SubscriberFailure {
                        subscription_id: "partner".into(),
                        error_message: "down".into(),
                    }],
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(status, EventStatus::FailedTooManyTimes);
        assert_eq!(store.quarantined().await.unwrap().len(), 1);

        store.requeue(id).await.unwrap();
        let record = store.record(id).unwrap();
        assert_eq!(record.status, EventStatus::ToRepublish);
        assert_eq!(record.attempts, 0);
        assert!(store.failures_for(id).await.unwrap().is_empty());
        assert_eq!(store.list_republish_candidates().await.unwrap().len(), 1);

        // The replayed event runs the full fan-out again.
        let claimed = store.claim(10, Utc::now()).await.unwrap();
        assert!(claimed[0].pending_subscribers.is_none());
    }
}
