//! Outbox contracts: atomic persistence, claiming, and outcome recording.
//!
//! Two traits split the outbox's two callers:
//!
//! - [`TransitionStore`] is what business operations use: persist the new
//!   convention value and the events a transition produced as one atomic
//!   unit. Either both become durable or neither does; this is the
//!   correctness backbone that prevents "state changed but no one was told"
//!   and its converse.
//! - [`OutboxStore`] is what the delivery engine uses: claim due events,
//!   record outcomes, and expose the operator surface (requeue,
//!   quarantine listing).
//!
//! The claim operation is the sole cross-instance concurrency-control point
//! in the subsystem: it atomically moves selected events to `in-process`,
//! so two concurrent engine instances never claim the same event.
//!
//! # Dyn Compatibility
//!
//! Both traits use explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` so they can be held as trait objects (`Arc<dyn OutboxStore>`)
//! by the engine.

use crate::convention::{Convention, ConventionId};
use crate::event::{
    ConventionEvent, DeliveryFailure, EventId, EventStatus, OutboxRecord, Publication,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Convenience alias for the boxed futures the store traits return.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, OutboxError>> + Send + 'a>>;

/// Errors from outbox storage operations.
///
/// Storage failures inside a delivery tick are fatal to that tick but never
/// lose an event: a claimed event whose bookkeeping failed is reclaimed
/// once its lease expires.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The referenced event does not exist.
    #[error("unknown event: {0}")]
    EventNotFound(EventId),

    /// The referenced convention does not exist.
    #[error("unknown convention: {0}")]
    ConventionNotFound(ConventionId),

    /// Underlying storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// An event handed to the engine by a claim.
///
/// `pending_subscribers` is `Some` when the event is being retried after a
/// partial failure: only the named subscribers are still owed a delivery.
/// `None` means the full fan-out runs (first attempt, or operator replay
/// with a fresh budget).
#[derive(Clone, Debug)]
pub struct ClaimedEvent {
    /// The claimed record, already moved to `in-process`.
    pub record: OutboxRecord,
    /// Subscriber names still owed a delivery, if this is a targeted retry.
    pub pending_subscribers: Option<Vec<String>>,
}

/// One subscriber's failure, as reported by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriberFailure {
    /// Name of the failing subscriber.
    pub subscription_id: String,
    /// The error it reported.
    pub error_message: String,
}

/// The aggregated result of one event's fan-out.
///
/// One outcome per attempt, owning its per-subscriber failure entries;
/// the store derives the publication row and the failure rows from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every subscriber succeeded.
    Delivered {
        /// When the fan-out completed.
        at: DateTime<Utc>,
    },
    /// At least one subscriber failed.
    Failed {
        /// The failing subscribers. Never empty.
        failures: Vec<SubscriberFailure>,
        /// When the fan-out completed.
        at: DateTime<Utc>,
    },
}

/// Atomic persistence for state-machine transitions.
pub trait TransitionStore: Send + Sync {
    /// Persist a transition's new convention value and its events as one
    /// atomic unit of work.
    ///
    /// Returns the ids of the appended outbox records, in event order.
    fn persist_transition(
        &self,
        convention: Convention,
        events: Vec<ConventionEvent>,
    ) -> StoreFuture<'_, Vec<EventId>>;

    /// Load a convention by id.
    fn load_convention(&self, id: ConventionId) -> StoreFuture<'_, Option<Convention>>;
}

/// Delivery bookkeeping for the outbox.
pub trait OutboxStore: Send + Sync {
    /// Atomically claim up to `batch_size` due events as of `now`.
    ///
    /// Due means: status `never-published`, `to-republish` or
    /// `failed-but-will-retry`, or `in-process` with a claim older than the
    /// lease (a crashed worker's leftovers). Claimed events move to
    /// `in-process` with `claimed_at = now` before being returned; two
    /// concurrent claims never return overlapping events.
    fn claim(&self, batch_size: usize, now: DateTime<Utc>) -> StoreFuture<'_, Vec<ClaimedEvent>>;

    /// Record the outcome of one event's fan-out and recompute its status.
    ///
    /// `Delivered` writes the publication row (at most one per event, kept
    /// from the first full success) and sets `published`. `Failed` writes
    /// one failure row per failing subscriber, increments the attempt
    /// count, and sets `failed-but-will-retry` or `failed-to-many-times`
    /// per the retry budget. Returns the recomputed status.
    fn record_outcome(
        &self,
        event_id: EventId,
        outcome: DeliveryOutcome,
    ) -> StoreFuture<'_, EventStatus>;

    /// Operator action: queue an event for replay with a fresh retry
    /// budget, clearing its attempt count and prior failure rows.
    fn requeue(&self, event_id: EventId) -> StoreFuture<'_, ()>;

    /// Events an operator has queued for replay (`to-republish`).
    fn list_republish_candidates(&self) -> StoreFuture<'_, Vec<OutboxRecord>>;

    /// Quarantined events (`failed-to-many-times`), for operator review.
    fn quarantined(&self) -> StoreFuture<'_, Vec<OutboxRecord>>;

    /// The publication row for an event, if its fan-out ever completed.
    fn publication_of(&self, event_id: EventId) -> StoreFuture<'_, Option<Publication>>;

    /// All recorded failures for an event, oldest first.
    fn failures_for(&self, event_id: EventId) -> StoreFuture<'_, Vec<DeliveryFailure>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn error_display_names_the_event() {
        let id = EventId::new(Uuid::nil());
        let err = OutboxError::EventNotFound(id);
        assert!(format!("{err}").contains(&Uuid::nil().to_string()));
    }

    #[test]
    fn outcome_equality_is_structural() {
        let at = Utc::now();
        let failed = DeliveryOutcome::Failed {
            failures: vec![SubscriberFailure {
                subscription_id: "email".into(),
                error_message: "smtp 550".into(),
            }],
            at,
        };
        assert_ne!(failed, DeliveryOutcome::Delivered { at });
    }
}
