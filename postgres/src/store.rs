//! `PostgreSQL`-backed convention and outbox storage.
//!
//! One store implements both contracts: business operations persist
//! transitions through it, the delivery engine claims and records
//! outcomes through it. Both sides go through the same pool, and the
//! transition path uses a single transaction so the convention mutation
//! and its outbox rows commit or roll back together.
//!
//! The claim query is the multi-instance safety point: `FOR UPDATE SKIP
//! LOCKED` inside the selecting CTE means two engines polling the same
//! database partition the due events between them instead of double
//! delivering.

use chrono::{DateTime, TimeDelta, Utc};
use conventions_core::convention::{Convention, ConventionId};
use conventions_core::event::{
    ConventionEvent, DeliveryFailure, EventId, EventStatus, OutboxRecord, Publication,
};
use conventions_core::outbox::{
    ClaimedEvent, DeliveryOutcome, OutboxError, OutboxStore, StoreFuture, TransitionStore,
};
use conventions_core::policy::DeliveryPolicy;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

/// The instant before which an `in-process` claim counts as abandoned.
fn lease_cutoff(now: DateTime<Utc>, lease: std::time::Duration) -> DateTime<Utc> {
    let lease = TimeDelta::from_std(lease).unwrap_or(TimeDelta::MAX);
    now.checked_sub_signed(lease)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn storage_error(e: sqlx::Error) -> OutboxError {
    OutboxError::Storage(e.to_string())
}

fn row_to_record(row: &PgRow) -> Result<OutboxRecord, OutboxError> {
    let payload: serde_json::Value = row.get("payload");
    let payload: ConventionEvent =
        serde_json::from_value(payload).map_err(|e| OutboxError::Serialization(e.to_string()))?;
    let status: String = row.get("status");
    let status = EventStatus::parse(&status).map_err(OutboxError::Storage)?;
    let attempts: i32 = row.get("attempts");
    #[allow(clippy::cast_sign_loss)] // Attempt counts are never negative
    let attempts = attempts as u32;

    Ok(OutboxRecord {
        id: EventId::new(row.get("id")),
        payload,
        occurred_at: row.get("occurred_at"),
        status,
        attempts,
        claimed_at: row.get("claimed_at"),
    })
}

/// `PostgreSQL` implementation of [`TransitionStore`] and [`OutboxStore`].
pub struct PostgresConventionStore {
    pool: PgPool,
    policy: DeliveryPolicy,
}

impl PostgresConventionStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool, policy: DeliveryPolicy) -> Self {
        Self { pool, policy }
    }

    /// Connect to `database_url` and create a store.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the connection fails.
    pub async fn connect(database_url: &str, policy: DeliveryPolicy) -> Result<Self, OutboxError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(storage_error)?;
        Ok(Self::new(pool, policy))
    }

    /// Run the outbox schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), OutboxError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(format!("migration failed: {e}")))
    }

    /// The subscribers still owed a delivery for a retried event.
    ///
    /// Only the most recent attempt's failures count: a subscriber that
    /// failed earlier but succeeded since has no row in the latest batch.
    async fn pending_subscribers(&self, event_id: EventId) -> Result<Vec<String>, OutboxError> {
        let rows = sqlx::query(
            r"
            SELECT DISTINCT subscription_id
            FROM delivery_failures
            WHERE event_id = $1
              AND occurred_at = (
                  SELECT MAX(occurred_at)
                  FROM delivery_failures
                  WHERE event_id = $1
              )
            ",
        )
        .bind(event_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows.iter().map(|row| row.get("subscription_id")).collect())
    }

    async fn records_by_status(&self, status: EventStatus) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = sqlx::query(
            r"
            SELECT id, payload, occurred_at, status, attempts, claimed_at
            FROM outbox_events
            WHERE status = $1
            ORDER BY occurred_at ASC
            ",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(row_to_record).collect()
    }
}

impl TransitionStore for PostgresConventionStore {
    fn persist_transition(
        &self,
        convention: Convention,
        events: Vec<ConventionEvent>,
    ) -> StoreFuture<'_, Vec<EventId>> {
        Box::pin(async move {
            let now = Utc::now();
            let data = serde_json::to_value(&convention)
                .map_err(|e| OutboxError::Serialization(e.to_string()))?;

            let mut tx = self.pool.begin().await.map_err(storage_error)?;

            sqlx::query(
                r"
                INSERT INTO conventions (id, status, data, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO UPDATE
                SET status = EXCLUDED.status,
                    data = EXCLUDED.data,
                    updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(convention.id.as_uuid())
            .bind(convention.status.as_str())
            .bind(data)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;

            let mut ids = Vec::with_capacity(events.len());
            for payload in events {
                let record = OutboxRecord::new(payload, now);
                let json = serde_json::to_value(&record.payload)
                    .map_err(|e| OutboxError::Serialization(e.to_string()))?;
                sqlx::query(
                    r"
                    INSERT INTO outbox_events (id, topic, payload, occurred_at, status, attempts)
                    VALUES ($1, $2, $3, $4, $5, 0)
                    ",
                )
                .bind(record.id.as_uuid())
                .bind(record.topic().as_str())
                .bind(json)
                .bind(record.occurred_at)
                .bind(record.status.as_str())
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?;
                ids.push(record.id);
            }

            tx.commit().await.map_err(storage_error)?;

            tracing::info!(
                convention_id = %convention.id,
                status = convention.status.as_str(),
                events = ids.len(),
                "Transition persisted"
            );
            metrics::counter!("outbox.appended").increment(ids.len() as u64);

            Ok(ids)
        })
    }

    fn load_convention(&self, id: ConventionId) -> StoreFuture<'_, Option<Convention>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT data FROM conventions WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;

            row.map(|row| {
                let data: serde_json::Value = row.get("data");
                serde_json::from_value(data)
                    .map_err(|e| OutboxError::Serialization(e.to_string()))
            })
            .transpose()
        })
    }
}

impl OutboxStore for PostgresConventionStore {
    fn claim(&self, batch_size: usize, now: DateTime<Utc>) -> StoreFuture<'_, Vec<ClaimedEvent>> {
        Box::pin(async move {
            let cutoff = lease_cutoff(now, self.policy.lease);
            #[allow(clippy::cast_possible_wrap)] // Batch sizes are small
            let limit = batch_size as i64;

            // SKIP LOCKED partitions due events between concurrent engines.
            let rows = sqlx::query(
                r"
                WITH due AS (
                    SELECT id, status AS prior_status
                    FROM outbox_events
                    WHERE status IN ('never-published', 'to-republish', 'failed-but-will-retry')
                       OR (status = 'in-process' AND claimed_at <= $1)
                    ORDER BY occurred_at ASC
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE outbox_events e
                SET status = 'in-process', claimed_at = $3
                FROM due
                WHERE e.id = due.id
                RETURNING e.id, e.payload, e.occurred_at, e.status, e.attempts,
                          e.claimed_at, due.prior_status
                ",
            )
            .bind(cutoff)
            .bind(limit)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

            let mut claimed = Vec::with_capacity(rows.len());
            for row in &rows {
                let record = row_to_record(row)?;
                let prior: String = row.get("prior_status");
                let prior = EventStatus::parse(&prior).map_err(OutboxError::Storage)?;
                let pending_subscribers = if prior == EventStatus::FailedButWillRetry {
                    Some(self.pending_subscribers(record.id).await?)
                } else {
                    None
                };
                claimed.push(ClaimedEvent {
                    record,
                    pending_subscribers,
                });
            }

            if !claimed.is_empty() {
                tracing::debug!(count = claimed.len(), "Claimed outbox events");
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
            let mut tx = self.pool.begin().await.map_err(storage_error)?;

            let status = match outcome {
                DeliveryOutcome::Delivered { at } => {
                    let result = sqlx::query(
                        r"
                        UPDATE outbox_events
                        SET status = 'published', claimed_at = NULL
                        WHERE id = $1
                        ",
                    )
                    .bind(event_id.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_error)?;
                    if result.rows_affected() == 0 {
                        return Err(OutboxError::EventNotFound(event_id));
                    }

                    // At most one publication per event: the first full
                    // success wins, later replays leave it untouched.
                    sqlx::query(
                        r"
                        INSERT INTO publications (id, event_id, published_at)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (event_id) DO NOTHING
                        ",
                    )
                    .bind(Uuid::new_v4())
                    .bind(event_id.as_uuid())
                    .bind(at)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_error)?;

                    EventStatus::Published
                }
                DeliveryOutcome::Failed { failures, at } => {
                    let row = sqlx::query(
                        r"
                        UPDATE outbox_events
                        SET attempts = attempts + 1, claimed_at = NULL
                        WHERE id = $1
                        RETURNING attempts
                        ",
                    )
                    .bind(event_id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage_error)?
                    .ok_or(OutboxError::EventNotFound(event_id))?;

                    let attempts: i32 = row.get("attempts");
                    #[allow(clippy::cast_sign_loss)] // Attempt counts are never negative
                    let status = self.policy.status_after_failure(attempts as u32);

                    sqlx::query("UPDATE outbox_events SET status = $1 WHERE id = $2")
                        .bind(status.as_str())
                        .bind(event_id.as_uuid())
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_error)?;

                    for failure in failures {
                        sqlx::query(
                            r"
                            INSERT INTO delivery_failures
                                (id, event_id, subscription_id, error_message, occurred_at)
                            VALUES ($1, $2, $3, $4, $5)
                            ",
                        )
                        .bind(Uuid::new_v4())
                        .bind(event_id.as_uuid())
                        .bind(&failure.subscription_id)
                        .bind(&failure.error_message)
                        .bind(at)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_error)?;
                    }

                    status
                }
            };

            tx.commit().await.map_err(storage_error)?;
            Ok(status)
        })
    }

    fn requeue(&self, event_id: EventId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(storage_error)?;

            let result = sqlx::query(
                r"
                UPDATE outbox_events
                SET status = 'to-republish', attempts = 0, claimed_at = NULL
                WHERE id = $1
                ",
            )
            .bind(event_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
            if result.rows_affected() == 0 {
                return Err(OutboxError::EventNotFound(event_id));
            }

            // A replay starts with a clean slate: the full fan-out runs
            // again, so old failure rows must not narrow it.
            sqlx::query("DELETE FROM delivery_failures WHERE event_id = $1")
                .bind(event_id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?;

            tx.commit().await.map_err(storage_error)?;

            tracing::info!(event_id = %event_id, "Event requeued for replay");
            metrics::counter!("outbox.requeued").increment(1);
            Ok(())
        })
    }

    fn list_republish_candidates(&self) -> StoreFuture<'_, Vec<OutboxRecord>> {
        Box::pin(self.records_by_status(EventStatus::ToRepublish))
    }

    fn quarantined(&self) -> StoreFuture<'_, Vec<OutboxRecord>> {
        Box::pin(self.records_by_status(EventStatus::FailedTooManyTimes))
    }

    fn publication_of(&self, event_id: EventId) -> StoreFuture<'_, Option<Publication>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, event_id, published_at FROM publications WHERE event_id = $1",
            )
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

            Ok(row.map(|row| Publication {
                id: row.get("id"),
                event_id: EventId::new(row.get("event_id")),
                published_at: row.get("published_at"),
            }))
        })
    }

    fn failures_for(&self, event_id: EventId) -> StoreFuture<'_, Vec<DeliveryFailure>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id, event_id, subscription_id, error_message, occurred_at
                FROM delivery_failures
                WHERE event_id = $1
                ORDER BY occurred_at ASC
                ",
            )
            .bind(event_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

            Ok(rows
                .iter()
                .map(|row| DeliveryFailure {
                    id: row.get("id"),
                    event_id: EventId::new(row.get("event_id")),
                    subscription_id: row.get("subscription_id"),
                    error_message: row.get("error_message"),
                    occurred_at: row.get("occurred_at"),
                })
                .collect())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lease_cutoff_subtracts_the_lease() {
        let now = Utc::now();
        let cutoff = lease_cutoff(now, Duration::from_secs(600));
        assert_eq!(now - cutoff, TimeDelta::seconds(600));
    }

    #[test]
    fn oversized_leases_never_reclaim() {
        let cutoff = lease_cutoff(Utc::now(), Duration::MAX);
        assert_eq!(cutoff, DateTime::<Utc>::MIN_UTC);
    }
}
