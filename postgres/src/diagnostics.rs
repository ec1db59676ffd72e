//! Persistent diagnostics sink backed by the `saved_errors` table.

use chrono::{DateTime, Utc};
use conventions_core::diagnostics::{Diagnostic, DiagnosticsSink};
use conventions_core::event::EventId;
use conventions_core::outbox::OutboxError;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;

fn storage_error(e: sqlx::Error) -> OutboxError {
    OutboxError::Storage(e.to_string())
}

fn row_to_diagnostic(row: &PgRow) -> Diagnostic {
    let http_status: Option<i32> = row.get("http_status");
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)] // Stored from a u16
    let http_status = http_status.map(|s| s as u16);
    Diagnostic {
        service_name: row.get("service_name"),
        event_id: EventId::new(row.get("event_id")),
        subscription_id: row.get("subscription_id"),
        http_status,
        message: row.get("message"),
        params: row.get("params"),
        occurred_at: row.get("occurred_at"),
    }
}

/// `PostgreSQL`-backed [`DiagnosticsSink`].
///
/// Every quarantine report becomes a row operators can search by event,
/// subscriber or time window before deciding what to requeue.
pub struct PostgresDiagnostics {
    pool: PgPool,
}

impl PostgresDiagnostics {
    /// Create a sink over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Diagnostics recorded for one event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the query fails.
    pub async fn for_event(&self, event_id: EventId) -> Result<Vec<Diagnostic>, OutboxError> {
        let rows = sqlx::query(
            r"
            SELECT service_name, event_id, subscription_id, http_status,
                   message, params, occurred_at
            FROM saved_errors
            WHERE event_id = $1
            ORDER BY occurred_at ASC
            ",
        )
        .bind(event_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows.iter().map(row_to_diagnostic).collect())
    }

    /// The most recent diagnostics across all events.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the query fails.
    pub async fn recent(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Diagnostic>, OutboxError> {
        #[allow(clippy::cast_possible_wrap)] // Limits are small
        let limit = limit as i64;
        let rows = sqlx::query(
            r"
            SELECT service_name, event_id, subscription_id, http_status,
                   message, params, occurred_at
            FROM saved_errors
            WHERE occurred_at >= $1
            ORDER BY occurred_at DESC
            LIMIT $2
            ",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows.iter().map(row_to_diagnostic).collect())
    }
}

impl DiagnosticsSink for PostgresDiagnostics {
    fn report(
        &self,
        diagnostic: Diagnostic,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO saved_errors
                    (service_name, event_id, subscription_id, http_status,
                     message, params, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(&diagnostic.service_name)
            .bind(diagnostic.event_id.as_uuid())
            .bind(&diagnostic.subscription_id)
            .bind(diagnostic.http_status.map(i32::from))
            .bind(&diagnostic.message)
            .bind(&diagnostic.params)
            .bind(diagnostic.occurred_at)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

            tracing::warn!(
                event_id = %diagnostic.event_id,
                subscriber = diagnostic.subscription_id,
                "Delivery diagnostic saved"
            );
            metrics::counter!("outbox.diagnostics_saved").increment(1);
            Ok(())
        })
    }
}
