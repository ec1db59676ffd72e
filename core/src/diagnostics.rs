//! Operator-facing diagnostics for permanently failing deliveries.
//!
//! When an event exhausts its retry budget the engine reports one
//! [`Diagnostic`] per still-failing subscriber to a [`DiagnosticsSink`].
//! Quarantined events stay inspectable through the outbox store; the sink
//! is the searchable "what broke and why" record operators start from
//! before requeueing.

use crate::event::EventId;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

use crate::outbox::OutboxError;

/// One operator-facing error record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// The service that produced the record (e.g. `"delivery-engine"`).
    pub service_name: String,
    /// The quarantined event.
    pub event_id: EventId,
    /// The subscriber that kept failing.
    pub subscription_id: String,
    /// HTTP status reported by the subscriber's upstream, when known.
    pub http_status: Option<u16>,
    /// The last error message.
    pub message: String,
    /// Free-form context such as the topic and attempt count.
    pub params: serde_json::Value,
    /// When the quarantine happened.
    pub occurred_at: DateTime<Utc>,
}

/// Destination for operator diagnostics.
///
/// Implementations: a postgres table in `conventions-postgres`, an
/// in-memory vector in `conventions-testing`.
pub trait DiagnosticsSink: Send + Sync {
    /// Persist one diagnostic record.
    fn report(
        &self,
        diagnostic: Diagnostic,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;
}
