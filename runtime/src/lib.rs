//! # Conventions Runtime
//!
//! The delivery engine: a recurring task that turns "an event exists in
//! the outbox" into "every subscriber has seen it, eventually". At-least-
//! once semantics with a bounded retry budget, per-subscriber failure
//! isolation and timeout, and quarantine of permanently-failing events.

/// The delivery engine and its tick summary.
pub mod engine;

pub use engine::{DeliveryEngine, TickSummary};
