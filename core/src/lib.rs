//! # Conventions Core
//!
//! Domain model and core contracts for the convention workflow: the
//! multi-party agreement state machine and the transactional outbox that
//! notifies every interested party when the agreement's legal state
//! changes.
//!
//! ## Core Concepts
//!
//! - **Convention**: the agreement aggregate; its status only moves along
//!   edges the transition table allows
//! - **Transition**: `attempt_transition` validates source status, acting
//!   roles and business guards, then returns the new convention plus the
//!   events to persist atomically with it
//! - **Outbox**: durable, append-only log of events with per-delivery
//!   bookkeeping; `claim` is the single concurrency-control point
//! - **Registry**: static topic → subscribers mapping, built once and
//!   injected
//! - **Policy**: finite retry budget and claim lease, shared by store and
//!   engine
//!
//! ## Architecture Principles
//!
//! - Transitions are pure with respect to delivery: they never invoke
//!   subscribers
//! - State change and event append are one atomic unit
//! - Delivery is at-least-once; every subscriber must be idempotent
//! - Illegal states are unrepresentable: statuses, topics and payload
//!   shapes are closed enums, not strings

/// Convention aggregate, statuses, roles and signatories.
pub mod convention;

/// Operator diagnostics for quarantined deliveries.
pub mod diagnostics;

/// Domain events, topics and outbox record types.
pub mod event;

/// Outbox store contracts and delivery outcomes.
pub mod outbox;

/// Retry budget, lease and batching configuration.
pub mod policy;

/// Subscriber contract and the subscription registry.
pub mod registry;

/// The convention status state machine.
pub mod transition;
