//! # Conventions Postgres
//!
//! `PostgreSQL` persistence for the convention workflow: an outbox store
//! whose transition path is a single transaction, a claim query safe
//! across concurrent engine instances, and a diagnostics table for
//! quarantined deliveries.
//!
//! # Example
//!
//! ```ignore
//! use conventions_core::policy::DeliveryPolicy;
//! use conventions_postgres::{PostgresConventionStore, PostgresDiagnostics};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store =
//!         PostgresConventionStore::connect("postgres://localhost/conventions", DeliveryPolicy::default())
//!             .await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod diagnostics;
pub mod store;

pub use diagnostics::PostgresDiagnostics;
pub use store::PostgresConventionStore;
