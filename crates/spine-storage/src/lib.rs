//! Postgres-backed persistence for every entity in Market Spine (§4.1 Storage
//! Adapter). One [`Storage`] wraps a `sqlx::PgPool`; each module below adds
//! typed methods for one entity family. Every write that needs to be atomic
//! with a sibling write (state transition + event, claim + lease) goes
//! through a single `sqlx` transaction rather than two round trips.
//!
//! Conditional-insert idioms (`ON CONFLICT DO NOTHING`, `FOR UPDATE SKIP
//! LOCKED`) follow the ones worked out for task-claiming and
//! workflow-execution repositories; see `DESIGN.md` for sources.
//!
//! Errors are classified into [`StorageError`] at the edge of this crate so
//! callers can decide whether to retry without matching on `sqlx` internals.

mod error;
mod pool;

pub mod alerts;
pub mod capture;
pub mod executions;
pub mod locks;
pub mod schedules;
pub mod sources;
pub mod watermark;
pub mod workflow;
pub mod workitems;

pub use error::StorageError;
pub use pool::Storage;

pub use sqlx::PgPool;
