//! Database layer for Roomcast.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and embedded SQL migrations. Every table is created through a versioned
//! migration managed by this crate.
//!
//! WAL mode lets the many readers (history, presence lookups, membership
//! checks) proceed while a single writer commits a message transaction.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
