//! # Ferry Persistence
//!
//! SQL job stores for `ferry_queue::DatabaseQueue`.
//!
//! Supports:
//! - SQLite (single node, atomic `UPDATE … RETURNING` claims)
//! - PostgreSQL (many workers, `FOR UPDATE SKIP LOCKED` claims)
//!
//! Migrations are embedded and run on connect.

pub mod config;
pub mod error;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use config::StoreConfig;
pub use error::PersistError;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;
