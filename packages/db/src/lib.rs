//! SurrealDB integration for conductor.
//!
//! This crate provides database connectivity, versioned migrations and
//! repositories for model records and the job journal.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
pub mod repositories;
mod schema;

pub use connection::{Database, DbConfig, DbError, connect};
pub use schema::{
    MIGRATIONS, Migration, current_version, latest_version, run_migrations, run_migrations_with,
};

/// Connect with the given configuration and bring the schema up to date.
///
/// This should be called once at application startup; a migration failure
/// is fatal.
pub async fn init(config: &DbConfig) -> Result<Database, DbError> {
    let db = connect(config).await?;
    run_migrations(&db).await?;
    Ok(db)
}
