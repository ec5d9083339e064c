use db::{Database, DbConfig, DbError};

/// Fresh in-memory database with the schema applied.
///
/// Every `mem://` connection owns its own datastore, so tests do not share
/// state and can run in parallel.
pub async fn setup_db() -> Result<Database, DbError> {
    db::init(&DbConfig::memory()).await
}

/// Fresh in-memory database without any migrations.
pub async fn empty_db() -> Result<Database, DbError> {
    db::connect(&DbConfig::memory()).await
}
