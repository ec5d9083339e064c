//! Versioned schema migrations using SurrealQL.
//!
//! The applied version lives in the `schema_version:current` record. Each
//! pending migration runs in its own transaction together with the version
//! bump, so a failing migration leaves the previous version in place.

use serde::Deserialize;

use crate::{Database, DbError};

/// A single schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub statements: &'static str,
}

/// Migrations known to this binary, in ascending version order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "model records",
        statements: MODEL_SCHEMA,
    },
    Migration {
        version: 2,
        description: "job journal",
        statements: JOB_SCHEMA,
    },
];

/// Model record table. Enum fields are stored in their serialized form.
const MODEL_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS model SCHEMALESS;

DEFINE INDEX IF NOT EXISTS model_source ON model FIELDS source;
DEFINE INDEX IF NOT EXISTS model_name ON model FIELDS name;
"#;

/// Job journal table. `data` holds the serialized job.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE INDEX IF NOT EXISTS job_queue ON job FIELDS queue;
DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS queue, status;
"#;

const BUMP_VERSION: &str = "UPSERT schema_version:current CONTENT { version: $version };";

#[derive(Debug, Deserialize)]
struct VersionRow {
    version: u32,
}

/// Latest version among `migrations`.
pub fn latest_version(migrations: &[Migration]) -> u32 {
    migrations.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Currently applied schema version (0 for an empty database).
pub async fn current_version(db: &Database) -> Result<u32, DbError> {
    let row: Option<VersionRow> = db.select(("schema_version", "current")).await?;
    Ok(row.map_or(0, |r| r.version))
}

/// Apply all pending built-in migrations.
pub async fn run_migrations(db: &Database) -> Result<u32, DbError> {
    run_migrations_with(db, MIGRATIONS).await
}

/// Apply pending migrations from `migrations`, returning the resulting version.
pub async fn run_migrations_with(db: &Database, migrations: &[Migration]) -> Result<u32, DbError> {
    let supported = latest_version(migrations);
    let mut current = current_version(db).await?;

    if current > supported {
        return Err(DbError::SchemaTooNew {
            found: current,
            supported,
        });
    }

    let mut pending: Vec<&Migration> = migrations.iter().filter(|m| m.version > current).collect();
    pending.sort_by_key(|m| m.version);

    for migration in pending {
        tracing::info!(
            version = migration.version,
            "Applying migration: {}",
            migration.description
        );

        let sql = format!(
            "BEGIN TRANSACTION;\n{}\n{}\nCOMMIT TRANSACTION;",
            migration.statements, BUMP_VERSION
        );

        let response = db
            .query(sql)
            .bind(("version", migration.version))
            .await
            .map_err(|e| DbError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;

        response.check().map_err(|e| DbError::Migration {
            version: migration.version,
            reason: e.to_string(),
        })?;

        current = migration.version;
    }

    tracing::info!(version = current, "Database schema up to date");

    Ok(current)
}
