//! Model record store.

use conductor_core::{ModelConfig, ModelRecordChanges, ModelRecordFilter};

use crate::{Database, DbError};

const TABLE: &str = "model";

/// Durable catalog of installed models keyed by their stable key.
#[derive(Clone)]
pub struct ModelRecordRepository {
    db: Database,
}

impl ModelRecordRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Add a new record. Fails with [`DbError::Duplicate`] if the key exists.
    pub async fn add(&self, config: &ModelConfig) -> Result<ModelConfig, DbError> {
        if self.exists(&config.key).await? {
            return Err(DbError::Duplicate(config.key.clone()));
        }

        let record: Option<ModelConfig> = self
            .db
            .create((TABLE, config.key.as_str()))
            .content(config.clone())
            .await
            .map_err(|e| {
                // Lost a race with a concurrent create of the same key.
                if e.to_string().contains("already exists") {
                    DbError::Duplicate(config.key.clone())
                } else {
                    DbError::Connection(e)
                }
            })?;

        record.ok_or_else(|| DbError::Query(format!("Failed to create model {}", config.key)))
    }

    /// Get a record by key.
    pub async fn get(&self, key: &str) -> Result<ModelConfig, DbError> {
        self.find(key)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Model not found: {key}")))
    }

    /// Get a record by key, `None` if missing.
    pub async fn find(&self, key: &str) -> Result<Option<ModelConfig>, DbError> {
        Ok(self.db.select((TABLE, key)).await?)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, DbError> {
        Ok(self.find(key).await?.is_some())
    }

    /// Find the record installed from `source`, if any.
    pub async fn get_by_source(&self, source: &str) -> Result<Option<ModelConfig>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM model WHERE source = $source LIMIT 1")
            .bind(("source", source.to_string()))
            .await?;

        let records: Vec<ModelConfig> = result.take(0)?;

        Ok(records.into_iter().next())
    }

    /// Apply `changes` to an existing record.
    pub async fn update(
        &self,
        key: &str,
        changes: &ModelRecordChanges,
    ) -> Result<ModelConfig, DbError> {
        let mut config = self.get(key).await?;
        config.apply(changes);

        let record: Option<ModelConfig> = self
            .db
            .update((TABLE, key))
            .content(config)
            .await?;

        record.ok_or_else(|| DbError::NotFound(format!("Model not found: {key}")))
    }

    /// Delete a record, returning what was removed.
    pub async fn delete(&self, key: &str) -> Result<ModelConfig, DbError> {
        let record: Option<ModelConfig> = self.db.delete((TABLE, key)).await?;
        record.ok_or_else(|| DbError::NotFound(format!("Model not found: {key}")))
    }

    /// List records matching `filter`, ordered by name.
    pub async fn list(&self, filter: &ModelRecordFilter) -> Result<Vec<ModelConfig>, DbError> {
        let mut conditions = Vec::new();
        let mut bindings: Vec<(&str, serde_json::Value)> = Vec::new();

        if let Some(name) = &filter.name {
            conditions.push("name = $name");
            bindings.push(("name", serde_json::json!(name)));
        }

        if let Some(base) = filter.base {
            conditions.push("base = $base");
            bindings.push(("base", to_json(base)?));
        }

        if let Some(model_type) = filter.model_type {
            conditions.push("`type` = $model_type");
            bindings.push(("model_type", to_json(model_type)?));
        }

        if let Some(format) = filter.format {
            conditions.push("format = $format");
            bindings.push(("format", to_json(format)?));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!("SELECT * FROM model {where_clause} ORDER BY name ASC");

        let mut result = self.db.query(&query);

        for (name, value) in bindings {
            result = result.bind((name, value));
        }

        let mut response = result.await?;
        let records: Vec<ModelConfig> = response.take(0)?;

        Ok(records)
    }
}

fn to_json<T: serde::Serialize>(value: T) -> Result<serde_json::Value, DbError> {
    serde_json::to_value(value).map_err(|e| DbError::Serialization(e.to_string()))
}
