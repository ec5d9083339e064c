//! Application configuration from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `CONDUCTOR_DB` | `mem://` |
//! | `CONDUCTOR_DB_NAMESPACE` / `CONDUCTOR_DB_NAME` | `conductor` / `main` |
//! | `CONDUCTOR_MODELS_DIR` | `./models` |
//! | `CONDUCTOR_DOWNLOAD_WORKERS` | `3` |
//! | `CONDUCTOR_INSTALL_WORKERS` | `2` |
//! | `CONDUCTOR_SESSION_WORKERS` | `1` |
//! | `CONDUCTOR_EVENT_CAPACITY` | `1024` |
//! | `CONDUCTOR_MAX_QUEUE_SIZE` | unbounded |
//! | `CONDUCTOR_PROGRESS_INTERVAL_MS` | `500` |
//! | `CONDUCTOR_PERSIST` | `true` |
//! | `CONDUCTOR_LOG_JSON` | `false` |
//! | `CONDUCTOR_PRELOAD_MODELS` | none (comma separated sources) |

use std::path::PathBuf;
use std::str::FromStr;

use db::DbConfig;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub db_endpoint: String,
    pub db_namespace: String,
    pub db_name: String,
    pub models_dir: PathBuf,
    pub download_workers: usize,
    pub install_workers: usize,
    pub session_workers: usize,
    pub event_capacity: usize,
    pub max_queue_size: Option<usize>,
    pub progress_interval_ms: u64,
    /// Journal install and session jobs in the database.
    pub persist: bool,
    pub log_json: bool,
    /// Sources installed at startup.
    pub preload_models: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_endpoint: "mem://".to_string(),
            db_namespace: "conductor".to_string(),
            db_name: "main".to_string(),
            models_dir: PathBuf::from("./models"),
            download_workers: 3,
            install_workers: 2,
            session_workers: 1,
            event_capacity: actors::DEFAULT_CAPACITY,
            max_queue_size: None,
            progress_interval_ms: 500,
            persist: true,
            log_json: false,
            preload_models: Vec::new(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl AppConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            db_endpoint: lookup("CONDUCTOR_DB").unwrap_or(defaults.db_endpoint),
            db_namespace: lookup("CONDUCTOR_DB_NAMESPACE").unwrap_or(defaults.db_namespace),
            db_name: lookup("CONDUCTOR_DB_NAME").unwrap_or(defaults.db_name),
            models_dir: lookup("CONDUCTOR_MODELS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.models_dir),
            download_workers: parse(&lookup, "CONDUCTOR_DOWNLOAD_WORKERS")?
                .unwrap_or(defaults.download_workers),
            install_workers: parse(&lookup, "CONDUCTOR_INSTALL_WORKERS")?
                .unwrap_or(defaults.install_workers),
            session_workers: parse(&lookup, "CONDUCTOR_SESSION_WORKERS")?
                .unwrap_or(defaults.session_workers),
            event_capacity: parse(&lookup, "CONDUCTOR_EVENT_CAPACITY")?
                .unwrap_or(defaults.event_capacity),
            max_queue_size: parse(&lookup, "CONDUCTOR_MAX_QUEUE_SIZE")?,
            progress_interval_ms: parse(&lookup, "CONDUCTOR_PROGRESS_INTERVAL_MS")?
                .unwrap_or(defaults.progress_interval_ms),
            persist: parse_bool(&lookup, "CONDUCTOR_PERSIST")?.unwrap_or(defaults.persist),
            log_json: parse_bool(&lookup, "CONDUCTOR_LOG_JSON")?.unwrap_or(defaults.log_json),
            preload_models: lookup("CONDUCTOR_PRELOAD_MODELS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|source| !source.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("CONDUCTOR_DOWNLOAD_WORKERS", self.download_workers),
            ("CONDUCTOR_INSTALL_WORKERS", self.install_workers),
            ("CONDUCTOR_SESSION_WORKERS", self.session_workers),
            ("CONDUCTOR_EVENT_CAPACITY", self.event_capacity),
        ];
        for (var, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    var,
                    value: value.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        let known = ["mem://", "file://", "rocksdb://", "ws://", "wss://", "http://", "https://"];
        if !known.iter().any(|scheme| self.db_endpoint.starts_with(scheme)) {
            return Err(ConfigError::Invalid {
                var: "CONDUCTOR_DB",
                value: self.db_endpoint.clone(),
                reason: "unsupported database endpoint".to_string(),
            });
        }
        Ok(())
    }

    pub fn db_config(&self) -> DbConfig {
        DbConfig::endpoint(&self.db_endpoint)
            .with_namespace(&self.db_namespace)
            .with_database(&self.db_name)
    }
}

fn parse<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value,
                reason: e.to_string(),
            }),
    }
}

fn parse_bool<F>(lookup: &F, var: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var).as_deref().map(str::trim) {
        None => Ok(None),
        Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some("0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(other) => Err(ConfigError::Invalid {
            var,
            value: other.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(load(&[]).unwrap(), AppConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = load(&[
            ("CONDUCTOR_DB", "rocksdb://./data"),
            ("CONDUCTOR_DOWNLOAD_WORKERS", "5"),
            ("CONDUCTOR_MAX_QUEUE_SIZE", "100"),
            ("CONDUCTOR_LOG_JSON", "true"),
            ("CONDUCTOR_PRELOAD_MODELS", "invokeai/gemini-3-pro, ,/models/a.safetensors"),
        ])
        .unwrap();

        assert_eq!(config.db_config().endpoint, "rocksdb://./data");
        assert_eq!(config.download_workers, 5);
        assert_eq!(config.max_queue_size, Some(100));
        assert!(config.log_json);
        assert_eq!(
            config.preload_models,
            vec!["invokeai/gemini-3-pro", "/models/a.safetensors"]
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            load(&[("CONDUCTOR_SESSION_WORKERS", "many")]),
            Err(ConfigError::Invalid { var: "CONDUCTOR_SESSION_WORKERS", .. })
        ));
        assert!(load(&[("CONDUCTOR_INSTALL_WORKERS", "0")]).is_err());
        assert!(load(&[("CONDUCTOR_PERSIST", "maybe")]).is_err());
        assert!(load(&[("CONDUCTOR_DB", "postgres://x")]).is_err());
    }
}
