//! Host wiring for conductor: configuration, service startup and the
//! built-in node engine.

pub mod config;
pub mod engine;
pub mod init;

pub use config::{AppConfig, ConfigError};
pub use engine::PrimitiveEngine;
pub use init::{InitError, Services, init};
