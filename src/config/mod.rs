// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - `model.rs`: the TOML-backed raw model and the validated `ConfigFile`.
//! - `loader.rs`: reading a config file from disk.
//! - `validate.rs`: `RawConfigFile` -> `ConfigFile`, parsing durations and
//!   checking backend prerequisites.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, load_raw};
pub use model::{
    BatchConfig, CloudConfig, ConfigFile, DockerConfig, OrchestratorConfig, RawConfigFile,
    RetryConfig, SlurmConfig,
};
