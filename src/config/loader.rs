// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file and return the raw, unvalidated `RawConfigFile`.
///
/// This only performs TOML deserialization. Use [`load_and_validate`] or
/// `ConfigFile::try_from` once any CLI overrides have been applied.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and validate it as-is.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Raw configuration for a run.
///
/// An explicit path must exist. Without one, [`default_config_path`] is used
/// when present and built-in defaults otherwise.
pub fn load_raw(explicit: Option<&Path>) -> Result<RawConfigFile> {
    if let Some(path) = explicit {
        debug!(path = %path.display(), "loading config");
        return load_from_path(path);
    }

    let fallback = default_config_path();
    if fallback.is_file() {
        debug!(path = %fallback.display(), "loading default config");
        return load_from_path(fallback);
    }
    Ok(RawConfigFile::default())
}

/// `taskfleet.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("taskfleet.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackendKind;
    use std::time::Duration;

    #[test]
    fn parses_sections_and_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskfleet.toml");
        fs::write(
            &path,
            r#"
[orchestrator]
max_workers = 2
backend = "slurm"
poll_interval = "250ms"

[slurm]
partition = "gpu"
gpus_per_task = 1
"#,
        )
        .unwrap();

        let cfg = load_and_validate(&path).unwrap();
        assert_eq!(cfg.orchestrator.max_workers, 2);
        assert_eq!(cfg.orchestrator.backend, BackendKind::Slurm);
        assert_eq!(cfg.orchestrator.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.slurm.partition, "gpu");
        assert_eq!(cfg.slurm.gpus_per_task, 1);
        assert_eq!(cfg.slurm.memory, "4G");
        assert_eq!(cfg.retry.max_retries, 3);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[orchestrator]\nmax_wrokers = 2\n").unwrap();
        assert!(load_from_path(&path).is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_raw(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
