// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{
    ConfigFile, OrchestratorConfig, RawConfigFile, RawLlmSection, RawRetrySection, RetryConfig,
};
use crate::errors::{Result, TaskfleetError};
use crate::llm::LlmSettings;
use crate::types::{BackendKind, parse_duration};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = TaskfleetError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;

        let o = &raw.orchestrator;
        let orchestrator = OrchestratorConfig {
            max_workers: o.max_workers,
            backend: o.backend,
            output_dir: o.output_dir.clone(),
            real: o.real,
            planner: o.planner,
            poll_interval: duration("orchestrator.poll_interval", &o.poll_interval)?,
            timeout: o
                .timeout
                .as_deref()
                .map(|t| duration("orchestrator.timeout", t))
                .transpose()?,
            simulated_task_time: duration("orchestrator.simulated_task_time", &o.simulated_task_time)?,
        };

        Ok(ConfigFile {
            orchestrator,
            retry: retry_config(&raw.retry)?,
            llm: llm_settings(&raw.llm)?,
            docker: raw.docker,
            slurm: raw.slurm,
            cloud: raw.cloud,
            batch: raw.batch,
        })
    }
}

fn duration(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| TaskfleetError::ConfigError(format!("[{field}]: {e}")))
}

fn retry_config(raw: &RawRetrySection) -> Result<RetryConfig> {
    Ok(RetryConfig {
        max_retries: raw.max_retries,
        base_delay: duration("retry.base_delay", &raw.base_delay)?,
        multiplier: raw.multiplier,
        max_delay: raw
            .max_delay
            .as_deref()
            .map(|d| duration("retry.max_delay", d))
            .transpose()?,
    })
}

fn llm_settings(raw: &RawLlmSection) -> Result<LlmSettings> {
    Ok(LlmSettings {
        binary: raw.binary.clone(),
        model: raw.model.clone(),
        timeout: duration("llm.timeout", &raw.timeout)?,
    })
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_orchestrator(cfg)?;
    validate_retry(cfg)?;
    validate_backend_requirements(cfg)?;
    Ok(())
}

fn validate_orchestrator(cfg: &RawConfigFile) -> Result<()> {
    if cfg.orchestrator.max_workers == 0 {
        return Err(TaskfleetError::ConfigError(
            "[orchestrator].max_workers must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.orchestrator.output_dir.as_os_str().is_empty() {
        return Err(TaskfleetError::ConfigError(
            "[orchestrator].output_dir must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_retry(cfg: &RawConfigFile) -> Result<()> {
    let retry = &cfg.retry;
    if retry.max_retries == 0 {
        return Err(TaskfleetError::ConfigError(
            "[retry].max_retries must be >= 1 (it counts the first attempt)".to_string(),
        ));
    }
    if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
        return Err(TaskfleetError::ConfigError(format!(
            "[retry].multiplier must be >= 1.0 (got {})",
            retry.multiplier
        )));
    }
    Ok(())
}

fn validate_backend_requirements(cfg: &RawConfigFile) -> Result<()> {
    let backend = cfg.orchestrator.backend;

    if backend.uses_object_storage() && cfg.cloud.bucket.as_deref().is_none_or(str::is_empty) {
        return Err(TaskfleetError::ConfigError(format!(
            "backend '{backend}' keeps its state in object storage; set [cloud].bucket or --bucket"
        )));
    }

    if backend == BackendKind::Batch {
        if cfg.batch.job_queue.is_none() {
            return Err(TaskfleetError::ConfigError(
                "backend 'batch' requires [batch].job_queue".to_string(),
            ));
        }
        if cfg.batch.job_definition.is_none() {
            return Err(TaskfleetError::ConfigError(
                "backend 'batch' requires [batch].job_definition".to_string(),
            ));
        }
    }

    if matches!(backend, BackendKind::Docker) && cfg.docker.worker_command.is_empty() {
        return Err(TaskfleetError::ConfigError(
            "[docker].worker_command must not be empty".to_string(),
        ));
    }
    if matches!(backend, BackendKind::Slurm | BackendKind::ParallelCluster)
        && cfg.slurm.worker_command.is_empty()
    {
        return Err(TaskfleetError::ConfigError(
            "[slurm].worker_command must not be empty".to_string(),
        ));
    }

    Ok(())
}
