use kestrel_core::{AcceleratorKind, JobId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::{ConfigError, JobConfig};

#[derive(Error, Debug, PartialEq)]
pub enum InvalidJobSpec {
    #[error("job must have at least one worker")]
    NoWorkers,

    #[error("each worker needs at least one accelerator")]
    NoAccelerators,

    #[error("worker command is empty")]
    EmptyCommand,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub accelerator: AcceleratorKind,
    pub accelerators_per_worker: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    #[default]
    Never,
    /// Resubmit a failed job from its resume point, at most `max_restarts`
    /// times.
    OnFailure { max_restarts: u32 },
}

/// What to run and where. Immutable once submitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: JobId,
    /// Shell command each process-backed worker runs.
    pub command: String,
    pub worker_count: u32,
    pub resources: Resources,
    /// Passed to every worker. `KESTREL_*` entries also configure the job.
    pub env: BTreeMap<String, String>,
    pub restart_policy: RestartPolicy,
    /// Base options the `KESTREL_*` entries of `env` override.
    pub config: JobConfig,
}

impl JobSpec {
    pub fn new(
        job_id: JobId,
        command: impl Into<String>,
        worker_count: u32,
        resources: Resources,
    ) -> Result<Self, InvalidJobSpec> {
        let command = command.into();
        if worker_count == 0 {
            return Err(InvalidJobSpec::NoWorkers);
        }
        if resources.accelerators_per_worker == 0 {
            return Err(InvalidJobSpec::NoAccelerators);
        }
        if command.trim().is_empty() {
            return Err(InvalidJobSpec::EmptyCommand);
        }
        Ok(Self {
            job_id,
            command,
            worker_count,
            resources,
            env: BTreeMap::new(),
            restart_policy: RestartPolicy::Never,
            config: JobConfig::default(),
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Effective configuration: the base config with env overrides applied,
    /// checked against this job's own worker count and accelerator.
    pub fn resolve_config(&self) -> Result<JobConfig, ConfigError> {
        let mut config = self.config.clone();
        config.apply_env(&self.env)?;
        config.validate()?;
        if let Some(workers) = config.workers {
            if workers != self.worker_count {
                return Err(ConfigError::Conflict {
                    key: "workers",
                    config: workers.to_string(),
                    spec: self.worker_count.to_string(),
                });
            }
        }
        if let Some(accelerator) = &config.accelerator {
            if *accelerator != self.resources.accelerator {
                return Err(ConfigError::Conflict {
                    key: "accelerator",
                    config: accelerator.to_string(),
                    spec: self.resources.accelerator.to_string(),
                });
            }
        }
        Ok(config)
    }
}
