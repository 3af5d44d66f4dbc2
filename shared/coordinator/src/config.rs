use kestrel_cache::{ArtifactRef, CacheConfig, CacheError, resolve_cache_root};
use kestrel_checkpoint::{LocalObjectStore, ObjectStore, ObjectStoreError};
use kestrel_core::AcceleratorKind;
use kestrel_sharding::DataSharding;
use kestrel_worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

/// Lock file libtpu leaves behind when a process holding the TPU dies.
pub const TPU_LOCKFILE: &str = "/tmp/libtpu_lockfile";

pub const ENV_PREFIX: &str = "KESTREL_";

/// Every `KESTREL_*` key a job may carry, with the config field it sets.
pub const ENV_KEYS: &[(&str, &str)] = &[
    ("KESTREL_CACHE_DIR", "cache_dir"),
    ("KESTREL_BUCKET", "bucket"),
    ("KESTREL_WORKERS", "workers"),
    ("KESTREL_ACCELERATOR", "accelerator"),
    ("KESTREL_RESUME", "resume"),
    ("KESTREL_TARGET_STEPS", "target_steps"),
    ("KESTREL_CHECKPOINT_EVERY", "checkpoint_every"),
    ("KESTREL_KEEP_CHECKPOINTS", "keep_checkpoints"),
    ("KESTREL_EARLY_STOP_FILE", "early_stop_file"),
    ("KESTREL_STARTUP_TIMEOUT_SECS", "startup_timeout_secs"),
    ("KESTREL_STALL_TIMEOUT_SECS", "stall_timeout_secs"),
    ("KESTREL_LOG_EVERY", "log_every"),
    ("KESTREL_TRAINING_MODE", "training_mode"),
    ("KESTREL_BASE_MODEL", "base_model"),
    ("KESTREL_DATA_SHARDING", "data_sharding"),
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("couldn't read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unrecognized configuration key {0}")]
    UnrecognizedKey(String),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{key} is {config} but the job spec requests {spec}")]
    Conflict {
        key: &'static str,
        config: String,
        spec: String,
    },

    #[error("no base model configured")]
    MissingBaseModel,

    #[error("no checkpoint bucket configured")]
    MissingBucket,

    #[error("unsupported checkpoint bucket {0}")]
    UnsupportedBucket(String),

    #[error("couldn't open checkpoint bucket: {0}")]
    Bucket(#[from] ObjectStoreError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeMode {
    /// Continue from the recorded resume point or the latest committed
    /// checkpoint, if any.
    #[default]
    Auto,
    /// Ignore existing checkpoints.
    Fresh,
}

impl FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "fresh" => Ok(Self::Fresh),
            _ => Err("expected auto or fresh".to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TrainingMode {
    #[default]
    Full,
    /// Frozen base weights plus a trainable low-rank adapter.
    Lora { rank: u64 },
}

impl FromStr for TrainingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "full" {
            return Ok(Self::Full);
        }
        match s.strip_prefix("lora:").map(str::parse::<u64>) {
            Some(Ok(rank)) if rank > 0 => Ok(Self::Lora { rank }),
            _ => Err("expected full or lora:<rank>".to_string()),
        }
    }
}

impl fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Lora { rank } => write!(f, "lora:{rank}"),
        }
    }
}

impl TryFrom<String> for TrainingMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TrainingMode> for String {
    fn from(value: TrainingMode) -> Self {
        value.to_string()
    }
}

/// Options recognised for one job. Loaded from TOML, then overridden by the
/// `KESTREL_*` variables in the job's environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub cache_dir: Option<PathBuf>,
    /// `gs://bucket/prefix` or a local directory.
    pub bucket: Option<String>,
    pub workers: Option<u32>,
    pub accelerator: Option<AcceleratorKind>,
    pub resume: ResumeMode,
    pub target_steps: u64,
    pub checkpoint_every: u64,
    pub keep_checkpoints: usize,
    /// Stop gracefully once this file exists.
    pub early_stop_file: Option<PathBuf>,
    pub startup_timeout_secs: u64,
    pub stall_timeout_secs: u64,
    pub log_every: u64,
    pub training_mode: TrainingMode,
    pub base_model: Option<ArtifactRef>,
    pub data_sharding: DataSharding,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            bucket: None,
            workers: None,
            accelerator: None,
            resume: ResumeMode::Auto,
            target_steps: 100,
            checkpoint_every: 20,
            keep_checkpoints: 5,
            early_stop_file: None,
            startup_timeout_secs: 600,
            stall_timeout_secs: 300,
            log_every: 10,
            training_mode: TrainingMode::Full,
            base_model: None,
            data_sharding: DataSharding::Replicated,
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: err.to_string(),
    })
}

impl JobConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Applies every `KESTREL_*` entry of `env`. Other variables are left for
    /// the workers.
    pub fn apply_env(&mut self, env: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        for (key, value) in env.iter().filter(|(key, _)| key.starts_with(ENV_PREFIX)) {
            self.apply(key, value.trim())?;
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "KESTREL_CACHE_DIR" => self.cache_dir = Some(PathBuf::from(value)),
            "KESTREL_BUCKET" => self.bucket = Some(value.to_string()),
            "KESTREL_WORKERS" => self.workers = Some(parse(key, value)?),
            "KESTREL_ACCELERATOR" => self.accelerator = Some(parse(key, value)?),
            "KESTREL_RESUME" => self.resume = parse(key, value)?,
            "KESTREL_TARGET_STEPS" => self.target_steps = parse(key, value)?,
            "KESTREL_CHECKPOINT_EVERY" => self.checkpoint_every = parse(key, value)?,
            "KESTREL_KEEP_CHECKPOINTS" => self.keep_checkpoints = parse(key, value)?,
            "KESTREL_EARLY_STOP_FILE" => self.early_stop_file = Some(PathBuf::from(value)),
            "KESTREL_STARTUP_TIMEOUT_SECS" => self.startup_timeout_secs = parse(key, value)?,
            "KESTREL_STALL_TIMEOUT_SECS" => self.stall_timeout_secs = parse(key, value)?,
            "KESTREL_LOG_EVERY" => self.log_every = parse(key, value)?,
            "KESTREL_TRAINING_MODE" => self.training_mode = parse(key, value)?,
            "KESTREL_BASE_MODEL" => self.base_model = Some(parse(key, value)?),
            "KESTREL_DATA_SHARDING" => self.data_sharding = parse(key, value)?,
            _ => return Err(ConfigError::UnrecognizedKey(key.to_string())),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_model.is_none() {
            return Err(ConfigError::MissingBaseModel);
        }
        let positive = [
            ("target_steps", self.target_steps),
            ("startup_timeout_secs", self.startup_timeout_secs),
            ("stall_timeout_secs", self.stall_timeout_secs),
            ("keep_checkpoints", self.keep_checkpoints as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn worker_config(&self, accelerator: &AcceleratorKind) -> WorkerConfig {
        let stale_lockfiles = match accelerator {
            AcceleratorKind::Tpu(_) => vec![PathBuf::from(TPU_LOCKFILE)],
            _ => vec![],
        };
        WorkerConfig {
            target_steps: self.target_steps,
            checkpoint_every: self.checkpoint_every,
            log_every: self.log_every,
            stale_lockfiles,
            ..WorkerConfig::default()
        }
    }

    pub fn cache_config(&self) -> Result<CacheConfig, CacheError> {
        Ok(CacheConfig::new(resolve_cache_root(self.cache_dir.as_deref())?))
    }

    /// Opens the configured checkpoint bucket.
    pub async fn object_store(&self) -> Result<Arc<dyn ObjectStore>, ConfigError> {
        let bucket = self.bucket.as_deref().ok_or(ConfigError::MissingBucket)?;
        if let Some(location) = bucket.strip_prefix("gs://") {
            return open_gcs(location).await;
        }
        let path = Path::new(bucket.strip_prefix("file://").unwrap_or(bucket));
        if !path.is_absolute() {
            return Err(ConfigError::UnsupportedBucket(bucket.to_string()));
        }
        Ok(Arc::new(LocalObjectStore::new(path)))
    }
}

#[cfg(feature = "gcs")]
async fn open_gcs(location: &str) -> Result<Arc<dyn ObjectStore>, ConfigError> {
    let (bucket, prefix) = match location.split_once('/') {
        Some((bucket, prefix)) if !prefix.is_empty() => (bucket, Some(prefix.trim_end_matches('/'))),
        Some((bucket, _)) => (bucket, None),
        None => (location, None),
    };
    if bucket.is_empty() {
        return Err(ConfigError::UnsupportedBucket(format!("gs://{location}")));
    }
    Ok(Arc::new(
        kestrel_checkpoint::GcsObjectStore::new(bucket, prefix).await?,
    ))
}

#[cfg(not(feature = "gcs"))]
async fn open_gcs(location: &str) -> Result<Arc<dyn ObjectStore>, ConfigError> {
    Err(ConfigError::UnsupportedBucket(format!(
        "gs://{location} (built without the gcs feature)"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_toml_and_env_overrides() {
        let mut config = JobConfig::from_toml_str(
            r#"
            bucket = "/var/checkpoints"
            target_steps = 500
            training_mode = "lora:8"
            base_model = "hf://org/model"
            data_sharding = "per-host"
            "#,
        )
        .unwrap();
        assert_eq!(config.checkpoint_every, 20);
        assert_eq!(config.training_mode, TrainingMode::Lora { rank: 8 });

        config
            .apply_env(&env(&[
                ("KESTREL_TARGET_STEPS", "1000"),
                ("KESTREL_ACCELERATOR", "tpu-v5e"),
                ("KESTREL_RESUME", "fresh"),
                ("HF_TOKEN", "ignored"),
            ]))
            .unwrap();
        assert_eq!(config.target_steps, 1000);
        assert_eq!(config.accelerator, Some(AcceleratorKind::Tpu("v5e".into())));
        assert_eq!(config.resume, ResumeMode::Fresh);
        assert_eq!(config.data_sharding, DataSharding::PerHost);
        config.validate().unwrap();

        let worker = config.worker_config(&AcceleratorKind::Tpu("v5e".into()));
        assert_eq!(worker.stale_lockfiles, vec![PathBuf::from(TPU_LOCKFILE)]);
        assert!(config.worker_config(&AcceleratorKind::Cpu).stale_lockfiles.is_empty());
    }

    #[test]
    fn test_every_env_key_is_recognized() {
        let mut config = JobConfig::default();
        for (key, _) in ENV_KEYS {
            let value = match *key {
                "KESTREL_ACCELERATOR" => "cpu",
                "KESTREL_RESUME" => "auto",
                "KESTREL_TRAINING_MODE" => "full",
                "KESTREL_BASE_MODEL" => "file:///models/base",
                "KESTREL_DATA_SHARDING" => "replicated",
                "KESTREL_CACHE_DIR" | "KESTREL_BUCKET" | "KESTREL_EARLY_STOP_FILE" => "/tmp/x",
                _ => "3",
            };
            config.apply_env(&env(&[(*key, value)])).unwrap();
        }
        assert_eq!(config.workers, Some(3));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let mut config = JobConfig::default();
        assert!(matches!(
            config.apply_env(&env(&[("KESTREL_TARGET_STEP", "5")])),
            Err(ConfigError::UnrecognizedKey(key)) if key == "KESTREL_TARGET_STEP"
        ));
        assert!(matches!(
            JobConfig::from_toml_str("target_step = 5"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_invalid_values() {
        let mut config = JobConfig::default();
        for (key, value) in [
            ("KESTREL_WORKERS", "many"),
            ("KESTREL_TRAINING_MODE", "lora:0"),
            ("KESTREL_RESUME", "sometimes"),
            ("KESTREL_BASE_MODEL", "ftp://nope"),
        ] {
            assert!(
                matches!(
                    config.apply_env(&env(&[(key, value)])),
                    Err(ConfigError::InvalidValue { .. })
                ),
                "{key}={value}"
            );
        }
        assert!(matches!(config.validate(), Err(ConfigError::MissingBaseModel)));
    }

    #[tokio::test]
    async fn test_object_store_location() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JobConfig::default();
        assert!(matches!(
            config.object_store().await,
            Err(ConfigError::MissingBucket)
        ));
        config.bucket = Some(format!("file://{}", dir.path().display()));
        config.object_store().await.unwrap();
        config.bucket = Some("relative/dir".into());
        assert!(matches!(
            config.object_store().await,
            Err(ConfigError::UnsupportedBucket(_))
        ));
    }
}
