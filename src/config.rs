use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use url::Url;

/// Errors raised while loading or validating the configuration file.
/// A failure here is fatal for the whole process: no source can run without
/// a readable configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "failed to read configuration: {err}"),
            ConfigError::Parse(err) => write!(f, "failed to parse configuration: {err}"),
            ConfigError::Invalid(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        ConfigError::Parse(value)
    }
}

/// Operating mode of the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Training,
    Runtime,
}

/// Top-level configuration. Source entries are kept as raw JSON so that one
/// malformed source disables only that source instead of aborting startup;
/// see [`SourceConfig::from_value`].
#[derive(Debug, Clone, Deserialize)]
pub struct ObserverConfig {
    pub mode: Mode,
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
    pub model_server_url: String,
    #[serde(default)]
    pub vlm: Option<VlmConfig>,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub sources: Vec<serde_json::Value>,
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}

/// Remote vision-language analysis of anomalous frames. Optional; when
/// absent, anomalies are logged and exported but never analyzed.
#[derive(Debug, Clone, Deserialize)]
pub struct VlmConfig {
    pub business_name: String,
    pub business_type: String,
    pub analysis_goal: String,
    #[serde(default = "default_vlm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_vlm_timeout_secs() -> u64 {
    30
}

/// Training-mode knobs: the static duplicate gate, the dynamic anchor
/// threshold schedule, and the pruning bound.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_training_static_threshold")]
    pub static_frame_threshold: f32,
    #[serde(default = "default_base_threshold")]
    pub base_threshold: f32,
    #[serde(default = "default_max_threshold")]
    pub max_threshold: f32,
    #[serde(default = "default_threshold_step")]
    pub threshold_step: f32,
    #[serde(default = "default_threshold_step_size")]
    pub threshold_step_size: u64,
    #[serde(default = "default_training_top_k")]
    pub top_k: usize,
    /// When set, the index is pruned and the run frozen once the ingest
    /// sequence reaches this bound.
    #[serde(default)]
    pub prune_after: Option<u64>,
    #[serde(default = "default_prune_percent")]
    pub prune_percent: u32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            static_frame_threshold: default_training_static_threshold(),
            base_threshold: default_base_threshold(),
            max_threshold: default_max_threshold(),
            threshold_step: default_threshold_step(),
            threshold_step_size: default_threshold_step_size(),
            top_k: default_training_top_k(),
            prune_after: None,
            prune_percent: default_prune_percent(),
        }
    }
}

fn default_training_static_threshold() -> f32 {
    0.99
}

fn default_base_threshold() -> f32 {
    0.85
}

fn default_max_threshold() -> f32 {
    0.97
}

fn default_threshold_step() -> f32 {
    0.005
}

fn default_threshold_step_size() -> u64 {
    200
}

fn default_training_top_k() -> usize {
    3
}

fn default_prune_percent() -> u32 {
    30
}

/// Runtime-mode knobs: the static duplicate gate, the anomaly threshold,
/// and where anomalous frames are exported.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_static_threshold")]
    pub static_frame_threshold: f32,
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f32,
    #[serde(default = "default_runtime_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub anomaly_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            static_frame_threshold: default_runtime_static_threshold(),
            anomaly_threshold: default_anomaly_threshold(),
            top_k: default_runtime_top_k(),
            anomaly_dir: None,
        }
    }
}

fn default_runtime_static_threshold() -> f32 {
    0.995
}

fn default_anomaly_threshold() -> f32 {
    0.97
}

fn default_runtime_top_k() -> usize {
    5
}

/// One configured frame source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    pub source: SourceKind,
    pub snapshot_policy: SnapshotPolicy,
}

impl SourceConfig {
    /// Parse a single source entry. Unknown source types or policy modes are
    /// rejected here, at load time, before any thread for the source starts.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let cfg: SourceConfig = serde_json::from_value(value.clone())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.source_id.is_empty() {
            return Err(ConfigError::Invalid("source_id must not be empty".into()));
        }
        match &self.source {
            SourceKind::VideoFile { path, .. } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "source '{}': video path must not be empty",
                        self.source_id
                    )));
                }
            }
            SourceKind::Stream { url } => {
                Url::parse(url).map_err(|err| {
                    ConfigError::Invalid(format!(
                        "source '{}': invalid stream url '{url}': {err}",
                        self.source_id
                    ))
                })?;
            }
        }
        match &self.snapshot_policy {
            SnapshotPolicy::Interval {
                interval_seconds,
                resize_percent,
            } => {
                if *interval_seconds == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "source '{}': interval_seconds must be >= 1",
                        self.source_id
                    )));
                }
                if *resize_percent == 0 || *resize_percent > 100 {
                    return Err(ConfigError::Invalid(format!(
                        "source '{}': resize_percent must be in 1..=100",
                        self.source_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Where frames come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    VideoFile {
        path: PathBuf,
        #[serde(default = "default_true")]
        loop_playback: bool,
        #[serde(default)]
        start_paused: bool,
    },
    Stream {
        url: String,
    },
}

fn default_true() -> bool {
    true
}

/// Closed set of snapshot policies. A config entry with an unknown `mode`
/// tag fails deserialization and disables only that source.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SnapshotPolicy {
    Interval {
        #[serde(default = "default_interval_seconds")]
        interval_seconds: u64,
        #[serde(default = "default_resize_percent")]
        resize_percent: u32,
    },
}

fn default_interval_seconds() -> u64 {
    2
}

fn default_resize_percent() -> u32 {
    50
}

impl ObserverConfig {
    /// Load and validate the configuration file. Any failure here aborts
    /// startup; per-source problems are deferred to registry load.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: ObserverConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.training.threshold_step_size == 0 {
            return Err(ConfigError::Invalid(
                "training.threshold_step_size must be >= 1".into(),
            ));
        }
        if self.training.prune_percent == 0 || self.training.prune_percent >= 100 {
            return Err(ConfigError::Invalid(
                "training.prune_percent must be in 1..=99".into(),
            ));
        }
        if self.model_server_url.is_empty() {
            return Err(ConfigError::Invalid("model_server_url is not set".into()));
        }
        Ok(())
    }
}
