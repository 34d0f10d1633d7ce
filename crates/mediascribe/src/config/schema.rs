use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
    /// Upper bound on how long a crashed holder can keep a file claimed.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// SQLite busy timeout; claims fail fast once it elapses.
    #[serde(default = "default_lease_statement_timeout_ms")]
    pub lease_statement_timeout_ms: u64,
}

fn default_catalog_path() -> PathBuf {
    crate::db::default_database_path().unwrap_or_else(|| PathBuf::from("mediascribe.db"))
}

fn default_lease_ttl_secs() -> u64 {
    7200
}

fn default_lease_statement_timeout_ms() -> u64 {
    2000
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
            lease_ttl_secs: default_lease_ttl_secs(),
            lease_statement_timeout_ms: default_lease_statement_timeout_ms(),
        }
    }
}

impl CatalogConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_statement_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Kept small: each worker holds a model in accelerator memory.
    #[serde(default = "default_max_parallel_workers")]
    pub max_parallel_workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_success_freshness_hours")]
    pub success_freshness_hours: u64,
    #[serde(default)]
    pub retry_failed_after_secs: u64,
    #[serde(default = "default_max_pool_faults")]
    pub max_pool_faults: usize,
    #[serde(default = "default_media_mime_prefixes")]
    pub media_mime_prefixes: Vec<String>,
    #[serde(default)]
    pub excluded_mime_types: Vec<String>,
    #[serde(default = "default_snapshot_refresh_secs")]
    pub snapshot_refresh_secs: u64,
}

fn default_max_parallel_workers() -> usize {
    2
}

fn default_batch_size() -> usize {
    100
}

fn default_success_freshness_hours() -> u64 {
    24
}

/// Seconds as a signed delta, clamped to `chrono::Duration::MAX`.
fn saturating_delta(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

fn default_max_pool_faults() -> usize {
    3
}

fn default_media_mime_prefixes() -> Vec<String> {
    vec!["audio/".to_string(), "video/".to_string()]
}

fn default_snapshot_refresh_secs() -> u64 {
    300
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_parallel_workers: default_max_parallel_workers(),
            batch_size: default_batch_size(),
            success_freshness_hours: default_success_freshness_hours(),
            retry_failed_after_secs: 0,
            max_pool_faults: default_max_pool_faults(),
            media_mime_prefixes: default_media_mime_prefixes(),
            excluded_mime_types: Vec::new(),
            snapshot_refresh_secs: default_snapshot_refresh_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn success_freshness(&self) -> chrono::Duration {
        saturating_delta(self.success_freshness_hours.saturating_mul(3600))
    }

    pub fn retry_failed_after(&self) -> chrono::Duration {
        saturating_delta(self.retry_failed_after_secs)
    }

    pub fn snapshot_refresh(&self) -> Duration {
        Duration::from_secs(self.snapshot_refresh_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Command,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_kind")]
    pub kind: EngineKind,
    #[serde(default = "default_model_identity")]
    pub model_identity: String,
    #[serde(default = "default_beam_size")]
    pub beam_size: u32,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_true")]
    pub vad_filter: bool,
    #[serde(default)]
    pub command: CommandEngineConfig,
    #[serde(default)]
    pub remote: RemoteEngineConfig,
}

fn default_engine_kind() -> EngineKind {
    EngineKind::Command
}

fn default_model_identity() -> String {
    "distil-large-v3-ct2".to_string()
}

fn default_beam_size() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: default_engine_kind(),
            model_identity: default_model_identity(),
            beam_size: default_beam_size(),
            language: None,
            vad_filter: true,
            command: CommandEngineConfig::default(),
            remote: RemoteEngineConfig::default(),
        }
    }
}

/// External program invoked once per file. Arguments may use the
/// `{input}`, `{model}`, `{beam_size}`, `{language}` and `{vad_filter}`
/// placeholders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandEngineConfig {
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEngineConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
    /// Bearer token, inline. Prefer `token_file` or `token_env_var`.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_file: Option<String>,
    #[serde(default)]
    pub token_env_var: Option<String>,
}

fn default_remote_timeout_secs() -> u64 {
    3600
}

impl RemoteEngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RemoteEngineConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: default_remote_timeout_secs(),
            token: None,
            token_file: None,
            token_env_var: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_convert_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_min_free_memory_mb")]
    pub min_free_memory_mb: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
}

fn default_convert_extensions() -> Vec<String> {
    vec!["mkv".to_string()]
}

fn default_min_free_memory_mb() -> u64 {
    2048
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_wait_secs() -> u64 {
    600
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            extensions: default_convert_extensions(),
            min_free_memory_mb: default_min_free_memory_mb(),
            poll_interval_ms: default_poll_interval_ms(),
            max_wait_secs: default_max_wait_secs(),
            temp_dir: None,
            ffmpeg: default_ffmpeg(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    30
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ffprobe: default_ffprobe(),
            timeout_secs: default_probe_timeout_secs(),
        }
    }
}
