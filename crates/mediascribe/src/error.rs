use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScribeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Volume probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("No home directory available to locate the default config")]
    NoHomeDirectory,

    #[error("Failed to resolve the engine token: {0}")]
    Secret(#[from] crate::secrets::SecretError),
}

/// Failures of a single platform volume probe.
///
/// These never escape `list_mounted_devices`; they are logged and turned
/// into an empty snapshot.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with status {status}")]
    ToolFailed { program: String, status: i32 },

    #[error("Failed to read '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unparseable {what} output: {reason}")]
    Parse { what: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to start engine '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine exited with status {status}: {stderr}")]
    Exited { status: i32, stderr: String },

    #[error("Engine request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Engine reply was not valid JSON: {0}")]
    InvalidReply(#[from] serde_json::Error),

    #[error("Engine reported an error: {0}")]
    Reported(String),

    #[error("Failed to read media '{path}': {source}")]
    ReadMedia {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Worker pool is broken after {faults} consecutive worker faults")]
    PoolBroken { faults: usize },

    #[error("Media conversion failed for '{path}': {reason}")]
    Conversion { path: PathBuf, reason: String },

    #[error("Timed out after {waited_secs}s waiting for {needed_mb} MiB of free memory")]
    MemoryHeadroom { needed_mb: u64, waited_secs: u64 },

    #[error("Invalid worker request: {0}")]
    InvalidRequest(#[from] serde_json::Error),

    #[error("Worker I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a worker process as seen by the process that drives it.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to start worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Worker process terminated abnormally ({status})")]
    Crashed { status: String },

    #[error("Worker protocol violation: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Worker pipe failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScribeError>;
