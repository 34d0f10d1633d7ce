pub mod config;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod paths;
pub mod recorder;
pub mod sanitize;
pub mod secrets;
pub mod selector;
pub mod transcript;
pub mod verifier;
pub mod volume;
pub mod worker;

pub use config::{load_config, load_config_or_default, Config};
pub use db::{Database, DatabaseError};
pub use dispatcher::{DispatchOptions, DispatchSummary, Dispatcher};
pub use engine::{build_engine, TranscriptionEngine};
pub use error::{ConfigError, EngineError, ProbeError, Result, RunnerError, ScribeError, WorkerError};
pub use paths::{logical_path_to_real, real_path_to_logical, LogicalPath};
pub use recorder::{ResultRecorder, SqliteRecorder};
pub use volume::{list_mounted_devices, normalize_uuid, MountSnapshot, VolumeMount, VolumeProbe};
