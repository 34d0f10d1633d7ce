pub mod convert;
pub mod lease;
pub mod pool;
pub mod runner;
pub mod task;

pub use convert::{MediaConverter, TempArtifact};
pub use lease::{Lease, LeaseOutcome};
pub use pool::{PoolJob, WorkerPool};
pub use runner::{
    run_worker_process, InlineRunner, ProcessRunner, TaskRunner, WorkerRequest,
};
pub use task::{RunStatus, SkipReason, TaskOutcome, TaskReport, TaskState, TranscriptionTask};
