use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::engine::EngineOptions;
use crate::error::WorkerError;
use crate::recorder::{ResultRecorder, RunRecord};
use crate::sanitize::redact_path;
use crate::worker::convert::TempArtifact;
use crate::worker::lease::Lease;
use crate::worker::runner::{TaskRunner, WorkerRequest};
use crate::worker::task::{next_run_version, TaskOutcome, TaskReport, TaskState};

/// A claimed task ready to run. Dropping it releases the lease and
/// removes any conversion artifact.
#[derive(Debug)]
pub struct PoolJob {
    pub request: WorkerRequest,
    pub lease: Option<Lease>,
    pub artifact: Option<TempArtifact>,
}

impl PoolJob {
    pub fn file_id(&self) -> i64 {
        self.request.task.file_id
    }

    /// Reports the job as cancelled and lets go of what it holds.
    pub fn cancel(self) -> TaskReport {
        TaskReport {
            file_id: self.file_id(),
            state: TaskState::Cancelled,
            worker_fault: false,
        }
    }
}

struct WorkerContext {
    runner: Arc<dyn TaskRunner>,
    recorder: Arc<dyn ResultRecorder>,
    options: EngineOptions,
    max_faults: usize,
    shutdown: Arc<AtomicBool>,
    broken: Arc<AtomicBool>,
    /// Worker faults since the last task that reached its worker.
    consecutive_faults: Arc<AtomicUsize>,
}

/// Fixed number of supervisor threads, each driving one task at a time
/// through a [`TaskRunner`].
///
/// The pool breaks after `max_faults` consecutive worker faults. A broken
/// pool stops taking jobs; the owner is expected to call
/// [`cancel_pending`](Self::cancel_pending).
pub struct WorkerPool {
    job_sender: Sender<PoolJob>,
    job_receiver: Receiver<PoolJob>,
    result_receiver: Receiver<TaskReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    broken: Arc<AtomicBool>,
    consecutive_faults: Arc<AtomicUsize>,
    capacity: usize,
}

impl WorkerPool {
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        recorder: Arc<dyn ResultRecorder>,
        options: EngineOptions,
        worker_count: usize,
        max_faults: usize,
    ) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");
        let (job_sender, job_receiver) = bounded::<PoolJob>(worker_count * 2);
        let (result_sender, result_receiver) = bounded::<TaskReport>(worker_count * 2);
        let shutdown = Arc::new(AtomicBool::new(false));
        let broken = Arc::new(AtomicBool::new(false));
        let consecutive_faults = Arc::new(AtomicUsize::new(0));

        let context = Arc::new(WorkerContext {
            runner,
            recorder,
            options,
            max_faults: max_faults.max(1),
            shutdown: Arc::clone(&shutdown),
            broken: Arc::clone(&broken),
            consecutive_faults: Arc::clone(&consecutive_faults),
        });

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let job_rx = job_receiver.clone();
            let result_tx = result_sender.clone();
            let ctx = Arc::clone(&context);

            let handle = thread::spawn(move || {
                run_worker(worker_id, job_rx, result_tx, ctx);
            });

            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Self {
            job_sender,
            job_receiver,
            result_receiver,
            workers,
            shutdown,
            broken,
            consecutive_faults,
            capacity: worker_count,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queues a job. On failure the job is handed back so the caller can
    /// report it.
    pub fn submit(&self, job: PoolJob) -> Result<(), (WorkerError, PoolJob)> {
        if self.is_broken() {
            let faults = self.consecutive_faults.load(Ordering::SeqCst);
            return Err((WorkerError::PoolBroken { faults }, job));
        }
        if self.shutdown.load(Ordering::Relaxed) {
            return Err((WorkerError::ChannelClosed, job));
        }

        self.job_sender
            .send(job)
            .map_err(|e| (WorkerError::ChannelClosed, e.into_inner()))
    }

    /// Waits up to `timeout` for the next finished task, in completion
    /// order.
    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<TaskReport> {
        self.result_receiver.recv_timeout(timeout).ok()
    }

    /// Takes every job that no worker has started yet.
    pub fn cancel_pending(&self) -> Vec<PoolJob> {
        let pending: Vec<PoolJob> = self.job_receiver.try_iter().collect();
        if !pending.is_empty() {
            warn!("Cancelled {} pending tasks", pending.len());
        }
        pending
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Stops the workers and returns reports that arrived meanwhile.
    pub fn wait(self) -> Vec<TaskReport> {
        // Drop sender to signal workers to exit
        drop(self.job_sender);

        let mut late = Vec::new();
        for (i, worker) in self.workers.into_iter().enumerate() {
            while !worker.is_finished() {
                if let Ok(report) = self.result_receiver.recv_timeout(Duration::from_millis(100)) {
                    late.push(report);
                }
            }
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        late.extend(self.result_receiver.try_iter());
        late.extend(self.job_receiver.try_iter().map(PoolJob::cancel));

        info!("All workers have stopped");
        late
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }
}

fn run_worker(
    worker_id: usize,
    job_receiver: Receiver<PoolJob>,
    result_sender: Sender<TaskReport>,
    ctx: Arc<WorkerContext>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if ctx.shutdown.load(Ordering::Relaxed) || ctx.broken.load(Ordering::SeqCst) {
            debug!("Worker {} received stop signal", worker_id);
            break;
        }

        match job_receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => {
                let report = if ctx.broken.load(Ordering::SeqCst) {
                    job.cancel()
                } else {
                    execute_job(worker_id, job, &ctx)
                };

                if let Err(e) = result_sender.send(report) {
                    error!("Worker {} failed to send result: {}", worker_id, e);
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                debug!("Worker {} job channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn execute_job(worker_id: usize, job: PoolJob, ctx: &WorkerContext) -> TaskReport {
    let task = &job.request.task;
    let span = tracing::info_span!(
        "transcribe",
        worker = worker_id,
        file_id = task.file_id,
        file = %redact_path(&task.physical_path),
    );
    let _guard = span.enter();

    debug!("Worker {} running file {}", worker_id, task.file_id);
    let started_at = Utc::now();
    let (outcome, worker_fault) = match ctx.runner.run(&job.request) {
        Ok(outcome) => {
            ctx.consecutive_faults.store(0, Ordering::SeqCst);
            (outcome, false)
        }
        Err(e) => {
            let faults = ctx.consecutive_faults.fetch_add(1, Ordering::SeqCst) + 1;
            warn!("Worker fault on file {} ({} in a row): {}", task.file_id, faults, e);
            if faults >= ctx.max_faults && !ctx.broken.swap(true, Ordering::SeqCst) {
                error!("Worker pool broken after {} consecutive faults", faults);
            }
            (TaskOutcome::error(format!("worker fault: {}", e)), true)
        }
    };
    let ended_at = Utc::now();

    let status = outcome.status();
    let path = task.physical_path.to_string_lossy();
    let record = RunRecord {
        file_id: task.file_id,
        md5: task.md5.as_deref(),
        path: &path,
        started_at,
        ended_at,
        outcome: &outcome,
        options: &ctx.options,
        run_version: next_run_version(started_at),
    };

    let state = match ctx.recorder.record(&record) {
        Ok(run_id) => {
            info!("File {} finished: {}", task.file_id, status);
            TaskState::Recorded { status, run_id }
        }
        Err(e) => {
            error!("Failed to record run for file {}: {}", task.file_id, e);
            TaskState::Unrecorded {
                status,
                reason: e.to_string(),
            }
        }
    };

    let file_id = task.file_id;
    drop(job);

    TaskReport {
        file_id,
        state,
        worker_fault,
    }
}
