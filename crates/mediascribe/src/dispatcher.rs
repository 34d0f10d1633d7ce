//! The dispatch loop.
//!
//! Selected candidates are claimed one at a time, prepared on this thread
//! (conversion included) and handed to the worker pool. Submission stops
//! at pool capacity until a task completes, so the pool stays saturated
//! without an unbounded queue. Completions are consumed in arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{self, run_repo, Database};
use crate::engine::EngineOptions;
use crate::error::ScribeError;
use crate::recorder::{ResultRecorder, RunRecord, SqliteRecorder};
use crate::selector::{
    AudioProbe, CandidateFilter, FfprobeAudioProbe, SelectorSettings, SkipCounters, WorkSelector,
};
use crate::volume::{probe_for_host, MountSnapshot, VolumeProbe};
use crate::worker::convert::MediaConverter;
use crate::worker::lease::{self, Lease, LeaseOutcome};
use crate::worker::pool::{PoolJob, WorkerPool};
use crate::worker::runner::{TaskRunner, WorkerRequest};
use crate::worker::task::{
    next_run_version, RunStatus, SkipReason, TaskOutcome, TaskReport, TaskState,
    TranscriptionTask,
};

const RESULT_POLL: Duration = Duration::from_millis(100);

/// Bounds of one dispatch run.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub id_min: Option<i64>,
    pub id_max: Option<i64>,
    /// Stop after this many candidates were taken up for dispatch.
    pub limit: Option<usize>,
}

/// Counts reported to the operator at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub selected: usize,
    pub submitted: usize,
    pub succeeded: usize,
    pub partially_succeeded: usize,
    pub failed: usize,
    pub unrecorded: usize,
    pub contended: usize,
    pub already_done: usize,
    pub claim_errors: usize,
    pub cancelled: usize,
    pub worker_faults: usize,
    pub skipped: SkipCounters,
    pub pool_broken: bool,
    pub interrupted: bool,
}

impl DispatchSummary {
    fn tally(&mut self, report: &TaskReport) {
        if report.worker_fault {
            self.worker_faults += 1;
        }
        match &report.state {
            TaskState::Recorded { status, .. } => match status {
                RunStatus::Success => self.succeeded += 1,
                RunStatus::PartialSuccess => self.partially_succeeded += 1,
                RunStatus::Error => self.failed += 1,
            },
            TaskState::Unrecorded { .. } => self.unrecorded += 1,
            TaskState::Skipped(SkipReason::Contended) => self.contended += 1,
            TaskState::Skipped(SkipReason::AlreadyDone) => self.already_done += 1,
            TaskState::Cancelled => self.cancelled += 1,
            other => warn!("File {} reported in non-terminal state {:?}", report.file_id, other),
        }
    }

    /// Runs that reached the run log.
    pub fn recorded(&self) -> usize {
        self.succeeded + self.partially_succeeded + self.failed
    }
}

enum Prepared {
    Job(PoolJob),
    Done(TaskReport),
    ClaimError,
}

pub struct Dispatcher {
    db: Database,
    config: Config,
    runner: Arc<dyn TaskRunner>,
    recorder: Arc<dyn ResultRecorder>,
    volume_probe: Box<dyn VolumeProbe>,
    audio_probe: Box<dyn AudioProbe>,
    converter: MediaConverter,
    owner: String,
    stop: Arc<AtomicBool>,
}

impl Dispatcher {
    /// A dispatcher with the host's volume probe, `ffprobe`, `ffmpeg` and
    /// the SQLite recorder.
    pub fn new(db: Database, config: Config, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            recorder: Arc::new(SqliteRecorder::new(db.clone())),
            volume_probe: probe_for_host(),
            audio_probe: Box::new(FfprobeAudioProbe::from_config(&config.probe)),
            converter: MediaConverter::new(config.conversion.clone()),
            owner: lease::owner_id(),
            stop: Arc::new(AtomicBool::new(false)),
            db,
            config,
            runner,
        }
    }

    pub fn with_volume_probe(mut self, probe: Box<dyn VolumeProbe>) -> Self {
        self.volume_probe = probe;
        self
    }

    pub fn with_audio_probe(mut self, probe: Box<dyn AudioProbe>) -> Self {
        self.audio_probe = probe;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ResultRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_converter(mut self, converter: MediaConverter) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Setting the flag stops submission; running tasks still finish.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn run(&self, options: &DispatchOptions) -> Result<DispatchSummary, ScribeError> {
        let dispatch = &self.config.dispatch;
        let mut summary = DispatchSummary::default();
        let mut snapshot = MountSnapshot::capture(self.volume_probe.as_ref());
        info!(
            "Dispatching as {} with {} workers, {} volumes mounted",
            self.owner,
            dispatch.max_parallel_workers,
            snapshot.mounts().len()
        );

        let pool = WorkerPool::new(
            Arc::clone(&self.runner),
            Arc::clone(&self.recorder),
            EngineOptions::from(&self.config.engine),
            dispatch.max_parallel_workers.max(1),
            dispatch.max_pool_faults,
        );
        let mut selector = WorkSelector::new(
            self.db.clone(),
            SelectorSettings::from_config(dispatch, options.id_min, options.id_max),
        );
        let mut filter = CandidateFilter::new(self.audio_probe.as_ref());
        let mut in_flight = 0usize;
        let mut taken = 0usize;

        let loop_result = (|| -> Result<(), ScribeError> {
            'batches: loop {
                if self.should_stop(&mut summary) || limit_reached(options, taken) {
                    break;
                }
                if snapshot.age() >= dispatch.snapshot_refresh() {
                    snapshot = MountSnapshot::capture(self.volume_probe.as_ref());
                    debug!("Refreshed mount snapshot: {} volumes", snapshot.mounts().len());
                }

                let batch = selector.next_batch()?;
                if batch.is_empty() {
                    break;
                }
                summary.selected += batch.len();

                for task in filter.filter(batch, &snapshot) {
                    if self.should_stop(&mut summary) || limit_reached(options, taken) {
                        break 'batches;
                    }

                    while in_flight >= pool.capacity() && !pool.is_broken() {
                        if let Some(report) = pool.recv_result_timeout(RESULT_POLL) {
                            summary.tally(&report);
                            in_flight -= 1;
                        }
                    }
                    if pool.is_broken() {
                        break 'batches;
                    }

                    taken += 1;
                    match self.prepare(task) {
                        Prepared::Job(job) => match pool.submit(job) {
                            Ok(()) => {
                                in_flight += 1;
                                summary.submitted += 1;
                            }
                            Err((e, job)) => {
                                warn!("Task for file {} not submitted: {}", job.file_id(), e);
                                summary.tally(&job.cancel());
                                break 'batches;
                            }
                        },
                        Prepared::Done(report) => summary.tally(&report),
                        Prepared::ClaimError => summary.claim_errors += 1,
                    }
                }
            }
            Ok(())
        })();

        while in_flight > 0 {
            if pool.is_broken() {
                for job in pool.cancel_pending() {
                    summary.tally(&job.cancel());
                    in_flight -= 1;
                }
                if in_flight == 0 {
                    break;
                }
            }
            if let Some(report) = pool.recv_result_timeout(RESULT_POLL) {
                summary.tally(&report);
                in_flight -= 1;
            }
        }

        summary.pool_broken = pool.is_broken();
        pool.shutdown();
        for report in pool.wait() {
            summary.tally(&report);
        }
        summary.skipped = filter.counters();

        if summary.pool_broken {
            error!(
                "Worker pool broke after {} worker faults; {} pending tasks cancelled",
                summary.worker_faults, summary.cancelled
            );
        }
        info!(
            "Dispatch finished: {} selected, {} succeeded, {} partial, {} failed, {} skipped",
            summary.selected,
            summary.succeeded,
            summary.partially_succeeded,
            summary.failed,
            summary.skipped.total() + summary.contended + summary.already_done
        );

        loop_result.map(|()| summary)
    }

    fn should_stop(&self, summary: &mut DispatchSummary) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            if !summary.interrupted {
                warn!("Stop requested, no new tasks will be submitted");
            }
            summary.interrupted = true;
        }
        summary.interrupted
    }

    /// Claims, re-checks and converts one task.
    fn prepare(&self, task: TranscriptionTask) -> Prepared {
        let file_id = task.file_id;
        debug!("File {}: {:?}", file_id, TaskState::Selected);

        let lease = match Lease::try_acquire(
            &self.db,
            file_id,
            &self.owner,
            self.config.catalog.lease_ttl(),
        ) {
            Ok(LeaseOutcome::Acquired(lease)) => lease,
            Ok(LeaseOutcome::Contended) => {
                return Prepared::Done(skipped(file_id, SkipReason::Contended));
            }
            Err(e) => {
                warn!("Cannot claim file {}: {}", file_id, e);
                return Prepared::ClaimError;
            }
        };
        debug!("File {}: {:?}", file_id, TaskState::Claimed);

        if self.recently_succeeded(&task) {
            info!("File {} skipped: content already transcribed", file_id);
            return Prepared::Done(skipped(file_id, SkipReason::AlreadyDone));
        }

        let mut artifact = None;
        if self.converter.needs_conversion(&task.physical_path) {
            match self.converter.convert(&task.physical_path) {
                Ok(converted) => artifact = Some(converted),
                Err(e) => {
                    warn!("File {}: {}", file_id, e);
                    let report = self.record_failure(&task, e.to_string());
                    drop(lease);
                    return Prepared::Done(report);
                }
            }
        }

        let media_path = artifact
            .as_ref()
            .map(|a| a.path().to_path_buf())
            .unwrap_or_else(|| task.physical_path.clone());
        debug!("File {}: {:?}", file_id, TaskState::Running);

        Prepared::Job(PoolJob {
            request: WorkerRequest {
                task,
                media_path,
                engine: self.config.engine.clone(),
            },
            lease: Some(lease),
            artifact,
        })
    }

    /// True when the latest run for this content is a success inside the
    /// freshness window, i.e. a racing dispatcher got there first. Files
    /// without a checksum are checked by their own run history.
    fn recently_succeeded(&self, task: &TranscriptionTask) -> bool {
        let latest = match &task.md5 {
            Some(md5) => run_repo::latest_for_md5(&self.db, md5),
            None => run_repo::latest_for_file(&self.db, task.file_id, None),
        };
        let latest = match latest {
            Ok(latest) => latest,
            Err(e) => {
                warn!("Cannot check prior runs: {}", e);
                return false;
            }
        };
        let Some(run) = latest else {
            return false;
        };
        if run.status != RunStatus::Success.as_str() {
            return false;
        }
        let cutoff = Utc::now()
            .checked_sub_signed(self.config.dispatch.success_freshness())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        db::parse_timestamp(&run.ended_at)
            .map(|ended| ended >= cutoff)
            .unwrap_or(false)
    }

    /// Records a task that failed before reaching a worker.
    fn record_failure(&self, task: &TranscriptionTask, message: String) -> TaskReport {
        let outcome = TaskOutcome::error(message);
        let options = EngineOptions::from(&self.config.engine);
        let now = Utc::now();
        let path = task.physical_path.to_string_lossy();
        let record = RunRecord {
            file_id: task.file_id,
            md5: task.md5.as_deref(),
            path: &path,
            started_at: now,
            ended_at: now,
            outcome: &outcome,
            options: &options,
            run_version: next_run_version(now),
        };

        let state = match self.recorder.record(&record) {
            Ok(run_id) => TaskState::Recorded {
                status: RunStatus::Error,
                run_id,
            },
            Err(e) => {
                error!("Failed to record run for file {}: {}", task.file_id, e);
                TaskState::Unrecorded {
                    status: RunStatus::Error,
                    reason: e.to_string(),
                }
            }
        };
        TaskReport {
            file_id: task.file_id,
            state,
            worker_fault: false,
        }
    }
}

fn skipped(file_id: i64, reason: SkipReason) -> TaskReport {
    TaskReport {
        file_id,
        state: TaskState::Skipped(reason),
        worker_fault: false,
    }
}

fn limit_reached(options: &DispatchOptions, taken: usize) -> bool {
    options.limit.map(|limit| taken >= limit).unwrap_or(false)
}
