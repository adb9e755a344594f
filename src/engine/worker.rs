//! The scheduling loop.
//!
//! A worker walks its priority list of kinds. The first kind that yields a
//! job gets it executed, then the scan restarts from the top. A pass that
//! finds nothing makes the worker idle: in finish mode it stops, otherwise it
//! sleeps and scans again.

use crate::backlog::Backlog;
use crate::error::{Error, Result};
use crate::handler::{HandlerRegistry, IntentionHandler, RunContext};
use crate::model::*;
use crate::sched::Scheduler;
use crate::sched::batcher::DEFAULT_BATCH_SIZE;
use crate::telemetry::job::{record_intention_result, record_job_outcome, start_job_span};
use crate::telemetry::metrics;
use chrono::Utc;
use opentelemetry::KeyValue;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, warn};

/// Loop parameters.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Stop at the first idle pass instead of waiting for more work.
    pub finish: bool,
    /// Users sampled per job.
    pub max_users: usize,
    /// Intentions per job (`None` = no limit).
    pub batch_size: Option<usize>,
    /// Sleep between passes when idle.
    pub idle_interval: Duration,
    /// How often a running job touches its heartbeat. Capped at a quarter of
    /// `stale_after`.
    pub heartbeat: Duration,
    /// Jobs whose heartbeat is older than this are presumed orphaned and
    /// dissolved.
    pub stale_after: Option<Duration>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            finish: false,
            max_users: 1,
            batch_size: Some(DEFAULT_BATCH_SIZE),
            idle_interval: Duration::from_secs(5),
            heartbeat: Duration::from_secs(10),
            stale_after: None,
        }
    }
}

/// Where the loop is.
#[derive(Debug)]
pub enum WorkerState {
    /// Looking for work of the kind at this priority index.
    Scanning(usize),
    /// Executing a job of the kind at this priority index.
    Running(usize, Job),
    Idle,
    Stopped,
}

/// Totals accumulated over one `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub jobs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub incomplete: u64,
    /// Jobs abandoned after their claim was dissolved by stale recovery.
    pub claims_lost: u64,
    pub idle_passes: u64,
}

/// What executing one job did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub succeeded: u64,
    pub failed: u64,
    pub incomplete: u64,
    /// `None` when the job was dissolved (every run incomplete) or lost.
    pub outcome: Option<ArchiveOutcome>,
    /// The job stopped holding its intentions mid-run. Nothing further was
    /// archived for it.
    pub claim_lost: bool,
}

impl JobReport {
    fn outcome_label(&self) -> String {
        match self.outcome {
            _ if self.claim_lost => "claim_lost".to_string(),
            Some(outcome) => outcome.to_string(),
            None => "dissolved".to_string(),
        }
    }
}

/// Result of one intention run inside a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunResult {
    Succeeded,
    Failed,
    Incomplete,
    /// Archival was refused because the job no longer holds the intention.
    Lost,
}

impl RunResult {
    fn as_str(self) -> &'static str {
        match self {
            RunResult::Succeeded => "success",
            RunResult::Failed => "error",
            RunResult::Incomplete => "incomplete",
            RunResult::Lost => "claim_lost",
        }
    }
}

/// Requests a graceful stop. Takes effect between jobs.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

pub struct Worker {
    scheduler: Scheduler,
    backlog: Arc<dyn Backlog>,
    handlers: Vec<Arc<dyn IntentionHandler>>,
    config: LoopConfig,
    shutdown: ShutdownHandle,
}

impl Worker {
    /// A worker over `handlers`, given in priority order.
    pub fn new(
        backlog: Arc<dyn Backlog>,
        handlers: Vec<Arc<dyn IntentionHandler>>,
        config: LoopConfig,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(Arc::clone(&backlog), WorkerId::new()),
            backlog,
            handlers,
            config,
            shutdown: ShutdownHandle::default(),
        }
    }

    /// Resolve `priority` against `registry`; fails on unknown kinds.
    pub fn from_registry(
        backlog: Arc<dyn Backlog>,
        registry: &HandlerRegistry,
        priority: &[IntentionKind],
        config: LoopConfig,
    ) -> Result<Self> {
        let handlers = registry.resolve(priority)?;
        Ok(Self::new(backlog, handlers, config))
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.scheduler = self.scheduler.with_rng(rng);
        self
    }

    pub fn worker_id(&self) -> WorkerId {
        self.scheduler.worker_id()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until stopped: at the first idle pass in finish mode, or on shutdown.
    pub async fn run(&mut self) -> Result<WorkerStats> {
        info!(
            worker_id = %self.worker_id(),
            kinds = self.handlers.len(),
            finish = self.config.finish,
            "worker started"
        );
        self.dissolve_stale().await;

        let mut stats = WorkerStats::default();
        let mut state = WorkerState::Scanning(0);
        loop {
            state = match state {
                WorkerState::Scanning(_) if self.shutdown.is_requested() => WorkerState::Stopped,
                WorkerState::Scanning(i) if i >= self.handlers.len() => WorkerState::Idle,
                WorkerState::Scanning(i) => match self.next_job(i).await {
                    Some(job) => WorkerState::Running(i, job),
                    None => WorkerState::Scanning(i + 1),
                },
                WorkerState::Running(i, job) => {
                    let handler = Arc::clone(&self.handlers[i]);
                    let report = self.execute(handler.as_ref(), job).await;
                    stats.jobs += 1;
                    stats.succeeded += report.succeeded;
                    stats.failed += report.failed;
                    stats.incomplete += report.incomplete;
                    stats.claims_lost += u64::from(report.claim_lost);
                    WorkerState::Scanning(0)
                }
                WorkerState::Idle => {
                    stats.idle_passes += 1;
                    metrics::worker_idle().add(1, &[]);
                    if self.config.finish {
                        WorkerState::Stopped
                    } else {
                        debug!("no ready work, waiting");
                        self.dissolve_stale().await;
                        if self.wait_idle().await {
                            WorkerState::Scanning(0)
                        } else {
                            WorkerState::Stopped
                        }
                    }
                }
                WorkerState::Stopped => break,
            };
        }

        info!(worker_id = %self.worker_id(), ?stats, "worker stopped");
        Ok(stats)
    }

    /// Try to build a job for the kind at priority index `i`.
    async fn next_job(&mut self, i: usize) -> Option<Job> {
        let scope = self.handlers[i].scope();
        match self
            .scheduler
            .get_new_job_with(&scope, self.config.max_users, self.config.batch_size)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                error!(kind = %scope.kind, "failed to build job: {e}");
                None
            }
        }
    }

    /// Sleep for the idle interval. `false` if shutdown was requested.
    async fn wait_idle(&self) -> bool {
        if self.shutdown.is_requested() {
            return false;
        }
        tokio::select! {
            _ = self.shutdown.notify.notified() => false,
            _ = tokio::time::sleep(self.config.idle_interval) => !self.shutdown.is_requested(),
        }
    }

    async fn dissolve_stale(&self) {
        let Some(stale_after) = self.config.stale_after else {
            return;
        };
        let Ok(age) = chrono::Duration::from_std(stale_after) else {
            warn!(?stale_after, "stale job timeout out of range, skipping recovery");
            return;
        };
        match self.backlog.dissolve_stale_jobs(Utc::now() - age).await {
            Ok(0) => {}
            Ok(n) => warn!(dissolved = n, "dissolved stale jobs"),
            Err(e) => error!("stale job recovery failed: {e}"),
        }
    }

    /// Interval between heartbeats while a handler runs.
    fn heartbeat_period(&self) -> Duration {
        let period = match self.config.stale_after {
            Some(stale_after) => self.config.heartbeat.min(stale_after / 4),
            None => self.config.heartbeat,
        };
        period.max(Duration::from_millis(1))
    }

    /// Touch the job's heartbeat. `false` once the job is gone.
    async fn heartbeat(&self, job: JobId) -> bool {
        match self.backlog.touch_job(job).await {
            Ok(()) => true,
            Err(Error::ClaimLost(e)) => {
                warn!(job_id = %job, "{e}");
                false
            }
            Err(e) => {
                warn!(job_id = %job, "heartbeat failed: {e}");
                true
            }
        }
    }

    /// Run every intention of `job` once, archive results, then archive or
    /// dissolve the job. A job that lost its claim is abandoned as is.
    pub async fn execute(&self, handler: &dyn IntentionHandler, job: Job) -> JobReport {
        let span = start_job_span(job.id, self.worker_id(), handler.kind());
        async {
            let mut report = JobReport::default();
            for id in &job.intentions {
                if !self.heartbeat(job.id).await {
                    report.claim_lost = true;
                    break;
                }
                let intention = match self.backlog.get_intention(*id).await {
                    Ok(intention) if intention.job_id == Some(job.id) => intention,
                    Ok(_) => {
                        warn!(intention = %id, "intention claimed by another job");
                        report.claim_lost = true;
                        break;
                    }
                    Err(e) => {
                        warn!(intention = %id, "intention vanished from job: {e}");
                        continue;
                    }
                };
                let result = self.run_one(handler, &job, &intention).await;
                record_intention_result(&span, *id, result.as_str());
                match result {
                    RunResult::Succeeded => report.succeeded += 1,
                    RunResult::Failed => report.failed += 1,
                    RunResult::Incomplete => report.incomplete += 1,
                    RunResult::Lost => {
                        report.claim_lost = true;
                        break;
                    }
                }
            }

            if report.claim_lost {
                warn!(job_id = %job.id, "claim lost, abandoning job");
                metrics::claims_lost().add(1, &[KeyValue::new("kind", handler.kind().to_string())]);
                record_job_outcome(&span, &report.outcome_label());
                return report;
            }

            report.outcome = if report.failed > 0 {
                Some(ArchiveOutcome::Error)
            } else if report.succeeded > 0 {
                Some(ArchiveOutcome::Success)
            } else {
                None
            };

            let closed = match report.outcome {
                Some(outcome) => self.backlog.archive_job(job.id, outcome).await,
                None => self.backlog.dissolve_job(job.id).await,
            };
            match closed {
                Ok(()) => {
                    if let Some(outcome) = report.outcome {
                        metrics::jobs_archived()
                            .add(1, &[KeyValue::new("outcome", outcome.to_string())]);
                    }
                }
                Err(e) => error!(job_id = %job.id, "failed to close job: {e}"),
            }
            record_job_outcome(&span, &report.outcome_label());
            report
        }
        .instrument(span.clone())
        .await
    }

    /// Run one intention and archive it unless the run was incomplete.
    /// The job's heartbeat is kept up while the handler runs.
    async fn run_one(
        &self,
        handler: &dyn IntentionHandler,
        job: &Job,
        intention: &Intention,
    ) -> RunResult {
        let kind = KeyValue::new("kind", intention.kind.to_string());
        let ctx = RunContext::new(self.backlog.as_ref(), job, intention.user_id);

        let started = Instant::now();
        let period = self.heartbeat_period();
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let run = handler.run(intention, &ctx);
        tokio::pin!(run);
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = ticks.tick() => {
                    self.heartbeat(job.id).await;
                }
            }
        };
        metrics::run_duration_ms().record(
            started.elapsed().as_millis() as f64,
            std::slice::from_ref(&kind),
        );

        match result {
            Ok(RunStatus::Done) => {
                let follow_ups = handler
                    .follow_ups(intention)
                    .into_iter()
                    .map(|follow_up| follow_up.after(intention.id))
                    .collect();
                match self
                    .backlog
                    .archive_success(job.id, intention.id, follow_ups)
                    .await
                {
                    Ok(_) => {}
                    Err(Error::ClaimLost(e)) => {
                        warn!(intention = %intention.id, "not archiving success: {e}");
                        return RunResult::Lost;
                    }
                    Err(e) => {
                        error!(intention = %intention.id, "failed to archive success: {e}");
                        return RunResult::Incomplete;
                    }
                }
                info!(intention = %intention.id, kind = %intention.kind, "intention done");
                metrics::intentions_archived()
                    .add(1, &[kind, KeyValue::new("outcome", "success")]);
                RunResult::Succeeded
            }
            Ok(RunStatus::Incomplete) => {
                debug!(intention = %intention.id, "intention incomplete, stays pending");
                metrics::intentions_incomplete().add(1, &[kind]);
                RunResult::Incomplete
            }
            Err(e) => {
                let detail = format!("{e:#}");
                warn!(intention = %intention.id, kind = %intention.kind, error = %detail, "intention failed");
                match self.backlog.archive_error(job.id, intention.id, &detail).await {
                    Ok(()) => {}
                    Err(Error::ClaimLost(e)) => {
                        warn!(intention = %intention.id, "not archiving error: {e}");
                        return RunResult::Lost;
                    }
                    Err(e) => {
                        error!(intention = %intention.id, "failed to archive error: {e}");
                        return RunResult::Incomplete;
                    }
                }
                metrics::intentions_archived().add(1, &[kind, KeyValue::new("outcome", "error")]);
                RunResult::Failed
            }
        }
    }
}
