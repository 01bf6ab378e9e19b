//! Runner loop: polls for pending jobs and drives them through slots.
//!
//! One control loop owns the slot table. Every dispatched job runs as its own
//! task and reports back over a channel; the slot is freed when the report
//! arrives. Shutdown cancels every slot and waits for all reports, so each
//! claimed job either publishes a bundle or stays in staging with an error
//! in the log.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bundle::{self, BundleFinalizer, PublishedBundle, StagedBundle};
use crate::config::RunnerConfig;
use crate::error::{Error, JobError, Result, StagingError};
use crate::job::{Job, JobId};
use crate::store::JobStore;
use crate::worker::collector::OutputCollector;
use crate::worker::slot::{ActiveJob, SlotTable};
use crate::worker::supervisor::ProcessSupervisor;

/// Reason recorded for jobs found half-run in staging at startup.
const INTERRUPTED_REASON: &str = "interrupted by runner restart";

/// Reason recorded for jobs cancelled before their tool started.
const CANCELLED_BEFORE_START: &str = "cancelled before start";

/// What the loop did over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Staging entries published during startup recovery.
    pub recovered: usize,
    pub dispatched: usize,
    pub published: usize,
    /// Jobs left in staging because staging or publication failed.
    pub retained: usize,
}

/// Sent by a job task when it is done with its slot.
#[derive(Debug)]
struct JobReport {
    slot_id: usize,
    job_id: JobId,
    result: Result<PublishedBundle>,
}

/// Everything a job task needs, detached from the loop.
#[derive(Clone)]
struct JobTask {
    supervisor: ProcessSupervisor,
    finalizer: BundleFinalizer,
    job_timeout: Duration,
    drain_timeout: Duration,
}

impl JobTask {
    async fn execute(&self, mut job: Job, cancel: CancellationToken) -> Result<PublishedBundle> {
        let staged = self.stage(&mut job, &cancel).await?;
        Ok(self.finalizer.publish(&staged).await?)
    }

    async fn stage(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
    ) -> std::result::Result<StagedBundle, StagingError> {
        if cancel.is_cancelled() {
            info!(job_id = %job.id, "Job cancelled before its tool started");
            return OutputCollector::stage_cancelled(job, CANCELLED_BEFORE_START.into()).await;
        }
        if let Some(reason) = job.descriptor_error.clone() {
            warn!(job_id = %job.id, %reason, "Rejecting job with invalid descriptor");
            return OutputCollector::stage_failure(job, reason).await;
        }

        let mut collector = OutputCollector::prepare(job, self.drain_timeout).await?;
        let timeout = job.timeout.unwrap_or(self.job_timeout);
        let mut handle = match self.supervisor.start(job, timeout).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to start tool");
                return OutputCollector::stage_failure(job, e.to_string()).await;
            }
        };
        collector.attach(&mut handle).await?;

        match self.supervisor.wait(&mut handle, cancel).await {
            Ok(outcome) => collector.finalize(job, outcome).await,
            Err(e) => {
                collector
                    .finalize_lost(job, format!("lost track of tool process: {e}"))
                    .await
            }
        }
    }
}

/// The job runner daemon loop.
pub struct RunnerLoop {
    config: RunnerConfig,
    store: Arc<dyn JobStore>,
    task: JobTask,
    slots: SlotTable,
    reports_tx: mpsc::UnboundedSender<JobReport>,
    reports_rx: mpsc::UnboundedReceiver<JobReport>,
    summary: RunSummary,
}

impl RunnerLoop {
    pub fn new(config: RunnerConfig, store: Arc<dyn JobStore>) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let task = JobTask {
            supervisor: ProcessSupervisor::new(config.grace_period),
            finalizer: BundleFinalizer::new(config.done_dir.clone()),
            job_timeout: config.job_timeout,
            drain_timeout: config.drain_timeout,
        };
        Self {
            slots: SlotTable::new(config.slots),
            config,
            store,
            task,
            reports_tx,
            reports_rx,
            summary: RunSummary::default(),
        }
    }

    /// Run until `shutdown` is cancelled or a fatal error occurs.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<RunSummary> {
        info!(
            slots = self.slots.capacity(),
            poll_secs = self.config.poll_interval.as_secs_f64(),
            pending = %self.config.pending_dir.display(),
            done = %self.config.done_dir.display(),
            "Runner started"
        );

        self.recover().await?;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let fatal = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(in_flight = self.slots.occupied_count(), "Shutdown requested");
                    break None;
                }
                Some(report) = self.reports_rx.recv() => {
                    if let Some(e) = self.handle_report(report).await {
                        break Some(e);
                    }
                }
                _ = ticker.tick() => {
                    self.poll_cycle(&shutdown).await;
                }
            }
        };

        let fatal = self.drain(fatal).await;
        info!(
            recovered = self.summary.recovered,
            dispatched = self.summary.dispatched,
            published = self.summary.published,
            retained = self.summary.retained,
            "Runner stopped"
        );
        match fatal {
            Some(e) => Err(e),
            None => Ok(self.summary),
        }
    }

    /// One scan: honor abort requests, then fill free slots.
    async fn poll_cycle(&mut self, shutdown: &CancellationToken) {
        let queued_aborts = self.apply_abort_requests().await;

        if self.slots.free_slot().is_none() {
            debug!("All slots busy, skipping scan");
            return;
        }

        let pending = match self.store.list_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Failed to scan pending jobs");
                return;
            }
        };

        for candidate in pending {
            if shutdown.is_cancelled() {
                break;
            }
            let Some(slot_id) = self.slots.free_slot() else {
                break;
            };
            if self.slots.holds(&candidate.id) {
                continue;
            }
            match self.store.claim(&candidate.id).await {
                Ok(job) => {
                    let aborted = queued_aborts.contains(&candidate.id);
                    self.dispatch(slot_id, job, shutdown, aborted);
                    if aborted {
                        self.clear_abort_request(&candidate.id).await;
                    }
                }
                Err(e) => debug!(job_id = %candidate.id, error = %e, "Claim failed, skipping"),
            }
        }
    }

    /// Cancel running jobs with an abort marker. Returns the aborted jobs
    /// still waiting in the pending namespace; their markers stay until the
    /// job is claimed.
    async fn apply_abort_requests(&mut self) -> HashSet<JobId> {
        let mut queued = HashSet::new();
        let ids = match self.store.abort_requests().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to read abort requests");
                return queued;
            }
        };

        for id in ids {
            if self.slots.cancel(&id) {
                info!(job_id = %id, "Abort requested, cancelling job");
                self.clear_abort_request(&id).await;
            } else if self.store.is_pending(&id).await {
                debug!(job_id = %id, "Abort requested for a queued job");
                queued.insert(id);
            } else {
                debug!(job_id = %id, "Dropping abort request for unknown job");
                self.clear_abort_request(&id).await;
            }
        }
        queued
    }

    async fn clear_abort_request(&self, id: &JobId) {
        if let Err(e) = self.store.clear_abort_request(id).await {
            warn!(job_id = %id, error = %e, "Failed to remove abort request");
        }
    }

    fn dispatch(&mut self, slot_id: usize, job: Job, shutdown: &CancellationToken, aborted: bool) {
        let job_id = job.id.clone();
        let cancel = shutdown.child_token();
        if aborted {
            cancel.cancel();
        }
        let task = self.task.clone();
        let reports = self.reports_tx.clone();
        let token = cancel.clone();
        let report_id = job_id.clone();

        let handle = tokio::spawn(async move {
            let result = AssertUnwindSafe(task.execute(job, token))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(JobError::TaskFailed {
                        id: report_id.clone(),
                        reason: "job task panicked".to_string(),
                    }
                    .into())
                });
            // The loop only stops listening once every slot has reported.
            let _ = reports.send(JobReport {
                slot_id,
                job_id: report_id,
                result,
            });
        });

        let active = ActiveJob {
            job_id: job_id.clone(),
            cancel,
            handle,
            dispatched_at: Utc::now(),
        };
        match self.slots.occupy(slot_id, active) {
            Ok(()) => {
                self.summary.dispatched += 1;
                info!(job_id = %job_id, slot = slot_id, "Dispatched job");
            }
            Err(e) => error!(job_id = %job_id, slot = slot_id, error = %e, "Failed to occupy slot"),
        }
    }

    /// Free the reporting slot. Returns the error if it must stop the daemon.
    async fn handle_report(&mut self, report: JobReport) -> Option<Error> {
        let held_here = self
            .slots
            .find_by_job(&report.job_id)
            .is_some_and(|s| s.slot_id == report.slot_id);
        if held_here {
            if let Some(active) = self.slots.release(report.slot_id) {
                let elapsed = Utc::now() - active.dispatched_at;
                debug!(
                    job_id = %report.job_id,
                    slot = report.slot_id,
                    elapsed_secs = elapsed.num_seconds(),
                    "Slot released"
                );
                // The report is the task's last action.
                if let Err(e) = active.handle.await {
                    warn!(job_id = %report.job_id, error = %e, "Job task did not finish cleanly");
                }
            }
        }

        match report.result {
            Ok(published) => {
                self.summary.published += 1;
                debug!(job_id = %published.job_id, state = %published.state, "Job done");
                None
            }
            Err(e) => {
                self.summary.retained += 1;
                error!(
                    job_id = %report.job_id,
                    slot = report.slot_id,
                    error = %e,
                    "Job left in staging"
                );
                is_fatal(&e).then_some(e)
            }
        }
    }

    /// Cancel every slot and collect the remaining reports.
    async fn drain(&mut self, mut fatal: Option<Error>) -> Option<Error> {
        if self.slots.occupied_count() == 0 {
            return fatal;
        }
        info!(in_flight = self.slots.occupied_count(), "Cancelling in-flight jobs");
        self.slots.cancel_all();

        while self.slots.occupied_count() > 0 {
            let Some(report) = self.reports_rx.recv().await else {
                break;
            };
            if let Some(e) = self.handle_report(report).await {
                fatal.get_or_insert(e);
            }
        }
        fatal
    }

    /// Publish what a previous run left in staging.
    async fn recover(&mut self) -> Result<()> {
        let staged = match self.store.staged_jobs().await {
            Ok(staged) => staged,
            Err(e) => {
                warn!(error = %e, "Failed to scan staging area, skipping recovery");
                return Ok(());
            }
        };

        for id in staged {
            let path = self.store.staging_path(&id);
            let manifest = match bundle::read_manifest(&path).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Unreadable manifest, leaving in staging");
                    continue;
                }
            };

            let published = match manifest {
                Some(_) => self.task.finalizer.republish(&id, &path).await.map(|_| ()),
                None => {
                    let mut job = match self.store.load_staged(&id).await {
                        Ok(job) => job,
                        Err(e) => {
                            warn!(job_id = %id, error = %e, "Failed to load interrupted job");
                            continue;
                        }
                    };
                    warn!(job_id = %id, "Found interrupted job in staging");
                    let staged = match OutputCollector::stage_failure(&mut job, INTERRUPTED_REASON.into()).await {
                        Ok(staged) => staged,
                        Err(e) if e.is_resource_exhaustion() => return Err(e.into()),
                        Err(e) => {
                            warn!(job_id = %id, error = %e, "Failed to stage interrupted job");
                            continue;
                        }
                    };
                    self.task.finalizer.publish(&staged).await.map(|_| ())
                }
            };

            match published {
                Ok(()) => {
                    self.summary.recovered += 1;
                    info!(job_id = %id, "Recovered staged job");
                }
                Err(e) => warn!(job_id = %id, error = %e, "Failed to publish recovered job"),
            }
        }
        Ok(())
    }
}

fn is_fatal(e: &Error) -> bool {
    matches!(e, Error::Staging(s) if s.is_resource_exhaustion())
}
