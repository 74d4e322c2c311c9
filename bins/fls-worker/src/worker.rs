//! Job orchestration: claim, stage, build, grade, report, clean up.
//!
//! Every fault is classified where it is detected (see [`FaultKind`]).
//! This module only acts on the classification:
//!
//! - Infrastructure: never reported, the claim is released so another
//!   worker can retry.
//! - Student: reported as a failing result together with the job log.
//! - Unexpected, including panics: a trace is appended to the job log and a
//!   failing result is reported on a best-effort basis.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fls_common::{Arch, Config, Submission};
use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use crate::api::ControlPlane;
use crate::error::{FaultKind, Result, WorkerError};
use crate::extract::stage_archive;
use crate::heartbeat::Heartbeat;
use crate::joblog::{clip, JobLog};
use crate::metrics;
use crate::runner::Pass;
use crate::sandbox::Sandbox;
use crate::trace;
use crate::workspace::JobWorkspace;

/// Longest rejection reason echoed to the job log and the tracing output.
const MAX_REASON_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Claiming,
    Staging,
    Building,
    Grading,
    Reporting,
    CleaningUp,
}

/// Result of one pass of the worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing to do, or the claim could not be made.
    Idle,
    /// Another worker claimed the submission first.
    Contended,
    Reported { submission_id: u64, passed: bool },
    /// An infrastructure fault stopped the job; the claim was released.
    Cancelled { submission_id: u64 },
}

impl PassOutcome {
    /// Whether the loop should go straight into the next pass.
    pub fn did_work(&self) -> bool {
        matches!(self, PassOutcome::Reported { .. } | PassOutcome::Contended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PassOutcome::Idle => "idle",
            PassOutcome::Contended => "contended",
            PassOutcome::Reported { passed: true, .. } => "passed",
            PassOutcome::Reported { passed: false, .. } => "failed",
            PassOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub arch: Arch,
    pub jobs_root: PathBuf,
    pub max_log_bytes: u64,
    pub heartbeat_interval: Duration,
    pub heartbeat_stop_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config, arch: Arch) -> Self {
        Self {
            arch,
            jobs_root: config.sandbox.jobs_root(),
            max_log_bytes: config.sandbox.max_log_bytes,
            heartbeat_interval: config.run.heartbeat_interval,
            heartbeat_stop_timeout: config.run.heartbeat_stop_timeout,
        }
    }
}

pub struct Worker<C, S> {
    api: Arc<C>,
    sandbox: Arc<S>,
    settings: WorkerSettings,
}

impl<C, S> Worker<C, S>
where
    C: ControlPlane + 'static,
    S: Sandbox + 'static,
{
    pub fn new(api: Arc<C>, sandbox: Arc<S>, settings: WorkerSettings) -> Self {
        trace::install_panic_hook();
        Self {
            api,
            sandbox,
            settings,
        }
    }

    /// List, claim and fully process at most one submission.
    ///
    /// Only a failure to list escapes as an error; everything after a
    /// successful claim is folded into the outcome.
    pub async fn run_once(&self) -> Result<PassOutcome> {
        let submissions = self.api.list_submissions(self.settings.arch).await?;
        let Some(submission) = submissions.into_iter().next() else {
            return Ok(PassOutcome::Idle);
        };

        enter(&submission, JobState::Claiming);
        match self.api.claim(&submission).await {
            Ok(()) => {}
            Err(WorkerError::AlreadyClaimed) => {
                info!(submission_id = submission.id, "submission claimed by another worker");
                return Ok(PassOutcome::Contended);
            }
            Err(e) => {
                warn!(submission_id = submission.id, error = %e, "claim failed");
                return Ok(PassOutcome::Idle);
            }
        }
        info!(
            submission_id = submission.id,
            user_id = %submission.user_id,
            arch = %submission.arch,
            "claimed submission"
        );

        let outcome = self.process(&submission).await;
        metrics::record_outcome(outcome.as_str());
        Ok(outcome)
    }

    async fn process(&self, submission: &Submission) -> PassOutcome {
        let workspace = match JobWorkspace::create(&self.settings.jobs_root).await {
            Ok(workspace) => workspace,
            Err(e) => return self.abort(submission, e).await,
        };

        let result = AssertUnwindSafe(self.execute(submission, &workspace))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(passed)) => PassOutcome::Reported {
                submission_id: submission.id,
                passed,
            },
            Ok(Err(e)) if e.is_infrastructure() => self.abort(submission, e).await,
            Ok(Err(e)) => {
                error!(submission_id = submission.id, error = %e, "job failed unexpectedly");
                metrics::record_fault(e.kind());
                self.report_failure(submission, &workspace, &trace::error_trace(&e))
                    .await
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(submission_id = submission.id, panic = %message, "job panicked");
                metrics::record_fault(FaultKind::Unexpected);
                self.report_failure(submission, &workspace, &trace::panic_trace(&message))
                    .await
            }
        };

        enter(submission, JobState::CleaningUp);
        workspace.remove().await;
        outcome
    }

    async fn execute(&self, submission: &Submission, workspace: &JobWorkspace) -> Result<bool> {
        let mut log = JobLog::open(&workspace.log_path(), self.settings.max_log_bytes).await?;
        self.sandbox.prepare().await?;

        enter(submission, JobState::Staging);
        let tarball = workspace.tarball_path();
        self.api.download_tarball(submission, &tarball).await?;

        match stage_archive(&tarball, &workspace.src_dir()).await {
            Ok(summary) => info!(
                submission_id = submission.id,
                files = summary.files,
                directories = summary.directories,
                bytes = summary.bytes,
                "submission staged"
            ),
            Err(e) if e.kind() == FaultKind::Student => {
                let reason = e.to_string();
                let reason = clip(&reason, MAX_REASON_BYTES);
                warn!(submission_id = submission.id, error = %reason, "submission archive rejected");
                metrics::record_fault(FaultKind::Student);
                log.note(&reason).await?;
                log.flush().await?;
                self.report(submission, false, &log).await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let heartbeat = Heartbeat::start(
            self.api.clone(),
            self.settings.heartbeat_interval,
            self.settings.heartbeat_stop_timeout,
        );
        let verdict = self.build_and_grade(submission, workspace, &mut log).await;
        heartbeat.stop().await;

        let passed = match verdict {
            Ok(()) => true,
            Err(e) if e.kind() == FaultKind::Student => {
                info!(submission_id = submission.id, reason = %e, "submission failed");
                metrics::record_fault(FaultKind::Student);
                log.note(&e.to_string()).await?;
                false
            }
            Err(e) => return Err(e),
        };

        log.note(if passed { "result: passed" } else { "result: failed" })
            .await?;
        log.flush().await?;
        self.report(submission, passed, &log).await?;
        Ok(passed)
    }

    async fn build_and_grade(
        &self,
        submission: &Submission,
        workspace: &JobWorkspace,
        log: &mut JobLog,
    ) -> Result<()> {
        enter(submission, JobState::Building);
        log.note("build phase").await?;
        let started = Instant::now();
        let built = self
            .sandbox
            .build(&workspace.src_dir(), &workspace.out_dir(), log)
            .await;
        metrics::observe_phase("build", started.elapsed().as_secs_f64());
        let artifact = built?;

        enter(submission, JobState::Grading);
        log.note("grade phase").await?;
        let started = Instant::now();
        let graded = self.sandbox.grade(&artifact, log).await;
        metrics::observe_phase("grade", started.elapsed().as_secs_f64());
        graded
    }

    async fn report(&self, submission: &Submission, passed: bool, log: &JobLog) -> Result<()> {
        enter(submission, JobState::Reporting);
        self.api.submit_result(submission, passed, log.path()).await?;
        info!(submission_id = submission.id, passed, "result submitted");
        Ok(())
    }

    /// Release the claim after an infrastructure fault.
    async fn abort(&self, submission: &Submission, fault: WorkerError) -> PassOutcome {
        error!(
            submission_id = submission.id,
            kind = fault.kind().as_str(),
            error = %fault,
            "job aborted, releasing claim"
        );
        metrics::record_fault(fault.kind());
        self.cancel(submission).await;
        PassOutcome::Cancelled {
            submission_id: submission.id,
        }
    }

    async fn cancel(&self, submission: &Submission) {
        if let Err(e) = self.api.cancel(submission).await {
            warn!(submission_id = submission.id, error = %e, "failed to cancel claim");
            metrics::record_cancel_failure();
        }
    }

    /// Best-effort failing result for a fault nobody classified.
    async fn report_failure(
        &self,
        submission: &Submission,
        workspace: &JobWorkspace,
        trace: &str,
    ) -> PassOutcome {
        let log_path = workspace.log_path();
        let appended = async {
            let mut log = JobLog::open(&log_path, u64::MAX).await?;
            log.note(trace).await?;
            log.flush().await
        };
        if let Err(e) = appended.await {
            warn!(submission_id = submission.id, error = %e, "failed to write trace to job log");
        }

        match self.api.submit_result(submission, false, &log_path).await {
            Ok(()) => PassOutcome::Reported {
                submission_id: submission.id,
                passed: false,
            },
            Err(e) => self.abort(submission, e).await,
        }
    }
}

#[async_trait]
impl<C, S> Pass for Worker<C, S>
where
    C: ControlPlane + 'static,
    S: Sandbox + 'static,
{
    async fn run_once(&self) -> Result<PassOutcome> {
        Worker::run_once(self).await
    }
}

fn enter(submission: &Submission, state: JobState) {
    debug!(submission_id = submission.id, state = ?state, "job state");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
