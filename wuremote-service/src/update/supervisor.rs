//! Supervision of a single agent job.
//!
//! A [`JobSupervisor`] owns one submitted job for its whole life: it arms
//! the watchdog, turns agent callbacks into [`SupervisorReport`]s and makes
//! sure exactly one terminal result leaves it, whichever of completion or
//! timeout wins the race.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wuremote_agent::{
    AgentJob, JobListener, JobOutcome, JobProgress, JobRequest, OperationResult, UpdateAgent,
};

use super::error::{Result, ServiceError};
use super::state::{Failure, Phase, PhaseOutcome};
use super::status::ProgressSnapshot;

/// Message from a supervisor to its controller.
#[derive(Debug, Clone)]
pub struct SupervisorReport {
    pub job_id: u64,
    pub phase: Phase,
    pub kind: ReportKind,
}

#[derive(Debug, Clone)]
pub enum ReportKind {
    Progress(ProgressSnapshot),
    Finished(PhaseResult),
}

/// Terminal result of a supervised job.
#[derive(Debug, Clone)]
pub enum PhaseResult {
    /// The agent signaled completion.
    Completed(JobOutcome),
    /// The watchdog fired first.
    TimedOut { after: Duration },
}

impl PhaseResult {
    /// Interpretation for the state machine.
    pub fn phase_outcome(&self) -> PhaseOutcome {
        match self {
            PhaseResult::Completed(outcome) => match outcome.result {
                OperationResult::Succeeded | OperationResult::SucceededWithErrors => {
                    PhaseOutcome::Succeeded {
                        reboot_required: outcome.reboot_required,
                    }
                }
                OperationResult::Aborted => PhaseOutcome::Failed(Failure::Aborted),
                OperationResult::Failed => {
                    PhaseOutcome::Failed(Failure::Failed { code: outcome.code })
                }
            },
            PhaseResult::TimedOut { after } => PhaseOutcome::Failed(Failure::TimedOut {
                after_secs: after.as_secs(),
            }),
        }
    }
}

/// Watchdog and terminal-result guard around one agent job.
pub struct JobSupervisor {
    job_id: u64,
    phase: Phase,
    timeout: Duration,
    started_at: DateTime<Utc>,
    job: Mutex<Option<Box<dyn AgentJob>>>,
    reports: Mutex<Option<mpsc::UnboundedSender<SupervisorReport>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    resolved: AtomicBool,
    abort_requested: AtomicBool,
    disposed: AtomicBool,
}

impl JobSupervisor {
    pub fn new(
        job_id: u64,
        phase: Phase,
        timeout: Duration,
        reports: mpsc::UnboundedSender<SupervisorReport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_id,
            phase,
            timeout,
            started_at: Utc::now(),
            job: Mutex::new(None),
            reports: Mutex::new(Some(reports)),
            timer: Mutex::new(None),
            started: AtomicBool::new(false),
            resolved: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether a terminal result has been emitted.
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Submit `request` to the agent and arm the watchdog.
    ///
    /// Submission errors are returned as is and leave nothing armed.
    pub async fn start(self: &Arc<Self>, agent: &dyn UpdateAgent, request: JobRequest) -> Result<()> {
        if request.kind() != self.phase.job_kind() {
            return Err(ServiceError::Unexpected(format!(
                "{} supervisor cannot run a {} job",
                self.phase,
                request.kind()
            )));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServiceError::InvalidTransition {
                from: self.phase.active_state().name(),
                attempted: self.phase.to_string(),
            });
        }

        let listener: Arc<dyn JobListener> = Arc::new(SupervisorListener {
            supervisor: Arc::downgrade(self),
        });

        let job = match agent.submit(request, listener).await {
            Ok(job) => job,
            Err(e) => {
                self.detach();
                return Err(e.into());
            }
        };
        *self.job.lock().unwrap_or_else(PoisonError::into_inner) = Some(job);

        self.arm_timer();

        info!(
            job_id = self.job_id,
            phase = %self.phase,
            timeout_secs = self.timeout.as_secs(),
            "Job started"
        );
        Ok(())
    }

    fn arm_timer(self: &Arc<Self>) {
        if self.is_resolved() {
            return;
        }

        let weak = Arc::downgrade(self);
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(supervisor) = weak.upgrade() {
                supervisor.on_timeout();
            }
        });
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        // Completion may have raced with arming.
        if self.is_resolved() {
            self.disarm_timer();
        }
    }

    fn disarm_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }

    /// Time from supervisor creation to `until`, zero if `until` is earlier.
    fn elapsed(&self, until: DateTime<Utc>) -> Duration {
        (until - self.started_at).to_std().unwrap_or_default()
    }

    /// Claim the single terminal slot.
    fn resolve(&self) -> bool {
        self.resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn on_progress(&self, progress: JobProgress) {
        if self.is_resolved() {
            debug!(job_id = self.job_id, "Ignoring progress after terminal result");
            return;
        }
        self.send(ReportKind::Progress(ProgressSnapshot::from_job(&progress)));
    }

    fn on_completed(&self, outcome: JobOutcome) {
        if !self.resolve() {
            debug!(
                job_id = self.job_id,
                result = ?outcome.result,
                "Dropping terminal signal, job already resolved"
            );
            return;
        }

        self.disarm_timer();
        info!(
            job_id = self.job_id,
            phase = %self.phase,
            result = ?outcome.result,
            code = outcome.code,
            elapsed_ms = self.elapsed(outcome.finished_at).as_millis() as u64,
            "Job completed"
        );
        self.send(ReportKind::Finished(PhaseResult::Completed(outcome)));
    }

    fn on_timeout(&self) {
        if !self.resolve() {
            debug!(job_id = self.job_id, "Watchdog fired after completion");
            return;
        }

        // Running on the timer task itself; drop the handle without aborting.
        self.timer.lock().unwrap_or_else(PoisonError::into_inner).take();

        warn!(
            job_id = self.job_id,
            phase = %self.phase,
            timeout_secs = self.timeout.as_secs(),
            elapsed_ms = self.elapsed(Utc::now()).as_millis() as u64,
            "Job timed out, requesting abort"
        );
        self.send_abort();
        self.send(ReportKind::Finished(PhaseResult::TimedOut {
            after: self.timeout,
        }));
    }

    /// Ask the agent to abort once. Failures are logged.
    fn send_abort(&self) {
        if self.abort_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(job) = self.job.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            if let Err(e) = job.request_abort() {
                warn!(job_id = self.job_id, error = %e, "Abort request failed");
            }
        }
    }

    /// Request an abort on behalf of a client.
    ///
    /// Advisory: the terminal result still arrives through the report
    /// channel. Returns `false` when the job already resolved.
    pub fn request_abort(&self) -> Result<bool> {
        if self.is_resolved() {
            return Ok(false);
        }
        if self.abort_requested.swap(true, Ordering::AcqRel) {
            debug!(job_id = self.job_id, "Abort already requested");
            return Ok(true);
        }

        let guard = self.job.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = guard.as_ref() {
            if let Err(e) = job.request_abort() {
                self.abort_requested.store(false, Ordering::Release);
                return Err(e.into());
            }
        }
        info!(job_id = self.job_id, phase = %self.phase, "Abort requested");
        Ok(true)
    }

    /// Stop forwarding reports. Nothing is sent once this returns.
    pub fn detach(&self) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Disarm, abort if still running and release the agent job. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.disarm_timer();

        let job = self.job.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(job) = job {
            if !self.is_resolved() && !job.is_completed() {
                if self.abort_requested.swap(true, Ordering::AcqRel) {
                    debug!(job_id = self.job_id, "Disposing job with pending abort");
                } else if let Err(e) = job.request_abort() {
                    warn!(job_id = self.job_id, error = %e, "Abort on dispose failed");
                }
            }
            job.clean_up();
        }
        debug!(job_id = self.job_id, "Supervisor disposed");
    }

    fn send(&self, kind: ReportKind) {
        let guard = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            debug!(job_id = self.job_id, "Supervisor detached, dropping report");
            return;
        };
        let report = SupervisorReport {
            job_id: self.job_id,
            phase: self.phase,
            kind,
        };
        if tx.send(report).is_err() {
            debug!(job_id = self.job_id, "Controller gone, dropping report");
        }
    }
}

impl Drop for JobSupervisor {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Listener handed to the agent. Holds the supervisor weakly so a job
/// outliving its supervisor cannot keep it alive.
struct SupervisorListener {
    supervisor: Weak<JobSupervisor>,
}

impl JobListener for SupervisorListener {
    fn on_progress(&self, progress: JobProgress) {
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.on_progress(progress);
        }
    }

    fn on_completed(&self, outcome: JobOutcome) {
        match self.supervisor.upgrade() {
            Some(supervisor) => supervisor.on_completed(outcome),
            None => debug!("Completion for a released supervisor"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wuremote_agent::{AgentError, JobKind, MockAgent};

    fn setup(
        phase: Phase,
        timeout: Duration,
    ) -> (
        Arc<JobSupervisor>,
        mpsc::UnboundedReceiver<SupervisorReport>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (JobSupervisor::new(7, phase, timeout, tx), rx)
    }

    fn search() -> JobRequest {
        JobRequest::Search {
            criteria: wuremote_agent::DEFAULT_SEARCH_CRITERIA.to_string(),
        }
    }

    fn finished(report: SupervisorReport) -> PhaseResult {
        match report.kind {
            ReportKind::Finished(result) => result,
            other => panic!("expected terminal report, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_reports_once() {
        let agent = MockAgent::manual(MockAgent::sample_catalog(2));
        let (supervisor, mut rx) = setup(Phase::Search, Duration::from_secs(30));
        supervisor.start(&agent, search()).await.unwrap();

        let job = agent.last_job().unwrap();
        job.emit_progress(JobProgress::indeterminate(50));
        job.complete(JobOutcome::succeeded(JobKind::Search));
        job.complete(JobOutcome::failed(JobKind::Search, -1));
        job.emit_progress(JobProgress::indeterminate(90));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.kind, ReportKind::Progress(_)));
        assert_eq!(first.job_id, 7);

        let result = finished(rx.recv().await.unwrap());
        assert_eq!(
            result.phase_outcome(),
            PhaseOutcome::Succeeded { reboot_required: false }
        );

        // The watchdog must stay quiet after completion.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(job.abort_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_exactly_once() {
        let agent = MockAgent::manual(MockAgent::sample_catalog(1));
        let (supervisor, mut rx) = setup(Phase::Search, Duration::from_secs(5));
        supervisor.start(&agent, search()).await.unwrap();

        let result = finished(rx.recv().await.unwrap());
        assert!(matches!(result, PhaseResult::TimedOut { .. }));
        assert_eq!(
            result.phase_outcome(),
            PhaseOutcome::Failed(Failure::TimedOut { after_secs: 5 })
        );

        let job = agent.last_job().unwrap();
        assert_eq!(job.abort_requests(), 1);

        // A late completion is dropped.
        job.complete(JobOutcome::aborted(JobKind::Search));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_submission_error_propagates() {
        let agent = MockAgent::manual(MockAgent::sample_catalog(1));
        agent.fail_next_submit(AgentError::native(wuremote_agent::codes::E_FAIL, "busy"));
        let (supervisor, mut rx) = setup(Phase::Search, Duration::from_secs(5));

        let err = supervisor.start(&agent, search()).await.unwrap_err();
        assert!(matches!(err, ServiceError::ApiFault { .. }));
        drop(supervisor);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let agent = MockAgent::manual(MockAgent::sample_catalog(1));
        let (supervisor, _rx) = setup(Phase::Search, Duration::from_secs(5));
        supervisor.start(&agent, search()).await.unwrap();
        let err = supervisor.start(&agent, search()).await.unwrap_err();
        assert!(err.is_invalid_transition());
    }

    #[tokio::test]
    async fn test_detach_silences_reports() {
        let agent = MockAgent::manual(MockAgent::sample_catalog(1));
        let (supervisor, mut rx) = setup(Phase::Search, Duration::from_secs(5));
        supervisor.start(&agent, search()).await.unwrap();

        supervisor.detach();
        let job = agent.last_job().unwrap();
        job.emit_progress(JobProgress::indeterminate(10));
        job.complete(JobOutcome::succeeded(JobKind::Search));

        drop(supervisor);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dispose_aborts_and_cleans_up() {
        let agent = MockAgent::manual(MockAgent::sample_catalog(1));
        let (supervisor, _rx) = setup(Phase::Search, Duration::from_secs(5));
        supervisor.start(&agent, search()).await.unwrap();

        assert!(supervisor.request_abort().unwrap());
        supervisor.dispose();
        supervisor.dispose();

        let job = agent.last_job().unwrap();
        assert_eq!(job.abort_requests(), 1);
        assert!(job.was_cleaned_up());
    }

    #[test]
    fn test_outcome_interpretation() {
        let aborted = PhaseResult::Completed(JobOutcome::aborted(JobKind::Install));
        assert_eq!(aborted.phase_outcome(), PhaseOutcome::Failed(Failure::Aborted));

        let failed = PhaseResult::Completed(JobOutcome::failed(JobKind::Install, 0x42));
        assert_eq!(
            failed.phase_outcome(),
            PhaseOutcome::Failed(Failure::Failed { code: 0x42 })
        );

        let reboot = PhaseResult::Completed(
            JobOutcome::succeeded(JobKind::Install).with_reboot_required(),
        );
        assert_eq!(
            reboot.phase_outcome(),
            PhaseOutcome::Succeeded { reboot_required: true }
        );
    }

    #[test]
    fn test_elapsed_measured_from_creation() {
        let (supervisor, _rx) = setup(Phase::Download, Duration::from_secs(60));

        let later = supervisor.started_at + chrono::Duration::milliseconds(1500);
        assert_eq!(supervisor.elapsed(later), Duration::from_millis(1500));

        // Agent clocks may lag behind ours.
        let earlier = supervisor.started_at - chrono::Duration::seconds(1);
        assert_eq!(supervisor.elapsed(earlier), Duration::ZERO);
    }
}
