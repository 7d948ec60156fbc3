//! Mock update agent for testing and development.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::{AgentError, Result};
use crate::traits::{AgentJob, JobListener, UpdateAgent};
use crate::types::*;

/// Number of submitted jobs kept for inspection.
pub const JOB_HISTORY: usize = 32;

/// How submitted jobs make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockMode {
    /// Jobs run on a background task: `steps` progress signals spaced by
    /// `step_delay`, then completion.
    Auto { step_delay: Duration, steps: usize },
    /// Jobs only move when the caller drives them through [`MockJob`].
    Manual,
}

/// Mock update agent.
///
/// This backend simulates the native agent in memory. Useful for:
/// - Unit and integration testing (manual mode)
/// - Development on hosts without an update agent
/// - Demo environments
pub struct MockAgent {
    mode: MockMode,
    catalog: Arc<RwLock<Vec<AgentUpdate>>>,
    jobs: Mutex<Vec<Arc<MockJob>>>,
    fail_next_submit: Mutex<Option<AgentError>>,
    install_requires_reboot: Arc<AtomicBool>,
    reboot_requests: AtomicUsize,
}

impl MockAgent {
    /// Create a mock agent with the given catalog.
    pub fn new(mode: MockMode, catalog: Vec<AgentUpdate>) -> Self {
        info!(?mode, updates = catalog.len(), "Creating mock update agent");
        Self {
            mode,
            catalog: Arc::new(RwLock::new(catalog)),
            jobs: Mutex::new(Vec::new()),
            fail_next_submit: Mutex::new(None),
            install_requires_reboot: Arc::new(AtomicBool::new(false)),
            reboot_requests: AtomicUsize::new(0),
        }
    }

    /// Create a manually driven mock agent.
    pub fn manual(catalog: Vec<AgentUpdate>) -> Self {
        Self::new(MockMode::Manual, catalog)
    }

    /// A catalog of `count` pending updates; every other one is important.
    pub fn sample_catalog(count: usize) -> Vec<AgentUpdate> {
        (0..count)
            .map(|i| {
                let update = AgentUpdate::new(
                    format!("KB50{:05}", i + 1),
                    format!("Cumulative update {}", i + 1),
                )
                .with_description("Simulated update published by the mock agent")
                .with_size(1024 * 1024 * (i as u64 + 1), 4 * 1024 * 1024 * (i as u64 + 1));
                if i % 2 == 0 {
                    update.important()
                } else {
                    update
                }
            })
            .collect()
    }

    /// The last [`JOB_HISTORY`] submitted jobs, oldest first.
    pub fn jobs(&self) -> Vec<Arc<MockJob>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The most recently submitted job.
    pub fn last_job(&self) -> Option<Arc<MockJob>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Make the next submission fail with `error`.
    pub fn fail_next_submit(&self, error: AgentError) {
        *self
            .fail_next_submit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Whether simulated installs report that a restart is required.
    pub fn set_install_requires_reboot(&self, required: bool) {
        self.install_requires_reboot.store(required, Ordering::SeqCst);
    }

    /// Number of host restarts requested.
    pub fn reboot_requests(&self) -> usize {
        self.reboot_requests.load(Ordering::SeqCst)
    }

    /// Current catalog contents.
    pub fn catalog(&self) -> Vec<AgentUpdate> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn validate(&self, request: &JobRequest) -> Result<()> {
        let ids = request.update_ids();
        if request.kind() != JobKind::Search && ids.is_empty() {
            return Err(AgentError::InvalidArgument(format!(
                "{} job requires at least one update",
                request.kind()
            )));
        }

        let catalog = self
            .catalog
            .read()
            .map_err(|_| AgentError::Internal("Lock poisoned".to_string()))?;
        for id in ids {
            if !catalog.iter().any(|u| &u.id == id) {
                return Err(AgentError::UpdateNotFound(id.clone()));
            }
        }
        Ok(())
    }
}

impl Default for MockAgent {
    fn default() -> Self {
        Self::new(
            MockMode::Auto {
                step_delay: Duration::from_millis(500),
                steps: 10,
            },
            Self::sample_catalog(4),
        )
    }
}

#[async_trait]
impl UpdateAgent for MockAgent {
    async fn info(&self) -> Result<AgentInfo> {
        Ok(AgentInfo {
            name: "mock".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    #[instrument(skip(self, listener), fields(kind = %request.kind()))]
    async fn submit(
        &self,
        request: JobRequest,
        listener: Arc<dyn JobListener>,
    ) -> Result<Box<dyn AgentJob>> {
        if let Some(error) = self
            .fail_next_submit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            debug!(error = %error, "Failing submission as instructed");
            return Err(error);
        }

        self.validate(&request)?;

        let job = Arc::new(MockJob {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            listener,
            completed: AtomicBool::new(false),
            abort_requests: AtomicUsize::new(0),
            cleaned_up: AtomicBool::new(false),
        });
        {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            jobs.push(job.clone());
            if jobs.len() > JOB_HISTORY {
                let excess = jobs.len() - JOB_HISTORY;
                jobs.drain(..excess);
            }
        }

        info!(job_id = %job.id, "Mock job submitted");

        if let MockMode::Auto { step_delay, steps } = self.mode {
            tokio::spawn(simulate(
                job.clone(),
                self.catalog.clone(),
                self.install_requires_reboot.clone(),
                step_delay,
                steps.max(1),
            ));
        }

        Ok(Box::new(MockJobHandle(job)))
    }

    #[instrument(skip(self))]
    async fn accept_eula(&self, update_id: &str) -> Result<()> {
        let mut catalog = self
            .catalog
            .write()
            .map_err(|_| AgentError::Internal("Lock poisoned".to_string()))?;
        let update = catalog
            .iter_mut()
            .find(|u| u.id == update_id)
            .ok_or_else(|| AgentError::UpdateNotFound(update_id.to_string()))?;
        update.eula_accepted = true;
        debug!("Mock EULA accepted");
        Ok(())
    }

    async fn reboot_host(&self) -> Result<()> {
        self.reboot_requests.fetch_add(1, Ordering::SeqCst);
        info!("Mock host reboot requested");
        Ok(())
    }
}

/// Drive an auto-mode job to completion.
async fn simulate(
    job: Arc<MockJob>,
    catalog: Arc<RwLock<Vec<AgentUpdate>>>,
    install_requires_reboot: Arc<AtomicBool>,
    step_delay: Duration,
    steps: usize,
) {
    let kind = job.request.kind();
    let ids = job.request.update_ids().to_vec();

    for step in 0..steps {
        tokio::time::sleep(step_delay).await;

        if job.abort_requests() > 0 {
            job.complete(JobOutcome::aborted(kind).with_results_for(&ids));
            return;
        }

        let percent = ((step + 1) * 100 / steps) as u32;
        let progress = if ids.is_empty() {
            JobProgress::indeterminate(percent)
        } else {
            let index = (step * ids.len() / steps).min(ids.len() - 1);
            let update = catalog
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .find(|u| u.id == ids[index])
                .cloned();
            JobProgress::of(update, index, ids.len(), percent)
        };
        job.emit_progress(progress);
    }

    let outcome = {
        let mut catalog = catalog.write().unwrap_or_else(PoisonError::into_inner);
        match kind {
            JobKind::Search => JobOutcome::succeeded(kind)
                .with_updates(catalog.iter().filter(|u| !u.is_installed).cloned().collect()),
            JobKind::Download => {
                for update in catalog.iter_mut().filter(|u| ids.contains(&u.id)) {
                    update.is_downloaded = true;
                }
                JobOutcome::succeeded(kind).with_results_for(&ids)
            }
            JobKind::Install => {
                for update in catalog.iter_mut().filter(|u| ids.contains(&u.id)) {
                    update.is_installed = true;
                }
                let outcome = JobOutcome::succeeded(kind).with_results_for(&ids);
                if install_requires_reboot.load(Ordering::SeqCst) {
                    outcome.with_reboot_required()
                } else {
                    outcome
                }
            }
        }
    };

    job.complete(outcome);
}

/// A job submitted to the [`MockAgent`].
///
/// In manual mode tests call [`MockJob::emit_progress`] and
/// [`MockJob::complete`] to play the native agent. `complete` does not guard
/// against repeated calls so double completion can be simulated.
pub struct MockJob {
    id: String,
    request: JobRequest,
    listener: Arc<dyn JobListener>,
    completed: AtomicBool,
    abort_requests: AtomicUsize,
    cleaned_up: AtomicBool,
}

impl MockJob {
    /// Job identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The submitted request.
    pub fn request(&self) -> &JobRequest {
        &self.request
    }

    /// Raise a progress signal.
    pub fn emit_progress(&self, progress: JobProgress) {
        self.listener.on_progress(progress);
    }

    /// Raise a completion signal.
    pub fn complete(&self, outcome: JobOutcome) {
        self.completed.store(true, Ordering::SeqCst);
        self.listener.on_completed(outcome);
    }

    /// How many times an abort was requested.
    pub fn abort_requests(&self) -> usize {
        self.abort_requests.load(Ordering::SeqCst)
    }

    /// Whether native resources were released.
    pub fn was_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    /// Whether the job signaled completion.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

struct MockJobHandle(Arc<MockJob>);

impl AgentJob for MockJobHandle {
    fn kind(&self) -> JobKind {
        self.0.request.kind()
    }

    fn request_abort(&self) -> Result<()> {
        let previous = self.0.abort_requests.fetch_add(1, Ordering::SeqCst);
        debug!(job_id = %self.0.id, previous, "Mock job abort requested");
        Ok(())
    }

    fn clean_up(&self) {
        self.0.cleaned_up.store(true, Ordering::SeqCst);
    }

    fn is_completed(&self) -> bool {
        self.0.is_completed()
    }
}
