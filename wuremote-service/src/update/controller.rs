//! Update controller
//!
//! Single owner of the current [`WuState`] and of the at most one
//! [`JobSupervisor`] in flight. Every mutation runs under one async mutex;
//! supervisor reports are applied by a pump task in arrival order under the
//! same mutex. Readers use a snapshot that is republished before the mutex
//! is released, so state and progress are always read as a pair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use wuremote_agent::{JobOutcome, JobRequest, UpdateAgent};

use super::descriptor::UpdateDescriptor;
use super::error::{Result, ServiceError};
use super::settings::Settings;
use super::state::{Phase, StateEvent, WuState};
use super::status::{ProgressSnapshot, WuStatus};
use super::supervisor::{JobSupervisor, PhaseResult, ReportKind, SupervisorReport};

/// Notification raised by the controller, in the order transitions apply.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    StateChanged(WuState),
    ProgressChanged {
        phase: Phase,
        progress: ProgressSnapshot,
    },
    AsyncOperationCompleted {
        phase: Phase,
        state: WuState,
    },
}

/// Everything a reset replaces.
struct ControllerCore {
    generation: u64,
    state: WuState,
    progress: Option<ProgressSnapshot>,
    updates: Vec<UpdateDescriptor>,
    supervisor: Option<Arc<JobSupervisor>>,
}

impl ControllerCore {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            state: WuState::Ready,
            progress: None,
            updates: Vec::new(),
            supervisor: None,
        }
    }

    fn find_mut(&mut self, update_id: &str) -> Result<&mut UpdateDescriptor> {
        self.updates
            .iter_mut()
            .find(|u| u.id == update_id)
            .ok_or_else(|| ServiceError::UpdateNotFound(update_id.to_string()))
    }

    fn selected_ids(&self) -> Vec<String> {
        self.updates
            .iter()
            .filter(|u| u.is_selected)
            .map(|u| u.id.clone())
            .collect()
    }

    /// Release the running supervisor: unsubscribe first, then dispose.
    fn release_supervisor(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.detach();
            supervisor.dispose();
        }
    }
}

/// Consistent copy of the core for lock-free readers.
struct Published {
    status: WuStatus,
    updates: Arc<Vec<UpdateDescriptor>>,
}

struct Shared {
    agent: Arc<dyn UpdateAgent>,
    search_criteria: String,
    core: Mutex<ControllerCore>,
    published: RwLock<Published>,
    settings: RwLock<Settings>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    reports: mpsc::UnboundedSender<SupervisorReport>,
    next_job_id: AtomicU64,
}

/// Orchestrates search, download and install on top of an [`UpdateAgent`].
pub struct UpdateController {
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

impl UpdateController {
    /// Create a controller in the Ready state.
    ///
    /// Must be called inside a tokio runtime; spawns the report pump.
    pub fn new(
        agent: Arc<dyn UpdateAgent>,
        settings: Settings,
        search_criteria: impl Into<String>,
        events: mpsc::UnboundedSender<ControllerEvent>,
    ) -> Self {
        let (reports, reports_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            agent,
            search_criteria: search_criteria.into(),
            core: Mutex::new(ControllerCore::new(0)),
            published: RwLock::new(Published {
                status: WuStatus::ready(),
                updates: Arc::new(Vec::new()),
            }),
            settings: RwLock::new(settings),
            events,
            reports,
            next_job_id: AtomicU64::new(1),
        });

        let pump = tokio::spawn(pump_reports(Arc::downgrade(&shared), reports_rx));

        Self { shared, pump }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn state(&self) -> WuState {
        self.shared.read_published(|p| p.status.state.clone())
    }

    /// State and progress as one consistent pair.
    pub fn status(&self) -> WuStatus {
        self.shared.read_published(|p| p.status.clone())
    }

    pub fn current_progress(&self) -> Option<ProgressSnapshot> {
        self.shared.read_published(|p| p.status.progress.clone())
    }

    /// The last fetched update list.
    pub fn available_updates(&self) -> Vec<UpdateDescriptor> {
        self.shared
            .read_published(|p| p.updates.clone())
            .as_ref()
            .clone()
    }

    pub fn settings(&self) -> Settings {
        self.shared
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn set_timeout(&self, phase: Phase, secs: i64) -> Result<Settings> {
        let mut settings = self
            .shared
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        settings.set_timeout(phase, secs)?;
        info!(phase = %phase, secs, "Timeout updated");
        Ok(settings.clone())
    }

    pub fn set_auto_accept_eulas(&self, enabled: bool) -> Settings {
        self.update_settings(|s| s.auto_accept_eulas = enabled)
    }

    pub fn set_auto_select_updates(&self, enabled: bool) -> Settings {
        self.update_settings(|s| s.auto_select_updates = enabled)
    }

    fn update_settings(&self, apply: impl FnOnce(&mut Settings)) -> Settings {
        let mut settings = self
            .shared
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        apply(&mut settings);
        debug!(settings = ?*settings, "Settings updated");
        settings.clone()
    }

    // =========================================================================
    // Phase control
    // =========================================================================

    /// Start `phase` and return the busy state it entered.
    ///
    /// The phase itself finishes in the background; its result arrives as
    /// [`ControllerEvent`]s.
    #[instrument(skip(self))]
    pub async fn begin(&self, phase: Phase) -> Result<WuState> {
        let shared = &self.shared;
        let mut core = shared.core.lock().await;

        let next = core.state.transition(StateEvent::Begin(phase))?;
        let settings = self.settings();
        let update_ids = core.selected_ids();

        if phase != Phase::Search {
            if update_ids.is_empty() {
                return Err(precondition(&core.state, phase, "no updates selected"));
            }
            if phase == Phase::Install && core.state == WuState::SearchCompleted {
                if let Some(update) = core.updates.iter().find(|u| u.is_selected && !u.is_downloaded)
                {
                    return Err(precondition(
                        &core.state,
                        phase,
                        &format!("update {} is not downloaded", update.id),
                    ));
                }
            }
            if settings.auto_accept_eulas {
                let accepted = shared.accept_pending_eulas(&mut core).await;
                shared.publish(&core);
                accepted?;
            }
            if phase == Phase::Install {
                if let Some(update) = core.updates.iter().find(|u| u.is_selected && !u.eula_accepted)
                {
                    return Err(precondition(
                        &core.state,
                        phase,
                        &format!("license terms of {} not accepted", update.id),
                    ));
                }
            }
        }

        let request = match phase {
            Phase::Search => JobRequest::Search {
                criteria: shared.search_criteria.clone(),
            },
            Phase::Download => JobRequest::Download { update_ids },
            Phase::Install => JobRequest::Install { update_ids },
        };

        let job_id = shared.next_job_id.fetch_add(1, Ordering::Relaxed);
        let supervisor = JobSupervisor::new(
            job_id,
            phase,
            settings.timeout_for(phase),
            shared.reports.clone(),
        );
        supervisor.start(shared.agent.as_ref(), request).await?;

        core.supervisor = Some(supervisor);
        core.state = next.clone();
        core.progress = None;
        shared.publish(&core);
        shared.emit(ControllerEvent::StateChanged(next.clone()));

        info!(job_id, generation = core.generation, state = %next, "Phase started");
        Ok(next)
    }

    /// Request an abort of `phase`.
    ///
    /// A no-op returning the current state when `phase` is not running. The
    /// aborted state is entered once the job reports back.
    #[instrument(skip(self))]
    pub async fn abort(&self, phase: Phase) -> Result<WuState> {
        let core = self.shared.core.lock().await;

        match core.supervisor.as_ref() {
            Some(supervisor)
                if supervisor.phase() == phase && core.state.active_phase() == Some(phase) =>
            {
                supervisor.request_abort()?;
            }
            _ => debug!(state = %core.state, "Abort ignored, phase not running"),
        }

        Ok(core.state.clone())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Discard the running job and the update list and start over in Ready.
    ///
    /// The old supervisor is unsubscribed before it is disposed, so nothing
    /// it raises afterwards reaches this controller. Settings are kept.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<WuState> {
        let shared = &self.shared;
        let mut core = shared.core.lock().await;

        if core.state == WuState::Disposed {
            return Err(ServiceError::InvalidTransition {
                from: core.state.name(),
                attempted: "reset".to_string(),
            });
        }

        core.release_supervisor();
        let generation = core.generation + 1;
        *core = ControllerCore::new(generation);

        shared.publish(&core);
        shared.emit(ControllerEvent::StateChanged(WuState::Ready));

        info!(generation, "Controller reset");
        Ok(WuState::Ready)
    }

    /// Ask the agent to restart the host. Refused while a phase runs.
    #[instrument(skip(self))]
    pub async fn reboot_host(&self) -> Result<WuState> {
        let core = self.shared.core.lock().await;

        if core.state.is_busy() || core.state == WuState::Disposed {
            return Err(ServiceError::InvalidTransition {
                from: core.state.name(),
                attempted: "reboot".to_string(),
            });
        }

        self.shared.agent.reboot_host().await?;
        info!(state = %core.state, "Host reboot requested");
        Ok(core.state.clone())
    }

    /// Abort any running job and enter the terminal Disposed state.
    #[instrument(skip(self))]
    pub async fn dispose(&self) -> WuState {
        let shared = &self.shared;
        let mut core = shared.core.lock().await;

        let Ok(next) = core.state.transition(StateEvent::Dispose) else {
            return core.state.clone();
        };

        core.release_supervisor();
        core.state = next.clone();
        core.progress = None;
        shared.publish(&core);
        shared.emit(ControllerEvent::StateChanged(next.clone()));

        info!("Controller disposed");
        next
    }

    // =========================================================================
    // Selection
    // =========================================================================

    pub async fn select_update(&self, update_id: &str) -> Result<()> {
        self.set_selected(update_id, true).await
    }

    pub async fn unselect_update(&self, update_id: &str) -> Result<()> {
        self.set_selected(update_id, false).await
    }

    async fn set_selected(&self, update_id: &str, selected: bool) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        core.find_mut(update_id)?.is_selected = selected;
        self.shared.publish(&core);
        debug!(update_id, selected, "Selection changed");
        Ok(())
    }

    /// Select every update that is not installed yet. Returns how many are
    /// selected afterwards.
    pub async fn select_all_updates(&self) -> usize {
        let mut core = self.shared.core.lock().await;
        for update in core.updates.iter_mut() {
            update.is_selected = !update.is_installed;
        }
        self.shared.publish(&core);
        core.updates.iter().filter(|u| u.is_selected).count()
    }

    pub async fn unselect_all_updates(&self) {
        let mut core = self.shared.core.lock().await;
        for update in core.updates.iter_mut() {
            update.is_selected = false;
        }
        self.shared.publish(&core);
    }

    /// Accept the license terms of one update.
    #[instrument(skip(self))]
    pub async fn accept_eula(&self, update_id: &str) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        let update = core.find_mut(update_id)?;
        if !update.eula_accepted {
            self.shared.agent.accept_eula(update_id).await?;
            update.eula_accepted = true;
        }
        self.shared.publish(&core);
        Ok(())
    }
}

impl Drop for UpdateController {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn precondition(state: &WuState, phase: Phase, reason: &str) -> ServiceError {
    ServiceError::PreconditionNotFulfilled {
        from: state.name(),
        attempted: phase.to_string(),
        reason: reason.to_string(),
    }
}

impl Shared {
    fn read_published<T>(&self, read: impl FnOnce(&Published) -> T) -> T {
        let published = self.published.read().unwrap_or_else(PoisonError::into_inner);
        read(&published)
    }

    /// Republish the reader snapshot. Called with the core mutex held.
    fn publish(&self, core: &ControllerCore) {
        let mut published = self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        published.status = WuStatus {
            state: core.state.clone(),
            progress: core.progress.clone(),
        };
        published.updates = Arc::new(core.updates.clone());
    }

    fn emit(&self, event: ControllerEvent) {
        if self.events.send(event).is_err() {
            debug!("No event consumer attached");
        }
    }

    async fn accept_pending_eulas(&self, core: &mut ControllerCore) -> Result<()> {
        for update in core
            .updates
            .iter_mut()
            .filter(|u| u.is_selected && !u.eula_accepted)
        {
            self.agent.accept_eula(&update.id).await?;
            update.eula_accepted = true;
            info!(update_id = %update.id, "License terms accepted automatically");
        }
        Ok(())
    }

    async fn apply_report(&self, report: SupervisorReport) {
        let mut core = self.core.lock().await;

        let current = core.supervisor.as_ref().map(|s| s.job_id());
        if current != Some(report.job_id) {
            debug!(
                job_id = report.job_id,
                generation = core.generation,
                "Dropping stale supervisor report"
            );
            return;
        }

        match report.kind {
            ReportKind::Progress(snapshot) => {
                let update = snapshot
                    .current_update()
                    .and_then(|u| core.updates.iter().find(|known| *known == u))
                    .cloned();
                let snapshot = match update {
                    Some(known) => snapshot.with_update(Some(known)),
                    None => snapshot,
                };
                core.progress = Some(snapshot.clone());
                self.publish(&core);
                self.emit(ControllerEvent::ProgressChanged {
                    phase: report.phase,
                    progress: snapshot,
                });
            }
            ReportKind::Finished(result) => {
                core.release_supervisor();

                let next = match core
                    .state
                    .transition(StateEvent::Finished(report.phase, result.phase_outcome()))
                {
                    Ok(next) => next,
                    Err(e) => {
                        error!(error = %e, "Unanticipated phase result");
                        return;
                    }
                };

                if let PhaseResult::Completed(outcome) = &result {
                    self.absorb_outcome(&mut core, report.phase, outcome);
                } else {
                    warn!(phase = %report.phase, "Phase timed out");
                }

                core.state = next.clone();
                core.progress = None;
                self.publish(&core);
                self.emit(ControllerEvent::StateChanged(next.clone()));
                self.emit(ControllerEvent::AsyncOperationCompleted {
                    phase: report.phase,
                    state: next.clone(),
                });

                info!(job_id = report.job_id, state = %next, "Phase finished");
            }
        }
    }

    /// Fold a job outcome into the update list.
    fn absorb_outcome(&self, core: &mut ControllerCore, phase: Phase, outcome: &JobOutcome) {
        match phase {
            Phase::Search => {
                if !outcome.result.is_success() {
                    return;
                }
                let auto_select = self
                    .settings
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .auto_select_updates;
                core.updates = outcome
                    .updates
                    .iter()
                    .map(|u| {
                        let mut descriptor = UpdateDescriptor::from(u);
                        descriptor.is_selected = auto_select && descriptor.is_important;
                        descriptor
                    })
                    .collect();
                info!(found = core.updates.len(), auto_select, "Update list refreshed");
            }
            Phase::Download | Phase::Install => {
                for id in outcome.succeeded_update_ids() {
                    if let Ok(update) = core.find_mut(id) {
                        if phase == Phase::Download {
                            update.is_downloaded = true;
                        } else {
                            update.is_installed = true;
                        }
                    }
                }
            }
        }
    }
}

async fn pump_reports(shared: Weak<Shared>, mut reports: mpsc::UnboundedReceiver<SupervisorReport>) {
    while let Some(report) = reports.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.apply_report(report).await;
    }
    debug!("Report pump stopped");
}
