//! Update pipeline state machine.
//!
//! Pure transition logic. The controller owns the current [`WuState`] and
//! feeds it [`StateEvent`]s; nothing in here performs I/O.

use serde::Serialize;
use std::fmt;
use wuremote_agent::JobKind;

use super::error::{Result, ServiceError};

/// One of the three asynchronous pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Search,
    Download,
    Install,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Search, Phase::Download, Phase::Install];

    /// The agent job kind that implements this phase.
    pub fn job_kind(self) -> JobKind {
        match self {
            Phase::Search => JobKind::Search,
            Phase::Download => JobKind::Download,
            Phase::Install => JobKind::Install,
        }
    }

    /// The busy state held while the phase runs.
    pub fn active_state(self) -> WuState {
        match self {
            Phase::Search => WuState::Searching,
            Phase::Download => WuState::Downloading,
            Phase::Install => WuState::Installing,
        }
    }

    fn failed_state(self, failure: Failure) -> WuState {
        match self {
            Phase::Search => WuState::SearchFailed(failure),
            Phase::Download => WuState::DownloadFailed(failure),
            Phase::Install => WuState::InstallFailed(failure),
        }
    }
}

impl From<JobKind> for Phase {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::Search => Phase::Search,
            JobKind::Download => Phase::Download,
            JobKind::Install => Phase::Install,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Search => "search",
            Phase::Download => "download",
            Phase::Install => "install",
        };
        f.write_str(name)
    }
}

/// Why a phase ended without success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum Failure {
    /// Aborted on request.
    Aborted,
    /// The watchdog fired before the agent completed.
    TimedOut { after_secs: u64 },
    /// The agent reported a failure.
    Failed { code: i32 },
}

/// Observable state of the update pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "failure", rename_all = "snake_case")]
pub enum WuState {
    Ready,
    Searching,
    SearchCompleted,
    SearchFailed(Failure),
    Downloading,
    DownloadCompleted,
    DownloadFailed(Failure),
    Installing,
    InstallCompleted,
    InstallFailed(Failure),
    RebootRequired,
    Disposed,
}

/// How a phase ended, as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Succeeded { reboot_required: bool },
    Failed(Failure),
}

/// Input to [`WuState::transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// A phase is about to start.
    Begin(Phase),
    /// The running phase reached a terminal result.
    Finished(Phase, PhaseOutcome),
    /// The owning controller is shutting down.
    Dispose,
}

impl StateEvent {
    fn describe(&self) -> String {
        match self {
            StateEvent::Begin(phase) => phase.to_string(),
            StateEvent::Finished(phase, _) => format!("complete {}", phase),
            StateEvent::Dispose => "dispose".to_string(),
        }
    }
}

impl WuState {
    /// Human readable name, used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            WuState::Ready => "Ready",
            WuState::Searching => "Searching",
            WuState::SearchCompleted => "Search completed",
            WuState::SearchFailed(Failure::Aborted) => "Search aborted",
            WuState::SearchFailed(Failure::TimedOut { .. }) => "Search timed out",
            WuState::SearchFailed(Failure::Failed { .. }) => "Search failed",
            WuState::Downloading => "Downloading",
            WuState::DownloadCompleted => "Download completed",
            WuState::DownloadFailed(Failure::Aborted) => "Download aborted",
            WuState::DownloadFailed(Failure::TimedOut { .. }) => "Download timed out",
            WuState::DownloadFailed(Failure::Failed { .. }) => "Download failed",
            WuState::Installing => "Installing",
            WuState::InstallCompleted => "Install completed",
            WuState::InstallFailed(Failure::Aborted) => "Install aborted",
            WuState::InstallFailed(Failure::TimedOut { .. }) => "Install timed out",
            WuState::InstallFailed(Failure::Failed { .. }) => "Install failed",
            WuState::RebootRequired => "Reboot required",
            WuState::Disposed => "Disposed",
        }
    }

    /// The phase currently running, if any.
    pub fn active_phase(&self) -> Option<Phase> {
        match self {
            WuState::Searching => Some(Phase::Search),
            WuState::Downloading => Some(Phase::Download),
            WuState::Installing => Some(Phase::Install),
            _ => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active_phase().is_some()
    }

    /// Failure details of a failed state.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            WuState::SearchFailed(f) | WuState::DownloadFailed(f) | WuState::InstallFailed(f) => {
                Some(f)
            }
            _ => None,
        }
    }

    /// Phases that may begin from this state.
    ///
    /// Download needs a completed search. Install needs either a completed
    /// download or a search whose selected updates are already downloaded;
    /// the latter is checked by the controller as a precondition. A failed
    /// download or install only recovers through a reset.
    pub fn entry_phases(&self) -> &'static [Phase] {
        match self {
            WuState::Ready | WuState::SearchFailed(_) | WuState::InstallCompleted => {
                &[Phase::Search]
            }
            WuState::SearchCompleted => &[Phase::Search, Phase::Download, Phase::Install],
            WuState::DownloadCompleted => &[Phase::Install],
            WuState::Searching
            | WuState::DownloadFailed(_)
            | WuState::InstallFailed(_)
            | WuState::Downloading
            | WuState::Installing
            | WuState::RebootRequired
            | WuState::Disposed => &[],
        }
    }

    pub fn can_enter(&self, phase: Phase) -> bool {
        self.entry_phases().contains(&phase)
    }

    /// Compute the successor state, or reject the event.
    pub fn transition(&self, event: StateEvent) -> Result<WuState> {
        let next = match (self, &event) {
            (WuState::Disposed, _) => None,
            (_, StateEvent::Dispose) => Some(WuState::Disposed),
            (state, StateEvent::Begin(phase)) if state.can_enter(*phase) => {
                Some(phase.active_state())
            }
            (state, StateEvent::Finished(phase, outcome))
                if state.active_phase() == Some(*phase) =>
            {
                Some(match (phase, outcome) {
                    (Phase::Search, PhaseOutcome::Succeeded { .. }) => WuState::SearchCompleted,
                    (Phase::Download, PhaseOutcome::Succeeded { .. }) => {
                        WuState::DownloadCompleted
                    }
                    (Phase::Install, PhaseOutcome::Succeeded { reboot_required: true }) => {
                        WuState::RebootRequired
                    }
                    (Phase::Install, PhaseOutcome::Succeeded { reboot_required: false }) => {
                        WuState::InstallCompleted
                    }
                    (_, PhaseOutcome::Failed(failure)) => phase.failed_state(failure.clone()),
                })
            }
            _ => None,
        };

        next.ok_or_else(|| ServiceError::InvalidTransition {
            from: self.name(),
            attempted: event.describe(),
        })
    }
}

impl fmt::Display for WuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
