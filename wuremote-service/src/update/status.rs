//! Status tracking
//!
//! Progress snapshots and the combined state/progress view clients poll.

use serde::Serialize;
use wuremote_agent::JobProgress;

use super::descriptor::UpdateDescriptor;
use super::state::WuState;

/// Position of the current update within the running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressPosition {
    /// Zero-based index of the update being processed.
    pub index: usize,
    /// Number of updates in the job, always greater than zero.
    pub count: usize,
}

/// Immutable progress report for the running phase.
///
/// Constructors keep `percent` within 0..=100 and `index < count`. A
/// snapshot without a position is indeterminate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    current_update: Option<UpdateDescriptor>,
    position: Option<ProgressPosition>,
    percent: u8,
    indeterminate: bool,
}

impl ProgressSnapshot {
    /// Progress with no known position.
    pub fn indeterminate(percent: u32) -> Self {
        Self {
            current_update: None,
            position: None,
            percent: clamp_percent(percent),
            indeterminate: true,
        }
    }

    /// Progress on update `index` of `count`.
    ///
    /// A zero count yields an indeterminate snapshot; an out of range index
    /// is pinned to the last update.
    pub fn new(
        current_update: Option<UpdateDescriptor>,
        index: usize,
        count: usize,
        percent: u32,
    ) -> Self {
        if count == 0 {
            return Self::indeterminate(percent).with_update(current_update);
        }

        Self {
            current_update,
            position: Some(ProgressPosition {
                index: index.min(count - 1),
                count,
            }),
            percent: clamp_percent(percent),
            indeterminate: false,
        }
    }

    /// Translate a raw agent progress signal.
    pub fn from_job(progress: &JobProgress) -> Self {
        let update = progress.update.as_ref().map(UpdateDescriptor::from);
        match progress.count {
            Some(count) if count > 0 => {
                Self::new(update, progress.index.unwrap_or(0), count, progress.percent)
            }
            _ => Self::indeterminate(progress.percent).with_update(update),
        }
    }

    pub fn with_update(mut self, update: Option<UpdateDescriptor>) -> Self {
        self.current_update = update;
        self
    }

    pub fn current_update(&self) -> Option<&UpdateDescriptor> {
        self.current_update.as_ref()
    }

    pub fn position(&self) -> Option<ProgressPosition> {
        self.position
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn is_indeterminate(&self) -> bool {
        self.indeterminate
    }
}

fn clamp_percent(percent: u32) -> u8 {
    percent.min(100) as u8
}

/// State and progress, read together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WuStatus {
    pub state: WuState,
    /// Present only while a phase runs and has reported progress.
    pub progress: Option<ProgressSnapshot>,
}

impl WuStatus {
    pub fn ready() -> Self {
        Self {
            state: WuState::Ready,
            progress: None,
        }
    }
}
