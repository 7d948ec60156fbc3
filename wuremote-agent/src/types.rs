//! Type definitions for update-agent jobs, updates and outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// UPDATES
// =============================================================================

/// An update as reported by the native agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUpdate {
    /// Stable update identifier
    pub id: String,
    /// Human-readable title
    pub title: String,
    /// Longer description
    pub description: String,
    /// Whether the agent classifies the update as important
    pub is_important: bool,
    /// Lower bound of the download size in bytes
    pub min_download_size: u64,
    /// Upper bound of the download size in bytes
    pub max_download_size: u64,
    /// Already installed on the host
    pub is_installed: bool,
    /// Payload already present in the local cache
    pub is_downloaded: bool,
    /// License terms already accepted
    pub eula_accepted: bool,
}

impl AgentUpdate {
    /// Create a new update with default flags.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            is_important: false,
            min_download_size: 0,
            max_download_size: 0,
            is_installed: false,
            is_downloaded: false,
            eula_accepted: true,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the update as important.
    pub fn important(mut self) -> Self {
        self.is_important = true;
        self
    }

    /// Set the download size bounds.
    pub fn with_size(mut self, min: u64, max: u64) -> Self {
        self.min_download_size = min;
        self.max_download_size = max.max(min);
        self
    }

    /// Mark the payload as already downloaded.
    pub fn downloaded(mut self) -> Self {
        self.is_downloaded = true;
        self
    }

    /// Require EULA acceptance before installation.
    pub fn with_pending_eula(mut self) -> Self {
        self.eula_accepted = false;
        self
    }
}

// =============================================================================
// JOBS
// =============================================================================

/// Kind of a native job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Search,
    Download,
    Install,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Search => write!(f, "search"),
            JobKind::Download => write!(f, "download"),
            JobKind::Install => write!(f, "install"),
        }
    }
}

/// Parameters of a job submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobRequest {
    /// Search for applicable updates matching `criteria`.
    Search { criteria: String },
    /// Download the payloads of the given updates.
    Download { update_ids: Vec<String> },
    /// Install the given updates.
    Install { update_ids: Vec<String> },
}

/// Criteria used when none is configured: every applicable update that is
/// not installed yet.
pub const DEFAULT_SEARCH_CRITERIA: &str = "IsInstalled=0 and IsHidden=0";

impl JobRequest {
    /// The kind of job this request starts.
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Search { .. } => JobKind::Search,
            JobRequest::Download { .. } => JobKind::Download,
            JobRequest::Install { .. } => JobKind::Install,
        }
    }

    /// Update ids the job operates on (empty for searches).
    pub fn update_ids(&self) -> &[String] {
        match self {
            JobRequest::Search { .. } => &[],
            JobRequest::Download { update_ids } | JobRequest::Install { update_ids } => update_ids,
        }
    }
}

/// Progress signal raised by a running job.
///
/// `index`/`count` are absent while the agent cannot tell how much work is
/// left (searches report no count at all).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Update currently being processed
    pub update: Option<AgentUpdate>,
    /// Zero-based index of the current update
    pub index: Option<usize>,
    /// Number of updates handled by the job
    pub count: Option<usize>,
    /// Overall percentage as reported by the agent (may exceed 100 on some agents)
    pub percent: u32,
}

impl JobProgress {
    /// Progress without a known amount of work.
    pub fn indeterminate(percent: u32) -> Self {
        Self {
            update: None,
            index: None,
            count: None,
            percent,
        }
    }

    /// Progress on update `index` of `count`.
    pub fn of(update: Option<AgentUpdate>, index: usize, count: usize, percent: u32) -> Self {
        Self {
            update,
            index: Some(index),
            count: Some(count),
            percent,
        }
    }
}

/// Result code of a finished job or of a single update inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResult {
    Succeeded,
    SucceededWithErrors,
    Failed,
    Aborted,
}

impl OperationResult {
    /// Whether the job produced a usable result.
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Succeeded | OperationResult::SucceededWithErrors)
    }
}

/// Per-update result of a download or install job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub update_id: String,
    pub result: OperationResult,
    pub code: i32,
}

/// Completion signal raised by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub kind: JobKind,
    pub result: OperationResult,
    /// Native result code (0 on success)
    pub code: i32,
    /// Set by install jobs when the host must restart
    pub reboot_required: bool,
    /// Updates found by a search job
    pub updates: Vec<AgentUpdate>,
    /// Per-update results of download and install jobs
    pub update_results: Vec<UpdateResult>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    fn with_result(kind: JobKind, result: OperationResult, code: i32) -> Self {
        Self {
            kind,
            result,
            code,
            reboot_required: false,
            updates: Vec::new(),
            update_results: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    /// A successful outcome.
    pub fn succeeded(kind: JobKind) -> Self {
        Self::with_result(kind, OperationResult::Succeeded, 0)
    }

    /// An outcome reporting that the job was aborted.
    pub fn aborted(kind: JobKind) -> Self {
        Self::with_result(kind, OperationResult::Aborted, crate::error::codes::E_ABORT)
    }

    /// A failed outcome with a native result code.
    pub fn failed(kind: JobKind, code: i32) -> Self {
        Self::with_result(kind, OperationResult::Failed, code)
    }

    /// Attach search results.
    pub fn with_updates(mut self, updates: Vec<AgentUpdate>) -> Self {
        self.updates = updates;
        self
    }

    /// Mark every given update with the overall result.
    pub fn with_results_for(mut self, update_ids: &[String]) -> Self {
        self.update_results = update_ids
            .iter()
            .map(|id| UpdateResult {
                update_id: id.clone(),
                result: self.result,
                code: self.code,
            })
            .collect();
        self
    }

    /// Flag that the host must restart to finish the job.
    pub fn with_reboot_required(mut self) -> Self {
        self.reboot_required = true;
        self
    }

    /// Ids of updates the job handled successfully.
    pub fn succeeded_update_ids(&self) -> impl Iterator<Item = &str> {
        self.update_results
            .iter()
            .filter(|r| r.result.is_success())
            .map(|r| r.update_id.as_str())
    }
}

/// Identification of an agent backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Backend name (e.g., "mock")
    pub name: String,
    /// Backend version string
    pub version: String,
}
