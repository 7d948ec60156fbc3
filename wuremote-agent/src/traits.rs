//! Core update-agent abstraction traits.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::*;

/// Receiver of the signals raised by a running job.
///
/// Implementations are invoked on the agent's own callback context and must
/// not block. Agents may (erroneously) signal completion more than once.
pub trait JobListener: Send + Sync {
    /// Zero or more times while the job runs.
    fn on_progress(&self, progress: JobProgress);

    /// Once the job reached a terminal result.
    fn on_completed(&self, outcome: JobOutcome);
}

/// Capability handle of one submitted native job.
pub trait AgentJob: Send + Sync {
    /// Kind of the job.
    fn kind(&self) -> JobKind;

    /// Ask the agent to stop the job. Advisory: the job still reports its
    /// completion through the listener.
    fn request_abort(&self) -> Result<()>;

    /// Release native resources held by the job.
    fn clean_up(&self);

    /// Whether the agent considers the job finished.
    fn is_completed(&self) -> bool;
}

/// Core update-agent abstraction trait.
///
/// This trait defines the interface that update-agent backends implement.
/// Submission returns immediately with a job handle; progress and completion
/// are signaled through the supplied [`JobListener`].
#[async_trait]
pub trait UpdateAgent: Send + Sync {
    // =========================================================================
    // Identification & Health
    // =========================================================================

    /// Get backend identification.
    async fn info(&self) -> Result<AgentInfo>;

    /// Check if the agent is reachable.
    async fn health_check(&self) -> Result<bool>;

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Submit a job.
    async fn submit(
        &self,
        request: JobRequest,
        listener: Arc<dyn JobListener>,
    ) -> Result<Box<dyn AgentJob>>;

    // =========================================================================
    // Host
    // =========================================================================

    /// Accept the license terms of an update.
    async fn accept_eula(&self, update_id: &str) -> Result<()>;

    /// Restart the host.
    async fn reboot_host(&self) -> Result<()>;
}
