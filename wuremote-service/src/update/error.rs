//! Error taxonomy of the orchestration core.
//!
//! Every mutating operation fails with exactly one [`ServiceError`] kind.
//! Hosting layers turn errors into [`Fault`]s through [`ServiceError::fault`].

use serde::Serialize;
use thiserror::Error;
use wuremote_agent::AgentError;

/// Errors returned by the controller and the service facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The current state does not allow the requested operation.
    #[error("Invalid transition: cannot {attempted} while {from}")]
    InvalidTransition { from: &'static str, attempted: String },

    /// The state allows the operation but an input requirement is missing.
    #[error("Precondition not fulfilled: cannot {attempted} while {from}: {reason}")]
    PreconditionNotFulfilled {
        from: &'static str,
        attempted: String,
        reason: String,
    },

    /// Malformed input.
    #[error("Bad argument '{argument}': {message}")]
    BadArgument { argument: &'static str, message: String },

    /// The update id is not part of the last fetched list.
    #[error("Update not found: {0}")]
    UpdateNotFound(String),

    /// The update agent reported a failure.
    #[error("Update agent fault (0x{code:08X}): {message}")]
    ApiFault { code: i32, message: String },

    /// Anything the taxonomy does not anticipate.
    #[error("Unexpected failure: {0}")]
    Unexpected(String),
}

/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    /// True for both invalid transitions and their precondition refinement.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            ServiceError::InvalidTransition { .. } | ServiceError::PreconditionNotFulfilled { .. }
        )
    }

    /// Structured fault for the hosting boundary.
    pub fn fault(&self) -> Fault {
        let (kind, code) = match self {
            ServiceError::InvalidTransition { .. } => (FaultKind::InvalidTransition, None),
            ServiceError::PreconditionNotFulfilled { .. } => {
                (FaultKind::PreconditionNotFulfilled, None)
            }
            ServiceError::BadArgument { .. } => (FaultKind::BadArgument, None),
            ServiceError::UpdateNotFound(_) => (FaultKind::UpdateNotFound, None),
            ServiceError::ApiFault { code, .. } => (FaultKind::ApiFault, Some(*code)),
            ServiceError::Unexpected(_) => (FaultKind::Unexpected, None),
        };

        Fault {
            kind,
            code,
            message: self.to_string(),
        }
    }
}

impl From<AgentError> for ServiceError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Native { code, message } => ServiceError::ApiFault { code, message },
            AgentError::UpdateNotFound(id) => ServiceError::UpdateNotFound(id),
            AgentError::InvalidArgument(message) => ServiceError::BadArgument {
                argument: "request",
                message,
            },
            AgentError::Internal(message) => ServiceError::Unexpected(message),
        }
    }
}

/// Fault category exposed to hosting layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    InvalidTransition,
    PreconditionNotFulfilled,
    BadArgument,
    UpdateNotFound,
    ApiFault,
    Unexpected,
}

/// Structured rendering of a [`ServiceError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub kind: FaultKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    pub message: String,
}
