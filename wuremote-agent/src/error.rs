//! Error types for the update-agent boundary.

use thiserror::Error;

/// Well-known native result codes.
pub mod codes {
    /// Operation aborted.
    pub const E_ABORT: i32 = 0x8000_4004_u32 as i32;
    /// Unspecified failure.
    pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;
    /// The update agent is not available.
    pub const WU_E_NO_SERVICE: i32 = 0x8024_0001_u32 as i32;
}

/// Errors that can occur while talking to the update agent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The native agent rejected a call with a result code.
    #[error("Native agent call failed (0x{code:08X}): {message}")]
    Native { code: i32, message: String },

    /// The referenced update is not known to the agent.
    #[error("Update not found: {0}")]
    UpdateNotFound(String),

    /// A job request was malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Create a native error from a result code.
    pub fn native(code: i32, message: impl Into<String>) -> Self {
        Self::Native {
            code,
            message: message.into(),
        }
    }

    /// Native result code carried by this error, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            AgentError::Native { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_error_display() {
        let err = AgentError::native(codes::WU_E_NO_SERVICE, "service stopped");
        assert_eq!(
            err.to_string(),
            "Native agent call failed (0x80240001): service stopped"
        );
        assert_eq!(err.code(), Some(codes::WU_E_NO_SERVICE));
        assert_eq!(AgentError::UpdateNotFound("kb1".into()).code(), None);
    }
}
