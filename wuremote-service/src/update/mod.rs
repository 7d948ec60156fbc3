//! # Update Orchestration
//!
//! Drives the search, download and install phases of a host's update
//! pipeline on top of an [`UpdateAgent`](wuremote_agent::UpdateAgent).
//!
//! ```text
//! ┌──────────────┐  begin/abort   ┌──────────────────┐  submit   ┌─────────┐
//! │   caller     │───────────────►│ UpdateController │──────────►│  agent  │
//! └──────────────┘                │  (WuState, list) │           └────┬────┘
//!        ▲                        └────────▲─────────┘                │
//!        │ ControllerEvent                 │ SupervisorReport         │ progress
//!        │                        ┌────────┴─────────┐                │ completion
//!        └────────────────────────│  JobSupervisor   │◄───────────────┘
//!                                 │  (watchdog)      │
//!                                 └──────────────────┘
//! ```

mod controller;
mod descriptor;
mod error;
mod settings;
mod state;
mod status;
mod supervisor;

pub use controller::{ControllerEvent, UpdateController};
pub use descriptor::UpdateDescriptor;
pub use error::{Fault, FaultKind, Result, ServiceError};
pub use settings::{validate_timeout, Settings, MAX_TIMEOUT_SECS};
pub use state::{Failure, Phase, PhaseOutcome, StateEvent, WuState};
pub use status::{ProgressPosition, ProgressSnapshot, WuStatus};
pub use supervisor::{JobSupervisor, PhaseResult, ReportKind, SupervisorReport};
