//! # WuRemote Agent
//!
//! Boundary to the host's native update agent.
//!
//! The native agent runs long jobs (search, download, install) and reports
//! back through callbacks instead of being polled. This crate captures that
//! shape in three traits:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            UpdateAgent trait            │
//! │  (submit, accept_eula, reboot_host)     │
//! └─────────────────────┬───────────────────┘
//!                       │ returns
//!                       ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │  AgentJob handle  │     │   JobListener     │
//! │ (abort, clean_up) │     │ (progress, done)  │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wuremote_agent::{JobRequest, MockAgent, UpdateAgent, DEFAULT_SEARCH_CRITERIA};
//!
//! let agent = MockAgent::manual(MockAgent::sample_catalog(3));
//! let request = JobRequest::Search { criteria: DEFAULT_SEARCH_CRITERIA.into() };
//! let job = agent.submit(request, listener).await?;
//! job.request_abort()?;
//! ```

pub mod error;
pub mod mock;
pub mod traits;
pub mod types;

pub use error::{codes, AgentError};
pub use mock::{MockAgent, MockJob, MockMode};
pub use traits::{AgentJob, JobListener, UpdateAgent};
pub use types::*;
