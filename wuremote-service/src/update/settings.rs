//! Runtime settings of the update pipeline.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{Result, ServiceError};
use super::state::Phase;

/// Largest accepted timeout, in seconds. Keeps the value representable as
/// signed 32-bit milliseconds.
pub const MAX_TIMEOUT_SECS: i64 = (i32::MAX / 1000) as i64;

/// Phase timeouts and automation flags.
///
/// Loaded from the `settings` section of the configuration file and then
/// mutated at runtime. A reset of the pipeline keeps the current values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Search timeout in seconds
    pub search_timeout_secs: u32,
    /// Download timeout in seconds
    pub download_timeout_secs: u32,
    /// Install timeout in seconds
    pub install_timeout_secs: u32,
    /// Accept license terms of selected updates before download and install
    pub auto_accept_eulas: bool,
    /// Select important updates after every successful search
    pub auto_select_updates: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            search_timeout_secs: 10 * 60,
            download_timeout_secs: 60 * 60,
            install_timeout_secs: 2 * 60 * 60,
            auto_accept_eulas: false,
            auto_select_updates: false,
        }
    }
}

impl Settings {
    /// Watchdog duration for `phase`.
    pub fn timeout_for(&self, phase: Phase) -> Duration {
        let secs = match phase {
            Phase::Search => self.search_timeout_secs,
            Phase::Download => self.download_timeout_secs,
            Phase::Install => self.install_timeout_secs,
        };
        Duration::from_secs(u64::from(secs))
    }

    /// Validate and store the timeout for `phase`.
    ///
    /// On error the stored value is left untouched.
    pub fn set_timeout(&mut self, phase: Phase, secs: i64) -> Result<()> {
        let secs = validate_timeout(timeout_argument(phase), secs)?;
        match phase {
            Phase::Search => self.search_timeout_secs = secs,
            Phase::Download => self.download_timeout_secs = secs,
            Phase::Install => self.install_timeout_secs = secs,
        }
        Ok(())
    }

    /// Check values that came from configuration.
    pub fn validate(&self) -> Result<()> {
        for phase in Phase::ALL {
            validate_timeout(
                timeout_argument(phase),
                self.timeout_for(phase).as_secs() as i64,
            )?;
        }
        Ok(())
    }
}

fn timeout_argument(phase: Phase) -> &'static str {
    match phase {
        Phase::Search => "search_timeout",
        Phase::Download => "download_timeout",
        Phase::Install => "install_timeout",
    }
}

/// A timeout must be positive and fit in i32 milliseconds.
pub fn validate_timeout(argument: &'static str, secs: i64) -> Result<u32> {
    if secs <= 0 {
        return Err(ServiceError::BadArgument {
            argument,
            message: format!("timeout must be positive, got {}", secs),
        });
    }
    if secs > MAX_TIMEOUT_SECS {
        return Err(ServiceError::BadArgument {
            argument,
            message: format!(
                "timeout of {} seconds exceeds the maximum of {}",
                secs, MAX_TIMEOUT_SECS
            ),
        });
    }
    Ok(secs as u32)
}
