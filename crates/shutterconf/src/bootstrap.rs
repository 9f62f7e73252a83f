//! Bootstrap configuration - seeds runtime state, then runtime owns it.
//!
//! The role in particular is overwritten by `set,<role>` messages at runtime;
//! the value here only matters until the coordinator sends the first one.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Initial node role.
    /// Default: TX
    pub role: String,

    /// Align mode used when the frame source is checked at boot.
    /// Default: HW
    pub align_mode: String,

    /// Ask the frame source for hardware frame sync.
    /// Default: true
    pub enable_sync: bool,

    /// Frame rate of the built-in synthetic source.
    /// Default: 30
    pub synthetic_fps: u32,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            role: "TX".to_string(),
            align_mode: "HW".to_string(),
            enable_sync: true,
            synthetic_fps: 30,
        }
    }
}
