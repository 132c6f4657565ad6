//! # config
//! Build-time constants of the runtime and the [`RedzoneConfig`] assembled
//! from them. The defaults of the builder are exactly the constants, so a
//! runtime created from `RedzoneConfig::default()` behaves as compiled.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::{GuestAddr, WORD_SIZE, layout::RedzoneLayout};

/// The word written into redzones and freed memory.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_SENTINEL: GuestAddr = 0xdeadbeef_deadbeef;

/// The word written into redzones and freed memory.
#[cfg(target_pointer_width = "32")]
pub const DEFAULT_SENTINEL: GuestAddr = 0xdeadbeef;

/// Bytes of guard in front of every user region.
pub const PRE_REDZONE_SIZE: usize = 8;

/// Bytes of guard behind every user region.
pub const POST_REDZONE_SIZE: usize = 16;

/// Custom allocation functions wrapped like `malloc`.
pub const CUSTOM_MALLOCS: &[&str] = &["tmalloc"];

/// Custom deallocation functions wrapped like `free`.
pub const CUSTOM_FREES: &[&str] = &["tfree"];

/// Addresses this far below the stack pointer still count as stack.
pub const STACK_SLACK: usize = 32;

/// Addresses up to this far above the frame pointer count as stack.
pub const STACK_FRAME_BOUND: usize = 1 << 20;

/// The number of violations kept in full; later ones are only counted.
pub const MAX_REPORTS: usize = 1024;

/// What the monitor does once it has found a sentinel word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorMode {
    /// Count and log only, the program runs unchanged.
    Observe,
    /// Also skip offending writes and substitute offending reads.
    #[default]
    Intercept,
}

/// The configuration of a [`crate::RedzoneRuntime`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct RedzoneConfig {
    /// The sentinel word
    #[builder(default = DEFAULT_SENTINEL)]
    pub sentinel: GuestAddr,
    /// Size of the guard in front of the user region
    #[builder(default = PRE_REDZONE_SIZE)]
    pub pre_redzone: usize,
    /// Size of the guard behind the user region
    #[builder(default = POST_REDZONE_SIZE)]
    pub post_redzone: usize,
    /// Symbols wrapped as allocation functions in addition to `malloc`
    #[builder(default = CUSTOM_MALLOCS.iter().map(|s| (*s).to_string()).collect())]
    pub custom_mallocs: Vec<String>,
    /// Symbols wrapped as deallocation functions in addition to `free`
    #[builder(default = CUSTOM_FREES.iter().map(|s| (*s).to_string()).collect())]
    pub custom_frees: Vec<String>,
    #[builder(default = STACK_SLACK)]
    pub stack_slack: usize,
    #[builder(default = STACK_FRAME_BOUND)]
    pub stack_frame_bound: usize,
    #[builder(default)]
    pub mode: MonitorMode,
    /// Log every allocation still live when the process exits
    #[builder(default = true)]
    pub report_leaks: bool,
    #[builder(default = MAX_REPORTS)]
    pub max_reports: usize,
}

impl Default for RedzoneConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RedzoneConfig {
    /// Validates the guard sizes and derives the redzone layout.
    pub fn layout(&self) -> Result<RedzoneLayout, ConfigError> {
        for size in [self.pre_redzone, self.post_redzone] {
            if size == 0 || size % WORD_SIZE != 0 {
                Err(ConfigError::MisalignedRedzone(size))?;
            }
        }
        if self.sentinel == 0 {
            Err(ConfigError::ZeroSentinel)?;
        }
        Ok(RedzoneLayout::new(
            self.pre_redzone,
            self.post_redzone,
            self.sentinel,
        ))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Redzone size {0:#x} is not a non-zero multiple of the word size")]
    MisalignedRedzone(usize),
    #[error("The sentinel must not be zero")]
    ZeroSentinel,
}
