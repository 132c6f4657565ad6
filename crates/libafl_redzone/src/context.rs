//! # context
//! All mutable state of the runtime lives in one [`EngineContext`] which is
//! handed to every hook. Nothing in here is synchronized: concurrent
//! allocator calls or checks from several threads race on it.
use core::hash::BuildHasherDefault;

use ahash::AHasher;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{
    GuestAddr,
    config::{ConfigError, MonitorMode, RedzoneConfig},
    errors::{AccessCounters, Reports},
    host::MachineContext,
    layout::RedzoneLayout,
    nesting::NestingDepth,
    registry::Registry,
};

type Hasher = BuildHasherDefault<AHasher>;

/// Counts of the allocator calls the interceptor has seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptorStats {
    /// Outermost allocations that returned a guarded block
    pub allocations: u64,
    pub frees: u64,
    pub resizes: u64,
    pub failed_allocations: u64,
    /// Frees and resizes of pointers missing from the registry
    pub unknown_pointers: u64,
    /// Calls made while another wrapped call was active
    pub nested_calls: u64,
}

/// Counts of the translation work the monitor has seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationStats {
    pub blocks: u64,
    pub instructions: u64,
    /// Checks inserted over all blocks
    pub checks: u64,
}

impl TranslationStats {
    /// Records one translated block.
    pub fn record(&mut self, instructions: usize, checks: usize) {
        self.blocks += 1;
        self.instructions += instructions as u64;
        self.checks += checks as u64;
    }

    /// The mean count of instructions per block, `None` before the first
    /// block.
    #[must_use]
    pub fn average_block_size(&self) -> Option<f64> {
        (self.blocks > 0).then(|| self.instructions as f64 / self.blocks as f64)
    }
}

#[derive(Debug)]
pub struct EngineContext {
    pub layout: RedzoneLayout,
    pub registry: Registry,
    pub depth: NestingDepth,
    pub counters: AccessCounters,
    pub reports: Reports,
    pub stats: InterceptorStats,
    pub translation: TranslationStats,
    pub mode: MonitorMode,
    stack_slack: usize,
    stack_frame_bound: usize,
    substitutes: HashMap<GuestAddr, GuestAddr, Hasher>,
}

impl EngineContext {
    pub fn new(config: &RedzoneConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            layout: config.layout()?,
            registry: Registry::new(),
            depth: NestingDepth::new(),
            counters: AccessCounters::default(),
            reports: Reports::new(config.max_reports),
            stats: InterceptorStats::default(),
            translation: TranslationStats::default(),
            mode: config.mode,
            stack_slack: config.stack_slack,
            stack_frame_bound: config.stack_frame_bound,
            substitutes: HashMap::with_hasher(Hasher::default()),
        })
    }

    /// Guesses whether `addr` lies on the current stack: a little below the
    /// stack pointer up to a generous distance above the frame pointer.
    #[must_use]
    pub fn is_stack_address(&self, mc: &MachineContext, addr: GuestAddr) -> bool {
        addr > mc.sp().saturating_sub(self.stack_slack)
            && addr < mc.bp().saturating_add(self.stack_frame_bound)
    }

    /// The value a neutralized read at `pc` yields. Every call for the same
    /// `pc` returns a larger value than the last one.
    pub fn next_substitute(&mut self, pc: GuestAddr) -> GuestAddr {
        let next = self.substitutes.entry(pc).or_insert(0);
        let value = *next;
        *next += 1;
        value
    }
}
