//! # runtime
//! The [`RedzoneRuntime`] owns the host, the engine context and the
//! interceptor. An embedder creates it once with [`RedzoneRuntime::init`]
//! and then feeds it every [`Event`] the host produces, either through the
//! [`EventHandler`] implementation or by calling the `on_*` entry points
//! directly.
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    GuestAddr,
    config::{ConfigError, MonitorMode, RedzoneConfig},
    context::{EngineContext, InterceptorStats, TranslationStats},
    errors::{AccessCounters, Violation},
    event::{BasicBlock, Event, EventHandler, EventKind},
    host::{Directive, Host, ModuleInfo, WrapContext},
    interceptor::{AllocationInterceptor, CallStash},
    monitor::{AccessMonitor, CheckCall},
    registry::{AllocationRecord, Registry},
};

const SUBSCRIBED_EVENTS: [EventKind; 7] = [
    EventKind::ProcessStart,
    EventKind::ModuleLoaded,
    EventKind::BlockTranslated,
    EventKind::FunctionEntered,
    EventKind::FunctionExited,
    EventKind::AccessCheck,
    EventKind::ProcessExit,
];

/// What the runtime observed over the lifetime of the process.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub counters: AccessCounters,
    pub stats: InterceptorStats,
    pub translation: TranslationStats,
    /// Allocations never freed, sorted by address
    pub live_allocations: Vec<AllocationRecord>,
    pub violations: Vec<Violation>,
    /// Violations beyond the report capacity, counted only
    pub dropped_violations: u64,
}

#[derive(Debug)]
pub struct RedzoneRuntime<H: Host> {
    host: H,
    config: RedzoneConfig,
    cx: EngineContext,
    interceptor: AllocationInterceptor,
}

impl<H: Host> RedzoneRuntime<H> {
    /// Validates `config` and subscribes to every event the runtime handles.
    pub fn init(mut host: H, config: RedzoneConfig) -> Result<Self, RuntimeError<H>> {
        let cx = EngineContext::new(&config)?;
        host.subscribe(&SUBSCRIBED_EVENTS)
            .map_err(RuntimeError::Host)?;
        debug!("redzone runtime initialized");
        Ok(Self {
            host,
            config,
            cx,
            interceptor: AllocationInterceptor::new(),
        })
    }

    pub fn on_start(&self) {
        info!("redzone runtime started - config: {:?}", self.config);
    }

    /// Wraps the allocator entry points of `module`. Returns the count of
    /// newly wrapped functions.
    pub fn on_module_load(&mut self, module: &ModuleInfo) -> Result<usize, RuntimeError<H>> {
        trace!("module loaded: {} ({}) at {:#x}", module.name, module.path, module.base);
        self.interceptor
            .register(&mut self.host, module, &self.config)
            .map_err(RuntimeError::Host)
    }

    pub fn on_block(&mut self, block: &mut BasicBlock) -> usize {
        let checks = AccessMonitor::instrument_block(block);
        trace!("block {:#x}: {checks} checks", block.tag);
        self.cx.translation.record(block.instructions.len(), checks);
        checks
    }

    pub fn on_call_entry(&mut self, target: GuestAddr, call: &mut dyn WrapContext) -> CallStash {
        match self.interceptor.function(target) {
            Some(function) => AllocationInterceptor::before(&mut self.cx, function, call),
            None => {
                warn!("entered unwrapped function at {target:#x}");
                CallStash::Passthrough
            }
        }
    }

    pub fn on_call_exit(
        &mut self,
        target: GuestAddr,
        call: &mut dyn WrapContext,
        stash: CallStash,
    ) {
        match self.interceptor.function(target) {
            Some(function) => AllocationInterceptor::after(&mut self.cx, function, call, stash),
            None => warn!("exited unwrapped function at {target:#x}"),
        }
    }

    pub fn on_check(&mut self, check: CheckCall) -> Directive {
        AccessMonitor::check(&mut self.cx, &self.host, check)
    }

    /// Logs the final counters and, if configured, every allocation that is
    /// still live.
    pub fn on_exit(&mut self) -> Summary {
        let summary = self.summary();
        info!(
            "Reads: {}, Writes: {}",
            summary.counters.reads, summary.counters.writes
        );
        info!("{:?}", summary.stats);
        let translation = summary.translation;
        info!(
            "Blocks: {}, Instructions: {}, Checks: {}",
            translation.blocks, translation.instructions, translation.checks
        );
        if let Some(average) = translation.average_block_size() {
            info!("Average block size: {average:.2}");
        }
        if self.config.report_leaks {
            for leak in &summary.live_allocations {
                warn!("leaked {:#x}, size: {:#x}", leak.user, leak.size);
            }
        }
        if summary.dropped_violations > 0 {
            warn!("{} violations were not kept", summary.dropped_violations);
        }
        summary
    }

    #[must_use]
    pub fn summary(&self) -> Summary {
        Summary {
            counters: self.cx.counters,
            stats: self.cx.stats,
            translation: self.cx.translation,
            live_allocations: self.cx.registry.records(),
            violations: self.cx.reports.violations().to_vec(),
            dropped_violations: self.cx.reports.dropped(),
        }
    }

    pub fn set_mode(&mut self, mode: MonitorMode) {
        debug!("monitor mode: {mode:?}");
        self.cx.mode = mode;
    }

    #[must_use]
    pub fn config(&self) -> &RedzoneConfig {
        &self.config
    }

    #[must_use]
    pub fn context(&self) -> &EngineContext {
        &self.cx
    }

    pub fn context_mut(&mut self) -> &mut EngineContext {
        &mut self.cx
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.cx.registry
    }

    #[must_use]
    pub fn interceptor(&self) -> &AllocationInterceptor {
        &self.interceptor
    }

    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}

impl<H: Host> EventHandler for RedzoneRuntime<H> {
    type Error = RuntimeError<H>;

    fn handle(&mut self, event: Event<'_>) -> Result<Directive, Self::Error> {
        trace!("{event:?}");
        match event {
            Event::ProcessStart => self.on_start(),
            Event::ModuleLoaded(module) => {
                self.on_module_load(module)?;
            }
            Event::BlockTranslated(block) => {
                self.on_block(block);
            }
            Event::FunctionEntered {
                target,
                call,
                stash,
            } => *stash = self.on_call_entry(target, call),
            Event::FunctionExited {
                target,
                call,
                stash,
            } => self.on_call_exit(target, call, stash),
            Event::AccessCheck(check) => return Ok(self.on_check(check)),
            Event::ProcessExit => {
                self.on_exit();
            }
        }
        Ok(Directive::Continue)
    }
}

#[derive(Error, Debug)]
pub enum RuntimeError<H: Host> {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Host error: {0:?}")]
    Host(H::Error),
}
