//! # interceptor
//! The interceptor wraps the allocator entry points of every loaded module.
//! Its before hooks grow the requested size by both redzones and translate
//! user pointers back into real bases; its after hooks poison the guards of
//! the returned block, hand the user pointer to the program and keep the
//! registry in step.
//!
//! Only the outermost of nested wrapped calls does any of this, see
//! [`crate::nesting`].
use core::hash::BuildHasherDefault;

use ahash::AHasher;
use hashbrown::HashMap;
use log::{debug, trace, warn};

use crate::{
    GuestAddr,
    config::RedzoneConfig,
    context::EngineContext,
    errors::{PointerOperation, Violation},
    host::{Host, ModuleInfo, WrapContext},
};

type Hasher = BuildHasherDefault<AHasher>;

/// The allocator entry points the interceptor knows how to wrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorFunction {
    /// `malloc(size)` and custom allocators of the same shape
    Malloc,
    /// `calloc(count, size)`
    Calloc,
    /// `realloc(ptr, size)`
    Realloc,
    /// `free(ptr)` and custom deallocators of the same shape
    Free,
}

const PLATFORM_FUNCTIONS: [(&str, AllocatorFunction); 4] = [
    ("malloc", AllocatorFunction::Malloc),
    ("calloc", AllocatorFunction::Calloc),
    ("realloc", AllocatorFunction::Realloc),
    ("free", AllocatorFunction::Free),
];

/// What a before hook leaves for its after hook.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CallStash {
    /// Nothing to do on return.
    #[default]
    Passthrough,
    /// Another wrapped call is active, leave this one alone.
    Nested,
    /// The size was grown by both redzones, guard the returned block.
    Allocate { requested: usize, rounded: usize },
    /// The size could not be grown; the host allocator was asked for
    /// `GuestAddr::MAX` bytes so that it fails.
    Oversized { requested: usize },
    /// A registered block is being resized; its post guard is cleared.
    Resize {
        old: GuestAddr,
        old_size: usize,
        requested: usize,
        rounded: usize,
    },
}

#[derive(Debug, Default)]
pub struct AllocationInterceptor {
    functions: HashMap<GuestAddr, AllocatorFunction, Hasher>,
}

impl AllocationInterceptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps the allocator entry points `module` provides: the configured
    /// custom allocators by symbol lookup, the platform allocator by export.
    /// Returns the count of newly wrapped functions.
    pub fn register<H: Host>(
        &mut self,
        host: &mut H,
        module: &ModuleInfo,
        config: &RedzoneConfig,
    ) -> Result<usize, H::Error> {
        let custom = config
            .custom_mallocs
            .iter()
            .map(|name| (name.as_str(), AllocatorFunction::Malloc))
            .chain(
                config
                    .custom_frees
                    .iter()
                    .map(|name| (name.as_str(), AllocatorFunction::Free)),
            );
        let targets = custom
            .filter_map(|(name, function)| {
                host.lookup_symbol(module, name)
                    .map(|addr| (name, function, addr))
            })
            .chain(PLATFORM_FUNCTIONS.iter().filter_map(|(name, function)| {
                host.resolve_export(module, name)
                    .map(|addr| (*name, *function, addr))
            }))
            .collect::<Vec<_>>();

        let mut wrapped = 0;
        for (name, function, addr) in targets {
            if self.functions.contains_key(&addr) {
                trace!("{name} at {addr:#x} is already wrapped");
                continue;
            }
            debug!("wrapping {name} ({function:?}) in {} at {addr:#x}", module.name);
            host.wrap(addr)?;
            self.functions.insert(addr, function);
            wrapped += 1;
        }
        Ok(wrapped)
    }

    #[must_use]
    pub fn function(&self, target: GuestAddr) -> Option<AllocatorFunction> {
        self.functions.get(&target).copied()
    }

    #[must_use]
    pub fn wrapped(&self) -> usize {
        self.functions.len()
    }

    /// The before hook of every wrapped function.
    pub fn before(
        cx: &mut EngineContext,
        function: AllocatorFunction,
        call: &mut dyn WrapContext,
    ) -> CallStash {
        if !cx.depth.enter() {
            trace!("{function:?} - nested, depth: {}", cx.depth.depth());
            cx.stats.nested_calls += 1;
            return CallStash::Nested;
        }
        match function {
            AllocatorFunction::Malloc => {
                let size = call.arg(0);
                trace!("malloc - size: {size:#x}");
                Self::grow(cx, call, 0, size)
            }
            AllocatorFunction::Calloc => Self::before_calloc(cx, call),
            AllocatorFunction::Realloc => Self::before_realloc(cx, call),
            AllocatorFunction::Free => {
                let ptr = call.arg(0);
                trace!("free - ptr: {ptr:#x}");
                if ptr != 0 {
                    Self::release(cx, call, ptr, PointerOperation::Free);
                }
                CallStash::Passthrough
            }
        }
    }

    /// The after hook of every wrapped function.
    pub fn after(
        cx: &mut EngineContext,
        function: AllocatorFunction,
        call: &mut dyn WrapContext,
        stash: CallStash,
    ) {
        if !cx.depth.exit() {
            return;
        }
        trace!("{function:?} - returned {:#x}, stash: {stash:?}", call.retval());
        match stash {
            CallStash::Passthrough | CallStash::Nested => (),
            CallStash::Allocate { requested, rounded } => {
                Self::guard_returned(cx, call, requested, rounded);
            }
            CallStash::Oversized { requested } => {
                if call.retval() == 0 {
                    Self::allocation_failed(cx, requested);
                } else {
                    warn!("{function:?} - oversized request of {requested:#x} succeeded unguarded");
                }
            }
            CallStash::Resize {
                old,
                old_size,
                requested,
                rounded,
            } => Self::after_resize(cx, call, old, old_size, requested, rounded),
        }
    }

    /// Rewrites the size argument at `index` to include both redzones.
    fn grow(
        cx: &mut EngineContext,
        call: &mut dyn WrapContext,
        index: usize,
        size: usize,
    ) -> CallStash {
        match cx.layout.sizes(size) {
            Ok((rounded, real)) => {
                debug!("size {size:#x} rounded up to {rounded:#x}, requesting {real:#x}");
                call.set_arg(index, real);
                CallStash::Allocate {
                    requested: size,
                    rounded,
                }
            }
            Err(e) => {
                warn!("{e}");
                call.set_arg(index, GuestAddr::MAX);
                CallStash::Oversized { requested: size }
            }
        }
    }

    fn before_calloc(cx: &mut EngineContext, call: &mut dyn WrapContext) -> CallStash {
        let count = call.arg(0);
        let size = call.arg(1);
        trace!("calloc - count: {count:#x}, size: {size:#x}");
        let Some(total) = count.checked_mul(size) else {
            debug!("calloc - {count:#x} * {size:#x} overflows, passing through");
            return CallStash::Passthrough;
        };
        call.set_arg(0, 1);
        Self::grow(cx, call, 1, total)
    }

    fn before_realloc(cx: &mut EngineContext, call: &mut dyn WrapContext) -> CallStash {
        let ptr = call.arg(0);
        let size = call.arg(1);
        trace!("realloc - ptr: {ptr:#x}, size: {size:#x}");

        if ptr == 0 && size == 0 {
            return CallStash::Passthrough;
        }
        if ptr == 0 {
            return Self::grow(cx, call, 1, size);
        }
        if size == 0 {
            if Self::release(cx, call, ptr, PointerOperation::Resize) {
                return CallStash::Passthrough;
            }
            // Now realloc(NULL, 0), which may still hand out a block.
            return Self::grow(cx, call, 1, 0);
        }

        let Some(old_size) = cx.registry.lookup(ptr) else {
            Self::unknown_pointer(cx, PointerOperation::Resize, ptr);
            return CallStash::Passthrough;
        };
        let base = cx.layout.base_from_user(ptr);
        call.set_arg(0, base);
        match cx.layout.sizes(size) {
            Ok((rounded, real)) => {
                // A grown block must not inherit the old guard as data.
                unsafe { cx.layout.clear_post(ptr, old_size) };
                call.set_arg(1, real);
                debug!("realloc - base: {base:#x}, requesting {real:#x}");
                CallStash::Resize {
                    old: ptr,
                    old_size,
                    requested: size,
                    rounded,
                }
            }
            Err(e) => {
                warn!("{e}");
                call.set_arg(1, GuestAddr::MAX);
                CallStash::Oversized { requested: size }
            }
        }
    }

    /// Poisons and forgets a registered block and passes its real base on.
    /// Unknown pointers are replaced by null. Returns whether `ptr` was live.
    fn release(
        cx: &mut EngineContext,
        call: &mut dyn WrapContext,
        ptr: GuestAddr,
        operation: PointerOperation,
    ) -> bool {
        match cx.registry.untrack(ptr) {
            Ok(record) => {
                let base = cx.layout.base_from_user(ptr);
                unsafe { cx.layout.poison_block(ptr, record.size) };
                debug!("{operation:?} - releasing {ptr:#x} via base {base:#x}");
                call.set_arg(0, base);
                cx.stats.frees += 1;
                true
            }
            Err(_) => {
                call.set_arg(0, 0);
                Self::unknown_pointer(cx, operation, ptr);
                false
            }
        }
    }

    fn guard_returned(
        cx: &mut EngineContext,
        call: &mut dyn WrapContext,
        requested: usize,
        rounded: usize,
    ) {
        let base = call.retval();
        if base == 0 {
            Self::allocation_failed(cx, requested);
            return;
        }
        let user = unsafe {
            let user = cx.layout.guard(base, rounded);
            cx.layout.scrub(user, 0, rounded);
            user
        };
        debug!("allocated {user:#x} (base {base:#x}), size: {rounded:#x}");
        call.set_retval(user);
        if let Err(e) = cx.registry.track(user, rounded) {
            warn!("{e}");
        }
        cx.stats.allocations += 1;
    }

    fn after_resize(
        cx: &mut EngineContext,
        call: &mut dyn WrapContext,
        old: GuestAddr,
        old_size: usize,
        requested: usize,
        rounded: usize,
    ) {
        let base = call.retval();
        if base == 0 {
            // The old block is still live, give it its guard back.
            unsafe { cx.layout.poison_post(old, old_size) };
            Self::allocation_failed(cx, requested);
            return;
        }
        let user = unsafe {
            let user = cx.layout.guard(base, rounded);
            if rounded > old_size {
                cx.layout.scrub(user, old_size, rounded);
            }
            user
        };
        debug!("resized {old:#x} to {user:#x}, size: {rounded:#x}");
        call.set_retval(user);
        cx.registry.replace(old, user, rounded);
        cx.stats.resizes += 1;
    }

    fn allocation_failed(cx: &mut EngineContext, size: usize) {
        cx.stats.failed_allocations += 1;
        cx.reports.report(Violation::AllocationFailure { size });
    }

    fn unknown_pointer(cx: &mut EngineContext, operation: PointerOperation, ptr: GuestAddr) {
        cx.stats.unknown_pointers += 1;
        cx.reports
            .report(Violation::UnknownPointerOperation { operation, ptr });
    }
}
