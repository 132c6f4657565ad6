/*!
A redzone heap sanitizer runtime for binary-instrumentation hosts.

The runtime wraps the allocator entry points of the monitored program so
that every live allocation is flanked by guard regions filled with a
sentinel word, and it attaches a check to every memory operand of every
translated basic block. At run time a check reads the word at the
accessed address; finding the sentinel means the program touched a
redzone or freed memory.

The instrumentation engine itself (block translation, symbol resolution,
function wrapping, machine context access) is supplied by the embedder
through the [`host::Host`] trait. The runtime talks to it only through
that trait and through the [`event::Event`]s the embedder delivers.

The runtime keeps its state in one [`context::EngineContext`] without
internal locking. It is meant for single-threaded targets; a
multi-threaded embedder has to keep one runtime per thread.
*/

#![deny(rustdoc::broken_intra_doc_links)]
#![allow(
    clippy::unreadable_literal,
    clippy::cast_precision_loss,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]
#![cfg_attr(
    not(test),
    warn(
        missing_debug_implementations,
        trivial_numeric_casts,
        unused_extern_crates,
        unused_import_braces,
        unused_qualifications,
    )
)]

pub mod config;
pub mod context;
pub mod errors;
pub mod event;
pub mod host;
pub mod interceptor;
pub mod layout;
pub mod monitor;
pub mod nesting;
pub mod registry;
pub mod runtime;

/// An address in the monitored program.
pub type GuestAddr = usize;

/// The width of one machine word, the unit of rounding and probing.
pub const WORD_SIZE: usize = size_of::<GuestAddr>();

/// Rounds `addr` down to the previous machine word boundary.
#[must_use]
#[inline]
pub const fn align_down(addr: GuestAddr) -> GuestAddr {
    addr & !(WORD_SIZE - 1)
}

pub use config::{MonitorMode, RedzoneConfig};
pub use context::EngineContext;
pub use errors::{AccessCounters, AccessKind, Violation};
pub use event::{Event, EventHandler, EventKind};
pub use host::{Directive, Host, WrapContext};
pub use runtime::{RedzoneRuntime, RuntimeError, Summary};
