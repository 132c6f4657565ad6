//! # event
//! Everything the host tells the runtime arrives as one [`Event`]. The host
//! owns the dispatch loop; the runtime implements [`EventHandler`] and
//! answers each event with a [`Directive`].
use core::fmt::{self, Debug, Formatter};

use crate::{
    GuestAddr,
    host::{Directive, Instruction, ModuleInfo, WrapContext},
    interceptor::CallStash,
    monitor::CheckCall,
};

/// The kinds of events a runtime can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    ProcessStart,
    ModuleLoaded,
    BlockTranslated,
    FunctionEntered,
    FunctionExited,
    AccessCheck,
    ProcessExit,
}

/// A freshly translated basic block, before its first execution.
#[derive(Clone, Debug, Default)]
pub struct BasicBlock {
    pub tag: GuestAddr,
    pub instructions: Vec<Instruction>,
    /// The checks the host has to insert, each before the instruction at
    /// its `pc`.
    pub checks: Vec<CheckCall>,
}

impl BasicBlock {
    #[must_use]
    pub fn new(tag: GuestAddr, instructions: Vec<Instruction>) -> Self {
        Self {
            tag,
            instructions,
            checks: Vec::new(),
        }
    }
}

pub enum Event<'a> {
    ProcessStart,
    ModuleLoaded(&'a ModuleInfo),
    BlockTranslated(&'a mut BasicBlock),
    /// A wrapped function is about to run. The handler fills `stash`, the
    /// host keeps it for the matching [`Event::FunctionExited`].
    FunctionEntered {
        target: GuestAddr,
        call: &'a mut dyn WrapContext,
        stash: &'a mut CallStash,
    },
    FunctionExited {
        target: GuestAddr,
        call: &'a mut dyn WrapContext,
        stash: CallStash,
    },
    /// An inserted check is executing.
    AccessCheck(CheckCall),
    ProcessExit,
}

impl Event<'_> {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ProcessStart => EventKind::ProcessStart,
            Event::ModuleLoaded(_) => EventKind::ModuleLoaded,
            Event::BlockTranslated(_) => EventKind::BlockTranslated,
            Event::FunctionEntered { .. } => EventKind::FunctionEntered,
            Event::FunctionExited { .. } => EventKind::FunctionExited,
            Event::AccessCheck(_) => EventKind::AccessCheck,
            Event::ProcessExit => EventKind::ProcessExit,
        }
    }
}

impl Debug for Event<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Event::ModuleLoaded(module) => f.debug_tuple("ModuleLoaded").field(module).finish(),
            Event::BlockTranslated(block) => f
                .debug_struct("BlockTranslated")
                .field("tag", &block.tag)
                .finish_non_exhaustive(),
            Event::FunctionEntered { target, .. } => f
                .debug_struct("FunctionEntered")
                .field("target", target)
                .finish_non_exhaustive(),
            Event::FunctionExited { target, stash, .. } => f
                .debug_struct("FunctionExited")
                .field("target", target)
                .field("stash", stash)
                .finish_non_exhaustive(),
            Event::AccessCheck(check) => f.debug_tuple("AccessCheck").field(check).finish(),
            Event::ProcessStart | Event::ProcessExit => write!(f, "{:?}", self.kind()),
        }
    }
}

pub trait EventHandler {
    type Error;

    fn handle(&mut self, event: Event<'_>) -> Result<Directive, Self::Error>;
}
