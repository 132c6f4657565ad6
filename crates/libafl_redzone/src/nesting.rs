//! # nesting
//! Allocator entry points call each other (a `calloc` built on `malloc`, a
//! `realloc` that allocates), so only the outermost wrapped call may rewrite
//! arguments and return values. Every wrapped entry point shares one depth
//! counter: `enter` reports whether the call is the outermost one, `exit`
//! whether the outermost call is returning.
use log::warn;

#[derive(Debug, Default)]
pub struct NestingDepth {
    depth: usize,
}

impl NestingDepth {
    #[must_use]
    pub const fn new() -> Self {
        Self { depth: 0 }
    }

    /// Returns `true` on the transition from 0 to 1.
    pub fn enter(&mut self) -> bool {
        self.depth += 1;
        self.depth == 1
    }

    /// Returns `true` on the transition from 1 to 0.
    pub fn exit(&mut self) -> bool {
        if self.depth == 0 {
            warn!("exit of a wrapped call without a matching entry");
            return false;
        }
        self.depth -= 1;
        self.depth == 0
    }

    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }
}
