//! # layout
//! The redzone layout decides how a requested size grows into the size that
//! is actually passed to the host allocator, how the user pointer relates to
//! the real base of the block, and it writes and clears the sentinel word in
//! the guard regions.
//!
//! ```text
//! base          user                      user + size
//!  |  pre guard  |       user region        |   post guard   |
//! ```
use core::ptr::write_bytes;

use log::trace;
use thiserror::Error;

use crate::{GuestAddr, WORD_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedzoneLayout {
    pre: usize,
    post: usize,
    sentinel: GuestAddr,
}

impl RedzoneLayout {
    /// Both sizes must be multiples of [`WORD_SIZE`], see
    /// [`crate::RedzoneConfig::layout`].
    #[must_use]
    pub const fn new(pre: usize, post: usize, sentinel: GuestAddr) -> Self {
        Self {
            pre,
            post,
            sentinel,
        }
    }

    #[must_use]
    pub const fn pre(&self) -> usize {
        self.pre
    }

    #[must_use]
    pub const fn post(&self) -> usize {
        self.post
    }

    #[must_use]
    pub const fn sentinel(&self) -> GuestAddr {
        self.sentinel
    }

    #[must_use]
    pub const fn is_sentinel(&self, word: GuestAddr) -> bool {
        word == self.sentinel
    }

    /// Rounds `size` up to the next multiple of the machine word.
    pub const fn round_up(size: usize) -> Result<usize, LayoutError> {
        match size.checked_add(WORD_SIZE - 1) {
            Some(s) => Ok(s & !(WORD_SIZE - 1)),
            None => Err(LayoutError::SizeOverflow(size)),
        }
    }

    /// The size of the whole block holding a user region of `rounded` bytes.
    pub const fn real_size(&self, rounded: usize) -> Result<usize, LayoutError> {
        match rounded.checked_add(self.pre + self.post) {
            Some(s) => Ok(s),
            None => Err(LayoutError::SizeOverflow(rounded)),
        }
    }

    /// Rounds a requested size and returns it with the real block size.
    pub fn sizes(&self, size: usize) -> Result<(usize, usize), LayoutError> {
        let rounded = Self::round_up(size)?;
        Ok((rounded, self.real_size(rounded)?))
    }

    #[must_use]
    pub const fn user_from_base(&self, base: GuestAddr) -> GuestAddr {
        base + self.pre
    }

    #[must_use]
    pub const fn base_from_user(&self, user: GuestAddr) -> GuestAddr {
        user - self.pre
    }

    /// Poisons both guards of a fresh block and returns the user pointer.
    ///
    /// # Safety
    /// `base` must be word aligned and point to at least
    /// `self.real_size(rounded)` writable bytes.
    pub unsafe fn guard(&self, base: GuestAddr, rounded: usize) -> GuestAddr {
        let user = self.user_from_base(base);
        unsafe {
            self.fill(base, self.pre);
            self.poison_post(user, rounded);
        }
        user
    }

    /// Writes the post guard behind a user region of `rounded` bytes.
    ///
    /// # Safety
    /// `user + rounded` must be word aligned and be followed by `self.post`
    /// writable bytes.
    pub unsafe fn poison_post(&self, user: GuestAddr, rounded: usize) {
        unsafe { self.fill(user + rounded, self.post) };
    }

    /// Zeroes the post guard behind a user region of `rounded` bytes.
    ///
    /// # Safety
    /// See [`RedzoneLayout::poison_post`].
    pub unsafe fn clear_post(&self, user: GuestAddr, rounded: usize) {
        let start = user + rounded;
        trace!("clear - start: {start:#x}, len: {:#x}", self.post);
        unsafe { write_bytes(start as *mut u8, 0, self.post) };
    }

    /// Poisons the whole block of a user region that is being released.
    ///
    /// # Safety
    /// `user` must be a live user pointer of this layout whose user region is
    /// `rounded` bytes long.
    pub unsafe fn poison_block(&self, user: GuestAddr, rounded: usize) {
        let base = self.base_from_user(user);
        unsafe { self.fill(base, self.pre + rounded + self.post) };
    }

    /// Zeroes every sentinel word in `[user + from, user + to)`, so memory the
    /// host allocator recycles from a poisoned block does not read as a
    /// redzone.
    ///
    /// # Safety
    /// The range must be word aligned, readable and writable.
    pub unsafe fn scrub(&self, user: GuestAddr, from: usize, to: usize) {
        let words = (user + from) as *mut GuestAddr;
        for i in 0..(to - from) / WORD_SIZE {
            unsafe {
                let word = words.add(i);
                if word.read_volatile() == self.sentinel {
                    word.write_volatile(0);
                }
            }
        }
    }

    /// # Safety
    /// `start` must be word aligned and `len` writable bytes long.
    unsafe fn fill(&self, start: GuestAddr, len: usize) {
        trace!("poison - start: {start:#x}, len: {len:#x}");
        let words = start as *mut GuestAddr;
        for i in 0..len / WORD_SIZE {
            unsafe { words.add(i).write_volatile(self.sentinel) };
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum LayoutError {
    #[error("Size overflow: {0:#x}")]
    SizeOverflow(usize),
}
