//! # registry
//! The registry maps every live user pointer to the rounded size of its user
//! region. It is the only record of which pointers the monitored program
//! currently owns; a pointer missing here is never handed to the host
//! allocator with a guessed guard offset.
use core::hash::BuildHasherDefault;

use ahash::AHasher;
use hashbrown::HashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::GuestAddr;

type Hasher = BuildHasherDefault<AHasher>;

/// A live allocation as the monitored program sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub user: GuestAddr,
    pub size: usize,
}

#[derive(Debug, Default)]
pub struct Registry {
    allocations: HashMap<GuestAddr, usize, Hasher>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            allocations: HashMap::with_capacity_and_hasher(256, Hasher::default()),
        }
    }

    /// Records a fresh allocation. The pointer must not be live already.
    pub fn track(&mut self, user: GuestAddr, size: usize) -> Result<(), RegistryError> {
        debug!("track - user: {user:#x}, size: {size:#x}");
        if let Some(old) = self.allocations.insert(user, size) {
            // Keep the newer record, the host allocator handed the block out again.
            Err(RegistryError::TrackingConflict(user, old))?;
        }
        Ok(())
    }

    pub fn untrack(&mut self, user: GuestAddr) -> Result<AllocationRecord, RegistryError> {
        debug!("untrack - user: {user:#x}");
        let size = self
            .allocations
            .remove(&user)
            .ok_or(RegistryError::AllocationNotFound(user))?;
        Ok(AllocationRecord { user, size })
    }

    /// Replaces the record of `old` by a record of `new`, as after a resize.
    pub fn replace(&mut self, old: GuestAddr, new: GuestAddr, size: usize) {
        debug!("replace - old: {old:#x}, new: {new:#x}, size: {size:#x}");
        self.allocations.remove(&old);
        self.allocations.insert(new, size);
    }

    #[must_use]
    pub fn lookup(&self, user: GuestAddr) -> Option<usize> {
        self.allocations.get(&user).copied()
    }

    #[must_use]
    pub fn contains(&self, user: GuestAddr) -> bool {
        self.allocations.contains_key(&user)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// All live allocations, sorted by address.
    #[must_use]
    pub fn records(&self) -> Vec<AllocationRecord> {
        let mut records = self
            .allocations
            .iter()
            .map(|(user, size)| AllocationRecord {
                user: *user,
                size: *size,
            })
            .collect::<Vec<_>>();
        records.sort_by_key(|r| r.user);
        records
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum RegistryError {
    #[error("Allocation not found: {0:#x}")]
    AllocationNotFound(GuestAddr),
    #[error("Tracking conflict: {0:#x}, stale size: {1:#x}")]
    TrackingConflict(GuestAddr, usize),
}
