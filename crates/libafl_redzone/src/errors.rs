//! Violations the runtime can observe, the counters kept about them and the
//! bounded list of reports collected during a run.
//!
//! None of these are ever raised into the monitored program. They are
//! logged when they happen and kept for the exit summary.
use core::fmt::{self, Display, Formatter};

use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::GuestAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Write,
}

impl Display for AccessKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Read => f.write_str("read"),
            AccessKind::Write => f.write_str("write"),
        }
    }
}

/// The allocator operation an unknown pointer was passed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointerOperation {
    Free,
    Resize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Violation {
    /// The host allocator returned null.
    AllocationFailure { size: usize },
    /// `free` or `realloc` of a pointer that is not live.
    UnknownPointerOperation {
        operation: PointerOperation,
        ptr: GuestAddr,
    },
    /// Reading the accessed word faulted.
    InaccessibleAccess {
        access: AccessKind,
        pc: GuestAddr,
        addr: GuestAddr,
    },
    /// The accessed word holds the sentinel.
    SentinelViolation {
        access: AccessKind,
        pc: GuestAddr,
        addr: GuestAddr,
        stack: bool,
    },
}

impl Violation {
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Violation::AllocationFailure { .. } => "allocation failure",
            Violation::UnknownPointerOperation {
                operation: PointerOperation::Free,
                ..
            } => "free of unknown pointer",
            Violation::UnknownPointerOperation {
                operation: PointerOperation::Resize,
                ..
            } => "resize of unknown pointer",
            Violation::InaccessibleAccess {
                access: AccessKind::Read,
                ..
            } => "inaccessible read",
            Violation::InaccessibleAccess {
                access: AccessKind::Write,
                ..
            } => "inaccessible write",
            Violation::SentinelViolation { stack: true, .. } => "stack sentinel access",
            Violation::SentinelViolation { stack: false, .. } => "heap sentinel access",
        }
    }

    /// Whether this is a sentinel hit outside the stack window.
    #[must_use]
    pub fn is_heap_sentinel(&self) -> bool {
        matches!(self, Violation::SentinelViolation { stack: false, .. })
    }
}

impl Display for Violation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())?;
        match self {
            Violation::AllocationFailure { size } => write!(f, " of size {size:#x}"),
            Violation::UnknownPointerOperation { ptr, .. } => write!(f, " {ptr:#x}"),
            Violation::InaccessibleAccess { pc, addr, .. }
            | Violation::SentinelViolation { pc, addr, .. } => {
                write!(f, " at {pc:#x}, accessed address {addr:#x}")
            }
        }
    }
}

/// Read and write violation counts. Both only ever grow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCounters {
    pub reads: u64,
    pub writes: u64,
}

impl AccessCounters {
    pub fn count(&mut self, access: AccessKind) {
        match access {
            AccessKind::Read => self.reads += 1,
            AccessKind::Write => self.writes += 1,
        }
    }
}

/// The violations of a run, the first `capacity` of them in full.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Reports {
    capacity: usize,
    violations: Vec<Violation>,
    dropped: u64,
}

impl Reports {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            violations: Vec::new(),
            dropped: 0,
        }
    }

    /// Logs `violation` at a level matching its severity and keeps it.
    pub fn report(&mut self, violation: Violation) {
        match violation {
            Violation::SentinelViolation { stack: true, .. }
            | Violation::UnknownPointerOperation { .. }
            | Violation::AllocationFailure { .. } => warn!("{violation}"),
            Violation::SentinelViolation { stack: false, .. }
            | Violation::InaccessibleAccess { .. } => error!("{violation}"),
        }
        if self.violations.len() < self.capacity {
            self.violations.push(violation);
        } else {
            self.dropped += 1;
        }
    }

    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// The count of violations that did not fit.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn clear(&mut self) {
        self.violations.clear();
        self.dropped = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessCounters, AccessKind, PointerOperation, Reports, Violation};

    #[test]
    fn test_reports_capacity() {
        let mut reports = Reports::new(1);
        reports.report(Violation::AllocationFailure { size: 0x10 });
        reports.report(Violation::UnknownPointerOperation {
            operation: PointerOperation::Free,
            ptr: 0x1234,
        });
        assert_eq!(reports.len(), 1);
        assert_eq!(reports.dropped(), 1);
        reports.clear();
        assert!(reports.is_empty());
    }

    #[test]
    fn test_counters() {
        let mut counters = AccessCounters::default();
        counters.count(AccessKind::Read);
        counters.count(AccessKind::Write);
        counters.count(AccessKind::Write);
        assert_eq!(counters, AccessCounters { reads: 1, writes: 2 });
    }

    #[test]
    fn test_display() {
        let violation = Violation::SentinelViolation {
            access: AccessKind::Write,
            pc: 0x401000,
            addr: 0x2010,
            stack: false,
        };
        assert!(violation.is_heap_sentinel());
        assert_eq!(
            violation.to_string(),
            "heap sentinel access at 0x401000, accessed address 0x2010"
        );
    }
}
