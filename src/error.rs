//! # Faults
//!
//! Protocol violations and invariant corruption detected by the kernel.
//!
//! Resource exhaustion (heap full, process table full) is *not* a fault:
//! those paths return `None`/`false` and are part of the normal contract.
//! A [`Fault`] always means a caller bug or memory corruption and is routed
//! to the platform's reporting hook by the [`Kernel`](crate::kernel::Kernel).

use core::fmt;

use crate::mem::MemAddr;
use crate::process::ProcessId;

/// How the kernel reacts once a fault has been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The offending call aborts its effect and the system keeps running.
    Recoverable,
    /// Continuing could execute corrupted state; the system must stop.
    Halting,
}

/// A fatal condition raised by the scheduler, the critical-section counter
/// or one of the heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `free`/`realloc` on a chunk owned by another process.
    NotOwner {
        addr: MemAddr,
        owner: ProcessId,
        caller: ProcessId,
    },
    /// Private `free`/`realloc` called on a shared-memory chunk.
    SharedViaPrivate { addr: MemAddr },
    /// A shared-memory operation hit private or free memory.
    NotShared { addr: MemAddr },
    /// The address does not resolve to any chunk of the heap.
    InvalidAddress { addr: MemAddr },
    /// `sh_read` past the end of a shared chunk.
    ReadViolation {
        addr: MemAddr,
        offset: u16,
        length: u16,
        size: u16,
    },
    /// `sh_write` past the end of a shared chunk.
    WriteViolation {
        addr: MemAddr,
        offset: u16,
        length: u16,
        size: u16,
    },
    /// A process stack no longer matches the checksum recorded when the
    /// process was switched out.
    StackCorrupted {
        pid: ProcessId,
        expected: u8,
        found: u8,
    },
    /// `enter` at the maximum nesting depth.
    CriticalSectionOverflow,
    /// `leave` without a matching `enter`.
    CriticalSectionUnderflow,
    /// A memory driver window too small or reaching past the address space.
    InvalidHeapLayout,
}

impl Fault {
    pub const fn severity(&self) -> Severity {
        match self {
            Fault::StackCorrupted { .. } => Severity::Halting,
            _ => Severity::Recoverable,
        }
    }

    #[inline]
    pub const fn is_halting(&self) -> bool {
        matches!(self.severity(), Severity::Halting)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Fault::NotOwner { addr, owner, caller } => write!(
                f,
                "not owner: chunk {:#06x} belongs to process {}, not {}",
                addr, owner, caller
            ),
            Fault::SharedViaPrivate { addr } => {
                write!(f, "shared chunk {:#06x} used through the private allocator", addr)
            }
            Fault::NotShared { addr } => write!(f, "{:#06x} is not shared memory", addr),
            Fault::InvalidAddress { addr } => write!(f, "invalid heap address {:#06x}", addr),
            Fault::ReadViolation {
                addr,
                offset,
                length,
                size,
            } => write!(
                f,
                "read violation: {}+{} exceeds {} bytes at {:#06x}",
                offset, length, size, addr
            ),
            Fault::WriteViolation {
                addr,
                offset,
                length,
                size,
            } => write!(
                f,
                "write violation: {}+{} exceeds {} bytes at {:#06x}",
                offset, length, size, addr
            ),
            Fault::StackCorrupted {
                pid,
                expected,
                found,
            } => write!(
                f,
                "invalid stack checksum for process {}: expected {:#04x}, found {:#04x}",
                pid, expected, found
            ),
            Fault::CriticalSectionOverflow => f.write_str("critical section overflow"),
            Fault::CriticalSectionUnderflow => f.write_str("critical section underflow"),
            Fault::InvalidHeapLayout => f.write_str("invalid heap layout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_stack_corruption_halts() {
        let corrupted = Fault::StackCorrupted {
            pid: 2,
            expected: 0x10,
            found: 0x11,
        };
        assert!(corrupted.is_halting());
        assert_eq!(Fault::CriticalSectionOverflow.severity(), Severity::Recoverable);
        assert_eq!(
            Fault::NotOwner {
                addr: 0x200,
                owner: 1,
                caller: 2
            }
            .severity(),
            Severity::Recoverable
        );
    }

    #[test]
    fn test_display_mentions_address() {
        let msg = Fault::NotShared { addr: 0x0123 }.to_string();
        assert!(msg.contains("0x0123"), "{}", msg);
    }
}
