//! # Synchronization Primitives
//!
//! The kernel's only lock: a nesting counter that masks the scheduling
//! timer interrupt. While the counter is non-zero no preemption happens, so
//! read-modify-write sequences on the process table and the allocation maps
//! are atomic with respect to other processes.
//!
//! Only the outermost `enter` masks the interrupt and only the outermost
//! `leave` unmasks it, so functions that protect themselves can be freely
//! called from other critical sections.

use crate::arch::Port;
use crate::config::MAX_CRITICAL_DEPTH;
use crate::error::Fault;

/// Execute a closure with all interrupts disabled.
///
/// Used for the few instructions that touch the nesting counter itself, so
/// the timer ISR never observes a half-updated depth.
#[inline]
pub fn interrupt_free<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    critical_section::with(|_cs| f())
}

/// Nesting counter gating the scheduler interrupt.
#[derive(Debug, Default)]
pub struct CriticalSection {
    depth: u8,
}

impl CriticalSection {
    pub const fn new() -> Self {
        Self { depth: 0 }
    }

    /// Current nesting depth; 0 means preemption is enabled.
    #[inline]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.depth > 0
    }

    /// Enter a critical section, masking the scheduler on the outermost entry.
    ///
    /// At [`MAX_CRITICAL_DEPTH`] the call is refused and the depth is left
    /// unchanged.
    pub fn enter(&mut self, port: &mut impl Port) -> Result<(), Fault> {
        interrupt_free(|| {
            if self.depth == MAX_CRITICAL_DEPTH {
                return Err(Fault::CriticalSectionOverflow);
            }
            if self.depth == 0 {
                port.set_scheduler_irq(false);
            }
            self.depth += 1;
            Ok(())
        })
    }

    /// Leave a critical section, unmasking the scheduler on the outermost exit.
    pub fn leave(&mut self, port: &mut impl Port) -> Result<(), Fault> {
        interrupt_free(|| {
            if self.depth == 0 {
                return Err(Fault::CriticalSectionUnderflow);
            }
            self.depth -= 1;
            if self.depth == 0 {
                port.set_scheduler_irq(true);
            }
            Ok(())
        })
    }

    /// Drop every nesting level at once and unmask the scheduler.
    ///
    /// Returns the depth to hand back to [`restore`](Self::restore). Used
    /// when a process gives up the CPU from inside a critical section.
    pub fn suspend(&mut self, port: &mut impl Port) -> u8 {
        interrupt_free(|| {
            let depth = self.depth;
            if depth > 0 {
                self.depth = 0;
                port.set_scheduler_irq(true);
            }
            depth
        })
    }

    /// Re-establish a depth previously returned by [`suspend`](Self::suspend).
    pub fn restore(&mut self, depth: u8, port: &mut impl Port) {
        interrupt_free(|| {
            if depth > 0 && self.depth == 0 {
                port.set_scheduler_irq(false);
            }
            self.depth = depth;
        })
    }
}
