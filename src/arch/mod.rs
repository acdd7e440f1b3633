//! # Architecture Abstraction Layer
//!
//! Provides the hardware boundary for the kernel. The [`Port`] trait is
//! everything the portable code needs from a platform: gating the
//! scheduler interrupt, pending a context switch, preparing a fresh process
//! stack and surfacing faults to the operator.
//!
//! - [`cortex_m4`]: the real port (SysTick + PendSV), ARM targets only.
//! - [`sim`]: a hosted port where the timer interrupt is an explicit
//!   `Kernel::tick()` call.

#[cfg(target_arch = "arm")]
pub mod cortex_m4;
pub mod sim;

use crate::error::Fault;
use crate::process::Stack;

/// Platform services consumed by the [`Kernel`](crate::kernel::Kernel).
pub trait Port {
    /// Enable or disable the scheduling timer interrupt. Called only by the
    /// outermost critical-section enter/leave.
    fn set_scheduler_irq(&mut self, enabled: bool);

    /// Request a context switch on behalf of the running process.
    ///
    /// Returns `true` when the platform cannot defer the switch and the
    /// kernel must dispatch inline (hosted ports). Interrupt-driven ports
    /// pend the switch and return `false`; it happens as soon as the
    /// caller's instruction stream allows it.
    fn pend_switch(&mut self) -> bool;

    /// Lay out the initial context of a new process on `stack` so that the
    /// first resume enters the dispatcher trampoline.
    ///
    /// Returns the saved stack pointer as an offset into `stack`.
    fn init_stack(&self, stack: &mut Stack) -> usize;

    /// Surface a fault to the operator.
    fn report(&mut self, fault: &Fault);

    /// Stop the system after a halting fault.
    fn halt(&mut self, fault: &Fault) -> !;
}

/// Number of 32-bit words in a freshly prepared Cortex-M context:
/// R4–R11 saved by software plus the 8-word hardware exception frame.
pub const CONTEXT_WORDS: usize = 16;

/// xPSR value with only the Thumb bit set.
const INITIAL_XPSR: u32 = 0x0100_0000;

/// Build the initial Cortex-M context at the top of `stack`.
///
/// ## Stack Layout (top = high address, growing down)
///
/// ```text
/// [Hardware stacked frame]
///   xPSR  (Thumb bit set)
///   PC    (entry)
///   LR    (exit)
///   R12, R3, R2, R1, R0 (0)
/// [Software saved context]
///   R11 .. R4 (0)              <- returned offset
/// ```
///
/// The frame is plain bytes so it can be prepared and checksummed on any host.
pub fn init_exception_frame(stack: &mut Stack, entry: u32, exit: u32) -> usize {
    let top = stack.0.len() & !0x07;
    let sp = top - CONTEXT_WORDS * 4;

    let mut words = [0u32; CONTEXT_WORDS];
    words[13] = exit;
    words[14] = entry;
    words[15] = INITIAL_XPSR;

    for (i, word) in words.iter().enumerate() {
        let at = sp + i * 4;
        stack.0[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }
    sp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::STACK_SIZE;

    fn word(stack: &Stack, at: usize) -> u32 {
        u32::from_le_bytes([stack.0[at], stack.0[at + 1], stack.0[at + 2], stack.0[at + 3]])
    }

    #[test]
    fn test_frame_layout() {
        let mut stack = Stack::new();
        stack.0.fill(0xAA);
        let sp = init_exception_frame(&mut stack, 0x0800_1235, 0x0800_2001);

        assert_eq!(sp, STACK_SIZE - 64);
        // Software-saved registers are zeroed.
        for i in 0..8 {
            assert_eq!(word(&stack, sp + i * 4), 0);
        }
        assert_eq!(word(&stack, sp + 13 * 4), 0x0800_2001);
        assert_eq!(word(&stack, sp + 14 * 4), 0x0800_1235);
        assert_eq!(word(&stack, sp + 15 * 4), INITIAL_XPSR);
        // Memory below the frame is untouched.
        assert_eq!(stack.0[sp - 1], 0xAA);
    }
}
