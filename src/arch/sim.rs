//! # Hosted Port
//!
//! A [`Port`] for running the kernel without hardware. The timer interrupt
//! becomes an explicit `Kernel::tick()` call, yields dispatch inline, and
//! faults are recorded instead of being printed on a display.
//!
//! Process stacks are prepared with the same Cortex-M frame as on target,
//! using fixed placeholder addresses for the trampoline and exit hook, so
//! stack checksums behave exactly as they would on hardware.

use super::{init_exception_frame, Port};
use crate::error::Fault;
use crate::process::Stack;

/// Placeholder entry address (Thumb bit set) written into new frames.
pub const SIM_ENTRY: u32 = 0x0000_0101;

/// Placeholder return address written into new frames.
pub const SIM_EXIT: u32 = 0x0000_0201;

/// Number of faults retained by [`SimPort`]; older ones are overwritten.
pub const FAULT_LOG_LEN: usize = 16;

/// Hosted platform port.
#[derive(Debug)]
pub struct SimPort {
    irq_enabled: bool,
    switch_requests: u32,
    faults: [Option<Fault>; FAULT_LOG_LEN],
    fault_count: usize,
}

impl SimPort {
    pub const fn new() -> Self {
        Self {
            irq_enabled: true,
            switch_requests: 0,
            faults: [None; FAULT_LOG_LEN],
            fault_count: 0,
        }
    }

    /// Whether the scheduling timer interrupt is currently unmasked.
    pub fn scheduler_irq_enabled(&self) -> bool {
        self.irq_enabled
    }

    /// Number of yields / self-kills that requested a switch.
    pub fn switch_requests(&self) -> u32 {
        self.switch_requests
    }

    /// Total faults reported since creation.
    pub fn fault_count(&self) -> usize {
        self.fault_count
    }

    /// Most recently reported fault.
    pub fn last_fault(&self) -> Option<Fault> {
        if self.fault_count == 0 {
            return None;
        }
        self.faults[(self.fault_count - 1) % FAULT_LOG_LEN]
    }

    /// Retained faults, oldest first.
    pub fn faults(&self) -> impl Iterator<Item = Fault> + '_ {
        let retained = self.fault_count.min(FAULT_LOG_LEN);
        let first = self.fault_count - retained;
        (first..self.fault_count).filter_map(move |i| self.faults[i % FAULT_LOG_LEN])
    }

    pub fn clear_faults(&mut self) {
        self.faults = [None; FAULT_LOG_LEN];
        self.fault_count = 0;
    }
}

impl Default for SimPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for SimPort {
    fn set_scheduler_irq(&mut self, enabled: bool) {
        self.irq_enabled = enabled;
    }

    fn pend_switch(&mut self) -> bool {
        self.switch_requests += 1;
        true
    }

    fn init_stack(&self, stack: &mut Stack) -> usize {
        init_exception_frame(stack, SIM_ENTRY, SIM_EXIT)
    }

    fn report(&mut self, fault: &Fault) {
        self.faults[self.fault_count % FAULT_LOG_LEN] = Some(*fault);
        self.fault_count += 1;
    }

    fn halt(&mut self, fault: &Fault) -> ! {
        panic!("system halted: {}", fault);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_log_wraps() {
        let mut port = SimPort::new();
        assert_eq!(port.last_fault(), None);

        for addr in 0..(FAULT_LOG_LEN as u16 + 3) {
            port.report(&Fault::InvalidAddress { addr });
        }
        assert_eq!(port.fault_count(), FAULT_LOG_LEN + 3);
        assert_eq!(
            port.last_fault(),
            Some(Fault::InvalidAddress {
                addr: FAULT_LOG_LEN as u16 + 2
            })
        );
        let oldest = port.faults().next();
        assert_eq!(oldest, Some(Fault::InvalidAddress { addr: 3 }));
        assert_eq!(port.faults().count(), FAULT_LOG_LEN);
    }

    #[test]
    #[should_panic(expected = "system halted")]
    fn test_halt_panics() {
        let mut port = SimPort::new();
        port.halt(&Fault::StackCorrupted {
            pid: 1,
            expected: 0,
            found: 1,
        });
    }
}
