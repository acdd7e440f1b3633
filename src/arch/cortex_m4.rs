//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements context switching via PendSV, SysTick timer configuration,
//! process launch and the global kernel hook used by the exception handlers.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): Used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): Used by processes in Thread mode
//!
//! On exception entry, the hardware automatically stacks R0–R3, R12, LR, PC,
//! and xPSR onto the process stack. The PendSV handler saves and restores
//! R4–R11, converts the PSP to an offset into the process's stack array and
//! lets the kernel pick the next process.
//!
//! ## Preemption Gating
//!
//! The critical section masks only the SysTick interrupt (TICKINT), so a
//! voluntary yield can still pend PendSV from inside one.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: Priority 0xFF (lowest)
//! - PendSV: Priority 0xFF (lowest), runs only when no other ISR is active

use core::arch::{asm, naked_asm};
use core::ptr::NonNull;

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};
use log::{error, warn};

use super::{init_exception_frame, Port};
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::error::Fault;
use crate::kernel::Kernel;
use crate::mem::MemDriver;
use crate::process::{Program, Stack};

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// The hardware port. Owns the SysTick peripheral.
pub struct CortexM4Port {
    syst: SYST,
}

impl CortexM4Port {
    pub fn new(syst: SYST) -> Self {
        Self { syst }
    }
}

impl Port for CortexM4Port {
    fn set_scheduler_irq(&mut self, enabled: bool) {
        if enabled {
            self.syst.enable_interrupt();
        } else {
            self.syst.disable_interrupt();
        }
    }

    fn pend_switch(&mut self) -> bool {
        SCB::set_pendsv();
        false
    }

    fn init_stack(&self, stack: &mut Stack) -> usize {
        init_exception_frame(
            stack,
            dispatcher_trampoline as usize as u32,
            process_exit as usize as u32,
        )
    }

    fn report(&mut self, fault: &Fault) {
        warn!("fault: {}", fault);
    }

    fn halt(&mut self, fault: &Fault) -> ! {
        error!("halted: {}", fault);
        cortex_m::interrupt::disable();
        loop {
            cortex_m::asm::wfi();
        }
    }
}

// ---------------------------------------------------------------------------
// Global kernel hook
// ---------------------------------------------------------------------------

/// What the exception handlers and the trampoline need from the kernel,
/// independent of its heap driver types.
pub trait Dispatch {
    /// Save `psp` as the outgoing context and return the PSP to restore.
    fn switch_psp(&mut self, psp: *mut u32) -> *mut u32;

    /// Program of the running process.
    fn current_program(&self) -> Option<Program>;

    /// Kill the running process. Does not return on hardware.
    fn exit(&mut self);
}

impl<I: MemDriver, E: MemDriver> Dispatch for Kernel<CortexM4Port, I, E> {
    fn switch_psp(&mut self, psp: *mut u32) -> *mut u32 {
        let base = stack_base(self, self.current());
        let next_sp = self.switch_context(psp as usize - base);
        (stack_base(self, self.current()) + next_sp) as *mut u32
    }

    fn current_program(&self) -> Option<Program> {
        Kernel::current_program(self)
    }

    fn exit(&mut self) {
        Kernel::exit(self)
    }
}

fn stack_base<I: MemDriver, E: MemDriver>(kernel: &Kernel<CortexM4Port, I, E>, pid: usize) -> usize {
    kernel
        .process(pid)
        .map_or(0, |p| p.stack.0.as_ptr() as usize)
}

/// Kernel reached by PendSV and the trampoline.
///
/// # Safety
/// Set once by [`install`] before the scheduler starts, then only read.
static mut KERNEL: Option<NonNull<dyn Dispatch>> = None;

/// Publish the kernel to the exception handlers.
///
/// # Safety
/// `kernel` must stay valid and must not move for the rest of execution.
/// Must be called before [`launch`].
pub unsafe fn install(kernel: &'static mut dyn Dispatch) {
    KERNEL = Some(NonNull::from(kernel));
}

/// # Safety
/// Called from handler or process context after [`install`].
unsafe fn kernel() -> Option<&'static mut dyn Dispatch> {
    (*core::ptr::addr_of!(KERNEL)).map(|mut k| k.as_mut())
}

// ---------------------------------------------------------------------------
// Timer and priorities
// ---------------------------------------------------------------------------

/// Configure the SysTick timer for the scheduler tick.
///
/// Sets up SysTick to fire at `TICK_HZ` frequency using the processor
/// clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        let val = val | (0xFF << 16) | (0xFF << 24);
        core::ptr::write_volatile(shpr3, val);
    }
}

// ---------------------------------------------------------------------------
// Process entry and exit
// ---------------------------------------------------------------------------

/// First code every process executes: run its program, then kill it.
extern "C" fn dispatcher_trampoline() -> ! {
    unsafe {
        if let Some(program) = kernel().and_then(|k| k.current_program()) {
            program();
        }
    }
    process_exit()
}

/// Landing pad if a frame's return address is ever taken.
extern "C" fn process_exit() -> ! {
    unsafe {
        if let Some(k) = kernel() {
            k.exit();
        }
    }
    loop {
        cortex_m::asm::wfi();
    }
}

/// Start the first process by switching to PSP and branching to Thread mode.
///
/// `psp` points at the software-saved part of a frame built by
/// [`init_exception_frame`].
///
/// # Safety
/// Must only be called once, after [`install`], with a prepared frame.
pub unsafe fn launch(psp: *const u32) -> ! {
    asm!(
        // Skip the 8 software-saved registers
        "adds r0, #32",
        "msr psp, r0",

        // Thread mode uses PSP (CONTROL.SPSEL = 1)
        "movs r0, #2",
        "msr control, r0",
        "isb",

        // Unwind the hardware frame by hand
        "pop {{r0-r3, r12}}",
        "pop {{r4}}",          // LR
        "pop {{r5}}",          // PC
        "pop {{r6}}",          // xPSR
        "mov lr, r4",

        "cpsie i",
        "bx r5",

        in("r0") psp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

/// PendSV exception handler: performs the context switch.
///
/// 1. Save R4–R11 onto the current process's stack (PSP)
/// 2. Hand the PSP to the kernel, which returns the next process's PSP
/// 3. Restore R4–R11 from the new stack
/// 4. Return from exception on the process stack
///
/// # Safety
/// Naked function entered directly by the NVIC.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {switch}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "ldr r0, =0xFFFFFFFD",
        "bx r0",
        switch = sym pendsv_switch,
    );
}

/// # Safety
/// Called from `PendSV` only.
unsafe extern "C" fn pendsv_switch(psp: *mut u32) -> *mut u32 {
    match kernel() {
        Some(k) => k.switch_psp(psp),
        None => psp,
    }
}

/// SysTick exception handler. Masked by the critical section, so every
/// delivered tick can switch immediately.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    SCB::set_pendsv();
}
