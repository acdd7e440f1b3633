//! # SPOS Demo Firmware
//!
//! Boots the kernel on a Cortex-M4 board with three autostart programs:
//!
//! | Program    | Behavior                                                   |
//! |------------|------------------------------------------------------------|
//! | `producer` | Allocates a shared mailbox and writes a counter into it    |
//! | `consumer` | Reads the mailbox whenever the producer is not writing     |
//! | `churn`    | Grows and shrinks private chunks on both heaps, then exits |
//!
//! `churn` falls off the end of its program, so the dispatcher trampoline
//! kills it and its memory is reclaimed.

#![no_std]
#![no_main]

use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU16, Ordering};

use cortex_m_rt::entry;
use panic_halt as _;

use spos::arch::cortex_m4::{self, CortexM4Port};
use spos::config::{EXTERNAL_HEAP_START, INTERNAL_HEAP_SIZE, INTERNAL_HEAP_START};
use spos::kernel::{HeapId, Kernel};
use spos::mem::{AllocStrategy, RamDriver};
use spos::process::Program;
use spos::strategies::SchedulingStrategy;

/// The board has no serial RAM fitted, so the external heap is emulated
/// with a smaller on-chip window.
const EXTERNAL_DEMO_SIZE: usize = 3 * 2 * 1024;

type Os = Kernel<CortexM4Port, RamDriver<INTERNAL_HEAP_SIZE>, RamDriver<EXTERNAL_DEMO_SIZE>>;

static mut OS: Option<Os> = None;

/// Mailbox address published by the producer; 0 until allocated.
static MAILBOX: AtomicU16 = AtomicU16::new(0);

fn os() -> &'static mut Os {
    // SAFETY: OS is initialized in `main` before any process runs, and
    // access is serialized by the kernel's critical sections.
    match unsafe { (*addr_of_mut!(OS)).as_mut() } {
        Some(os) => os,
        None => loop {
            cortex_m::asm::wfi();
        },
    }
}

// ---------------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------------

fn idle() {
    loop {
        cortex_m::asm::wfi();
    }
}

fn producer() {
    let Some(mailbox) = os().sh_malloc(HeapId::Internal, 4) else {
        return;
    };
    MAILBOX.store(mailbox, Ordering::Release);

    let mut counter: u32 = 0;
    loop {
        if os().sh_write(HeapId::Internal, mailbox, 0, &counter.to_le_bytes()) {
            counter = counter.wrapping_add(1);
        }
        os().yield_now();
    }
}

fn consumer() {
    let mut last = 0u32;
    loop {
        let mailbox = MAILBOX.load(Ordering::Acquire);
        let mut bytes = [0u8; 4];
        if mailbox != 0 && os().sh_read(HeapId::Internal, mailbox, 0, &mut bytes) {
            let value = u32::from_le_bytes(bytes);
            if value != last {
                last = value;
                log::trace!("consumer: {}", value);
            }
        }
        os().yield_now();
    }
}

fn churn() {
    for heap in [HeapId::Internal, HeapId::External] {
        let mut chunk = os().malloc(heap, 16);
        for size in [32, 8, 64, 4] {
            chunk = chunk.and_then(|addr| os().realloc(heap, addr, size));
        }
        if let Some(addr) = chunk {
            os().free(heap, addr);
        }
    }
    // A leaked chunk is reclaimed when the process ends.
    let _ = os().malloc(HeapId::External, 100);
}

const AUTOSTART: [Program; 3] = [producer, consumer, churn];

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    // Interrupts stay off until the first process is launched.
    cortex_m::interrupt::disable();

    let Some(mut cp) = cortex_m::Peripherals::take() else {
        loop {
            cortex_m::asm::wfi();
        }
    };

    cortex_m4::configure_systick(&mut cp.SYST);
    cortex_m4::set_interrupt_priorities();

    let created = Kernel::new(
        CortexM4Port::new(cp.SYST),
        RamDriver::new(INTERNAL_HEAP_START),
        RamDriver::new(EXTERNAL_HEAP_START),
    );
    let kernel = match created {
        // SAFETY: single-threaded boot; no process or handler runs yet.
        Ok(kernel) => unsafe { (*addr_of_mut!(OS)).insert(kernel) },
        Err(_) => loop {
            cortex_m::asm::wfi();
        },
    };

    kernel.init_heaps();
    kernel.set_allocation_strategy(HeapId::External, AllocStrategy::NextFit);
    kernel.set_scheduling_strategy(SchedulingStrategy::RoundRobin);
    kernel.init_scheduler(idle, &AUTOSTART);

    let sp = kernel.start();
    let psp = kernel
        .process(kernel.current())
        .map_or(core::ptr::null(), |p| p.stack.0[sp..].as_ptr() as *const u32);

    unsafe {
        cortex_m4::install(kernel);
        cortex_m4::launch(psp)
    }
}
