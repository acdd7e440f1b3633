//! # SPOS — Small Preemptive Operating System
//!
//! A tick-driven multitasking kernel for single-core microcontrollers with
//! a nibble-mapped heap allocator and reader/writer-locked shared memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                       Programs                          │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │   exec · kill · yield · malloc · realloc · sh_*         │
//! ├──────────────┬─────────────────────┬───────────────────┤
//! │  Scheduler   │  Heaps (mem/)       │  Sync             │
//! │  scheduler.rs│  heap.rs · fit.rs   │  sync.rs          │
//! │  strategies.rs  shared.rs          │  ─ CriticalSection│
//! ├──────────────┴─────────────────────┴───────────────────┤
//! │  Process Model (process.rs)   │  Memory Drivers         │
//! │  PCB · Stack · checksum       │  RamDriver · SerialRam  │
//! ├────────────────────────────────────────────────────────┤
//! │   Arch Port (arch/): Port trait · sim · cortex_m4      │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling
//!
//! Six interchangeable strategies pick the next process at every timer
//! tick or voluntary yield: Even, Random, RoundRobin, InactiveAging,
//! RunToCompletion and a four-level feedback queue. Process 0 is the idle
//! process and only runs when nothing else is ready.
//!
//! ## Memory Model
//!
//! - **No `alloc`**: process table, stacks and heap storage are fixed-size
//! - **Per-process stack**: `[u8; STACK_SIZE]` inline in the PCB, with an
//!   XOR checksum verified on every switch-in
//! - **Heaps**: a map of 4-bit entries (owner, continuation or lock state)
//!   describes every usable byte; chunk sizes are never stored
//! - **Critical sections**: a nesting counter masking the scheduler tick
//!
//! ## Hosted Use
//!
//! [`arch::sim::SimPort`] runs the kernel on a development machine: the
//! timer interrupt becomes an explicit [`Kernel::tick`](kernel::Kernel::tick)
//! call and context switches happen inline.

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod mem;
pub mod process;
pub mod scheduler;
pub mod strategies;
pub mod sync;

pub use error::{Fault, Severity};
pub use kernel::{HeapId, Kernel};
