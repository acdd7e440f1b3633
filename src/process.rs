//! # Process Control Block
//!
//! Defines the process model: a fixed-size table slot holding the program,
//! its saved stack pointer, priority, lifecycle state and the stack
//! checksum used to detect corruption between two context switches.
//!
//! ```text
//!            exec()             dispatch
//!  Unused ──────────► Ready ─────────────► Running
//!    ▲                    ◄───────────────    │
//!    │                     preempt / yield    │
//!    └────────────────────────────────────────┘
//!                       kill()
//! ```

use crate::config::STACK_SIZE;

/// Index into the process table. Slot 0 is the idle process.
pub type ProcessId = usize;

/// Scheduling priority, 0 = least favourable, 255 = most favourable.
pub type Priority = u8;

/// Entry point of a process. Returning from it terminates the process.
pub type Program = fn();

/// The permanent idle process.
pub const IDLE: ProcessId = 0;

/// Lifecycle state of a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Free slot, reusable by `exec`.
    Unused,
    /// Waiting to be selected by the scheduler.
    Ready,
    /// Currently executing. Exactly one slot outside interrupt context.
    Running,
}

/// Per-process stack storage, aligned to 8 bytes as required by ARM AAPCS.
#[repr(C, align(8))]
pub struct Stack(pub [u8; STACK_SIZE]);

impl Stack {
    pub const fn new() -> Self {
        Self([0; STACK_SIZE])
    }
}

/// Process control block.
pub struct Process {
    /// Program run by the dispatcher trampoline; `None` for unused slots.
    pub program: Option<Program>,

    /// Saved stack pointer as an offset into `stack`. The saved context
    /// occupies `stack[sp..]`.
    pub sp: usize,

    pub priority: Priority,

    pub state: ProcessState,

    /// XOR of the stack content recorded at the last switch-out.
    pub checksum: u8,

    /// Critical-section nesting depth held while switched out.
    pub critical_depth: u8,

    pub stack: Stack,
}

impl Process {
    /// Create an unused slot. Used to initialize the process table.
    pub const fn empty() -> Self {
        Self {
            program: None,
            sp: STACK_SIZE,
            priority: 0,
            state: ProcessState::Unused,
            checksum: 0,
            critical_depth: 0,
            stack: Stack::new(),
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == ProcessState::Ready
    }

    #[inline]
    pub fn is_unused(&self) -> bool {
        self.state == ProcessState::Unused
    }

    /// XOR over every byte between the saved stack pointer and the stack
    /// bottom.
    pub fn stack_checksum(&self) -> u8 {
        let from = self.sp.min(STACK_SIZE);
        self.stack.0[from..].iter().fold(0, |acc, b| acc ^ b)
    }

    /// Record the current stack checksum.
    pub fn seal_stack(&mut self) {
        self.checksum = self.stack_checksum();
    }
}
