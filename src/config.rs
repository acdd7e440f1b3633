//! # spos Configuration
//!
//! Compile-time constants governing the scheduler, the critical-section
//! counter and the two heaps. All limits are fixed at compile time; nothing
//! in the kernel allocates dynamically.

/// Maximum number of processes the system can manage simultaneously,
/// including the idle process in slot 0.
///
/// Owner markers in the allocation map are stored in a nibble below the
/// shared-memory range (`0x8`), so this must not exceed 8.
pub const MAX_PROCESSES: usize = 8;

/// Per-process stack size in bytes. Must hold the deepest call chain plus
/// the hardware exception frame (32 bytes) and the software-saved context
/// (32 bytes for R4–R11).
pub const STACK_SIZE: usize = 512;

/// SysTick frequency in Hz. One scheduler dispatch per tick.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Deepest supported critical-section nesting.
pub const MAX_CRITICAL_DEPTH: u8 = u8::MAX;

/// Priority given to autostart programs and the idle process.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Number of multi-level feedback queues. Each queue corresponds to one
/// priority class taken from the top two bits of a process priority.
pub const MLFQ_QUEUES: usize = 4;

/// Time slice in ticks granted by each feedback queue, highest class first.
pub const MLFQ_TIME_SLICES: [u8; MLFQ_QUEUES] = [1, 2, 4, 8];

/// Seed for the pseudo random generator behind the Random strategy.
pub const RANDOM_SEED: u64 = 0x5eed_0f_5905;

/// Size in bytes of the on-chip RAM window handed to the internal heap.
/// One third becomes the allocation map, two thirds usable memory.
pub const INTERNAL_HEAP_SIZE: usize = 3 * 1024;

/// Base address of the internal heap window. Must be non-zero since
/// address 0 is the null allocation.
pub const INTERNAL_HEAP_START: u16 = 0x0100;

/// Size in bytes of the external serial RAM window used by the external heap.
pub const EXTERNAL_HEAP_SIZE: usize = 3 * 16 * 1024;

/// Base address of the external heap window on the serial RAM.
pub const EXTERNAL_HEAP_START: u16 = 0x0010;
