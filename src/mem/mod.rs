//! # Memory Management
//!
//! Byte-addressable memory drivers and the heaps built on top of them.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Heap (heap.rs, shared.rs)                    │
//! │   malloc · free · realloc · sh_* · map query │
//! ├──────────────────────┬───────────────────────┤
//! │ Fit strategies       │ Allocation map        │
//! │ fit.rs               │ one nibble per byte   │
//! ├──────────────────────┴───────────────────────┤
//! │ MemDriver (drivers.rs)                       │
//! │   RamDriver (on-chip) · SerialRam (SPI SRAM) │
//! └──────────────────────────────────────────────┘
//! ```

pub mod drivers;
pub mod fit;
pub mod heap;
pub mod shared;

pub use drivers::{RamDriver, SerialRam, SpiBus};
pub use fit::AllocStrategy;
pub use heap::{Heap, Marker, ShState};

/// Address within a driver's window. 0 is the null address.
pub type MemAddr = u16;

/// One byte of memory.
pub type MemValue = u8;

/// Uniform byte access to a fixed address window.
///
/// All operations are synchronous: they return once the device has
/// completed the transfer.
pub trait MemDriver {
    /// One-time device setup. Called by heap initialization at boot.
    fn init(&mut self);

    fn read(&mut self, addr: MemAddr) -> MemValue;

    fn write(&mut self, addr: MemAddr, value: MemValue);

    /// First address of the window.
    fn start(&self) -> MemAddr;

    /// Size of the window in bytes.
    fn size(&self) -> usize;
}
