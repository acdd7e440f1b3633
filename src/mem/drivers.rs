//! # Memory Drivers
//!
//! - [`RamDriver`]: directly addressed RAM backed by an in-memory array
//!   (on-chip SRAM region).
//! - [`SerialRam`]: a 23LC1024-style serial SRAM reached through an SPI bus
//!   with a chip-select line, used in byte mode.

use super::{MemAddr, MemDriver, MemValue};
use crate::sync::interrupt_free;

/// Directly addressable RAM window of `N` bytes starting at `start`.
///
/// Accesses outside the window read as 0 and are ignored on write.
pub struct RamDriver<const N: usize> {
    start: MemAddr,
    cells: [MemValue; N],
}

impl<const N: usize> RamDriver<N> {
    pub const fn new(start: MemAddr) -> Self {
        Self {
            start,
            cells: [0; N],
        }
    }

    #[inline]
    fn index(&self, addr: MemAddr) -> Option<usize> {
        let offset = addr.checked_sub(self.start)? as usize;
        (offset < N).then_some(offset)
    }
}

impl<const N: usize> MemDriver for RamDriver<N> {
    fn init(&mut self) {}

    fn read(&mut self, addr: MemAddr) -> MemValue {
        self.index(addr).map_or(0, |i| self.cells[i])
    }

    fn write(&mut self, addr: MemAddr, value: MemValue) {
        if let Some(i) = self.index(addr) {
            self.cells[i] = value;
        }
    }

    fn start(&self) -> MemAddr {
        self.start
    }

    fn size(&self) -> usize {
        N
    }
}

// ---------------------------------------------------------------------------
// Serial SRAM
// ---------------------------------------------------------------------------

/// Write mode register.
pub const CMD_WRMR: u8 = 0x01;
/// Write data.
pub const CMD_WRITE: u8 = 0x02;
/// Read data.
pub const CMD_READ: u8 = 0x03;
/// Mode register value for single-byte transfers.
pub const MODE_BYTE: u8 = 0x00;

/// Full-duplex byte transport with a chip-select line.
pub trait SpiBus {
    /// Configure the bus. Called once before the first command.
    fn init(&mut self) {}

    /// Pull chip-select low.
    fn select(&mut self);

    /// Release chip-select.
    fn deselect(&mut self);

    /// Shift one byte out and return the byte shifted in.
    fn transfer(&mut self, byte: u8) -> u8;
}

/// Serial SRAM window on an SPI bus.
pub struct SerialRam<B: SpiBus> {
    bus: B,
    start: MemAddr,
    size: usize,
}

impl<B: SpiBus> SerialRam<B> {
    pub const fn new(bus: B, start: MemAddr, size: usize) -> Self {
        Self { bus, start, size }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Opcode followed by a 24-bit address; the device has 17 address bits,
    /// the top byte is always 0 for a 16-bit window.
    fn command(&mut self, opcode: u8, addr: MemAddr) {
        let [hi, lo] = addr.to_be_bytes();
        self.bus.transfer(opcode);
        self.bus.transfer(0x00);
        self.bus.transfer(hi);
        self.bus.transfer(lo);
    }
}

impl<B: SpiBus> MemDriver for SerialRam<B> {
    fn init(&mut self) {
        self.bus.init();
        self.bus.select();
        self.bus.transfer(CMD_WRMR);
        self.bus.transfer(MODE_BYTE);
        self.bus.deselect();
    }

    fn read(&mut self, addr: MemAddr) -> MemValue {
        interrupt_free(|| {
            self.bus.select();
            self.command(CMD_READ, addr);
            let value = self.bus.transfer(0xFF);
            self.bus.deselect();
            value
        })
    }

    fn write(&mut self, addr: MemAddr, value: MemValue) {
        interrupt_free(|| {
            self.bus.select();
            self.command(CMD_WRITE, addr);
            self.bus.transfer(value);
            self.bus.deselect();
        })
    }

    fn start(&self) -> MemAddr {
        self.start
    }

    fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Behavioural model of a 23LC1024 in byte mode.
    pub(crate) struct FakeSram {
        pub memory: Vec<u8>,
        pub mode: Option<u8>,
        pub selected: bool,
        pub commands: usize,
        frame: Vec<u8>,
    }

    impl FakeSram {
        pub(crate) fn new(size: usize) -> Self {
            Self {
                memory: vec![0; size],
                mode: None,
                selected: false,
                commands: 0,
                frame: Vec::new(),
            }
        }

        fn address(&self) -> usize {
            ((self.frame[1] as usize) << 16) | ((self.frame[2] as usize) << 8) | self.frame[3] as usize
        }
    }

    impl SpiBus for FakeSram {
        fn select(&mut self) {
            assert!(!self.selected, "chip selected twice");
            self.selected = true;
            self.frame.clear();
        }

        fn deselect(&mut self) {
            assert!(self.selected, "deselect without select");
            self.selected = false;
            self.commands += 1;
        }

        fn transfer(&mut self, byte: u8) -> u8 {
            assert!(self.selected, "transfer with chip deselected");
            self.frame.push(byte);
            match (self.frame[0], self.frame.len()) {
                (CMD_WRMR, 2) => {
                    self.mode = Some(byte);
                    0
                }
                (CMD_READ, 5) => self.memory[self.address()],
                (CMD_WRITE, 5) => {
                    let at = self.address();
                    self.memory[at] = byte;
                    0
                }
                _ => 0,
            }
        }
    }

    #[test]
    fn test_ram_driver_window() {
        let mut ram: RamDriver<16> = RamDriver::new(0x100);
        ram.write(0x100, 7);
        ram.write(0x10F, 9);
        ram.write(0x110, 1);
        ram.write(0x0FF, 1);
        assert_eq!(ram.read(0x100), 7);
        assert_eq!(ram.read(0x10F), 9);
        assert_eq!(ram.read(0x110), 0);
        assert_eq!(ram.read(0x0FF), 0);
        assert_eq!(ram.size(), 16);
        assert_eq!(ram.start(), 0x100);
    }

    #[test]
    fn test_serial_ram_init_sets_byte_mode() {
        let mut sram = SerialRam::new(FakeSram::new(0x200), 0x10, 0x1F0);
        sram.init();
        assert_eq!(sram.bus().mode, Some(MODE_BYTE));
        assert!(!sram.bus().selected);
    }

    #[test]
    fn test_serial_ram_read_write_protocol() {
        let mut sram = SerialRam::new(FakeSram::new(0x10000), 0x10, 0xFFF0);
        sram.init();
        sram.write(0x1234, 0xAB);
        sram.write(0x0010, 0x01);
        assert_eq!(sram.bus().memory[0x1234], 0xAB);
        assert_eq!(sram.read(0x1234), 0xAB);
        assert_eq!(sram.read(0x0010), 0x01);
        assert_eq!(sram.read(0x0011), 0x00);
        // init + 2 writes + 3 reads, each framed by chip-select.
        assert_eq!(sram.bus().commands, 6);
    }
}
