//! # Heap
//!
//! A heap splits its driver window into an allocation map followed by the
//! usable region. Every usable byte is described by one 4-bit map entry, so
//! the map is half the size of the usable region:
//!
//! ```text
//!  window = 3 × map_size bytes
//! ┌───────────────┬───────────────────────────────┐
//! │ map (nibbles) │ use region (2 × map_size)     │
//! └───────────────┴───────────────────────────────┘
//!   byte k holds entries for use bytes 2k (high nibble) and 2k+1 (low)
//! ```
//!
//! ## Map entries
//!
//! | Nibble      | Meaning                                   |
//! |-------------|-------------------------------------------|
//! | `0x0`       | free                                      |
//! | `0x1`–`0x7` | head of a private chunk, value = owner    |
//! | `0x8`       | shared chunk head, closed                 |
//! | `0x9`       | continuation of a shared chunk            |
//! | `0xA`       | shared chunk head, one reader             |
//! | `0xB`       | shared chunk head, two readers            |
//! | `0xC`       | shared chunk head, write-locked           |
//! | `0xF`       | continuation of a private chunk           |
//!
//! A chunk is its head entry plus the run of continuation entries after it;
//! its size is never stored.
//!
//! Heaps are plain data structures: callers provide the acting process id
//! and the atomicity (the [`Kernel`](crate::kernel::Kernel) wraps every
//! call in a critical section).

use log::{debug, trace};

use super::fit::{self, AllocStrategy};
use super::{MemAddr, MemDriver, MemValue};
use crate::config::MAX_PROCESSES;
use crate::error::Fault;
use crate::process::{ProcessId, IDLE};

const NIBBLE_FREE: u8 = 0x0;
const NIBBLE_SH_CLOSED: u8 = 0x8;
const NIBBLE_SH_FOLLOWS: u8 = 0x9;
const NIBBLE_SH_READ_ONE: u8 = 0xA;
const NIBBLE_SH_READ_MULTI: u8 = 0xB;
const NIBBLE_SH_WRITE: u8 = 0xC;
const NIBBLE_FOLLOWS: u8 = 0xF;

/// Lock state of a shared chunk, stored in its head entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShState {
    Closed,
    ReadOne,
    ReadMulti,
    WriteLocked,
}

/// Decoded allocation-map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Free,
    /// Head of a private chunk owned by the process.
    Owner(ProcessId),
    /// Continuation of a private chunk.
    Follows,
    /// Head of a shared chunk.
    Shared(ShState),
    /// Continuation of a shared chunk.
    SharedFollows,
    /// Unassigned nibble value; only present in a corrupted map.
    Reserved(u8),
}

impl Marker {
    pub const fn from_nibble(nibble: u8) -> Self {
        match nibble & 0x0F {
            NIBBLE_FREE => Marker::Free,
            n @ 0x1..=0x7 => Marker::Owner(n as ProcessId),
            NIBBLE_SH_CLOSED => Marker::Shared(ShState::Closed),
            NIBBLE_SH_FOLLOWS => Marker::SharedFollows,
            NIBBLE_SH_READ_ONE => Marker::Shared(ShState::ReadOne),
            NIBBLE_SH_READ_MULTI => Marker::Shared(ShState::ReadMulti),
            NIBBLE_SH_WRITE => Marker::Shared(ShState::WriteLocked),
            NIBBLE_FOLLOWS => Marker::Follows,
            n => Marker::Reserved(n),
        }
    }

    pub const fn nibble(self) -> u8 {
        match self {
            Marker::Free => NIBBLE_FREE,
            Marker::Owner(pid) => (pid as u8) & 0x0F,
            Marker::Follows => NIBBLE_FOLLOWS,
            Marker::Shared(ShState::Closed) => NIBBLE_SH_CLOSED,
            Marker::Shared(ShState::ReadOne) => NIBBLE_SH_READ_ONE,
            Marker::Shared(ShState::ReadMulti) => NIBBLE_SH_READ_MULTI,
            Marker::Shared(ShState::WriteLocked) => NIBBLE_SH_WRITE,
            Marker::SharedFollows => NIBBLE_SH_FOLLOWS,
            Marker::Reserved(n) => n & 0x0F,
        }
    }

    /// Whether the marker has a nibble of its own. Owners outside the
    /// process table and reserved values that collide with a defined
    /// marker would be stored as something else.
    pub const fn is_encodable(self) -> bool {
        match self {
            Marker::Owner(pid) => pid != IDLE && pid < MAX_PROCESSES,
            Marker::Reserved(n) => matches!(n, 0xD | 0xE),
            _ => true,
        }
    }

    /// Whether this entry starts a chunk.
    #[inline]
    pub const fn is_head(self) -> bool {
        matches!(self, Marker::Owner(_) | Marker::Shared(_))
    }

    /// Continuation marker matching this head's namespace.
    const fn continuation(self) -> Marker {
        match self {
            Marker::Shared(_) | Marker::SharedFollows => Marker::SharedFollows,
            _ => Marker::Follows,
        }
    }
}

/// A heap on top of one memory driver.
pub struct Heap<D: MemDriver> {
    driver: D,
    name: &'static str,
    map_start: MemAddr,
    map_size: u16,
    use_start: MemAddr,
    use_size: u16,
    strategy: AllocStrategy,
    /// Where next-fit resumes its search.
    pub(super) next_fit_cursor: MemAddr,
    /// Per-process bounds `[start, end)` enclosing all its private chunks.
    frame_start: [MemAddr; MAX_PROCESSES],
    frame_end: [MemAddr; MAX_PROCESSES],
}

impl<D: MemDriver> Heap<D> {
    /// Carve a heap out of the driver's whole window: the first third
    /// becomes the map, the rest the usable region.
    ///
    /// The driver is not touched; call [`init`](Self::init) at boot.
    pub fn new(driver: D, name: &'static str) -> Result<Self, Fault> {
        let map_size = driver.size() / 3;
        let use_size = map_size * 2;
        let map_start = driver.start() as usize;
        let use_start = map_start + map_size;
        if map_size == 0 || use_start + use_size > MemAddr::MAX as usize {
            return Err(Fault::InvalidHeapLayout);
        }

        let use_start = use_start as MemAddr;
        let use_end = use_start + use_size as MemAddr;
        Ok(Self {
            driver,
            name,
            map_start: map_start as MemAddr,
            map_size: map_size as u16,
            use_start,
            use_size: use_size as u16,
            strategy: AllocStrategy::FirstFit,
            next_fit_cursor: use_start,
            frame_start: [use_end; MAX_PROCESSES],
            frame_end: [use_start; MAX_PROCESSES],
        })
    }

    /// Initialize the device and mark every usable byte free.
    pub fn init(&mut self) {
        self.driver.init();
        for i in 0..self.map_size {
            self.driver.write(self.map_start + i, 0);
        }
        for pid in 0..MAX_PROCESSES {
            self.reset_frame(pid);
        }
        self.next_fit_cursor = self.use_start;
        debug!(
            "{}: {} bytes usable at {:#06x}, map at {:#06x}",
            self.name, self.use_size, self.use_start, self.map_start
        );
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn map_start(&self) -> MemAddr {
        self.map_start
    }

    pub fn map_size(&self) -> u16 {
        self.map_size
    }

    pub fn use_start(&self) -> MemAddr {
        self.use_start
    }

    pub fn use_size(&self) -> u16 {
        self.use_size
    }

    /// One past the last usable address.
    #[inline]
    pub fn use_end(&self) -> MemAddr {
        self.use_start + self.use_size
    }

    #[inline]
    pub fn contains(&self, addr: MemAddr) -> bool {
        addr >= self.use_start && addr < self.use_end()
    }

    pub fn allocation_strategy(&self) -> AllocStrategy {
        self.strategy
    }

    pub fn set_allocation_strategy(&mut self, strategy: AllocStrategy) {
        self.strategy = strategy;
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Raw byte read through the driver.
    pub fn read(&mut self, addr: MemAddr) -> MemValue {
        self.driver.read(addr)
    }

    /// Raw byte write through the driver.
    pub fn write(&mut self, addr: MemAddr, value: MemValue) {
        self.driver.write(addr, value)
    }

    /// Map entry of a usable address, `None` outside the use region.
    pub fn map_entry(&mut self, addr: MemAddr) -> Option<Marker> {
        self.contains(addr).then(|| self.entry(addr))
    }

    /// Overwrite the map entry of a usable address.
    ///
    /// Returns `false` without writing for out-of-range addresses and for
    /// markers that do not fit a map nibble.
    pub fn set_map_entry(&mut self, addr: MemAddr, marker: Marker) -> bool {
        if !self.contains(addr) || !marker.is_encodable() {
            return false;
        }
        self.set_entry(addr, marker);
        true
    }

    /// Map byte holding the entry of `addr` and whether it is the high nibble.
    #[inline]
    fn map_slot(&self, addr: MemAddr) -> (MemAddr, bool) {
        let offset = addr - self.use_start;
        (self.map_start + (offset >> 1), offset & 1 == 0)
    }

    /// Entry of an address known to be in the use region.
    pub(super) fn entry(&mut self, addr: MemAddr) -> Marker {
        let (at, high) = self.map_slot(addr);
        let byte = self.driver.read(at);
        Marker::from_nibble(if high { byte >> 4 } else { byte })
    }

    pub(super) fn set_entry(&mut self, addr: MemAddr, marker: Marker) {
        let (at, high) = self.map_slot(addr);
        let byte = self.driver.read(at);
        let nibble = marker.nibble();
        let byte = if high {
            (byte & 0x0F) | (nibble << 4)
        } else {
            (byte & 0xF0) | nibble
        };
        self.driver.write(at, byte);
    }

    #[inline]
    pub(super) fn is_free(&mut self, addr: MemAddr) -> bool {
        self.entry(addr) == Marker::Free
    }

    /// Walk back from `addr` over continuation entries to the chunk head.
    pub(super) fn head_of(&mut self, mut addr: MemAddr) -> MemAddr {
        let continuation = self.entry(addr).continuation();
        while addr > self.use_start && self.entry(addr) == continuation {
            addr -= 1;
        }
        addr
    }

    /// Number of continuation entries of kind `continuation` after `head`,
    /// plus the head itself.
    pub(super) fn run_len(&mut self, head: MemAddr, continuation: Marker) -> u16 {
        let end = self.use_end();
        let mut len = 1;
        let mut addr = head + 1;
        while addr < end && self.entry(addr) == continuation {
            len += 1;
            addr += 1;
        }
        len
    }

    /// Size of the chunk containing `addr`, 0 if `addr` is free, null or
    /// outside the heap.
    pub fn chunk_size(&mut self, addr: MemAddr) -> u16 {
        if !self.contains(addr) || self.is_free(addr) {
            return 0;
        }
        let head = self.head_of(addr);
        let marker = self.entry(head);
        if !marker.is_head() {
            return 0;
        }
        self.run_len(head, marker.continuation())
    }

    /// Owner of the private chunk containing `addr`.
    pub fn chunk_owner(&mut self, addr: MemAddr) -> Option<ProcessId> {
        if !self.contains(addr) {
            return None;
        }
        let head = self.head_of(addr);
        match self.entry(head) {
            Marker::Owner(pid) => Some(pid),
            _ => None,
        }
    }

    /// Length of the free run starting at `addr`.
    pub fn free_run_len(&mut self, addr: MemAddr) -> u16 {
        let mut len = 0;
        let mut at = addr;
        while self.contains(at) && self.is_free(at) {
            len += 1;
            at += 1;
        }
        len
    }

    /// Bounds `[start, end)` enclosing all private chunks of `pid`, `None`
    /// if it holds nothing.
    pub fn alloc_frame(&self, pid: ProcessId) -> Option<(MemAddr, MemAddr)> {
        let (start, end) = (*self.frame_start.get(pid)?, *self.frame_end.get(pid)?);
        (start < end).then_some((start, end))
    }

    fn reset_frame(&mut self, pid: ProcessId) {
        self.frame_start[pid] = self.use_end();
        self.frame_end[pid] = self.use_start;
    }

    fn frame_extend(&mut self, pid: ProcessId, start: MemAddr, len: u16) {
        if start < self.frame_start[pid] {
            self.frame_start[pid] = start;
        }
        if start + len > self.frame_end[pid] {
            self.frame_end[pid] = start + len;
        }
    }

    /// Trim bytes not held by `pid` off both ends of its frame.
    fn frame_shrink(&mut self, pid: ProcessId) {
        let (mut start, mut end) = (self.frame_start[pid], self.frame_end[pid]);
        while start < end && self.entry(start) != Marker::Owner(pid) {
            start += 1;
        }
        while start < end && self.chunk_owner(end - 1) != Some(pid) {
            end -= 1;
        }
        if start >= end {
            self.reset_frame(pid);
        } else {
            self.frame_start[pid] = start;
            self.frame_end[pid] = end;
        }
    }

    // -----------------------------------------------------------------------
    // Private allocation
    // -----------------------------------------------------------------------

    /// Find `size` free bytes with the active strategy.
    pub(super) fn find_free(&mut self, size: u16) -> Option<MemAddr> {
        if size == 0 || size > self.use_size {
            return None;
        }
        let addr = match self.strategy {
            AllocStrategy::FirstFit => fit::first_fit(self, size),
            AllocStrategy::NextFit => fit::next_fit(self, size),
            AllocStrategy::BestFit => fit::best_fit(self, size),
            AllocStrategy::WorstFit => fit::worst_fit(self, size),
        }?;
        self.contains(addr).then_some(addr)
    }

    /// Write a head marker followed by `size - 1` continuation markers.
    pub(super) fn mark_chunk(&mut self, addr: MemAddr, size: u16, head: Marker) {
        self.set_entry(addr, head);
        let continuation = head.continuation();
        for i in 1..size {
            self.set_entry(addr + i, continuation);
        }
    }

    /// Mark `[from, to)` free and zero the underlying bytes.
    pub(super) fn clear(&mut self, from: MemAddr, to: MemAddr) {
        for addr in from..to {
            self.set_entry(addr, Marker::Free);
            self.driver.write(addr, 0);
        }
    }

    /// Allocate `size` bytes owned by `pid`. `None` when no region fits.
    pub fn malloc(&mut self, pid: ProcessId, size: u16) -> Option<MemAddr> {
        if pid == IDLE || pid >= MAX_PROCESSES {
            return None;
        }
        let addr = self.find_free(size)?;
        self.mark_chunk(addr, size, Marker::Owner(pid));
        self.frame_extend(pid, addr, size);
        trace!("{}: malloc({}) by {} -> {:#06x}", self.name, size, pid, addr);
        Some(addr)
    }

    /// Resolve `addr` to the head of a private chunk owned by `pid`.
    fn owned_head(&mut self, pid: ProcessId, addr: MemAddr) -> Result<MemAddr, Fault> {
        if !self.contains(addr) {
            return Err(Fault::InvalidAddress { addr });
        }
        let head = self.head_of(addr);
        match self.entry(head) {
            Marker::Owner(owner) if owner == pid => Ok(head),
            Marker::Owner(owner) => Err(Fault::NotOwner {
                addr: head,
                owner,
                caller: pid,
            }),
            Marker::Shared(_) | Marker::SharedFollows => Err(Fault::SharedViaPrivate { addr: head }),
            _ => Err(Fault::InvalidAddress { addr }),
        }
    }

    /// Free the chunk at the given head and return its size.
    fn release_chunk(&mut self, head: MemAddr) -> u16 {
        let size = self.run_len(head, Marker::Follows);
        self.clear(head, head + size);
        size
    }

    /// Free the private chunk containing `addr`.
    ///
    /// Null and already-free addresses are ignored. Shared chunks and
    /// chunks of other processes are refused without touching the map.
    pub fn free(&mut self, pid: ProcessId, addr: MemAddr) -> Result<(), Fault> {
        if addr == 0 || (self.contains(addr) && self.is_free(addr)) {
            return Ok(());
        }
        let head = self.owned_head(pid, addr)?;
        let size = self.release_chunk(head);
        let (start, end) = (self.frame_start[pid], self.frame_end[pid]);
        if head <= start || head + size >= end {
            self.frame_shrink(pid);
        }
        trace!("{}: free({:#06x}) by {}, {} bytes", self.name, head, pid, size);
        Ok(())
    }

    /// Free every private chunk of `pid`. Only the process's frame is
    /// scanned. Returns the number of chunks released.
    pub fn free_process_memory(&mut self, pid: ProcessId) -> usize {
        if pid >= MAX_PROCESSES {
            return 0;
        }
        let (start, end) = (self.frame_start[pid], self.frame_end[pid]);
        let mut released = 0;
        let mut addr = start;
        while addr < end {
            if self.entry(addr) == Marker::Owner(pid) {
                let size = self.release_chunk(addr);
                released += 1;
                addr += size.max(1);
            } else {
                addr += 1;
            }
        }
        self.reset_frame(pid);
        if released > 0 {
            debug!("{}: released {} chunks of process {}", self.name, released, pid);
        }
        released
    }

    /// Copy `len` bytes from `src` to `dst`; the ranges may overlap.
    fn move_bytes(&mut self, dst: MemAddr, src: MemAddr, len: u16) {
        if dst == src || len == 0 {
            return;
        }
        if dst < src {
            for i in 0..len {
                let value = self.driver.read(src + i);
                self.driver.write(dst + i, value);
            }
        } else {
            for i in (0..len).rev() {
                let value = self.driver.read(src + i);
                self.driver.write(dst + i, value);
            }
        }
    }

    /// Resize the chunk at `addr` owned by `pid`.
    ///
    /// `addr == 0` allocates, `size == 0` frees and returns `None`.
    /// Growing tries, in order: free space to the right, free space to the
    /// left (moving the content), both sides, and finally a fresh chunk
    /// elsewhere with the content copied. `Ok(None)` means no space; the
    /// original chunk is then left untouched.
    pub fn realloc(
        &mut self,
        pid: ProcessId,
        addr: MemAddr,
        size: u16,
    ) -> Result<Option<MemAddr>, Fault> {
        if addr == 0 {
            return Ok(self.malloc(pid, size));
        }
        if size == 0 {
            self.free(pid, addr)?;
            return Ok(None);
        }

        let head = self.owned_head(pid, addr)?;
        let old_size = self.run_len(head, Marker::Follows);
        let end = self.use_end();

        if size == old_size {
            return Ok(Some(head));
        }

        if size < old_size {
            self.clear(head + size, head + old_size);
            self.frame_shrink(pid);
            return Ok(Some(head));
        }

        let difference = size - old_size;

        let mut right_free = 0;
        let mut at = head + old_size;
        while right_free < difference && at < end && self.is_free(at) {
            right_free += 1;
            at += 1;
        }

        let mut left_free = 0;
        let mut at = head;
        while at > self.use_start && self.is_free(at - 1) {
            left_free += 1;
            at -= 1;
        }

        if right_free >= difference {
            for i in old_size..size {
                self.set_entry(head + i, Marker::Follows);
            }
            self.frame_extend(pid, head, size);
            return Ok(Some(head));
        }

        if left_free + right_free >= difference {
            let new_start = head - left_free;
            self.move_bytes(new_start, head, old_size);
            if new_start + size < head + old_size {
                self.clear(new_start + size, head + old_size);
            }
            self.mark_chunk(new_start, size, Marker::Owner(pid));
            self.frame_extend(pid, new_start, size);
            self.frame_shrink(pid);
            return Ok(Some(new_start));
        }

        let Some(new_addr) = self.find_free(size) else {
            return Ok(None);
        };
        self.mark_chunk(new_addr, size, Marker::Owner(pid));
        for i in 0..old_size {
            let value = self.driver.read(head + i);
            self.driver.write(new_addr + i, value);
        }
        self.release_chunk(head);
        self.frame_extend(pid, new_addr, size);
        self.frame_shrink(pid);
        trace!(
            "{}: realloc moved {:#06x} -> {:#06x} ({} -> {} bytes)",
            self.name,
            head,
            new_addr,
            old_size,
            size
        );
        Ok(Some(new_addr))
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
