//! # Shared Memory
//!
//! Shared chunks live in the same allocation map as private ones but use
//! their own marker namespace, so the private and shared paths can never
//! free each other's chunks. The head entry of a shared chunk doubles as
//! its reader/writer lock:
//!
//! ```text
//!            write_open              read_open            read_open
//!   WriteLocked ◄──── Closed ────► ReadOne ────► ReadMulti ──► (rejected)
//!        │  close       ▲  close      │              │
//!        └──────────────┘◄────────────┘◄─────────────┘ close
//! ```
//!
//! Contention never blocks except in [`Heap::sh_free`], which waits for the
//! chunk to close. Waiting is expressed as a caller-supplied `yield_now`
//! callback so the heap stays independent of the scheduler.

use log::trace;

use super::heap::{Heap, Marker, ShState};
use super::{MemAddr, MemDriver};
use crate::error::Fault;

impl<D: MemDriver> Heap<D> {
    /// Allocate a shared chunk of `size` bytes in the closed state.
    pub fn sh_malloc(&mut self, size: u16) -> Option<MemAddr> {
        let addr = self.find_free(size)?;
        self.mark_chunk(addr, size, Marker::Shared(ShState::Closed));
        trace!("{}: sh_malloc({}) -> {:#06x}", self.name(), size, addr);
        Some(addr)
    }

    /// Head of the shared chunk containing `addr`.
    fn shared_head(&mut self, addr: MemAddr) -> Result<MemAddr, Fault> {
        if !self.contains(addr) {
            return Err(Fault::InvalidAddress { addr });
        }
        let head = self.head_of(addr);
        match self.entry(head) {
            Marker::Shared(_) => Ok(head),
            _ => Err(Fault::NotShared { addr }),
        }
    }

    fn lock_state(&mut self, head: MemAddr) -> Option<ShState> {
        match self.entry(head) {
            Marker::Shared(state) => Some(state),
            _ => None,
        }
    }

    fn set_lock_state(&mut self, head: MemAddr, state: ShState) {
        self.set_entry(head, Marker::Shared(state));
    }

    /// Lock state of the shared chunk containing `addr`.
    pub fn sh_state(&mut self, addr: MemAddr) -> Option<ShState> {
        let head = self.shared_head(addr).ok()?;
        self.lock_state(head)
    }

    /// Free the shared chunk `*ptr` points into and null the pointer.
    ///
    /// Calls `yield_now` until every reader and writer has closed the chunk.
    /// A null pointer is ignored.
    pub fn sh_free(
        &mut self,
        ptr: &mut MemAddr,
        mut yield_now: impl FnMut(&mut Self),
    ) -> Result<(), Fault> {
        if *ptr == 0 {
            return Ok(());
        }
        let head = self.shared_head(*ptr)?;
        while self.lock_state(head) != Some(ShState::Closed) {
            if self.lock_state(head).is_none() {
                return Err(Fault::NotShared { addr: head });
            }
            yield_now(self);
        }

        let size = self.run_len(head, Marker::SharedFollows);
        self.clear(head, head + size);
        *ptr = 0;
        trace!("{}: sh_free({:#06x}), {} bytes", self.name(), head, size);
        Ok(())
    }

    /// Open the chunk for reading.
    ///
    /// A write-locked chunk gets one `yield_now` to be released. At most two
    /// readers are admitted; further openers get `Ok(None)`, as does a writer
    /// that still holds the lock after the yield.
    pub fn sh_read_open(
        &mut self,
        addr: MemAddr,
        yield_now: impl FnOnce(&mut Self),
    ) -> Result<Option<MemAddr>, Fault> {
        let head = self.shared_head(addr)?;
        if self.lock_state(head) == Some(ShState::WriteLocked) {
            yield_now(self);
        }
        let next = match self.lock_state(head) {
            Some(ShState::Closed) => ShState::ReadOne,
            Some(ShState::ReadOne) => ShState::ReadMulti,
            Some(ShState::ReadMulti | ShState::WriteLocked) => return Ok(None),
            None => return Err(Fault::NotShared { addr }),
        };
        self.set_lock_state(head, next);
        Ok(Some(head))
    }

    /// Open the chunk for writing. Only a closed chunk can be write-locked;
    /// any open chunk yields `Ok(None)`.
    pub fn sh_write_open(&mut self, addr: MemAddr) -> Result<Option<MemAddr>, Fault> {
        let head = self.shared_head(addr)?;
        if self.lock_state(head) != Some(ShState::Closed) {
            return Ok(None);
        }
        self.set_lock_state(head, ShState::WriteLocked);
        Ok(Some(head))
    }

    /// Release one holder of the chunk.
    ///
    /// Closing a closed chunk, private memory or a free byte does nothing.
    pub fn sh_close(&mut self, addr: MemAddr) -> Result<(), Fault> {
        if !self.contains(addr) {
            return Err(Fault::InvalidAddress { addr });
        }
        let head = self.head_of(addr);
        match self.lock_state(head) {
            Some(ShState::WriteLocked | ShState::ReadOne) => {
                self.set_lock_state(head, ShState::Closed)
            }
            Some(ShState::ReadMulti) => self.set_lock_state(head, ShState::ReadOne),
            _ => {}
        }
        Ok(())
    }

    /// Read `dest.len()` bytes at `offset` into the shared chunk.
    ///
    /// Returns `Ok(false)` if the read lock was not granted. A range past the
    /// end of the chunk releases the lock and fails without copying.
    pub fn sh_read(
        &mut self,
        addr: MemAddr,
        offset: u16,
        dest: &mut [u8],
        yield_now: impl FnOnce(&mut Self),
    ) -> Result<bool, Fault> {
        let Some(head) = self.sh_read_open(addr, yield_now)? else {
            return Ok(false);
        };
        let size = self.run_len(head, Marker::SharedFollows);
        if exceeds(offset, dest.len(), size) {
            let length = clamp_len(dest.len());
            return self.violation(head, Fault::ReadViolation { addr: head, offset, length, size });
        }
        for (i, byte) in dest.iter_mut().enumerate() {
            *byte = self.read(head + offset + i as u16);
        }
        self.sh_close(head)?;
        Ok(true)
    }

    /// Write `src` at `offset` into the shared chunk.
    ///
    /// Returns `Ok(false)` if the chunk is open elsewhere. A range past the
    /// end of the chunk releases the lock and fails without copying.
    pub fn sh_write(&mut self, addr: MemAddr, offset: u16, src: &[u8]) -> Result<bool, Fault> {
        let Some(head) = self.sh_write_open(addr)? else {
            return Ok(false);
        };
        let size = self.run_len(head, Marker::SharedFollows);
        if exceeds(offset, src.len(), size) {
            let length = clamp_len(src.len());
            return self.violation(head, Fault::WriteViolation { addr: head, offset, length, size });
        }
        for (i, &byte) in src.iter().enumerate() {
            self.write(head + offset + i as u16, byte);
        }
        self.sh_close(head)?;
        Ok(true)
    }

    /// Release the lock taken for an out-of-bounds access and report it.
    fn violation(&mut self, head: MemAddr, fault: Fault) -> Result<bool, Fault> {
        self.sh_close(head)?;
        Err(fault)
    }
}

#[inline]
fn exceeds(offset: u16, length: usize, size: u16) -> bool {
    usize::from(offset).saturating_add(length) > usize::from(size)
}

/// Buffer length as reported in a violation; saturates at `u16::MAX`.
#[inline]
fn clamp_len(length: usize) -> u16 {
    u16::try_from(length).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::heap::tests::{accounted, small_heap, SmallHeap};

    fn no_yield(_: &mut SmallHeap) {
        panic!("unexpected yield");
    }

    #[test]
    fn test_sh_malloc_markers() {
        let mut heap = small_heap();
        let s = heap.sh_malloc(3).unwrap();
        assert_eq!(heap.map_entry(s), Some(Marker::Shared(ShState::Closed)));
        assert_eq!(heap.map_entry(s + 1), Some(Marker::SharedFollows));
        assert_eq!(heap.map_entry(s + 2), Some(Marker::SharedFollows));
        assert_eq!(heap.chunk_size(s + 2), 3);
        assert_eq!(heap.chunk_owner(s), None);
        assert_eq!(heap.sh_malloc(0), None);
    }

    #[test]
    fn test_private_and_shared_chunks_stay_apart() {
        let mut heap = small_heap();
        let p = heap.malloc(1, 2).unwrap();
        let s = heap.sh_malloc(2).unwrap();
        let q = heap.malloc(1, 2).unwrap();
        assert_eq!(heap.chunk_size(p), 2);
        assert_eq!(heap.chunk_size(s), 2);
        assert_eq!(heap.chunk_size(q), 2);
        assert_eq!(heap.sh_write_open(p), Err(Fault::NotShared { addr: p }));
        assert_eq!(accounted(&mut heap), 20);
    }

    #[test]
    fn test_lock_sequence_ends_closed() {
        let mut heap = small_heap();
        let s = heap.sh_malloc(4).unwrap();

        assert_eq!(heap.sh_write_open(s + 1), Ok(Some(s)));
        assert_eq!(heap.sh_state(s), Some(ShState::WriteLocked));
        heap.sh_close(s).unwrap();
        assert_eq!(heap.sh_read_open(s, no_yield), Ok(Some(s)));
        assert_eq!(heap.sh_read_open(s, no_yield), Ok(Some(s)));
        assert_eq!(heap.sh_state(s), Some(ShState::ReadMulti));
        heap.sh_close(s).unwrap();
        assert_eq!(heap.sh_state(s), Some(ShState::ReadOne));
        heap.sh_close(s).unwrap();
        assert_eq!(heap.sh_state(s), Some(ShState::Closed));
    }

    #[test]
    fn test_third_reader_is_rejected() {
        let mut heap = small_heap();
        let s = heap.sh_malloc(4).unwrap();
        heap.sh_read_open(s, no_yield).unwrap();
        heap.sh_read_open(s, no_yield).unwrap();
        assert_eq!(heap.sh_read_open(s, no_yield), Ok(None));
        assert_eq!(heap.sh_state(s), Some(ShState::ReadMulti));
    }

    #[test]
    fn test_write_contention_does_not_block() {
        let mut heap = small_heap();
        let s = heap.sh_malloc(4).unwrap();
        assert!(heap.sh_write_open(s).unwrap().is_some());
        assert_eq!(heap.sh_write_open(s), Ok(None));

        heap.sh_close(s).unwrap();
        heap.sh_read_open(s, no_yield).unwrap();
        assert_eq!(heap.sh_write_open(s), Ok(None));
    }

    #[test]
    fn test_reader_yields_once_to_writer() {
        let mut heap = small_heap();
        let s = heap.sh_malloc(4).unwrap();
        heap.sh_write_open(s).unwrap();

        let mut yields = 0;
        let opened = heap.sh_read_open(s, |h| {
            yields += 1;
            h.sh_close(s).unwrap();
        });
        assert_eq!(opened, Ok(Some(s)));
        assert_eq!(yields, 1);
        assert_eq!(heap.sh_state(s), Some(ShState::ReadOne));

        heap.sh_close(s).unwrap();
        heap.sh_write_open(s).unwrap();
        assert_eq!(heap.sh_read_open(s, |_| {}), Ok(None));
    }

    #[test]
    fn test_sh_free_waits_for_close() {
        let mut heap = small_heap();
        let mut s = heap.sh_malloc(4).unwrap();
        let head = s;
        heap.sh_read_open(s, no_yield).unwrap();
        heap.sh_read_open(s, no_yield).unwrap();

        let mut yields = 0;
        heap.sh_free(&mut s, |h| {
            yields += 1;
            h.sh_close(head).unwrap();
        })
        .unwrap();
        assert_eq!(yields, 2);
        assert_eq!(s, 0);
        assert_eq!(heap.free_run_len(head), 20);
    }

    #[test]
    fn test_sh_free_rejects_private_and_null() {
        let mut heap = small_heap();
        let mut null = 0;
        assert_eq!(heap.sh_free(&mut null, no_yield), Ok(()));

        let p = heap.malloc(1, 4).unwrap();
        let mut ptr = p + 2;
        assert_eq!(heap.sh_free(&mut ptr, no_yield), Err(Fault::NotShared { addr: p + 2 }));
        assert_eq!(ptr, p + 2);
        assert_eq!(heap.chunk_size(p), 4);
    }

    #[test]
    fn test_sh_write_then_read() {
        let mut heap = small_heap();
        let s = heap.sh_malloc(6).unwrap();
        assert_eq!(heap.sh_write(s, 2, &[7, 8, 9]), Ok(true));
        let mut buf = [0u8; 4];
        assert_eq!(heap.sh_read(s + 5, 1, &mut buf, no_yield), Ok(true));
        assert_eq!(buf, [0, 7, 8, 9]);
        assert_eq!(heap.sh_state(s), Some(ShState::Closed));
    }

    #[test]
    fn test_out_of_bounds_access_closes_lock() {
        let mut heap = small_heap();
        let s = heap.sh_malloc(4).unwrap();
        assert_eq!(
            heap.sh_write(s, 2, &[1, 2, 3]),
            Err(Fault::WriteViolation {
                addr: s,
                offset: 2,
                length: 3,
                size: 4
            })
        );
        assert_eq!(heap.sh_state(s), Some(ShState::Closed));
        assert_eq!(heap.read(s + 2), 0);

        let mut buf = [0u8; 5];
        assert!(matches!(
            heap.sh_read(s, 0, &mut buf, no_yield),
            Err(Fault::ReadViolation { size: 4, .. })
        ));
        assert_eq!(heap.sh_state(s), Some(ShState::Closed));
    }

    #[test]
    fn test_oversized_buffer_is_a_violation() {
        let mut heap = small_heap();
        let s = heap.sh_malloc(4).unwrap();

        // 65538 bytes would wrap to 2 if narrowed to the address width.
        let mut big = vec![0u8; usize::from(u16::MAX) + 3];
        assert_eq!(
            heap.sh_read(s, 0, &mut big, no_yield),
            Err(Fault::ReadViolation {
                addr: s,
                offset: 0,
                length: u16::MAX,
                size: 4
            })
        );
        assert_eq!(heap.sh_state(s), Some(ShState::Closed));

        assert!(matches!(
            heap.sh_write(s, 1, &big),
            Err(Fault::WriteViolation { length: u16::MAX, size: 4, .. })
        ));
        assert_eq!(heap.sh_state(s), Some(ShState::Closed));
        assert_eq!(accounted(&mut heap), 20);
    }

    #[test]
    fn test_close_ignores_unshared_memory() {
        let mut heap = small_heap();
        let p = heap.malloc(1, 3).unwrap();
        assert_eq!(heap.sh_close(p + 1), Ok(()));
        assert_eq!(heap.sh_close(p + 5), Ok(()));
        assert_eq!(heap.chunk_owner(p), Some(1));
        assert_eq!(heap.chunk_size(p), 3);

        let s = heap.sh_malloc(2).unwrap();
        heap.sh_close(s).unwrap();
        assert_eq!(heap.sh_state(s), Some(ShState::Closed));
        assert_eq!(heap.sh_close(0xFFFF), Err(Fault::InvalidAddress { addr: 0xFFFF }));
    }

    #[test]
    fn test_busy_chunk_refuses_access() {
        let mut heap = small_heap();
        let s = heap.sh_malloc(4).unwrap();
        heap.sh_write_open(s).unwrap();
        assert_eq!(heap.sh_write(s, 0, &[1]), Ok(false));
        assert_eq!(heap.sh_read(s, 0, &mut [0u8], |_| {}), Ok(false));
    }
}
