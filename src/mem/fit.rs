//! # Allocation Strategies
//!
//! Each strategy searches the allocation map for a run of at least `size`
//! free entries and returns the first address of the chosen run. The map
//! itself is only read here; marking is done by the heap.

use super::heap::Heap;
use super::{MemAddr, MemDriver};

/// How a heap picks among the free runs that can hold a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocStrategy {
    /// Lowest address that fits.
    #[default]
    FirstFit,
    /// Like first-fit, but resume where the previous allocation ended and
    /// wrap around once.
    NextFit,
    /// Smallest run that fits; the lowest address wins ties.
    BestFit,
    /// Largest run; the lowest address wins ties.
    WorstFit,
}

/// Leftmost free run starting in `[from, until)` that holds `size` bytes.
/// A run may extend past `until`.
fn scan<D: MemDriver>(heap: &mut Heap<D>, from: MemAddr, until: MemAddr, size: u16) -> Option<MemAddr> {
    let mut addr = from;
    while addr < until {
        if heap.is_free(addr) {
            let run = heap.free_run_len(addr);
            if run >= size {
                return Some(addr);
            }
            addr += run;
        } else {
            addr += 1;
        }
    }
    None
}

/// Walk every maximal free run and keep the one `better` prefers.
fn pick_run<D: MemDriver>(
    heap: &mut Heap<D>,
    size: u16,
    better: fn(candidate: u16, chosen: u16) -> bool,
) -> Option<MemAddr> {
    let mut chosen: Option<(MemAddr, u16)> = None;
    let mut addr = heap.use_start();
    let end = heap.use_end();
    while addr < end {
        if !heap.is_free(addr) {
            addr += 1;
            continue;
        }
        let run = heap.free_run_len(addr);
        if run >= size && chosen.map_or(true, |(_, len)| better(run, len)) {
            chosen = Some((addr, run));
        }
        addr += run;
    }
    chosen.map(|(addr, _)| addr)
}

pub fn first_fit<D: MemDriver>(heap: &mut Heap<D>, size: u16) -> Option<MemAddr> {
    let (start, end) = (heap.use_start(), heap.use_end());
    scan(heap, start, end, size)
}

pub fn next_fit<D: MemDriver>(heap: &mut Heap<D>, size: u16) -> Option<MemAddr> {
    let (start, end) = (heap.use_start(), heap.use_end());
    let cursor = if heap.contains(heap.next_fit_cursor) {
        heap.next_fit_cursor
    } else {
        start
    };

    let addr = scan(heap, cursor, end, size).or_else(|| scan(heap, start, cursor, size))?;
    let next = addr + size;
    heap.next_fit_cursor = if next >= end { start } else { next };
    Some(addr)
}

pub fn best_fit<D: MemDriver>(heap: &mut Heap<D>, size: u16) -> Option<MemAddr> {
    pick_run(heap, size, |candidate, chosen| candidate < chosen)
}

pub fn worst_fit<D: MemDriver>(heap: &mut Heap<D>, size: u16) -> Option<MemAddr> {
    pick_run(heap, size, |candidate, chosen| candidate > chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::heap::tests::{accounted, small_heap, SmallHeap};

    /// Free runs of 4, 2, 6 and 5 bytes separated by one-byte walls:
    /// `[4 free][w][2 free][w][6 free][w][5 free]`.
    fn fragmented() -> (SmallHeap, [MemAddr; 4]) {
        let mut heap = small_heap();
        let s = heap.use_start();
        let runs = [s, s + 5, s + 8, s + 15];
        let holes = [
            heap.malloc(2, 4).unwrap(),
            heap.malloc(1, 1).unwrap(),
            heap.malloc(2, 2).unwrap(),
            heap.malloc(1, 1).unwrap(),
            heap.malloc(2, 6).unwrap(),
            heap.malloc(1, 1).unwrap(),
        ];
        for hole in [holes[0], holes[2], holes[4]] {
            heap.free(2, hole).unwrap();
        }
        assert_eq!(heap.free_run_len(runs[3]), 5);
        (heap, runs)
    }

    #[test]
    fn test_first_fit_picks_lowest() {
        let (mut heap, runs) = fragmented();
        assert_eq!(heap.malloc(3, 2), Some(runs[0]));
        assert_eq!(heap.malloc(3, 5), Some(runs[2]));
        assert_eq!(accounted(&mut heap), 20);
    }

    #[test]
    fn test_best_fit_picks_smallest() {
        let (mut heap, runs) = fragmented();
        heap.set_allocation_strategy(AllocStrategy::BestFit);
        assert_eq!(heap.malloc(3, 2), Some(runs[1]));
        assert_eq!(heap.malloc(3, 5), Some(runs[3]));
        assert_eq!(heap.malloc(3, 3), Some(runs[0]));
    }

    #[test]
    fn test_worst_fit_picks_largest() {
        let (mut heap, runs) = fragmented();
        heap.set_allocation_strategy(AllocStrategy::WorstFit);
        assert_eq!(heap.malloc(3, 1), Some(runs[2]));
        // runs now 4, 2, 5 (at runs[2] + 1), 5: ties go to the lower address.
        assert_eq!(heap.malloc(3, 1), Some(runs[2] + 1));
        assert_eq!(heap.malloc(3, 7), None);
    }

    #[test]
    fn test_next_fit_resumes_and_wraps() {
        let (mut heap, runs) = fragmented();
        heap.set_allocation_strategy(AllocStrategy::NextFit);
        heap.next_fit_cursor = heap.use_start();

        assert_eq!(heap.malloc(3, 2), Some(runs[0]));
        // First-fit would reuse the rest of run 0; next-fit continues.
        assert_eq!(heap.malloc(3, 2), Some(runs[0] + 2));
        assert_eq!(heap.malloc(3, 2), Some(runs[1]));
        assert_eq!(heap.malloc(3, 5), Some(runs[2]));
        assert_eq!(heap.malloc(3, 4), Some(runs[3]));
        // The last free byte ends the region, so the cursor wraps.
        assert_eq!(heap.malloc(3, 1), Some(heap.use_end() - 1));
        assert_eq!(heap.malloc(3, 1), Some(runs[2] + 5));
        assert_eq!(heap.malloc(3, 1), None);
    }

    #[test]
    fn test_next_fit_takes_lower_run_after_wrap() {
        let mut heap = small_heap();
        heap.set_allocation_strategy(AllocStrategy::NextFit);
        let a = heap.malloc(1, 8).unwrap();
        let _b = heap.malloc(1, 8).unwrap();
        heap.free(1, a).unwrap();
        assert_eq!(heap.malloc(1, 6), Some(a));
    }
}
