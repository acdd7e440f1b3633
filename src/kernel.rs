//! # Kernel
//!
//! The [`Kernel`] owns everything with system lifetime: the process table,
//! the critical-section counter, the internal and external heaps and the
//! platform port. It is the API processes program against.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset handler
//!   └─► main()
//!         ├─► Kernel::new()            ← carve both heaps from their drivers
//!         ├─► Kernel::init_heaps()     ← driver init, zero allocation maps
//!         ├─► Kernel::init_scheduler() ← idle at pid 0, autostart programs
//!         └─► Kernel::start()          ← idle goes Running, port launches it
//! ```
//!
//! ## Faults
//!
//! Routine failures (heap full, table full, lock busy) come back as `None`
//! or `false`. Protocol violations are handed to [`Port::report`] and the
//! offending call has no effect; halting faults additionally end in
//! [`Port::halt`].
//!
//! Every heap operation runs inside the critical section and acts on behalf
//! of the process that is currently running.

use core::sync::atomic::{compiler_fence, Ordering};

use log::{debug, error, warn};

use crate::arch::Port;
use crate::config::DEFAULT_PRIORITY;
use crate::error::{Fault, Severity};
use crate::mem::{AllocStrategy, Heap, MemAddr, MemDriver, Marker, ShState};
use crate::process::{Priority, Process, ProcessId, ProcessState, Program};
use crate::scheduler::Scheduler;
use crate::strategies::SchedulingStrategy;
use crate::sync::CriticalSection;

/// Number of heaps managed by the kernel.
pub const HEAP_COUNT: usize = 2;

/// Selects one of the kernel's heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapId {
    /// On-chip RAM.
    Internal,
    /// External serial RAM.
    External,
}

impl HeapId {
    pub const ALL: [HeapId; HEAP_COUNT] = [HeapId::Internal, HeapId::External];
}

/// Evaluate `$body` with `$heap` bound to the selected heap. The two heaps
/// have different driver types, so each arm is monomorphized separately.
macro_rules! on_heap {
    ($kernel:expr, $id:expr, |$heap:ident| $body:expr) => {
        match $id {
            HeapId::Internal => {
                let $heap = &mut $kernel.internal;
                $body
            }
            HeapId::External => {
                let $heap = &mut $kernel.external;
                $body
            }
        }
    };
}

pub struct Kernel<P: Port, I: MemDriver, E: MemDriver> {
    scheduler: Scheduler,
    critical: CriticalSection,
    internal: Heap<I>,
    external: Heap<E>,
    port: P,
}

impl<P: Port, I: MemDriver, E: MemDriver> Kernel<P, I, E> {
    /// Assemble a kernel. Neither the drivers nor the process table are
    /// touched until [`init_heaps`](Self::init_heaps) and
    /// [`init_scheduler`](Self::init_scheduler).
    pub fn new(port: P, internal: I, external: E) -> Result<Self, Fault> {
        Ok(Self {
            scheduler: Scheduler::new(),
            critical: CriticalSection::new(),
            internal: Heap::new(internal, "internal")?,
            external: Heap::new(external, "external")?,
            port,
        })
    }

    // -----------------------------------------------------------------------
    // Boot
    // -----------------------------------------------------------------------

    /// Initialize every heap driver and mark all usable memory free.
    pub fn init_heaps(&mut self) {
        self.internal.init();
        self.external.init();
    }

    /// Clear the process table, register `idle` as process 0 and every
    /// autostart program after it.
    ///
    /// Autostart programs that do not fit in the table are dropped.
    pub fn init_scheduler(&mut self, idle: Program, autostart: &[Program]) {
        self.scheduler.reset();
        self.scheduler.exec(Some(idle), DEFAULT_PRIORITY, &self.port);
        for &program in autostart {
            if self.exec(program, DEFAULT_PRIORITY).is_none() {
                warn!("autostart: process table full");
                break;
            }
        }
        debug!("scheduler initialized, {} processes", self.active_processes());
    }

    /// Put the idle process on the CPU. Returns its saved stack pointer
    /// offset for the port to launch.
    pub fn start(&mut self) -> usize {
        self.scheduler.start()
    }

    // -----------------------------------------------------------------------
    // Faults
    // -----------------------------------------------------------------------

    fn raise(port: &mut P, fault: Fault) {
        match fault.severity() {
            Severity::Recoverable => {
                warn!("{}", fault);
                port.report(&fault);
            }
            Severity::Halting => {
                error!("{}", fault);
                port.report(&fault);
                port.halt(&fault);
            }
        }
    }

    fn fail(&mut self, fault: Fault) {
        Self::raise(&mut self.port, fault);
    }

    // -----------------------------------------------------------------------
    // Context switching
    // -----------------------------------------------------------------------

    /// Run the scheduler and carry the critical-section depth along with
    /// the CPU. The outgoing process parks its nesting levels in its control
    /// block and the incoming one gets its own levels back, so a process
    /// that gives up the CPU inside a critical section never masks the
    /// timer for the next one.
    fn dispatch(
        scheduler: &mut Scheduler,
        critical: &mut CriticalSection,
        port: &mut P,
        saved_sp: usize,
    ) -> Result<ProcessId, Fault> {
        let depth = critical.suspend(port);
        if let Some(p) = scheduler.process_mut(scheduler.current()) {
            p.critical_depth = depth;
        }
        let result = scheduler.switch_context(saved_sp);
        let resumed = scheduler.process(scheduler.current()).map_or(0, |p| p.critical_depth);
        critical.restore(resumed, port);
        result
    }

    fn switch_inline(
        scheduler: &mut Scheduler,
        critical: &mut CriticalSection,
        port: &mut P,
    ) -> Option<ProcessId> {
        let sp = scheduler.process(scheduler.current()).map_or(0, |p| p.sp);
        match Self::dispatch(scheduler, critical, port, sp) {
            Ok(next) => Some(next),
            Err(fault) => {
                Self::raise(port, fault);
                None
            }
        }
    }

    /// Scheduling half of a context switch for interrupt-driven ports.
    ///
    /// `saved_sp` is the offset of the outgoing process's saved context in
    /// its stack; the return value is the offset to restore for the
    /// incoming one.
    pub fn switch_context(&mut self, saved_sp: usize) -> usize {
        match Self::dispatch(&mut self.scheduler, &mut self.critical, &mut self.port, saved_sp) {
            Ok(next) => self.scheduler.processes()[next].sp,
            Err(fault) => {
                self.fail(fault);
                saved_sp
            }
        }
    }

    /// Timer tick for ports that deliver it as a call.
    ///
    /// Ignored while a critical section is active, as the masked interrupt
    /// would be. Returns the process that runs next.
    pub fn tick(&mut self) -> Option<ProcessId> {
        if self.critical.is_active() {
            return None;
        }
        Self::switch_inline(&mut self.scheduler, &mut self.critical, &mut self.port)
    }

    /// Give up the CPU. The running process stays ready.
    ///
    /// May be called inside a critical section: the nesting levels stay with
    /// the caller and are re-established when it is switched back in.
    pub fn yield_now(&mut self) {
        Self::yield_cpu(&mut self.scheduler, &mut self.critical, &mut self.port);
    }

    fn yield_cpu(scheduler: &mut Scheduler, critical: &mut CriticalSection, port: &mut P) {
        scheduler.request_yield();
        if port.pend_switch() {
            Self::switch_inline(scheduler, critical, port);
        }
    }

    /// Yield from a wait inside a kernel operation. The levels taken by the
    /// operation are dropped for the switch and re-established before the
    /// operation continues.
    fn yield_suspended(scheduler: &mut Scheduler, critical: &mut CriticalSection, port: &mut P) {
        let depth = critical.suspend(port);
        Self::yield_cpu(scheduler, critical, port);
        critical.restore(depth, port);
    }

    // -----------------------------------------------------------------------
    // Process management
    // -----------------------------------------------------------------------

    /// Register `program`. `None` when the process table is full.
    pub fn exec(&mut self, program: Program, priority: Priority) -> Option<ProcessId> {
        self.enter_critical_section();
        let pid = self.scheduler.exec(Some(program), priority, &self.port);
        self.leave_critical_section();
        pid
    }

    /// Terminate `pid` and reclaim its private memory on every heap.
    ///
    /// Killing the running process does not return until another process
    /// has been switched in.
    pub fn kill(&mut self, pid: ProcessId) -> bool {
        self.enter_critical_section();
        let released = self.scheduler.release(pid);
        if released {
            self.internal.free_process_memory(pid);
            self.external.free_process_memory(pid);
        }
        self.leave_critical_section();

        if released && pid == self.scheduler.current() {
            // The dead process's nesting levels must not leak to the next one.
            self.critical.suspend(&mut self.port);
            loop {
                self.yield_now();
                compiler_fence(Ordering::SeqCst);
                if self.scheduler.current() != pid {
                    break;
                }
                core::hint::spin_loop();
            }
        }
        released
    }

    /// Terminate the running process.
    pub fn exit(&mut self) {
        let pid = self.current();
        self.kill(pid);
    }

    /// Program of the running process. Used by the dispatcher trampoline.
    pub fn current_program(&self) -> Option<Program> {
        self.scheduler
            .process(self.scheduler.current())
            .and_then(|p| p.program)
    }

    #[inline]
    pub fn current(&self) -> ProcessId {
        self.scheduler.current()
    }

    /// Control block of `pid`.
    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        self.scheduler.process(pid)
    }

    /// Number of occupied process slots, idle included.
    pub fn active_processes(&self) -> usize {
        self.scheduler
            .processes()
            .iter()
            .filter(|p| p.state != ProcessState::Unused)
            .count()
    }

    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        self.scheduler.strategy()
    }

    pub fn set_scheduling_strategy(&mut self, strategy: SchedulingStrategy) {
        self.enter_critical_section();
        self.scheduler.set_strategy(strategy);
        self.leave_critical_section();
    }

    /// Timer-driven switches since boot.
    pub fn ticks(&self) -> u64 {
        self.scheduler.tick_count()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    // -----------------------------------------------------------------------
    // Critical sections
    // -----------------------------------------------------------------------

    pub fn enter_critical_section(&mut self) {
        if let Err(fault) = self.critical.enter(&mut self.port) {
            self.fail(fault);
        }
    }

    pub fn leave_critical_section(&mut self) {
        if let Err(fault) = self.critical.leave(&mut self.port) {
            self.fail(fault);
        }
    }

    pub fn critical_depth(&self) -> u8 {
        self.critical.depth()
    }

    fn guarded<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.enter_critical_section();
        let result = f(self);
        self.leave_critical_section();
        result
    }

    /// Unwrap a heap result, reporting the fault and substituting `fallback`.
    fn settle<T>(&mut self, result: Result<T, Fault>, fallback: T) -> T {
        result.unwrap_or_else(|fault| {
            self.fail(fault);
            fallback
        })
    }

    // -----------------------------------------------------------------------
    // Heaps
    // -----------------------------------------------------------------------

    pub fn heap_count(&self) -> usize {
        HEAP_COUNT
    }

    pub fn lookup_heap(&self, index: usize) -> Option<HeapId> {
        HeapId::ALL.get(index).copied()
    }

    pub fn heap_name(&self, id: HeapId) -> &'static str {
        match id {
            HeapId::Internal => self.internal.name(),
            HeapId::External => self.external.name(),
        }
    }

    pub fn internal_heap(&mut self) -> &mut Heap<I> {
        &mut self.internal
    }

    pub fn external_heap(&mut self) -> &mut Heap<E> {
        &mut self.external
    }

    pub fn allocation_strategy(&self, id: HeapId) -> AllocStrategy {
        match id {
            HeapId::Internal => self.internal.allocation_strategy(),
            HeapId::External => self.external.allocation_strategy(),
        }
    }

    pub fn set_allocation_strategy(&mut self, id: HeapId, strategy: AllocStrategy) {
        self.guarded(|k| on_heap!(k, id, |heap| heap.set_allocation_strategy(strategy)))
    }

    pub fn use_start(&self, id: HeapId) -> MemAddr {
        match id {
            HeapId::Internal => self.internal.use_start(),
            HeapId::External => self.external.use_start(),
        }
    }

    pub fn use_size(&self, id: HeapId) -> u16 {
        match id {
            HeapId::Internal => self.internal.use_size(),
            HeapId::External => self.external.use_size(),
        }
    }

    pub fn map_entry(&mut self, id: HeapId, addr: MemAddr) -> Option<Marker> {
        self.guarded(|k| on_heap!(k, id, |heap| heap.map_entry(addr)))
    }

    pub fn set_map_entry(&mut self, id: HeapId, addr: MemAddr, marker: Marker) -> bool {
        self.guarded(|k| on_heap!(k, id, |heap| heap.set_map_entry(addr, marker)))
    }

    pub fn chunk_size(&mut self, id: HeapId, addr: MemAddr) -> u16 {
        self.guarded(|k| on_heap!(k, id, |heap| heap.chunk_size(addr)))
    }

    pub fn free_run_len(&mut self, id: HeapId, addr: MemAddr) -> u16 {
        self.guarded(|k| on_heap!(k, id, |heap| heap.free_run_len(addr)))
    }

    pub fn chunk_owner(&mut self, id: HeapId, addr: MemAddr) -> Option<ProcessId> {
        self.guarded(|k| on_heap!(k, id, |heap| heap.chunk_owner(addr)))
    }

    pub fn alloc_frame(&self, id: HeapId, pid: ProcessId) -> Option<(MemAddr, MemAddr)> {
        match id {
            HeapId::Internal => self.internal.alloc_frame(pid),
            HeapId::External => self.external.alloc_frame(pid),
        }
    }

    /// Raw byte read from the heap's device.
    pub fn read(&mut self, id: HeapId, addr: MemAddr) -> u8 {
        self.guarded(|k| on_heap!(k, id, |heap| heap.read(addr)))
    }

    /// Raw byte write to the heap's device.
    pub fn write(&mut self, id: HeapId, addr: MemAddr, value: u8) {
        self.guarded(|k| on_heap!(k, id, |heap| heap.write(addr, value)))
    }

    // --- private memory ---

    pub fn malloc(&mut self, id: HeapId, size: u16) -> Option<MemAddr> {
        let pid = self.current();
        self.guarded(|k| on_heap!(k, id, |heap| heap.malloc(pid, size)))
    }

    pub fn free(&mut self, id: HeapId, addr: MemAddr) {
        let pid = self.current();
        let result = self.guarded(|k| on_heap!(k, id, |heap| heap.free(pid, addr)));
        self.settle(result, ());
    }

    pub fn realloc(&mut self, id: HeapId, addr: MemAddr, size: u16) -> Option<MemAddr> {
        let pid = self.current();
        let result = self.guarded(|k| on_heap!(k, id, |heap| heap.realloc(pid, addr, size)));
        self.settle(result, None)
    }

    /// Release every private chunk `pid` holds on the heap.
    pub fn free_process_memory(&mut self, id: HeapId, pid: ProcessId) -> usize {
        self.guarded(|k| on_heap!(k, id, |heap| heap.free_process_memory(pid)))
    }

    // --- shared memory ---

    pub fn sh_malloc(&mut self, id: HeapId, size: u16) -> Option<MemAddr> {
        self.guarded(|k| on_heap!(k, id, |heap| heap.sh_malloc(size)))
    }

    /// Free a shared chunk once nobody holds it open, then null `*ptr`.
    /// Yields to other processes while the chunk is open.
    pub fn sh_free(&mut self, id: HeapId, ptr: &mut MemAddr) {
        let result = self.guarded(|k| {
            on_heap!(k, id, |heap| heap.sh_free(ptr, |_| {
                Self::yield_suspended(&mut k.scheduler, &mut k.critical, &mut k.port)
            }))
        });
        self.settle(result, ());
    }

    pub fn sh_read_open(&mut self, id: HeapId, addr: MemAddr) -> Option<MemAddr> {
        let result = self.guarded(|k| {
            on_heap!(k, id, |heap| heap.sh_read_open(addr, |_| {
                Self::yield_suspended(&mut k.scheduler, &mut k.critical, &mut k.port)
            }))
        });
        self.settle(result, None)
    }

    pub fn sh_write_open(&mut self, id: HeapId, addr: MemAddr) -> Option<MemAddr> {
        let result = self.guarded(|k| on_heap!(k, id, |heap| heap.sh_write_open(addr)));
        self.settle(result, None)
    }

    pub fn sh_close(&mut self, id: HeapId, addr: MemAddr) {
        let result = self.guarded(|k| on_heap!(k, id, |heap| heap.sh_close(addr)));
        self.settle(result, ());
    }

    pub fn sh_state(&mut self, id: HeapId, addr: MemAddr) -> Option<ShState> {
        self.guarded(|k| on_heap!(k, id, |heap| heap.sh_state(addr)))
    }

    /// Copy `dest.len()` bytes out of a shared chunk. `false` if the chunk
    /// could not be opened or the range is out of bounds.
    pub fn sh_read(&mut self, id: HeapId, addr: MemAddr, offset: u16, dest: &mut [u8]) -> bool {
        let result = self.guarded(|k| {
            on_heap!(k, id, |heap| heap.sh_read(addr, offset, dest, |_| {
                Self::yield_suspended(&mut k.scheduler, &mut k.critical, &mut k.port)
            }))
        });
        self.settle(result, false)
    }

    /// Copy `src` into a shared chunk. `false` if the chunk is open
    /// elsewhere or the range is out of bounds.
    pub fn sh_write(&mut self, id: HeapId, addr: MemAddr, offset: u16, src: &[u8]) -> bool {
        let result = self.guarded(|k| on_heap!(k, id, |heap| heap.sh_write(addr, offset, src)));
        self.settle(result, false)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;
    use crate::mem::RamDriver;
    use crate::process::IDLE;

    type TestKernel = Kernel<SimPort, RamDriver<30>, RamDriver<60>>;

    fn idle() {}
    fn worker() {}

    fn kernel(workers: usize) -> TestKernel {
        let mut k = Kernel::new(SimPort::new(), RamDriver::new(0x100), RamDriver::new(0x10)).unwrap();
        k.init_heaps();
        let programs = [worker as Program; 7];
        k.init_scheduler(idle, &programs[..workers]);
        k.start();
        k
    }

    #[test]
    fn test_boot_registers_idle_and_autostart() {
        let k = kernel(3);
        assert_eq!(k.active_processes(), 4);
        assert_eq!(k.current(), IDLE);
        assert_eq!(k.process(IDLE).map(|p| p.state), Some(ProcessState::Running));
        assert_eq!(k.process(3).map(|p| p.priority), Some(DEFAULT_PRIORITY));
        assert_eq!(k.process(4).map(|p| p.state), Some(ProcessState::Unused));
    }

    #[test]
    fn test_heap_registry() {
        let k = kernel(0);
        assert_eq!(k.heap_count(), 2);
        assert_eq!(k.lookup_heap(0), Some(HeapId::Internal));
        assert_eq!(k.lookup_heap(1), Some(HeapId::External));
        assert_eq!(k.lookup_heap(2), None);
        assert_eq!(k.heap_name(HeapId::Internal), "internal");
        assert_eq!(k.heap_name(HeapId::External), "external");
        assert_eq!(k.use_size(HeapId::External), 40);
    }

    #[test]
    fn test_tick_is_ignored_inside_critical_section() {
        let mut k = kernel(2);
        k.enter_critical_section();
        assert!(!k.port().scheduler_irq_enabled());
        assert_eq!(k.tick(), None);
        assert_eq!(k.current(), IDLE);
        k.leave_critical_section();
        assert_eq!(k.tick(), Some(1));
        assert_eq!(k.ticks(), 1);
    }

    #[test]
    fn test_heap_calls_run_as_current_process() {
        let mut k = kernel(2);
        assert_eq!(k.malloc(HeapId::Internal, 4), None, "idle owns no memory");

        k.tick();
        let a = k.malloc(HeapId::Internal, 4).unwrap();
        assert_eq!(k.chunk_owner(HeapId::Internal, a), Some(1));
        assert_eq!(k.critical_depth(), 0);
        assert!(k.port().scheduler_irq_enabled());

        k.tick();
        assert_eq!(k.current(), 2);
        k.free(HeapId::Internal, a);
        assert!(matches!(k.port().last_fault(), Some(Fault::NotOwner { owner: 1, caller: 2, .. })));
        assert_eq!(k.chunk_size(HeapId::Internal, a), 4);
    }

    #[test]
    fn test_kill_reclaims_memory_on_both_heaps() {
        let mut k = kernel(2);
        k.tick();
        let a = k.malloc(HeapId::Internal, 5).unwrap();
        let b = k.malloc(HeapId::External, 7).unwrap();
        k.tick();

        assert!(k.kill(1));
        assert_eq!(k.chunk_size(HeapId::Internal, a), 0);
        assert_eq!(k.chunk_size(HeapId::External, b), 0);
        assert_eq!(k.alloc_frame(HeapId::External, 1), None);
        assert!(!k.kill(1));
        assert!(!k.kill(IDLE));
    }

    #[test]
    fn test_self_kill_switches_away() {
        let mut k = kernel(2);
        k.tick();
        assert_eq!(k.current(), 1);
        k.enter_critical_section();
        k.exit();
        assert_eq!(k.current(), 2);
        assert_eq!(k.critical_depth(), 0);
        assert_eq!(k.process(1).map(|p| p.state), Some(ProcessState::Unused));
    }

    #[test]
    fn test_yield_is_not_a_tick() {
        let mut k = kernel(2);
        k.yield_now();
        assert_eq!(k.current(), 1);
        assert_eq!(k.ticks(), 0);
        assert_eq!(k.port().switch_requests(), 1);
    }

    #[test]
    fn test_yield_inside_critical_section_keeps_levels_with_caller() {
        let mut k = kernel(2);
        k.tick();
        assert_eq!(k.current(), 1);
        k.enter_critical_section();
        k.enter_critical_section();
        k.yield_now();

        assert_eq!(k.current(), 2);
        assert_eq!(k.critical_depth(), 0);
        assert!(k.port().scheduler_irq_enabled());
        assert_eq!(k.process(1).map(|p| p.critical_depth), Some(2));

        // Process 2 is preemptible: the next tick goes back to process 1,
        // which resumes with its own nesting and the timer masked again.
        assert_eq!(k.tick(), Some(1));
        assert_eq!(k.ticks(), 2);
        assert_eq!(k.critical_depth(), 2);
        assert!(!k.port().scheduler_irq_enabled());
        assert_eq!(k.tick(), None);

        k.leave_critical_section();
        k.leave_critical_section();
        assert_eq!(k.tick(), Some(2));
        assert_eq!(k.port().fault_count(), 0);
    }

    #[test]
    fn test_critical_underflow_is_reported() {
        let mut k = kernel(0);
        k.leave_critical_section();
        assert_eq!(k.port().last_fault(), Some(Fault::CriticalSectionUnderflow));
        assert_eq!(k.critical_depth(), 0);
    }

    #[test]
    fn test_shared_violation_is_reported_and_closed() {
        let mut k = kernel(1);
        let s = k.sh_malloc(HeapId::External, 3).unwrap();
        assert!(k.sh_write(HeapId::External, s, 0, &[1, 2, 3]));
        assert!(!k.sh_write(HeapId::External, s, 1, &[1, 2, 3]));
        assert!(matches!(k.port().last_fault(), Some(Fault::WriteViolation { size: 3, .. })));
        assert_eq!(k.sh_state(HeapId::External, s), Some(ShState::Closed));

        let mut buf = [0u8; 3];
        assert!(k.sh_read(HeapId::External, s, 0, &mut buf));
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_read_open_yields_to_writer() {
        let mut k = kernel(2);
        let s = k.sh_malloc(HeapId::Internal, 2).unwrap();
        assert_eq!(k.sh_write_open(HeapId::Internal, s), Some(s));
        // The writer never runs on the host, so the one allowed yield
        // switches processes and the open is refused.
        assert_eq!(k.sh_read_open(HeapId::Internal, s), None);
        assert_eq!(k.current(), 1);
        assert_eq!(k.critical_depth(), 0);
        assert_eq!(k.port().fault_count(), 0);
    }

    #[test]
    #[should_panic(expected = "system halted")]
    fn test_stack_corruption_halts() {
        let mut k = kernel(2);
        k.tick();
        if let Some(p) = k.scheduler.process_mut(2) {
            let top = p.stack.0.len() - 1;
            p.stack.0[top] ^= 0xFF;
        }
        k.tick();
    }
}
