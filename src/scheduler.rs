//! # Scheduler
//!
//! Process table and context-switch state machine.
//!
//! ## Context Switch
//!
//! At every timer interrupt (or voluntary yield) the port saves the running
//! process's registers onto its own stack and hands the resulting stack
//! pointer to [`Scheduler::switch_context`], which:
//! 1. Records the stack pointer in the running process's PCB
//! 2. Reverts it to `Ready` unless it left the `Running` state meanwhile
//! 3. Seals its stack with a fresh checksum
//! 4. Asks the active strategy for the next process
//! 5. Verifies the next process's checksum (mismatch is a halting fault)
//! 6. Marks it `Running` and returns its stack pointer for the port to
//!    restore
//!
//! No other code runs during a switch, so the table is always observed in a
//! consistent state by the strategies.

use log::{debug, trace};

use crate::arch::Port;
use crate::config::MAX_PROCESSES;
use crate::error::Fault;
use crate::process::{Priority, Process, ProcessId, ProcessState, Program, IDLE};
use crate::strategies::{SchedulingInformation, SchedulingStrategy, SwitchCause};

/// Process table plus the state of the active scheduling strategy.
pub struct Scheduler {
    /// Fixed-size table. Slot 0 is the idle process.
    processes: [Process; MAX_PROCESSES],

    /// Process currently owning the CPU.
    current: ProcessId,

    strategy: SchedulingStrategy,

    info: SchedulingInformation,

    /// Number of timer-driven switches performed.
    tick_count: u64,

    /// Set by a voluntary yield, consumed by the next switch.
    yield_pending: bool,
}

impl Scheduler {
    /// Create a scheduler with every slot unused and the Even strategy.
    pub fn new() -> Self {
        Self {
            processes: core::array::from_fn(|_| Process::empty()),
            current: IDLE,
            strategy: SchedulingStrategy::Even,
            info: SchedulingInformation::new(),
            tick_count: 0,
            yield_pending: false,
        }
    }

    /// Mark every slot unused. Called once at boot before the idle process
    /// and the autostart programs are registered.
    pub fn reset(&mut self) {
        for p in self.processes.iter_mut() {
            p.state = ProcessState::Unused;
            p.program = None;
        }
        self.current = IDLE;
        self.yield_pending = false;
        self.info.reset(&self.processes, IDLE);
    }

    /// Register `program` in the first unused slot.
    ///
    /// The slot's stack is prepared by the port so the first resume enters
    /// the dispatcher trampoline. Returns `None` when the table is full or
    /// no program is given.
    pub fn exec(
        &mut self,
        program: Option<Program>,
        priority: Priority,
        port: &impl Port,
    ) -> Option<ProcessId> {
        let program = program?;
        let pid = self.processes.iter().position(Process::is_unused)?;

        let p = &mut self.processes[pid];
        p.program = Some(program);
        p.priority = priority;
        p.state = ProcessState::Ready;
        p.critical_depth = 0;
        p.sp = port.init_stack(&mut p.stack);
        p.seal_stack();

        self.info.reset_process(pid);
        debug!("exec: process {} registered with priority {}", pid, priority);
        Some(pid)
    }

    /// Release the slot of `pid`.
    ///
    /// Refuses the idle process, out-of-range ids and unused slots. Heap
    /// memory is reclaimed by the caller.
    pub fn release(&mut self, pid: ProcessId) -> bool {
        if pid == IDLE || pid >= MAX_PROCESSES || self.processes[pid].is_unused() {
            return false;
        }
        let p = &mut self.processes[pid];
        p.state = ProcessState::Unused;
        p.program = None;
        self.info.reset_process(pid);
        debug!("kill: process {} released", pid);
        true
    }

    /// Put the idle process on the CPU. Returns its stack pointer for the
    /// port to restore.
    pub fn start(&mut self) -> usize {
        self.current = IDLE;
        let idle = &mut self.processes[IDLE];
        idle.state = ProcessState::Running;
        idle.sp
    }

    /// Flag the next switch as a voluntary yield of the running process.
    pub fn request_yield(&mut self) {
        self.yield_pending = true;
    }

    /// Perform the scheduling half of a context switch.
    ///
    /// `saved_sp` is the running process's stack pointer after its context
    /// was pushed. Returns the process to resume; its stack pointer is
    /// available through [`process`](Self::process).
    pub fn switch_context(&mut self, saved_sp: usize) -> Result<ProcessId, Fault> {
        let prev = self.current;
        let p = &mut self.processes[prev];
        p.sp = saved_sp;
        if p.state == ProcessState::Running {
            p.state = ProcessState::Ready;
        }
        p.seal_stack();

        let cause = if core::mem::take(&mut self.yield_pending) {
            SwitchCause::Yield
        } else {
            self.tick_count += 1;
            SwitchCause::Tick
        };

        let next = self
            .info
            .select(self.strategy, &self.processes, prev, cause);

        let n = &mut self.processes[next];
        let found = n.stack_checksum();
        if found != n.checksum {
            return Err(Fault::StackCorrupted {
                pid: next,
                expected: n.checksum,
                found,
            });
        }
        n.state = ProcessState::Running;
        self.current = next;

        trace!("switch: {} -> {} ({:?})", prev, next, cause);
        Ok(next)
    }

    /// Process currently owning the CPU.
    #[inline]
    pub fn current(&self) -> ProcessId {
        self.current
    }

    /// Control block of `pid`, if in range.
    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(pid)
    }

    pub fn process_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(pid)
    }

    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Switch algorithms. All strategy state is rebuilt from the current
    /// table snapshot.
    pub fn set_strategy(&mut self, strategy: SchedulingStrategy) {
        self.strategy = strategy;
        self.info.reset(&self.processes, self.current);
        debug!("scheduling strategy set to {:?}", strategy);
    }

    pub fn info(&self) -> &SchedulingInformation {
        &self.info
    }

    /// Number of timer-driven switches since boot.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;

    fn noop() {}

    /// Scheduler with idle plus `n` user processes, idle running.
    fn booted(n: usize, priority: Priority) -> Scheduler {
        let port = SimPort::new();
        let mut s = Scheduler::new();
        s.reset();
        assert_eq!(s.exec(Some(noop), 1, &port), Some(IDLE));
        for _ in 0..n {
            s.exec(Some(noop), priority, &port).unwrap();
        }
        s.start();
        s
    }

    fn tick(s: &mut Scheduler) -> ProcessId {
        let sp = s.process(s.current()).unwrap().sp;
        s.switch_context(sp).unwrap()
    }

    #[test]
    fn test_exec_fills_first_free_slot() {
        let port = SimPort::new();
        let mut s = booted(2, 5);
        assert!(s.release(1));
        assert_eq!(s.exec(Some(noop), 9, &port), Some(1));
        let p = s.process(1).unwrap();
        assert_eq!(p.priority, 9);
        assert_eq!(p.state, ProcessState::Ready);
        assert_eq!(p.checksum, p.stack_checksum());
    }

    #[test]
    fn test_exec_rejects_missing_program_and_full_table() {
        let port = SimPort::new();
        let mut s = booted(MAX_PROCESSES - 1, 1);
        assert_eq!(s.exec(Some(noop), 1, &port), None);
        assert!(s.release(3));
        assert_eq!(s.exec(None, 1, &port), None);
        assert_eq!(s.exec(Some(noop), 1, &port), Some(3));
    }

    #[test]
    fn test_release_refusals() {
        let mut s = booted(1, 1);
        assert!(!s.release(IDLE));
        assert!(!s.release(5), "unused slot");
        assert!(!s.release(MAX_PROCESSES));
        assert!(s.release(1));
        assert!(!s.release(1), "already released");
    }

    #[test]
    fn test_switch_marks_running_and_reverts_previous() {
        let mut s = booted(2, 1);
        assert_eq!(s.process(IDLE).unwrap().state, ProcessState::Running);

        assert_eq!(tick(&mut s), 1);
        assert_eq!(s.process(IDLE).unwrap().state, ProcessState::Ready);
        assert_eq!(s.process(1).unwrap().state, ProcessState::Running);

        assert_eq!(tick(&mut s), 2);
        assert_eq!(s.process(1).unwrap().state, ProcessState::Ready);
        assert_eq!(s.tick_count(), 2);
    }

    #[test]
    fn test_even_fairness_over_three_switches() {
        let mut s = booted(3, 1);
        tick(&mut s);
        for _ in 0..5 {
            let mut seen = [false; MAX_PROCESSES];
            for _ in 0..3 {
                seen[tick(&mut s)] = true;
            }
            assert!(seen[1] && seen[2] && seen[3]);
            assert!(!seen[IDLE]);
        }
    }

    #[test]
    fn test_released_current_is_not_revived() {
        let mut s = booted(2, 1);
        assert_eq!(tick(&mut s), 1);
        assert!(s.release(1));
        assert_eq!(tick(&mut s), 2);
        assert_eq!(s.process(1).unwrap().state, ProcessState::Unused);
    }

    #[test]
    fn test_idle_when_nothing_else_ready() {
        let port = SimPort::new();
        let mut s = booted(1, 1);
        assert_eq!(tick(&mut s), 1);
        assert!(s.release(1));
        assert_eq!(tick(&mut s), IDLE);
        assert_eq!(s.exec(Some(noop), 1, &port), Some(1));
        assert_eq!(tick(&mut s), 1);
    }

    #[test]
    fn test_corrupted_stack_is_detected() {
        let mut s = booted(2, 1);
        assert_eq!(tick(&mut s), 1);

        // Scribble over process 2's saved context while it waits.
        let p2 = s.process_mut(2).unwrap();
        let sp = p2.sp;
        p2.stack.0[sp + 3] ^= 0x5A;

        let sp = s.process(1).unwrap().sp;
        match s.switch_context(sp) {
            Err(Fault::StackCorrupted { pid, .. }) => assert_eq!(pid, 2),
            other => panic!("expected stack corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_saved_context_is_resealed_on_switch_out() {
        let mut s = booted(1, 1);
        assert_eq!(tick(&mut s), 1);

        // The running process pushes more context before being switched out.
        let p1 = s.process_mut(1).unwrap();
        let sp = p1.sp - 8;
        p1.stack.0[sp..sp + 8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        assert_eq!(s.switch_context(sp).unwrap(), 1);
        let p1 = s.process(1).unwrap();
        assert_eq!(p1.sp, sp);
        assert_eq!(p1.checksum, p1.stack_checksum());
    }

    #[test]
    fn test_yield_is_not_counted_as_tick() {
        let mut s = booted(2, 1);
        tick(&mut s);
        s.request_yield();
        tick(&mut s);
        assert_eq!(s.tick_count(), 1);
    }

    #[test]
    fn test_set_strategy_resets_information() {
        let mut s = booted(2, 7);
        assert_eq!(tick(&mut s), 1);
        s.set_strategy(SchedulingStrategy::RoundRobin);
        assert_eq!(s.strategy(), SchedulingStrategy::RoundRobin);
        assert_eq!(s.info().time_slice(), 7);

        s.set_strategy(SchedulingStrategy::MultiLevelFeedbackQueue);
        assert_eq!(s.info().queue_of(1), Some(3));
        assert_eq!(s.info().queue_of(2), Some(3));
    }
}
