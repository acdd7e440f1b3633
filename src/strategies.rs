//! # Scheduling Strategies
//!
//! Selection functions used by the context switch to decide which process
//! runs next. Each strategy is a function of the process table snapshot and
//! the previously running process; the few that need memory between calls
//! (round-robin slice, inactive-aging ages, feedback queues, random
//! generator) keep it in [`SchedulingInformation`].
//!
//! Every strategy falls back to the idle process when no other process is
//! ready. None of them ever returns an unused slot.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::{MAX_PROCESSES, MLFQ_QUEUES, MLFQ_TIME_SLICES, RANDOM_SEED};
use crate::process::{Priority, Process, ProcessId, IDLE};

/// Accumulated waiting credit under inactive aging.
pub type Age = u16;

/// Selectable scheduling algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingStrategy {
    Even,
    Random,
    RoundRobin,
    InactiveAging,
    RunToCompletion,
    MultiLevelFeedbackQueue,
}

/// Why the running process is being switched out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchCause {
    /// Timer interrupt: the process used up one tick.
    Tick,
    /// The process gave up the CPU voluntarily.
    Yield,
}

// ---------------------------------------------------------------------------
// Process queue
// ---------------------------------------------------------------------------

/// Fixed-capacity FIFO of process ids.
#[derive(Debug, Clone)]
pub struct ProcessQueue {
    data: [ProcessId; MAX_PROCESSES],
    head: usize,
    len: usize,
}

impl ProcessQueue {
    pub const fn new() -> Self {
        Self {
            data: [IDLE; MAX_PROCESSES],
            head: 0,
            len: 0,
        }
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Append `pid` at the tail. A full queue ignores the request; with one
    /// slot per process this only happens on a duplicate insert.
    pub fn append(&mut self, pid: ProcessId) {
        if self.len == MAX_PROCESSES {
            return;
        }
        self.data[(self.head + self.len) % MAX_PROCESSES] = pid;
        self.len += 1;
    }

    /// Remove every occurrence of `pid`, keeping the order of the others.
    pub fn remove(&mut self, pid: ProcessId) {
        self.retain(|p| p != pid);
    }

    pub fn retain(&mut self, mut keep: impl FnMut(ProcessId) -> bool) {
        let mut kept = [IDLE; MAX_PROCESSES];
        let mut n = 0;
        for p in self.iter() {
            if keep(p) {
                kept[n] = p;
                n += 1;
            }
        }
        self.data = kept;
        self.head = 0;
        self.len = n;
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.iter().any(|p| p == pid)
    }

    /// Ids from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = ProcessId> + '_ {
        (0..self.len).map(move |i| self.data[(self.head + i) % MAX_PROCESSES])
    }
}

impl Default for ProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Feedback queue a priority maps to: the top two bits select the class,
/// queue 0 holding the most favourable one.
#[inline]
pub fn priority_class(priority: Priority) -> usize {
    MLFQ_QUEUES - 1 - (priority >> 6) as usize
}

// ---------------------------------------------------------------------------
// Stateless strategies
// ---------------------------------------------------------------------------

/// Next ready non-idle process in ascending circular order after `current`.
fn next_ready_after(processes: &[Process], current: ProcessId) -> Option<ProcessId> {
    let n = processes.len();
    (1..=n)
        .map(|offset| (current + offset) % n)
        .find(|&pid| pid != IDLE && processes[pid].is_ready())
}

/// Even: every ready process gets one tick in turn. Idle only runs when it
/// is the sole ready process.
pub fn even(processes: &[Process], current: ProcessId) -> ProcessId {
    let total_ready = processes.iter().filter(|p| p.is_ready()).count();
    if total_ready == 1 && processes[IDLE].is_ready() {
        return IDLE;
    }
    next_ready_after(processes, current).unwrap_or(IDLE)
}

/// Random: uniform choice among the ready non-idle processes.
pub fn random(processes: &[Process], rng: &mut SmallRng) -> ProcessId {
    let ready = processes
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, p)| p.is_ready())
        .count();
    if ready == 0 {
        return IDLE;
    }
    let pick = rng.gen_range(0..ready);
    processes
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, p)| p.is_ready())
        .nth(pick)
        .map(|(pid, _)| pid)
        .unwrap_or(IDLE)
}

/// Run-to-completion: keep the previous process while it is ready,
/// otherwise fall back to [`even`].
pub fn run_to_completion(processes: &[Process], current: ProcessId) -> ProcessId {
    if current != IDLE && processes[current].is_ready() {
        return current;
    }
    even(processes, current)
}

// ---------------------------------------------------------------------------
// Scheduling information
// ---------------------------------------------------------------------------

/// Auxiliary state of the stateful strategies.
pub struct SchedulingInformation {
    /// Remaining slice of the running process under round-robin.
    time_slice: u8,
    /// Inactive-aging credit per process.
    age: [Age; MAX_PROCESSES],
    /// Remaining MLFQ slice per process.
    slices: [u8; MAX_PROCESSES],
    queues: [ProcessQueue; MLFQ_QUEUES],
    rng: SmallRng,
}

impl SchedulingInformation {
    pub fn new() -> Self {
        Self {
            time_slice: 0,
            age: [0; MAX_PROCESSES],
            slices: [0; MAX_PROCESSES],
            queues: [
                ProcessQueue::new(),
                ProcessQueue::new(),
                ProcessQueue::new(),
                ProcessQueue::new(),
            ],
            rng: SmallRng::seed_from_u64(RANDOM_SEED),
        }
    }

    /// Run the selected strategy.
    pub fn select(
        &mut self,
        strategy: SchedulingStrategy,
        processes: &[Process],
        current: ProcessId,
        cause: SwitchCause,
    ) -> ProcessId {
        match strategy {
            SchedulingStrategy::Even => even(processes, current),
            SchedulingStrategy::Random => random(processes, &mut self.rng),
            SchedulingStrategy::RoundRobin => self.round_robin(processes, current),
            SchedulingStrategy::InactiveAging => self.inactive_aging(processes),
            SchedulingStrategy::RunToCompletion => run_to_completion(processes, current),
            SchedulingStrategy::MultiLevelFeedbackQueue => self.mlfq(processes, current, cause),
        }
    }

    /// Rebuild every strategy's state from the current table snapshot.
    /// Called whenever the active strategy changes.
    pub fn reset(&mut self, processes: &[Process], current: ProcessId) {
        self.time_slice = processes[current].priority;
        self.age = [0; MAX_PROCESSES];
        self.slices = [0; MAX_PROCESSES];
        for q in self.queues.iter_mut() {
            q.reset();
        }
        for (pid, p) in processes.iter().enumerate().skip(1) {
            if !p.is_unused() {
                self.admit(pid, p.priority);
            }
        }
    }

    /// Forget everything recorded about a process slot. Called when the
    /// slot is reused by `exec` or released by `kill`.
    pub fn reset_process(&mut self, pid: ProcessId) {
        self.age[pid] = 0;
        self.slices[pid] = 0;
        for q in self.queues.iter_mut() {
            q.remove(pid);
        }
    }

    /// Remaining round-robin slice.
    pub fn time_slice(&self) -> u8 {
        self.time_slice
    }

    pub fn age(&self, pid: ProcessId) -> Age {
        self.age[pid]
    }

    /// Feedback queue currently holding `pid`.
    pub fn queue_of(&self, pid: ProcessId) -> Option<usize> {
        self.queues.iter().position(|q| q.contains(pid))
    }

    pub fn queue(&self, level: usize) -> &ProcessQueue {
        &self.queues[level]
    }

    /// Remaining MLFQ slice of `pid`.
    pub fn remaining_slice(&self, pid: ProcessId) -> u8 {
        self.slices[pid]
    }

    /// Round-robin: the running process keeps the CPU while its slice
    /// (loaded from its priority) exceeds 1; then the next ready process in
    /// circular order takes over with a fresh slice.
    fn round_robin(&mut self, processes: &[Process], current: ProcessId) -> ProcessId {
        if current != IDLE && processes[current].is_ready() && self.time_slice > 1 {
            self.time_slice -= 1;
            return current;
        }
        match next_ready_after(processes, current) {
            Some(next) => {
                self.time_slice = processes[next].priority;
                next
            }
            None => IDLE,
        }
    }

    /// Inactive aging: every waiting process ages by its priority; the
    /// oldest wins, ties broken by higher priority, then lower id. The
    /// winner's age restarts at 0.
    fn inactive_aging(&mut self, processes: &[Process]) -> ProcessId {
        for (pid, p) in processes.iter().enumerate().skip(1) {
            if p.is_ready() {
                self.age[pid] = self.age[pid].saturating_add(p.priority as Age);
            }
        }

        let mut selected: Option<ProcessId> = None;
        for (pid, p) in processes.iter().enumerate().skip(1) {
            if !p.is_ready() {
                continue;
            }
            selected = match selected {
                None => Some(pid),
                Some(best) => {
                    let key = (self.age[pid], p.priority);
                    let best_key = (self.age[best], processes[best].priority);
                    // Ascending scan: equal keys keep the lower id.
                    if key > best_key {
                        Some(pid)
                    } else {
                        Some(best)
                    }
                }
            };
        }

        match selected {
            Some(pid) => {
                self.age[pid] = 0;
                pid
            }
            None => IDLE,
        }
    }

    /// Enqueue `pid` in the queue of its priority class with a full slice.
    fn admit(&mut self, pid: ProcessId, priority: Priority) {
        let level = priority_class(priority);
        self.slices[pid] = MLFQ_TIME_SLICES[level];
        self.queues[level].append(pid);
    }

    /// Multi-level feedback queue.
    ///
    /// The process that just ran is charged one tick; once its slice is
    /// used up it moves to the tail of the next lower queue (the lowest
    /// queue keeps it) with that queue's slice. A voluntary yield is not
    /// charged: the process goes to the tail of its own queue and keeps its
    /// remaining slice. The head-most ready process of the highest
    /// non-empty queue runs next.
    fn mlfq(&mut self, processes: &[Process], current: ProcessId, cause: SwitchCause) -> ProcessId {
        for q in self.queues.iter_mut() {
            q.retain(|pid| pid != IDLE && !processes[pid].is_unused());
        }

        if current != IDLE && processes[current].is_ready() {
            if let Some(level) = self.queue_of(current) {
                match cause {
                    SwitchCause::Tick => {
                        self.slices[current] = self.slices[current].saturating_sub(1);
                        if self.slices[current] == 0 {
                            let lower = (level + 1).min(MLFQ_QUEUES - 1);
                            self.queues[level].remove(current);
                            self.queues[lower].append(current);
                            self.slices[current] = MLFQ_TIME_SLICES[lower];
                        }
                    }
                    SwitchCause::Yield => {
                        // Level and slice are kept, the queue position is
                        // not: left at the head, a yielding process would
                        // be selected again immediately.
                        self.queues[level].remove(current);
                        self.queues[level].append(current);
                    }
                }
            }
        }

        for (pid, p) in processes.iter().enumerate().skip(1) {
            if p.is_ready() && self.queue_of(pid).is_none() {
                self.admit(pid, p.priority);
            }
        }

        self.queues
            .iter()
            .find_map(|q| q.iter().find(|&pid| processes[pid].is_ready()))
            .unwrap_or(IDLE)
    }
}

impl Default for SchedulingInformation {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
