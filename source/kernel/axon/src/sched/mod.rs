// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-core priority-band scheduler with super-period CPU quotas
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (admit/retire/ready/unready/charge/schedule/yield_current/set_affinity),
//!             SchedParams, Selection, Placement
//! DEPENDS_ON: types::{CapId, CpuId, Priority}, smp::MAX_CPUS
//! INVARIANTS: A job is either current on exactly one core, queued on exactly one queue, or neither;
//!             affined jobs are only ever placed on their core; equal-priority jobs rotate FIFO per
//!             quantum; a job that used its quota waits for the next super-period
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::smp::MAX_CPUS;
use crate::types::{CapId, CpuId, Priority};

const BANDS: usize = Priority::LEVELS;

/// Scheduling parameters of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedParams {
    pub priority: Priority,
    /// CPU time per super-period; `0` means the whole super-period.
    pub quota_ns: u64,
    pub affinity: Option<CpuId>,
}

/// Outcome of a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Job(CapId),
    /// Nothing eligible; the core runs its idle loop.
    Idle,
}

/// Where a job became ready.
#[must_use = "placements on remote cores may need a resched request"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub cpu: CpuId,
    /// The job outranks whatever the target core runs right now.
    pub preempts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Linkage {
    None,
    Ready,
    Exhausted,
    Current,
}

#[derive(Debug, Clone)]
struct Job {
    priority: Priority,
    quota_ns: u64,
    used_ns: u64,
    slice_left_ns: u64,
    affinity: Option<CpuId>,
    cpu: CpuId,
    linkage: Linkage,
}

impl Job {
    fn over_quota(&self) -> bool {
        self.used_ns >= self.quota_ns
    }
}

struct CoreQueues {
    ready: [VecDeque<CapId>; BANDS],
    exhausted: [VecDeque<CapId>; BANDS],
    current: Option<CapId>,
    period_left_ns: u64,
    idle_ns: u64,
}

impl CoreQueues {
    fn new(super_period_ns: u64) -> Self {
        Self {
            ready: core::array::from_fn(|_| VecDeque::new()),
            exhausted: core::array::from_fn(|_| VecDeque::new()),
            current: None,
            period_left_ns: super_period_ns,
            idle_ns: 0,
        }
    }

    fn highest_ready_band(&self) -> Option<usize> {
        (0..BANDS).rev().find(|&b| !self.ready[b].is_empty())
    }

    fn remove(&mut self, id: CapId, band: usize) {
        self.ready[band].retain(|&j| j != id);
        self.exhausted[band].retain(|&j| j != id);
    }
}

/// Per-core ready queues, one FIFO per priority band.
pub struct Scheduler {
    quantum_ns: u64,
    super_period_ns: u64,
    cores: usize,
    queues: Vec<CoreQueues>,
    jobs: BTreeMap<CapId, Job>,
    remote_resched: usize,
}

// The scheduler lives inside the kernel lock and moves between cores with it.
static_assertions::assert_impl_all!(Scheduler: Send);

impl Scheduler {
    pub fn new(cores: usize, quantum_ns: u64, super_period_ns: u64) -> Self {
        let cores = cores.clamp(1, MAX_CPUS);
        let quantum_ns = quantum_ns.max(1);
        let super_period_ns = super_period_ns.max(quantum_ns);
        Self {
            quantum_ns,
            super_period_ns,
            cores,
            queues: (0..cores).map(|_| CoreQueues::new(super_period_ns)).collect(),
            jobs: BTreeMap::new(),
            remote_resched: 0,
        }
    }

    #[inline]
    pub fn quantum_ns(&self) -> u64 {
        self.quantum_ns
    }

    #[inline]
    pub fn super_period_ns(&self) -> u64 {
        self.super_period_ns
    }

    fn core_for(&self, affinity: Option<CpuId>, hint: CpuId) -> CpuId {
        match affinity {
            Some(cpu) if cpu.as_index() < self.cores => cpu,
            _ if hint.as_index() < self.cores => hint,
            _ => CpuId::BOOT,
        }
    }

    /// Registers a job. It stays off every queue until [`Self::ready`].
    pub fn admit(&mut self, id: CapId, params: SchedParams, home: CpuId) {
        let quota_ns = match params.quota_ns {
            0 => self.super_period_ns,
            q => q.min(self.super_period_ns),
        };
        let cpu = self.core_for(params.affinity, home);
        let job = Job {
            priority: params.priority,
            quota_ns,
            used_ns: 0,
            slice_left_ns: self.quantum_ns,
            affinity: params.affinity,
            cpu,
            linkage: Linkage::None,
        };
        self.jobs.insert(id, job);
        log_trace!(target: "sched", "admit {} prio={} quota={}ns", id, params.priority.band(), quota_ns);
    }

    /// Forgets a job, unlinking it from whatever queue or core holds it.
    pub fn retire(&mut self, id: CapId) {
        self.unready(id);
        self.jobs.remove(&id);
    }

    pub fn is_admitted(&self, id: CapId) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Makes `id` eligible. Unaffined jobs land on `hint`, the core that unblocked them.
    pub fn ready(&mut self, id: CapId, hint: CpuId) -> Option<Placement> {
        let job = self.jobs.get(&id)?;
        if job.linkage != Linkage::None {
            return None;
        }
        let cpu = self.core_for(job.affinity, hint);
        Some(self.enqueue(id, cpu, hint))
    }

    fn enqueue(&mut self, id: CapId, cpu: CpuId, origin: CpuId) -> Placement {
        let current_prio = self.queues[cpu.as_index()]
            .current
            .and_then(|cur| self.jobs.get(&cur))
            .map(|j| j.priority);
        let Some(job) = self.jobs.get_mut(&id) else {
            return Placement { cpu, preempts: false };
        };
        job.cpu = cpu;
        let band = job.priority.band();
        let queues = &mut self.queues[cpu.as_index()];
        if job.over_quota() {
            job.linkage = Linkage::Exhausted;
            queues.exhausted[band].push_back(id);
        } else {
            job.linkage = Linkage::Ready;
            queues.ready[band].push_back(id);
        }
        let preempts =
            job.linkage == Linkage::Ready && current_prio.map_or(true, |p| p < job.priority);
        if preempts && cpu != origin {
            self.remote_resched |= cpu.mask();
        }
        Placement { cpu, preempts }
    }

    /// Takes `id` off its queue or core (blocking, pausing, destruction).
    pub fn unready(&mut self, id: CapId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        let band = job.priority.band();
        let queues = &mut self.queues[job.cpu.as_index()];
        match job.linkage {
            Linkage::None => {}
            Linkage::Ready | Linkage::Exhausted => queues.remove(id, band),
            Linkage::Current => {
                if queues.current == Some(id) {
                    queues.current = None;
                }
            }
        }
        job.linkage = Linkage::None;
    }

    /// Job currently selected on `cpu`.
    pub fn current(&self, cpu: CpuId) -> Option<CapId> {
        self.queues.get(cpu.as_index()).and_then(|q| q.current)
    }

    /// Core `id` is running on, if it is running.
    pub fn running_on(&self, id: CapId) -> Option<CpuId> {
        self.jobs.get(&id).filter(|j| j.linkage == Linkage::Current).map(|j| j.cpu)
    }

    pub fn is_queued(&self, id: CapId) -> bool {
        self.jobs
            .get(&id)
            .is_some_and(|j| matches!(j.linkage, Linkage::Ready | Linkage::Exhausted))
    }

    /// Gives up the remainder of the current quantum on `cpu`.
    pub fn yield_current(&mut self, cpu: CpuId) {
        if let Some(cur) = self.current(cpu) {
            if let Some(job) = self.jobs.get_mut(&cur) {
                job.slice_left_ns = 0;
            }
        }
    }

    /// Changes the core binding of `id`.
    ///
    /// Queued jobs migrate immediately. Returns the core `id` is running on when
    /// that core has to re-evaluate its decision.
    pub fn set_affinity(&mut self, id: CapId, affinity: Option<CpuId>) -> Option<CpuId> {
        let cores = self.cores;
        let job = self.jobs.get_mut(&id)?;
        job.affinity = affinity.filter(|c| c.as_index() < cores);
        let target = job.affinity?;
        match job.linkage {
            Linkage::Ready | Linkage::Exhausted if job.cpu != target => {
                let origin = job.cpu;
                self.unready(id);
                let _ = self.enqueue(id, target, origin);
                None
            }
            Linkage::Current if job.cpu != target => Some(job.cpu),
            Linkage::None => {
                job.cpu = target;
                None
            }
            _ => None,
        }
    }

    /// Accounts `elapsed_ns` of execution on `cpu` to its current job and the super-period.
    pub fn charge(&mut self, cpu: CpuId, elapsed_ns: u64) {
        let Some(queues) = self.queues.get_mut(cpu.as_index()) else {
            return;
        };
        match queues.current.and_then(|cur| self.jobs.get_mut(&cur)) {
            Some(job) => {
                job.used_ns = job.used_ns.saturating_add(elapsed_ns);
                job.slice_left_ns = job.slice_left_ns.saturating_sub(elapsed_ns);
            }
            None => queues.idle_ns = queues.idle_ns.saturating_add(elapsed_ns),
        }
        let mut left = elapsed_ns;
        while left > 0 {
            let queues = &mut self.queues[cpu.as_index()];
            if left < queues.period_left_ns {
                queues.period_left_ns -= left;
                break;
            }
            left -= queues.period_left_ns;
            self.refill(cpu);
        }
    }

    fn refill(&mut self, cpu: CpuId) {
        let super_period_ns = self.super_period_ns;
        for job in self.jobs.values_mut().filter(|j| j.cpu == cpu) {
            job.used_ns = 0;
        }
        let queues = &mut self.queues[cpu.as_index()];
        queues.period_left_ns = super_period_ns;
        for band in 0..BANDS {
            while let Some(id) = queues.exhausted[band].pop_front() {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.linkage = Linkage::Ready;
                }
                queues.ready[band].push_back(id);
            }
        }
        log_trace!(target: "sched", "{} super-period refill", cpu);
    }

    /// Picks the job `cpu` runs next.
    pub fn schedule(&mut self, cpu: CpuId) -> Selection {
        let Some(queues) = self.queues.get(cpu.as_index()) else {
            return Selection::Idle;
        };
        let best_band = queues.highest_ready_band();
        if let Some(cur) = queues.current {
            if let Some(job) = self.jobs.get(&cur) {
                let band = job.priority.band();
                let migrated = job.affinity.is_some_and(|a| a != cpu);
                let outranked = best_band.is_some_and(|b| b > band);
                if !migrated && !outranked && !job.over_quota() && job.slice_left_ns > 0 {
                    return Selection::Job(cur);
                }
                self.requeue_current(cpu, cur, migrated, outranked);
            }
        }
        self.pick(cpu)
    }

    fn requeue_current(&mut self, cpu: CpuId, cur: CapId, migrated: bool, outranked: bool) {
        let quantum_ns = self.quantum_ns;
        self.queues[cpu.as_index()].current = None;
        let Some(job) = self.jobs.get_mut(&cur) else {
            return;
        };
        job.linkage = Linkage::None;
        if migrated {
            let target = job.affinity.unwrap_or(cpu);
            let _ = self.enqueue(cur, target, cpu);
            self.remote_resched |= target.mask();
            return;
        }
        let band = job.priority.band();
        let queues = &mut self.queues[cpu.as_index()];
        if job.over_quota() {
            job.slice_left_ns = quantum_ns;
            job.linkage = Linkage::Exhausted;
            queues.exhausted[band].push_back(cur);
        } else if job.slice_left_ns == 0 {
            job.slice_left_ns = quantum_ns;
            job.linkage = Linkage::Ready;
            queues.ready[band].push_back(cur);
        } else if outranked {
            job.linkage = Linkage::Ready;
            queues.ready[band].push_front(cur);
        }
    }

    fn pick(&mut self, cpu: CpuId) -> Selection {
        let quantum_ns = self.quantum_ns;
        let queues = &mut self.queues[cpu.as_index()];
        let Some(band) = queues.highest_ready_band() else {
            return Selection::Idle;
        };
        let Some(id) = queues.ready[band].pop_front() else {
            return Selection::Idle;
        };
        queues.current = Some(id);
        if let Some(job) = self.jobs.get_mut(&id) {
            job.linkage = Linkage::Current;
            job.cpu = cpu;
            if job.slice_left_ns == 0 {
                job.slice_left_ns = quantum_ns;
            }
        }
        Selection::Job(id)
    }

    /// Nanoseconds until `cpu` must re-enter the scheduler.
    pub fn next_deadline_in(&self, cpu: CpuId) -> u64 {
        let Some(queues) = self.queues.get(cpu.as_index()) else {
            return self.super_period_ns;
        };
        let budget = queues
            .current
            .and_then(|cur| self.jobs.get(&cur))
            .map_or(u64::MAX, |j| j.slice_left_ns.min(j.quota_ns.saturating_sub(j.used_ns)));
        budget.min(queues.period_left_ns).max(1)
    }

    /// Time `cpu` spent idle so far.
    pub fn idle_ns(&self, cpu: CpuId) -> u64 {
        self.queues.get(cpu.as_index()).map_or(0, |q| q.idle_ns)
    }

    /// Cores that had a higher-priority job placed on them from elsewhere.
    pub fn take_remote_resched(&mut self) -> usize {
        core::mem::take(&mut self.remote_resched)
    }

    /// Verifies queue membership against per-job linkage.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        let mut seen: BTreeMap<CapId, usize> = BTreeMap::new();
        for (idx, q) in self.queues.iter().enumerate() {
            for band in 0..BANDS {
                for (list, linkage) in [(&q.ready[band], Linkage::Ready), (&q.exhausted[band], Linkage::Exhausted)] {
                    for id in list {
                        *seen.entry(*id).or_default() += 1;
                        let job = self.jobs.get(id).ok_or("queued job is not admitted")?;
                        if job.linkage != linkage || job.cpu.as_index() != idx {
                            return Err("queue linkage mismatch");
                        }
                        if job.priority.band() != band {
                            return Err("job queued in foreign band");
                        }
                    }
                }
            }
            if let Some(cur) = q.current {
                *seen.entry(cur).or_default() += 1;
                let job = self.jobs.get(&cur).ok_or("current job is not admitted")?;
                if job.linkage != Linkage::Current || job.cpu.as_index() != idx {
                    return Err("current linkage mismatch");
                }
            }
        }
        if seen.values().any(|&n| n > 1) {
            return Err("job linked more than once");
        }
        for (id, job) in &self.jobs {
            let linked = seen.contains_key(id);
            if linked != (job.linkage != Linkage::None) {
                return Err("job linkage without queue entry");
            }
            if let Some(aff) = job.affinity {
                if job.linkage != Linkage::None && job.linkage != Linkage::Current && job.cpu != aff {
                    return Err("affined job queued on foreign core");
                }
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests_prop;
