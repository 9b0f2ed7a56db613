// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SMP bookkeeping (online mask, resched requests, inter-processor work queues)
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 6 unit tests
//! PUBLIC API: MAX_CPUS, Smp::{mark_online, request_resched, post_work, take_ipi}, WorkItem, WorkTicket,
//!             ReschedTrapOutcome, ReschedEvidence
//! DEPENDS_ON: hal::IpiSender, spin::Mutex
//! INVARIANTS: bounded CPU set; atomic online-mask updates; work queues are per target core and
//!             never touched while the kernel lock is required to drain them
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::hal::IpiSender;
use crate::mm::TableHandle;
use crate::types::{CapId, CpuId};

/// Fixed CPU ceiling for bounded per-CPU state.
pub const MAX_CPUS: usize = 4;

static_assertions::const_assert!(MAX_CPUS <= usize::BITS as usize);

/// Operation a remote core has to perform locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkItem {
    /// Drop cached translations of an address space.
    TlbFlush { table: TableHandle },
    /// Re-evaluate the local scheduling decision (affinity change, remote kill).
    DomainUpdate,
}

/// Queued work plus the thread blocked until the work is acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkTicket {
    pub item: WorkItem,
    pub issuer: Option<CapId>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReschedEvidence {
    pub request_accepted_count: usize,
    pub ipi_sent_count: usize,
    pub ipi_trap_count: usize,
    pub ack_count: usize,
}

#[must_use = "resched trap outcomes must be handled"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReschedTrapOutcome {
    Acked,
    NoPendingRequest,
}

/// What an IPI entry found for the receiving core.
#[derive(Debug)]
pub struct IpiEntry {
    pub resched: ReschedTrapOutcome,
    pub work: Vec<WorkTicket>,
}

#[derive(Default)]
struct PerCpu {
    resched_pending: AtomicUsize,
    requests: AtomicUsize,
    ipis_sent: AtomicUsize,
    ipi_traps: AtomicUsize,
    acks: AtomicUsize,
    work: Mutex<VecDeque<WorkTicket>>,
}

/// Cross-core state shared by all cores, outside the kernel lock.
pub struct Smp {
    online: AtomicUsize,
    cpus: [PerCpu; MAX_CPUS],
}

impl Default for Smp {
    fn default() -> Self {
        Self::new()
    }
}

impl Smp {
    pub fn new() -> Self {
        Self {
            online: AtomicUsize::new(0),
            cpus: core::array::from_fn(|_| PerCpu::default()),
        }
    }

    #[inline]
    pub fn online_mask(&self) -> usize {
        self.online.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.online_mask() & cpu.mask() != 0
    }

    /// Online cores in ascending order.
    pub fn online_cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        let mask = self.online_mask();
        (0..MAX_CPUS).filter(move |i| mask & (1 << i) != 0).filter_map(CpuId::from_index)
    }

    /// Marks `cpu` online; logs the transition once.
    pub fn mark_online(&self, cpu: CpuId) {
        let previous = self.online.fetch_or(cpu.mask(), Ordering::AcqRel);
        if previous & cpu.mask() == 0 {
            log_info!(target: "smp", "KINIT: {} online", cpu);
        }
    }

    /// Asks `target` to re-run its scheduler. Returns false for offline cores.
    pub fn request_resched(&self, target: CpuId, ipi: &dyn IpiSender) -> bool {
        if !self.is_online(target) {
            return false;
        }
        let slot = &self.cpus[target.as_index()];
        slot.requests.fetch_add(1, Ordering::AcqRel);
        if slot.resched_pending.swap(1, Ordering::AcqRel) == 0 {
            ipi.send_ipi(target);
            slot.ipis_sent.fetch_add(1, Ordering::AcqRel);
        }
        true
    }

    /// Queues `ticket` on `target` and raises an IPI. Returns false for offline cores.
    pub fn post_work(&self, target: CpuId, ticket: WorkTicket, ipi: &dyn IpiSender) -> bool {
        if !self.is_online(target) {
            return false;
        }
        let slot = &self.cpus[target.as_index()];
        slot.work.lock().push_back(ticket);
        ipi.send_ipi(target);
        slot.ipis_sent.fetch_add(1, Ordering::AcqRel);
        log_trace!(target: "smp", "work {:?} -> {}", ticket.item, target);
        true
    }

    /// Consumes the resched flag and the work queue of `cpu` on IPI entry.
    pub fn take_ipi(&self, cpu: CpuId) -> IpiEntry {
        let slot = &self.cpus[cpu.as_index()];
        slot.ipi_traps.fetch_add(1, Ordering::AcqRel);
        let resched = if slot.resched_pending.swap(0, Ordering::AcqRel) != 0 {
            slot.acks.fetch_add(1, Ordering::AcqRel);
            ReschedTrapOutcome::Acked
        } else {
            ReschedTrapOutcome::NoPendingRequest
        };
        let work = slot.work.lock().drain(..).collect();
        IpiEntry { resched, work }
    }

    /// Number of tickets waiting on `cpu`.
    pub fn pending_work(&self, cpu: CpuId) -> usize {
        self.cpus[cpu.as_index()].work.lock().len()
    }

    pub fn resched_evidence(&self, cpu: CpuId) -> ReschedEvidence {
        let slot = &self.cpus[cpu.as_index()];
        ReschedEvidence {
            request_accepted_count: slot.requests.load(Ordering::Acquire),
            ipi_sent_count: slot.ipis_sent.load(Ordering::Acquire),
            ipi_trap_count: slot.ipi_traps.load(Ordering::Acquire),
            ack_count: slot.acks.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimPlatform;

    fn cpu(idx: usize) -> CpuId {
        CpuId::from_index(idx).expect("cpu")
    }

    fn two_core() -> (Smp, SimPlatform) {
        let smp = Smp::new();
        smp.mark_online(cpu(0));
        smp.mark_online(cpu(1));
        (smp, SimPlatform::new(2))
    }

    #[test]
    fn reject_offline_cpu_resched() {
        let (smp, platform) = two_core();
        assert!(!smp.request_resched(cpu(2), &platform.ipi));
        assert_eq!(smp.resched_evidence(cpu(2)).request_accepted_count, 0);
        assert_eq!(platform.ipi.pending(cpu(2)), 0);
    }

    #[test]
    fn ipi_entry_acknowledges_pending_request() {
        let (smp, platform) = two_core();
        assert!(smp.request_resched(cpu(1), &platform.ipi));
        assert_eq!(smp.take_ipi(cpu(1)).resched, ReschedTrapOutcome::Acked);
        let evidence = smp.resched_evidence(cpu(1));
        assert_eq!(evidence.request_accepted_count, 1);
        assert_eq!(evidence.ipi_trap_count, 1);
        assert_eq!(evidence.ack_count, 1);
    }

    #[test]
    fn ipi_entry_without_request_is_not_acked() {
        let (smp, _platform) = two_core();
        assert_eq!(smp.take_ipi(cpu(1)).resched, ReschedTrapOutcome::NoPendingRequest);
        let evidence = smp.resched_evidence(cpu(1));
        assert_eq!(evidence.ipi_trap_count, 1);
        assert_eq!(evidence.ack_count, 0);
    }

    #[test]
    fn repeated_requests_coalesce_into_one_ipi() {
        let (smp, platform) = two_core();
        assert!(smp.request_resched(cpu(1), &platform.ipi));
        assert!(smp.request_resched(cpu(1), &platform.ipi));
        assert_eq!(platform.ipi.take(cpu(1)), 1);
        assert_eq!(smp.resched_evidence(cpu(1)).request_accepted_count, 2);
    }

    #[test]
    fn work_is_drained_in_order() {
        let (smp, platform) = two_core();
        let first = WorkTicket { item: WorkItem::DomainUpdate, issuer: None };
        let second = WorkTicket { item: WorkItem::DomainUpdate, issuer: Some(CapId::from_raw(7)) };
        assert!(smp.post_work(cpu(1), first, &platform.ipi));
        assert!(smp.post_work(cpu(1), second, &platform.ipi));
        assert_eq!(smp.pending_work(cpu(1)), 2);
        let entry = smp.take_ipi(cpu(1));
        assert_eq!(entry.work, [first, second]);
        assert_eq!(smp.pending_work(cpu(1)), 0);
    }

    #[test]
    fn online_cpus_iterates_mask() {
        let (smp, _platform) = two_core();
        let cpus: Vec<_> = smp.online_cpus().collect();
        assert_eq!(cpus, [cpu(0), cpu(1)]);
    }
}
