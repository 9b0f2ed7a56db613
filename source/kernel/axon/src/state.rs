// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state guarded by the kernel lock: registry, scheduler, wait lists
//! OWNERS: @kernel-team
//! PUBLIC API: KernelState (read accessors), check_invariants()
//! DEPENDS_ON: cap::Registry, sched::Scheduler, ipc, signal, irq, vcpu, fault, smp::WorkTicket
//! INVARIANTS: Only mutated with the kernel lock held; a runnable thread is linked in the
//!             scheduler and a blocked one is not; a thread sits on at most one wait list;
//!             object teardown unlinks a thread before its id can be reused
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use axon_abi::args::CreateArgs;
use axon_abi::{rc, ObjectKind};

use crate::cap::{Object, Registry};
use crate::config::KernelConfig;
use crate::hal::Platform;
use crate::irq::Interrupt;
use crate::mm::AddressSpace;
use crate::pd::{Pd, Quota, Resource};
use crate::sched::{SchedParams, Scheduler, Selection};
use crate::signal::SignalContext;
use crate::smp::{WorkItem, WorkTicket, MAX_CPUS};
use crate::syscall::{Completion, Error, SysResult};
use crate::thread::{Thread, ThreadState};
use crate::types::{CapId, CpuId, Priority};
use crate::vcpu::Vcpu;

/// Everything the kernel lock protects.
pub struct KernelState {
    pub(crate) registry: Registry,
    pub(crate) sched: Scheduler,
    pub(crate) config: KernelConfig,
    pub(crate) root_pd: CapId,
    pub(crate) root_thread: CapId,
    pub(crate) timer_irq: u32,
    /// Hardware line -> interrupt object.
    pub(crate) irq_owners: BTreeMap<u32, CapId>,
    /// Thread whose registers are loaded on each core.
    pub(crate) running: [Option<CapId>; MAX_CPUS],
    /// Pd whose translations each core may hold.
    pub(crate) loaded_pd: [Option<CapId>; MAX_CPUS],
    /// Timestamp of the last kernel entry per core.
    pub(crate) entry_ns: [u64; MAX_CPUS],
    pub(crate) online: usize,
    /// Work for remote cores, posted after the lock is released.
    pub(crate) outbox: Vec<(CpuId, WorkTicket)>,
    /// Cores that must re-enter their scheduler.
    pub(crate) resched: usize,
}

static_assertions::assert_impl_all!(KernelState: Send);

impl KernelState {
    /// Builds the root Pd and the (not yet started) root thread.
    pub(crate) fn new(platform: &dyn Platform, config: KernelConfig) -> SysResult<Self> {
        let table = platform
            .mmu()
            .create_table()
            .map_err(|_| Error::OutOfResources(Resource::AddressSpaces))?;
        let mut registry = Registry::new(config.max_ids);
        let root_pd = registry
            .bootstrap(config.object_sizes.pd, |_| Pd::new(config.root_quota, AddressSpace::new(table)))?;
        let mut state = Self {
            registry,
            sched: Scheduler::new(config.cores, config.quantum_ns, config.super_period_ns),
            config,
            root_pd,
            root_thread: CapId::INVALID,
            timer_irq: platform.timer().irq(),
            irq_owners: BTreeMap::new(),
            running: [None; MAX_CPUS],
            loaded_pd: [None; MAX_CPUS],
            entry_ns: [0; MAX_CPUS],
            online: 0,
            outbox: Vec::new(),
            resched: 0,
        };
        let params = SchedParams {
            priority: Priority::new(config.root_priority).unwrap_or(Priority::LOWEST),
            quota_ns: 0,
            affinity: None,
        };
        state.root_thread = state.create_thread(root_pd, root_pd, params, CpuId::BOOT)?;
        log_info!(target: "kernel", "KINIT: root pd {} root thread {}", root_pd, state.root_thread);
        Ok(state)
    }

    #[inline]
    pub fn root_pd(&self) -> CapId {
        self.root_pd
    }

    #[inline]
    pub fn root_thread(&self) -> CapId {
        self.root_thread
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn thread(&self, id: CapId) -> Option<&Thread> {
        self.registry.thread(id)
    }

    pub fn thread_mut(&mut self, id: CapId) -> Option<&mut Thread> {
        self.registry.thread_mut(id)
    }

    pub fn pd(&self, id: CapId) -> Option<&Pd> {
        self.registry.pd(id)
    }

    // Object creation.

    pub(crate) fn create_thread(
        &mut self,
        holder: CapId,
        pd: CapId,
        params: SchedParams,
        home: CpuId,
    ) -> SysResult<CapId> {
        let ram = self.config.object_sizes.thread;
        let id = self.registry.create(pd, holder, ram, |id| {
            Object::Thread(Box::new(Thread::new(id, pd, params, home)))
        })?;
        if let Some(p) = self.registry.pd_mut(pd) {
            p.threads.insert(id);
        }
        self.sched.admit(id, params, home);
        Ok(id)
    }

    /// `create_object(pd, kind, args)`: the new object is charged to `target`, held by `holder`.
    pub(crate) fn create_object(
        &mut self,
        platform: &dyn Platform,
        holder: CapId,
        target: CapId,
        args: CreateArgs,
        cpu: CpuId,
    ) -> SysResult<CapId> {
        let sizes = self.config.object_sizes;
        let ram = sizes.of(args.kind());
        match args {
            CreateArgs::Thread(a) => {
                let priority = Priority::new(a.priority).ok_or(Error::InvalidArgument)?;
                let affinity = match a.affinity {
                    None => None,
                    Some(raw) => Some(
                        CpuId::new(raw)
                            .filter(|c| c.as_index() < self.config.cores)
                            .ok_or(Error::InvalidArgument)?,
                    ),
                };
                let params = SchedParams { priority, quota_ns: a.quota_ns, affinity };
                self.create_thread(holder, target, params, cpu)
            }
            CreateArgs::Pd(a) => {
                let ram = ram.checked_add(a.ram).ok_or(Error::OutOfResources(Resource::Ram))?;
                self.registry
                    .pd(target)
                    .ok_or(Error::InvalidCapability)?
                    .can_charge(ram)
                    .map_err(Error::OutOfResources)?;
                let table = platform
                    .mmu()
                    .create_table()
                    .map_err(|_| Error::OutOfResources(Resource::AddressSpaces))?;
                let quota = Quota { objects: a.objects, ram: a.ram, cap_slots: a.cap_slots };
                let created = self.registry.create(target, holder, ram, |_| {
                    Object::Pd(Box::new(Pd::new(quota, AddressSpace::new(table))))
                });
                if created.is_err() {
                    platform.mmu().destroy_table(table);
                }
                Ok(created?)
            }
            CreateArgs::SignalContext(a) => {
                let receiver = CapId::from_raw(a.receiver);
                self.registry.resolve(holder, receiver, ObjectKind::SignalReceiver)?;
                let context = SignalContext { receiver: Some(receiver), imprint: a.imprint, pending: 0 };
                let id = self
                    .registry
                    .create(target, holder, ram, |_| Object::SignalContext(Box::new(context)))?;
                self.bind_context(id, receiver);
                Ok(id)
            }
            CreateArgs::SignalReceiver => Ok(self
                .registry
                .create(target, holder, ram, |_| Object::SignalReceiver(Box::default()))?),
            CreateArgs::Interrupt(a) => {
                self.claim_irq(a.irq)?;
                let context = CapId::from_raw(a.context);
                self.registry.resolve(holder, context, ObjectKind::SignalContext)?;
                let int = Interrupt { irq: a.irq, context, occurrences: 0 };
                let id = self.registry.create(target, holder, ram, |_| Object::Interrupt(Box::new(int)))?;
                self.bind_irq(platform, id, a.irq, context);
                Ok(id)
            }
            CreateArgs::Vcpu(a) => {
                let context = CapId::from_raw(a.exit_context);
                self.registry.resolve(holder, context, ObjectKind::SignalContext)?;
                let id = self
                    .registry
                    .create(target, holder, ram, |_| Object::Vcpu(Box::new(Vcpu::new(context))))?;
                self.registry.pin(context);
                Ok(id)
            }
        }
    }

    // Scheduling state transitions.

    /// Unblocks `id`, optionally completing its pending syscall with `(code, value)`.
    ///
    /// A pause that arrived while the thread was blocked takes effect here.
    pub(crate) fn wake(&mut self, id: CapId, hint: CpuId, completion: Option<(isize, usize)>) {
        let Some(t) = self.registry.thread_mut(id) else {
            return;
        };
        if !t.state.is_blocked() {
            return;
        }
        if let Some((code, value)) = completion {
            t.context.set_return(code);
            t.context.set_value(value);
        }
        if core::mem::take(&mut t.pause_requested) {
            t.state = ThreadState::Paused;
            return;
        }
        self.make_ready(id, hint);
    }

    pub(crate) fn make_ready(&mut self, id: CapId, hint: CpuId) {
        if let Some(t) = self.registry.thread_mut(id) {
            t.state = ThreadState::Ready;
        }
        if let Some(placed) = self.sched.ready(id, hint) {
            log_trace!(target: "sched", "{} ready on {} preempts={}", id, placed.cpu, placed.preempts);
        }
    }

    pub(crate) fn block(&mut self, id: CapId, state: ThreadState) {
        if let Some(t) = self.registry.thread_mut(id) {
            t.state = state;
        }
        self.sched.unready(id);
    }

    /// Takes `id` off the scheduler; a remote core still executing it is told to reschedule.
    pub(crate) fn evict(&mut self, id: CapId, cpu: CpuId) {
        if let Some(remote) = self.sched.running_on(id).filter(|c| *c != cpu) {
            self.resched |= remote.mask();
        }
        self.sched.unready(id);
    }

    /// Runs the scheduler for `cpu` and updates thread states to match.
    pub(crate) fn dispatch(&mut self, cpu: CpuId) -> Selection {
        let previous = self.sched.current(cpu);
        let selection = self.sched.schedule(cpu);
        if let Some(prev) = previous.filter(|p| selection != Selection::Job(*p)) {
            if let Some(t) = self.registry.thread_mut(prev) {
                if t.state == ThreadState::Running {
                    t.state = ThreadState::Ready;
                }
            }
        }
        if let Selection::Job(id) = selection {
            let pd = self.registry.thread_mut(id).map(|t| {
                t.state = ThreadState::Running;
                t.cpu = cpu;
                t.pd
            });
            if let Some(pd) = pd.and_then(|pd| self.registry.pd_mut(pd)) {
                pd.note_active(cpu);
            }
        }
        selection
    }

    /// Loads `next` on `cpu`. Leaving a Pd flushes its translations from `cpu` and drops
    /// the core from the Pd's active set.
    pub(crate) fn load(&mut self, platform: &dyn Platform, cpu: CpuId, next: Option<CapId>) {
        let slot = cpu.as_index();
        self.running[slot] = next;
        let pd = next.and_then(|id| self.registry.thread(id)).map(|t| t.pd);
        let previous = core::mem::replace(&mut self.loaded_pd[slot], pd);
        let Some(left) = previous.filter(|p| Some(*p) != pd) else {
            return;
        };
        if let Some(p) = self.registry.pd_mut(left) {
            platform.mmu().flush_tlb(cpu, p.space.table());
            p.note_inactive(cpu);
            log_trace!(target: "sched", "{} left pd {}", cpu, left);
        }
    }

    // Destruction.

    /// `destroy(cap)`: drops the holder's reference; the last reference tears the object down.
    pub(crate) fn destroy(&mut self, platform: &dyn Platform, holder: CapId, id: CapId, cpu: CpuId) -> SysResult<()> {
        if !self.registry.holds(holder, id) {
            return Err(Error::InvalidCapability);
        }
        if id == self.root_pd {
            return Err(Error::Denied);
        }
        let last = self.registry.holdings(id) == 1;
        if last && self.busy_elsewhere(id, cpu) {
            return Err(Error::Busy);
        }
        if self.registry.drop_holding(holder, id)? == 0 {
            self.teardown(platform, id, cpu);
        }
        Ok(())
    }

    /// True if tearing `id` down would pull a thread out from under another core.
    fn busy_elsewhere(&self, id: CapId, cpu: CpuId) -> bool {
        let mut pending = alloc::vec![id];
        while let Some(id) = pending.pop() {
            match self.registry.get(id) {
                Some(Object::Thread(_)) => {
                    if self.sched.running_on(id).is_some_and(|c| c != cpu) {
                        return true;
                    }
                    // A parked thread keeps its core until that core re-enters the kernel.
                    let mut cores = self.running.iter().enumerate();
                    if cores.any(|(i, r)| *r == Some(id) && i != cpu.as_index()) {
                        return true;
                    }
                }
                Some(Object::Pd(pd)) => pending.extend(pd.owned.iter().copied().filter(|o| *o != id)),
                _ => {}
            }
        }
        false
    }

    /// Tears `root` down together with everything it owns and every object only it held.
    pub(crate) fn teardown(&mut self, platform: &dyn Platform, root: CapId, cpu: CpuId) {
        let mut pending = alloc::vec![root];
        while let Some(id) = pending.pop() {
            let Some(kind) = self.registry.kind_of(id) else {
                continue;
            };
            match kind {
                ObjectKind::Thread => self.teardown_thread(id, cpu),
                ObjectKind::Pd => self.teardown_pd(platform, id, &mut pending),
                ObjectKind::SignalContext => self.teardown_context(id),
                ObjectKind::SignalReceiver => self.teardown_receiver(id, cpu),
                ObjectKind::Interrupt => self.teardown_irq(platform, id),
                ObjectKind::Vcpu => self.teardown_vcpu(id),
            }
            drop(self.registry.retire(id));
            log_debug!(target: "cap", "destroyed {:?} {}", kind, id);
        }
    }

    fn teardown_thread(&mut self, id: CapId, cpu: CpuId) {
        self.cancel_ipc(id, cpu);
        self.leave_signal_wait(id);
        self.evict(id, cpu);
        self.sched.retire(id);
        for slot in self.running.iter_mut().filter(|r| **r == Some(id)) {
            *slot = None;
        }
        let Some(t) = self.registry.thread_mut(id) else {
            return;
        };
        t.state = ThreadState::Dead;
        let (pd, pager) = (t.pd, t.pager.take());
        if let Some(pager) = pager {
            self.registry.unpin(pager);
        }
        if let Some(p) = self.registry.pd_mut(pd) {
            p.threads.remove(&id);
        }
    }

    fn teardown_pd(&mut self, platform: &dyn Platform, id: CapId, pending: &mut Vec<CapId>) {
        let Some(pd) = self.registry.pd(id) else {
            return;
        };
        let owned: Vec<CapId> = pd.owned.iter().copied().filter(|o| *o != id).collect();
        let held: Vec<CapId> = pd.held.iter().copied().filter(|h| *h != id).collect();
        let table = pd.space.table();
        pending.extend(owned);
        for cap in held {
            if self.registry.drop_holding(id, cap) == Ok(0) {
                pending.push(cap);
            }
        }
        platform.mmu().destroy_table(table);
        for slot in self.loaded_pd.iter_mut().filter(|l| **l == Some(id)) {
            *slot = None;
        }
        log_info!(target: "cap", "pd {} torn down", id);
    }

    // Cross-core work.

    /// `update_pd(pd)`: flushes stale translations on every core that ran the Pd.
    pub(crate) fn update_pd(
        &mut self,
        platform: &dyn Platform,
        issuer: CapId,
        pd: CapId,
        cpu: CpuId,
    ) -> SysResult<Completion> {
        let p = self.registry.pd(pd).ok_or(Error::InvalidCapability)?;
        let table = p.space.table();
        let remote = p.active_cpus & self.online & !cpu.mask();
        platform.mmu().flush_tlb(cpu, table);
        let mut posted = 0;
        for target in (0..MAX_CPUS).filter(|i| remote & (1 << i) != 0).filter_map(CpuId::from_index) {
            let ticket = WorkTicket { item: WorkItem::TlbFlush { table }, issuer: Some(issuer) };
            self.outbox.push((target, ticket));
            posted += 1;
        }
        if posted == 0 {
            return Ok(Completion::Done(0));
        }
        if let Some(t) = self.registry.thread_mut(issuer) {
            t.pending_work += posted;
        }
        self.block(issuer, ThreadState::BlockedOnWork);
        log_debug!(target: "smp", "{} waits for {} tlb acks", issuer, posted);
        Ok(Completion::Blocked)
    }

    /// Records that a remote core finished `ticket`.
    pub(crate) fn ack_work(&mut self, ticket: WorkTicket, cpu: CpuId) {
        let Some(issuer) = ticket.issuer else {
            return;
        };
        let Some(t) = self.registry.thread_mut(issuer) else {
            return;
        };
        if t.pending_work == 0 {
            return;
        }
        t.pending_work -= 1;
        if t.pending_work == 0 && t.state == ThreadState::BlockedOnWork {
            self.wake(issuer, cpu, Some((rc::OK, 0)));
        }
    }

    /// Cores that need a resched IPI, merged from the scheduler and local requests.
    pub(crate) fn take_resched(&mut self) -> usize {
        core::mem::take(&mut self.resched) | self.sched.take_remote_resched()
    }

    // Invariants.

    pub fn check_invariants(&self) -> Result<(), &'static str> {
        self.registry.check_invariants()?;
        self.sched.check_invariants()?;
        let mut waits: BTreeMap<CapId, usize> = BTreeMap::new();
        for id in self.registry.live_ids() {
            match self.registry.get(id) {
                Some(Object::Thread(t)) => {
                    for caller in &t.ipc.callers {
                        *waits.entry(*caller).or_default() += 1;
                    }
                }
                Some(Object::SignalReceiver(rx)) => {
                    for waiter in &rx.waiters {
                        *waits.entry(*waiter).or_default() += 1;
                    }
                }
                _ => {}
            }
        }
        for id in self.registry.live_ids() {
            let Some(t) = self.registry.thread(id) else {
                continue;
            };
            let scheduled = self.sched.is_queued(id) || self.sched.running_on(id).is_some();
            if t.state.is_runnable() != scheduled {
                return Err("thread state disagrees with scheduler linkage");
            }
            match waits.get(&id).copied().unwrap_or(0) {
                0 => {}
                1 if t.state.is_blocked() => {}
                1 => return Err("thread on a wait list is not blocked"),
                _ => return Err("thread on several wait lists"),
            }
            if t.state == ThreadState::BlockedOnSignal && t.signal_wait.is_none() {
                return Err("signal waiter without receiver");
            }
        }
        for (irq, object) in &self.irq_owners {
            if self.registry.interrupt(*object).map(|i| i.irq) != Some(*irq) {
                return Err("irq owner is not a live interrupt object");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::hal::sim::SimPlatform;
    use axon_abi::args::{InterruptArgs, PdArgs, SignalContextArgs, VcpuArgs};

    pub struct TestKernel {
        pub platform: SimPlatform,
        pub state: KernelState,
    }

    impl TestKernel {
        pub fn new(cores: usize) -> Self {
            let platform = SimPlatform::new(cores);
            let config = KernelConfig::default().with_cores(cores).with_quantum_ns(1_000);
            let mut state = KernelState::new(&platform, config).expect("kernel state");
            state.online = (1 << cores) - 1;
            Self { platform, state }
        }

        fn create(&mut self, target: CapId, args: CreateArgs) -> CapId {
            let root = self.state.root_pd;
            self.state.create_object(&self.platform, root, target, args, CpuId::BOOT).expect("create")
        }
    }

    pub fn started_thread(k: &mut TestKernel, prio: u8) -> CapId {
        let root = k.state.root_pd;
        started_thread_in(k, root, prio)
    }

    pub fn started_thread_in(k: &mut TestKernel, pd: CapId, prio: u8) -> CapId {
        let params = SchedParams { priority: Priority::new(prio).expect("prio"), quota_ns: 0, affinity: None };
        let root = k.state.root_pd;
        let id = k.state.create_thread(root, pd, params, CpuId::BOOT).expect("thread");
        k.state.thread_start(id, 0x1000, 0x8000, CpuId::BOOT).expect("start");
        id
    }

    pub fn child_pd(k: &mut TestKernel, objects: u32) -> CapId {
        let root = k.state.root_pd;
        k.create(root, CreateArgs::Pd(PdArgs { objects, ram: 64 * 1024, cap_slots: 16 }))
    }

    pub fn receiver(k: &mut TestKernel) -> CapId {
        let root = k.state.root_pd;
        k.create(root, CreateArgs::SignalReceiver)
    }

    pub fn context(k: &mut TestKernel, receiver: CapId, imprint: usize) -> CapId {
        let root = k.state.root_pd;
        k.create(root, CreateArgs::SignalContext(SignalContextArgs { receiver: receiver.as_raw(), imprint }))
    }

    pub fn interrupt(k: &mut TestKernel, irq: u32, context: CapId) -> CapId {
        let root = k.state.root_pd;
        k.create(root, CreateArgs::Interrupt(InterruptArgs { irq, context: context.as_raw() }))
    }

    pub fn vcpu(k: &mut TestKernel, context: CapId) -> CapId {
        let root = k.state.root_pd;
        k.create(root, CreateArgs::Vcpu(VcpuArgs { exit_context: context.as_raw() }))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn boot_creates_root_objects() {
        let k = TestKernel::new(1);
        let root = k.state.root_pd();
        assert!(k.state.pd(root).is_some());
        let t = k.state.thread(k.state.root_thread()).expect("root thread");
        assert_eq!(t.state, ThreadState::AwaitsStart);
        assert_eq!(t.pd, root);
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn destroying_pd_takes_owned_objects_along() {
        let mut k = TestKernel::new(1);
        let pd = child_pd(&mut k, 4);
        let a = started_thread_in(&mut k, pd, 1);
        let b = started_thread_in(&mut k, pd, 1);
        let tables = k.platform.mmu.live_tables();
        let root = k.state.root_pd;
        k.state.destroy(&k.platform, root, pd, CpuId::BOOT).expect("destroy");
        assert!(k.state.thread(a).is_none());
        assert!(k.state.thread(b).is_none());
        assert_eq!(k.platform.mmu.live_tables(), tables - 1);
        assert!(!k.state.sched.is_admitted(a));
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn root_pd_cannot_be_destroyed() {
        let mut k = TestKernel::new(1);
        let root = k.state.root_pd;
        assert_eq!(k.state.destroy(&k.platform, root, root, CpuId::BOOT), Err(Error::Denied));
    }

    #[test]
    fn thread_running_elsewhere_is_busy() {
        let mut k = TestKernel::new(2);
        let t = started_thread(&mut k, 3);
        assert_eq!(k.state.dispatch(CpuId::BOOT), Selection::Job(t));
        let root = k.state.root_pd;
        let other = CpuId::from_index(1).expect("cpu1");
        assert_eq!(k.state.destroy(&k.platform, root, t, other), Err(Error::Busy));
        assert_eq!(k.state.destroy(&k.platform, root, t, CpuId::BOOT), Ok(()));
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn halted_pd_stays_busy_while_remote_core_holds_thread() {
        let mut k = TestKernel::new(2);
        let remote = CpuId::from_index(1).expect("cpu1");
        let pd = child_pd(&mut k, 4);
        let a = started_thread_in(&mut k, pd, 1);
        let b = started_thread_in(&mut k, pd, 1);
        k.state.thread_set_affinity(b, Some(remote), CpuId::BOOT).expect("affinity");
        assert_eq!(k.state.dispatch(CpuId::BOOT), Selection::Job(a));
        k.state.load(&k.platform, CpuId::BOOT, Some(a));
        assert_eq!(k.state.dispatch(remote), Selection::Job(b));
        k.state.load(&k.platform, remote, Some(b));

        let root = k.state.root_pd;
        assert_eq!(k.state.destroy(&k.platform, root, pd, CpuId::BOOT), Err(Error::Busy));
        let record = axon_abi::FaultRecord {
            kind: axon_abi::FaultKind::IllegalInstruction,
            addr: 0x4000,
            ip: 0x4000,
            access: 0,
        };
        let _ = k.state.take_resched();
        k.state.raise_fault(a, record, CpuId::BOOT);
        assert_eq!(k.state.thread(b).map(|t| t.state), Some(ThreadState::Faulted));
        assert_ne!(k.state.take_resched() & remote.mask(), 0);
        assert_eq!(k.state.destroy(&k.platform, root, pd, CpuId::BOOT), Err(Error::Busy));

        assert_eq!(k.state.dispatch(remote), Selection::Idle);
        k.state.load(&k.platform, remote, None);
        let tables = k.platform.mmu.live_tables();
        assert_eq!(k.state.destroy(&k.platform, root, pd, CpuId::BOOT), Ok(()));
        assert_eq!(k.platform.mmu.live_tables(), tables - 1);
        assert!(k.state.thread(b).is_none());
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn leaving_pd_clears_active_core() {
        let mut k = TestKernel::new(1);
        let pd = child_pd(&mut k, 4);
        let t = started_thread_in(&mut k, pd, 1);
        assert_eq!(k.state.dispatch(CpuId::BOOT), Selection::Job(t));
        k.state.load(&k.platform, CpuId::BOOT, Some(t));
        assert_eq!(k.state.pd(pd).map(|p| p.active_cpus), Some(CpuId::BOOT.mask()));

        let flushes = k.platform.mmu.flushes_on(CpuId::BOOT);
        k.state.block(t, ThreadState::BlockedOnIpc);
        assert_eq!(k.state.dispatch(CpuId::BOOT), Selection::Idle);
        k.state.load(&k.platform, CpuId::BOOT, None);
        assert_eq!(k.state.pd(pd).map(|p| p.active_cpus), Some(0));
        assert_eq!(k.platform.mmu.flushes_on(CpuId::BOOT), flushes + 1);

        let issuer = started_thread(&mut k, 1);
        assert_eq!(k.state.update_pd(&k.platform, issuer, pd, CpuId::BOOT), Ok(Completion::Done(0)));
        assert!(k.state.outbox.is_empty());
    }

    #[test]
    fn update_pd_waits_for_remote_acks() {
        let mut k = TestKernel::new(2);
        let issuer = started_thread(&mut k, 1);
        let root = k.state.root_pd;
        let remote = CpuId::from_index(1).expect("cpu1");
        if let Some(pd) = k.state.registry.pd_mut(root) {
            pd.note_active(remote);
        }
        let done = k.state.update_pd(&k.platform, issuer, root, CpuId::BOOT).expect("update");
        assert_eq!(done, Completion::Blocked);
        assert_eq!(k.state.outbox.len(), 1);
        let (target, ticket) = k.state.outbox[0];
        assert_eq!(target, remote);
        assert_eq!(k.state.thread(issuer).map(|t| t.state), Some(ThreadState::BlockedOnWork));
        k.state.ack_work(ticket, remote);
        assert_eq!(k.state.thread(issuer).map(|t| t.state), Some(ThreadState::Ready));
        k.state.check_invariants().expect("invariants");
    }
}
