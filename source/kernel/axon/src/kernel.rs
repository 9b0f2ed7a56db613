// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process-wide kernel object created once at boot; trap entry and exit
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::{boot, bring_up, start_root, handle_trap, with_state, check_invariants},
//!             Trap, Next
//! DEPENDS_ON: sync::KernelLock, state::KernelState, smp::Smp, syscall::SyscallTable, hal::Platform
//! INVARIANTS: Every trap takes the kernel lock exactly once; remote work and IPIs are posted
//!             only after the lock is released; the frame handed back always belongs to the
//!             thread the scheduler selected
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! Boot order: platform → `KernelState` (root Pd, root thread) → boot core online →
//! `start_root` → secondary cores call `bring_up` → every core loops on `handle_trap`.

use alloc::vec::Vec;

use axon_abi::{FaultRecord, ABI_VERSION};

use crate::config::KernelConfig;
use crate::hal::Platform;
use crate::ipc::Message;
use crate::sched::Selection;
use crate::smp::{Smp, WorkItem, WorkTicket, MAX_CPUS};
use crate::state::KernelState;
use crate::sync::KernelLock;
use crate::syscall::api::Context;
use crate::syscall::{Args, Completion, Error, SysResult, SyscallTable};
use crate::thread::{ThreadState, UserContext};
use crate::types::{CapId, CpuId};

/// Reason a core entered the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// System call; number and arguments are in the frame.
    Syscall,
    /// Synchronous exception of the interrupted thread.
    Exception(FaultRecord),
    /// External interrupt line.
    Interrupt(u32),
    /// Inter-processor interrupt.
    Ipi,
    /// A virtual CPU left guest mode.
    VcpuExit { vcpu: CapId, reason: u32 },
}

/// What the core does when it leaves the kernel.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Return to user mode with the frame loaded for this thread.
    Resume(CapId),
    /// Nothing is runnable; wait for the next interrupt.
    Idle,
}

pub struct Kernel<P: Platform> {
    platform: P,
    state: KernelLock<KernelState>,
    smp: Smp,
    syscalls: SyscallTable,
}

impl<P: Platform> Kernel<P> {
    /// Creates the kernel state and brings the boot core online.
    pub fn boot(platform: P, config: KernelConfig) -> SysResult<Self> {
        let state = KernelState::new(&platform, config)?;
        let kernel = Self { platform, state: KernelLock::new(state), smp: Smp::new(), syscalls: SyscallTable::default() };
        log_info!(
            target: "kernel",
            "KINIT: axon abi v{} cores={} quantum={}ns",
            ABI_VERSION,
            config.cores,
            config.quantum_ns
        );
        kernel.bring_up(CpuId::BOOT);
        Ok(kernel)
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn smp(&self) -> &Smp {
        &self.smp
    }

    /// Marks `cpu` online and arms its first scheduling tick.
    pub fn bring_up(&self, cpu: CpuId) {
        self.smp.mark_online(cpu);
        let timer = self.platform.timer();
        let mut state = self.state.lock(cpu);
        state.online = self.smp.online_mask();
        let now = timer.now();
        state.entry_ns[cpu.as_index()] = now;
        timer.schedule_tick(cpu, now.saturating_add(state.sched.next_deadline_in(cpu)));
    }

    /// Starts the root thread at `ip` with stack `sp`.
    pub fn start_root(&self, ip: usize, sp: usize) -> SysResult<CapId> {
        let mut state = self.state.lock(CpuId::BOOT);
        let root = state.root_thread();
        state.thread_start(root, ip, sp, CpuId::BOOT)?;
        log_info!(target: "kernel", "KINIT: root thread {} at {:#x}", root, ip);
        Ok(root)
    }

    /// Runs `f` with the kernel lock held by `cpu`.
    pub fn with_state<R>(&self, cpu: CpuId, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let mut state = self.state.lock(cpu);
        f(&mut state)
    }

    /// Stages `msg` in the message buffer of `thread`.
    pub fn write_utcb(&self, cpu: CpuId, thread: CapId, msg: Message) -> SysResult<()> {
        self.with_state(cpu, |s| {
            let t = s.thread_mut(thread).ok_or(Error::InvalidCapability)?;
            t.utcb = msg;
            Ok(())
        })
    }

    pub fn read_utcb(&self, cpu: CpuId, thread: CapId) -> Option<Message> {
        self.with_state(cpu, |s| s.thread(thread).map(|t| t.utcb))
    }

    pub fn check_invariants(&self, cpu: CpuId) -> Result<(), &'static str> {
        self.with_state(cpu, |s| s.check_invariants())
    }

    /// Single kernel entry point.
    ///
    /// `frame` holds the registers of the thread that was running on `cpu` and, on return,
    /// the registers of the thread to resume.
    pub fn handle_trap(&self, cpu: CpuId, trap: Trap, frame: &mut UserContext) -> Next {
        let acked = match trap {
            Trap::Ipi => self.drain_ipi(cpu),
            _ => Vec::new(),
        };
        let mut state = self.state.lock(cpu);
        let now = self.platform.timer().now();
        let elapsed = now.saturating_sub(state.entry_ns[cpu.as_index()]);
        state.entry_ns[cpu.as_index()] = now;
        state.sched.charge(cpu, elapsed);

        let current = state.running[cpu.as_index()];
        let running = match current.and_then(|id| state.thread_mut(id)) {
            Some(t) => {
                t.context = *frame;
                t.state == ThreadState::Running
            }
            None => false,
        };

        match trap {
            Trap::Syscall => {
                if let Some(caller) = current.filter(|_| running) {
                    self.syscall(&mut state, cpu, caller, frame);
                }
            }
            Trap::Exception(record) => {
                if let Some(thread) = current.filter(|_| running) {
                    state.raise_fault(thread, record, cpu);
                }
            }
            Trap::Interrupt(irq) if irq == state.timer_irq => {}
            Trap::Interrupt(irq) => state.irq_raised(&self.platform, irq, cpu),
            Trap::Ipi => {
                for ticket in acked {
                    state.ack_work(ticket, cpu);
                }
            }
            Trap::VcpuExit { vcpu, reason } => state.vcpu_exit(vcpu, reason, cpu),
        }

        state.settle_pause(cpu);
        let next = match state.dispatch(cpu) {
            Selection::Job(id) => {
                state.load(&self.platform, cpu, Some(id));
                if let Some(t) = state.thread(id) {
                    *frame = t.context;
                }
                Next::Resume(id)
            }
            Selection::Idle => {
                state.load(&self.platform, cpu, None);
                Next::Idle
            }
        };
        let deadline = now.saturating_add(state.sched.next_deadline_in(cpu));
        self.platform.timer().schedule_tick(cpu, deadline);

        #[cfg(debug_assertions)]
        if let Err(violation) = state.check_invariants() {
            crate::fatal!(target: "kernel", "state invariant broken after {:?}: {}", trap, violation);
        }

        let outbox = core::mem::take(&mut state.outbox);
        let resched = state.take_resched() & !cpu.mask();
        drop(state);
        self.post(cpu, outbox, resched);
        next
    }

    fn syscall(&self, state: &mut KernelState, cpu: CpuId, caller: CapId, frame: &UserContext) {
        let number = frame.syscall_number();
        let args = Args::new(frame.args());
        let result = {
            let mut ctx = Context::new(state, &self.platform, cpu, caller);
            self.syscalls.dispatch(number, &mut ctx, &args)
        };
        let Some(t) = state.thread_mut(caller) else {
            return;
        };
        match result {
            Ok(Completion::Done(value)) => {
                t.context.set_return(axon_abi::rc::OK);
                t.context.set_value(value);
            }
            Ok(Completion::Blocked) => {}
            Err(err) => {
                log_trace!(target: "syscall", "{} syscall {} failed: {}", caller, number, err);
                t.context.set_return(err.code());
                t.context.set_value(0);
            }
        }
    }

    /// Takes the IPI state of `cpu` and performs queued TLB maintenance before the lock.
    fn drain_ipi(&self, cpu: CpuId) -> Vec<WorkTicket> {
        let entry = self.smp.take_ipi(cpu);
        for ticket in &entry.work {
            if let WorkItem::TlbFlush { table } = ticket.item {
                self.platform.mmu().flush_tlb(cpu, table);
            }
        }
        entry.work
    }

    fn post(&self, cpu: CpuId, outbox: Vec<(CpuId, WorkTicket)>, resched: usize) {
        let ipi = self.platform.ipi();
        let mut undeliverable = Vec::new();
        for (target, ticket) in outbox {
            if !self.smp.post_work(target, ticket, ipi) {
                log_warn!(target: "smp", "{} offline; dropping {:?}", target, ticket.item);
                undeliverable.push(ticket);
            }
        }
        for target in (0..MAX_CPUS).filter(|i| resched & (1 << i) != 0).filter_map(CpuId::from_index) {
            let _ = self.smp.request_resched(target, ipi);
        }
        if !undeliverable.is_empty() {
            let mut state = self.state.lock(cpu);
            for ticket in undeliverable {
                state.ack_work(ticket, cpu);
            }
        }
    }
}

static_assertions::assert_impl_all!(Kernel<crate::hal::sim::SimPlatform>: Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimPlatform;
    use axon_abi::args::{CreateArgs, ThreadArgs};
    use axon_abi::{rc, Syscall, SYSCALL_NUMBER_REG};

    fn boot(cores: usize) -> Kernel<SimPlatform> {
        let config = KernelConfig::default().with_cores(cores).with_quantum_ns(1_000);
        Kernel::boot(SimPlatform::new(cores), config).expect("boot")
    }

    fn syscall(number: Syscall, args: &[usize]) -> UserContext {
        let mut frame = UserContext::default();
        frame.gpr[..args.len()].copy_from_slice(args);
        frame.gpr[SYSCALL_NUMBER_REG] = number.as_raw();
        frame
    }

    #[test]
    fn root_thread_runs_after_start() {
        let kernel = boot(1);
        let root = kernel.start_root(0x1000, 0x8000).expect("start");
        let mut frame = UserContext::default();
        assert_eq!(kernel.handle_trap(CpuId::BOOT, Trap::Interrupt(crate::hal::sim::SIM_TIMER_IRQ), &mut frame), Next::Resume(root));
        assert_eq!(frame.ip, 0x1000);
        assert!(kernel.platform().timer.deadline(CpuId::BOOT).is_some());
    }

    #[test]
    fn syscall_results_land_in_return_registers() {
        let kernel = boot(1);
        let root = kernel.start_root(0x1000, 0x8000).expect("start");
        let mut frame = UserContext::default();
        let _ = kernel.handle_trap(CpuId::BOOT, Trap::Interrupt(crate::hal::sim::SIM_TIMER_IRQ), &mut frame);
        let pd = kernel.with_state(CpuId::BOOT, |s| s.root_pd());
        let args = CreateArgs::Thread(ThreadArgs { priority: 1, quota_ns: 0, affinity: None });
        let w = args.to_words();
        frame = syscall(Syscall::CreateObject, &[pd.as_word(), args.kind() as usize, w[0], w[1], w[2], w[3]]);
        assert_eq!(kernel.handle_trap(CpuId::BOOT, Trap::Syscall, &mut frame), Next::Resume(root));
        assert_eq!(frame.return_code(), rc::OK);
        let created = CapId::from_word(frame.gpr[axon_abi::RETURN_VALUE_REG]);
        assert!(kernel.with_state(CpuId::BOOT, |s| s.thread(created).is_some()));

        frame = syscall(Syscall::DestroyObject, &[pd.as_word()]);
        let _ = kernel.handle_trap(CpuId::BOOT, Trap::Syscall, &mut frame);
        assert_eq!(frame.return_code(), rc::DENIED);

        let mut frame = syscall(Syscall::YieldThread, &[]);
        frame.gpr[SYSCALL_NUMBER_REG] = 63;
        let _ = kernel.handle_trap(CpuId::BOOT, Trap::Syscall, &mut frame);
        assert_eq!(frame.return_code(), rc::INVALID_SYSCALL);
        kernel.check_invariants(CpuId::BOOT).expect("invariants");
    }

    #[test]
    fn idle_when_nothing_is_runnable() {
        let kernel = boot(1);
        let mut frame = UserContext::default();
        assert_eq!(kernel.handle_trap(CpuId::BOOT, Trap::Interrupt(crate::hal::sim::SIM_TIMER_IRQ), &mut frame), Next::Idle);
    }

    #[test]
    #[should_panic(expected = "re-entrant kernel lock")]
    fn nested_entry_on_one_core_is_fatal() {
        let kernel = boot(1);
        kernel.with_state(CpuId::BOOT, |_| {
            let mut frame = UserContext::default();
            let _ = kernel.handle_trap(CpuId::BOOT, Trap::Ipi, &mut frame);
        });
    }
}
