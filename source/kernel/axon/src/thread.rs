// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Thread objects: register context, scheduling state, fault record, IPC node
//! OWNERS: @kernel-team
//! PUBLIC API: Thread, ThreadState, UserContext
//! DEPENDS_ON: ipc::IpcNode, ipc::Message, sched::SchedParams, axon_abi register layout
//!
//! Thread control (`start`, `pause`, `resume`, `yield`, affinity, pager, register access)
//! lives here as `KernelState` methods; the syscall layer only decodes and checks rights.
//! INVARIANTS: A thread belongs to exactly one Pd for its whole life; the state names the one
//!             wait list (if any) the thread sits on
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use axon_abi::{rc, FaultRecord, ARG_REGS, GPR_COUNT, RETURN_REG, RETURN_VALUE_REG, SYSCALL_NUMBER_REG};

use crate::ipc::{IpcNode, Message};
use crate::sched::SchedParams;
use crate::smp::{WorkItem, WorkTicket};
use crate::state::KernelState;
use crate::syscall::{Error, SysResult};
use crate::types::{CapId, CpuId};

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, registers not installed yet.
    AwaitsStart,
    Ready,
    Running,
    /// Sending and awaiting a reply, or waiting for a request.
    BlockedOnIpc,
    BlockedOnSignal,
    /// Waiting for remote cores to acknowledge queued work.
    BlockedOnWork,
    /// Stopped by a supervisor.
    Paused,
    /// Stopped by an unresolved fault; only destruction ends this state.
    Faulted,
    Dead,
}

impl ThreadState {
    pub const fn is_blocked(self) -> bool {
        matches!(self, Self::BlockedOnIpc | Self::BlockedOnSignal | Self::BlockedOnWork)
    }

    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

/// Architecture-neutral saved user register state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserContext {
    pub ip: usize,
    pub sp: usize,
    pub gpr: [usize; GPR_COUNT],
}

impl UserContext {
    #[inline]
    pub fn syscall_number(&self) -> usize {
        self.gpr[SYSCALL_NUMBER_REG]
    }

    pub fn args(&self) -> [usize; ARG_REGS] {
        let mut args = [0; ARG_REGS];
        args.copy_from_slice(&self.gpr[..ARG_REGS]);
        args
    }

    #[inline]
    pub fn set_return(&mut self, code: isize) {
        self.gpr[RETURN_REG] = rc::encode(code);
    }

    #[inline]
    pub fn set_value(&mut self, value: usize) {
        self.gpr[RETURN_VALUE_REG] = value;
    }

    #[inline]
    pub fn return_code(&self) -> isize {
        rc::decode(self.gpr[RETURN_REG])
    }

    /// Register by flat index: `0` = ip, `1` = sp, `2..` = gpr.
    pub fn register(&self, index: usize) -> Option<usize> {
        match index {
            0 => Some(self.ip),
            1 => Some(self.sp),
            i => self.gpr.get(i - 2).copied(),
        }
    }

    pub fn set_register(&mut self, index: usize, value: usize) -> bool {
        match index {
            0 => self.ip = value,
            1 => self.sp = value,
            i => match self.gpr.get_mut(i - 2) {
                Some(slot) => *slot = value,
                None => return false,
            },
        }
        true
    }
}

#[derive(Debug)]
pub struct Thread {
    pub id: CapId,
    pub pd: CapId,
    pub params: SchedParams,
    pub context: UserContext,
    pub state: ThreadState,
    pub pager: Option<CapId>,
    /// Last fault taken; kept while the fault is being resolved and after it failed.
    pub fault: Option<FaultRecord>,
    pub ipc: IpcNode,
    /// Message buffer shared by send and receive (the thread's UTCB).
    pub utcb: Message,
    /// Receiver this thread waits on.
    pub signal_wait: Option<CapId>,
    /// Remote acknowledgements still outstanding.
    pub pending_work: u32,
    /// A pause arrived while blocked; the wake-up parks the thread instead.
    pub pause_requested: bool,
    /// Core that last ran or queued this thread.
    pub cpu: CpuId,
}

impl Thread {
    pub fn new(id: CapId, pd: CapId, params: SchedParams, home: CpuId) -> Self {
        Self {
            id,
            pd,
            params,
            context: UserContext::default(),
            state: ThreadState::AwaitsStart,
            pager: None,
            fault: None,
            ipc: IpcNode::default(),
            utcb: Message::default(),
            signal_wait: None,
            pending_work: 0,
            pause_requested: false,
            cpu: params.affinity.unwrap_or(home),
        }
    }
}

impl KernelState {
    /// `start_thread(thread, ip, sp)`: installs the entry registers and readies the thread.
    pub(crate) fn thread_start(&mut self, id: CapId, ip: usize, sp: usize, cpu: CpuId) -> SysResult<()> {
        let t = self.registry.thread_mut(id).ok_or(Error::InvalidCapability)?;
        if t.state != ThreadState::AwaitsStart {
            return Err(Error::BadState);
        }
        t.context.ip = ip;
        t.context.sp = sp;
        self.make_ready(id, cpu);
        log_debug!(target: "thread", "{} started ip={:#x} sp={:#x}", id, ip, sp);
        Ok(())
    }

    /// `pause_thread(thread)`.
    ///
    /// A thread running on another core, or blocked, is parked at its next kernel entry
    /// or wake-up respectively.
    pub(crate) fn thread_pause(&mut self, id: CapId, cpu: CpuId) -> SysResult<()> {
        let remote = self.sched.running_on(id).filter(|c| *c != cpu);
        let t = self.registry.thread_mut(id).ok_or(Error::InvalidCapability)?;
        match t.state {
            ThreadState::AwaitsStart | ThreadState::Paused => Ok(()),
            ThreadState::Faulted | ThreadState::Dead => Err(Error::BadState),
            ThreadState::Running if remote.is_some() => {
                t.pause_requested = true;
                if let Some(remote) = remote {
                    self.resched |= remote.mask();
                }
                Ok(())
            }
            ThreadState::Ready | ThreadState::Running => {
                t.state = ThreadState::Paused;
                self.sched.unready(id);
                Ok(())
            }
            ThreadState::BlockedOnIpc | ThreadState::BlockedOnSignal | ThreadState::BlockedOnWork => {
                t.pause_requested = true;
                Ok(())
            }
        }
    }

    /// Parks the thread loaded on `cpu` if a pause arrived while it was running.
    pub(crate) fn settle_pause(&mut self, cpu: CpuId) {
        let Some(id) = self.running[cpu.as_index()] else {
            return;
        };
        let Some(t) = self.registry.thread_mut(id) else {
            return;
        };
        if t.pause_requested && t.state == ThreadState::Running {
            t.pause_requested = false;
            t.state = ThreadState::Paused;
            self.sched.unready(id);
        }
    }

    /// `resume_thread(thread)`: undoes a pause and cancels a blocking IPC or signal wait.
    pub(crate) fn thread_resume(&mut self, id: CapId, cpu: CpuId) -> SysResult<()> {
        let t = self.registry.thread_mut(id).ok_or(Error::InvalidCapability)?;
        t.pause_requested = false;
        match t.state {
            ThreadState::Paused => self.make_ready(id, cpu),
            ThreadState::BlockedOnIpc => {
                self.abort_ipc_wait(id);
                self.wake(id, cpu, Some((rc::CANCELLED, 0)));
            }
            ThreadState::BlockedOnSignal => {
                self.leave_signal_wait(id);
                self.wake(id, cpu, Some((rc::CANCELLED, 0)));
            }
            ThreadState::Ready | ThreadState::Running | ThreadState::BlockedOnWork => {}
            ThreadState::AwaitsStart | ThreadState::Faulted | ThreadState::Dead => return Err(Error::BadState),
        }
        Ok(())
    }

    /// `yield_thread()`: the caller gives up the rest of its quantum.
    pub(crate) fn thread_yield(&mut self, cpu: CpuId) {
        self.sched.yield_current(cpu);
    }

    /// `set_affinity(thread, cpu)`: `None` lets the thread follow whoever wakes it.
    pub(crate) fn thread_set_affinity(&mut self, id: CapId, affinity: Option<CpuId>, cpu: CpuId) -> SysResult<()> {
        if affinity.is_some_and(|c| c.as_index() >= self.config.cores) {
            return Err(Error::InvalidArgument);
        }
        let t = self.registry.thread_mut(id).ok_or(Error::InvalidCapability)?;
        t.params.affinity = affinity;
        if let Some(target) = affinity {
            t.cpu = target;
        }
        if let Some(remote) = self.sched.set_affinity(id, affinity).filter(|c| *c != cpu) {
            self.outbox.push((remote, WorkTicket { item: WorkItem::DomainUpdate, issuer: None }));
        }
        self.resched |= self.sched.take_remote_resched();
        Ok(())
    }

    /// `set_pager(thread, pager)`: later faults of `thread` are delegated to `pager`.
    pub(crate) fn thread_set_pager(&mut self, id: CapId, pager: Option<CapId>) -> SysResult<()> {
        if pager == Some(id) {
            return Err(Error::InvalidArgument);
        }
        let t = self.registry.thread_mut(id).ok_or(Error::InvalidCapability)?;
        let old = core::mem::replace(&mut t.pager, pager);
        if let Some(old) = old {
            self.registry.unpin(old);
        }
        if let Some(pager) = pager {
            self.registry.pin(pager);
        }
        Ok(())
    }

    fn inspectable(&self, id: CapId) -> SysResult<&Thread> {
        let t = self.registry.thread(id).ok_or(Error::InvalidCapability)?;
        if t.state.is_runnable() || t.state == ThreadState::Dead {
            return Err(Error::BadState);
        }
        Ok(t)
    }

    /// `read_register(thread, index)`: only for threads that are not executing.
    pub(crate) fn thread_read_register(&self, id: CapId, index: usize) -> SysResult<usize> {
        self.inspectable(id)?.context.register(index).ok_or(Error::InvalidArgument)
    }

    pub(crate) fn thread_write_register(&mut self, id: CapId, index: usize, value: usize) -> SysResult<()> {
        self.inspectable(id)?;
        let t = self.registry.thread_mut(id).ok_or(Error::InvalidCapability)?;
        if t.context.set_register(index, value) {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::{context, receiver, started_thread, TestKernel};

    #[test]
    fn register_indexing() {
        let mut ctx = UserContext::default();
        assert!(ctx.set_register(0, 0x1000));
        assert!(ctx.set_register(1, 0x8000));
        assert!(ctx.set_register(2 + SYSCALL_NUMBER_REG, 4));
        assert!(!ctx.set_register(2 + GPR_COUNT, 1));
        assert_eq!(ctx.register(0), Some(0x1000));
        assert_eq!(ctx.syscall_number(), 4);
        assert_eq!(ctx.register(2 + GPR_COUNT), None);
    }

    #[test]
    fn return_code_encoding() {
        let mut ctx = UserContext::default();
        ctx.set_return(rc::CANCELLED);
        assert_eq!(ctx.return_code(), rc::CANCELLED);
    }

    #[test]
    fn start_is_one_shot() {
        let mut k = TestKernel::new(1);
        let t = started_thread(&mut k, 1);
        assert_eq!(k.state.thread_start(t, 0, 0, CpuId::BOOT), Err(Error::BadState));
        let thread = k.state.thread(t).expect("t");
        assert_eq!((thread.context.ip, thread.context.sp), (0x1000, 0x8000));
        assert!(k.state.sched.is_queued(t));
    }

    #[test]
    fn pause_and_resume_ready_thread() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let t = started_thread(&mut k, 1);
        k.state.thread_pause(t, cpu).expect("pause");
        assert_eq!(k.state.thread(t).map(|x| x.state), Some(ThreadState::Paused));
        assert!(!k.state.sched.is_queued(t));
        k.state.check_invariants().expect("invariants");
        k.state.thread_resume(t, cpu).expect("resume");
        assert_eq!(k.state.thread(t).map(|x| x.state), Some(ThreadState::Ready));
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn pause_while_blocked_parks_on_wake() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let rx = receiver(&mut k);
        let ctx = context(&mut k, rx, 1);
        let t = started_thread(&mut k, 1);
        let _ = k.state.signal_wait(t, rx);
        k.state.thread_pause(t, cpu).expect("pause");
        assert_eq!(k.state.thread(t).map(|x| x.state), Some(ThreadState::BlockedOnSignal));
        k.state.signal_submit(ctx, 1, cpu);
        let thread = k.state.thread(t).expect("t");
        assert_eq!(thread.state, ThreadState::Paused);
        assert_eq!(thread.context.return_code(), rc::OK);
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn resume_cancels_a_signal_wait() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let rx = receiver(&mut k);
        let t = started_thread(&mut k, 1);
        let _ = k.state.signal_wait(t, rx);
        k.state.thread_resume(t, cpu).expect("resume");
        let thread = k.state.thread(t).expect("t");
        assert_eq!(thread.state, ThreadState::Ready);
        assert_eq!(thread.context.return_code(), rc::CANCELLED);
        assert!(k.state.registry.signal_receiver(rx).is_some_and(|r| r.waiters.is_empty()));
    }

    #[test]
    fn remote_pause_settles_at_next_entry() {
        let mut k = TestKernel::new(2);
        let remote = CpuId::from_index(1).expect("cpu1");
        let t = started_thread(&mut k, 1);
        k.state.thread_set_affinity(t, Some(remote), CpuId::BOOT).expect("affinity");
        assert_eq!(k.state.dispatch(remote), crate::sched::Selection::Job(t));
        k.state.load(&k.platform, remote, Some(t));
        k.state.thread_pause(t, CpuId::BOOT).expect("pause");
        assert_eq!(k.state.take_resched(), remote.mask());
        assert_eq!(k.state.thread(t).map(|x| x.state), Some(ThreadState::Running));
        k.state.settle_pause(remote);
        assert_eq!(k.state.thread(t).map(|x| x.state), Some(ThreadState::Paused));
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn registers_only_while_stopped() {
        let mut k = TestKernel::new(1);
        let t = started_thread(&mut k, 1);
        assert_eq!(k.state.thread_read_register(t, 0), Err(Error::BadState));
        k.state.thread_pause(t, CpuId::BOOT).expect("pause");
        k.state.thread_write_register(t, 3, 0x42).expect("write");
        assert_eq!(k.state.thread_read_register(t, 3), Ok(0x42));
        assert_eq!(k.state.thread_read_register(t, 2 + GPR_COUNT), Err(Error::InvalidArgument));
    }

    #[test]
    fn pager_link_keeps_id_reserved() {
        let mut k = TestKernel::new(1);
        let t = started_thread(&mut k, 1);
        let pager = started_thread(&mut k, 2);
        assert_eq!(k.state.thread_set_pager(t, Some(t)), Err(Error::InvalidArgument));
        k.state.thread_set_pager(t, Some(pager)).expect("pager");
        let root = k.state.root_pd;
        k.state.destroy(&k.platform, root, pager, CpuId::BOOT).expect("destroy pager");
        assert!(k.state.thread(pager).is_none());
        assert_eq!(k.state.registry.refcount(pager), 1);
        k.state.thread_set_pager(t, None).expect("clear");
        assert_eq!(k.state.registry.refcount(pager), 0);
    }

    #[test]
    fn blocked_states() {
        assert!(ThreadState::BlockedOnWork.is_blocked());
        assert!(!ThreadState::Faulted.is_blocked());
        assert!(ThreadState::Running.is_runnable());
    }
}
