// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous IPC rendezvous (call / wait_for_request / reply)
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: IpcNode, IpcState, ReplySlot, Outcome, Message
//! DEPENDS_ON: state::KernelState, cap::Registry, thread::Thread
//! INVARIANTS: A caller waits on at most one destination; callers are served FIFO; the badge
//!             is stamped by the kernel; a reply reaches the caller it was addressed to or
//!             reports cancellation, never both
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod message;

use alloc::collections::VecDeque;

use axon_abi::{rc, MsgFlags, ObjectKind};

pub use message::Message;

use crate::hal::Platform;
use crate::state::KernelState;
use crate::syscall::{Completion, Error, SysResult};
use crate::thread::ThreadState;
use crate::types::{Badge, CapId, CpuId};

/// Rendezvous state of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpcState {
    #[default]
    Idle,
    /// Sent a request to `dest`, waiting for its reply.
    AwaitReply { dest: CapId },
    /// Waiting for the next caller.
    AwaitRequest,
}

/// Caller owed a reply by a server thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplySlot {
    #[default]
    Empty,
    Caller(CapId),
    /// The caller was destroyed or resumed before the reply.
    Cancelled,
}

/// Completion of a reply.
#[must_use = "reply outcomes tell whether the caller saw the message"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Cancelled,
    /// Nobody was waiting for a reply.
    Invalid,
}

#[derive(Debug, Default)]
pub struct IpcNode {
    pub state: IpcState,
    /// Threads blocked in `call` on this thread, oldest first.
    pub callers: VecDeque<CapId>,
    pub reply_to: ReplySlot,
    /// Kernel-built request standing in for the UTCB while a fault is delegated.
    pub fault_msg: Option<Message>,
}

impl KernelState {
    /// `call(dest)`: sends the caller's UTCB and blocks until the reply.
    pub(crate) fn ipc_call(&mut self, caller: CapId, dest: CapId, cpu: CpuId) -> SysResult<Completion> {
        if caller == dest {
            return Err(Error::InvalidArgument);
        }
        let sender = self.registry.thread(caller).ok_or(Error::InvalidCapability)?;
        self.registry.resolve(sender.pd, dest, ObjectKind::Thread)?;
        if let Some(cap) = sender.utcb.cap() {
            if !self.registry.holds(sender.pd, cap) {
                return Err(Error::InvalidCapability);
            }
        }
        self.send_request(caller, dest, cpu);
        Ok(Completion::Blocked)
    }

    /// Blocks `caller` on `dest` and pairs the two if `dest` already waits.
    pub(crate) fn send_request(&mut self, caller: CapId, dest: CapId, cpu: CpuId) {
        if let Some(t) = self.registry.thread_mut(caller) {
            t.ipc.state = IpcState::AwaitReply { dest };
        }
        self.block(caller, ThreadState::BlockedOnIpc);
        let waiting = self
            .registry
            .thread(dest)
            .is_some_and(|d| d.ipc.state == IpcState::AwaitRequest);
        if waiting {
            let badge = self.deliver(caller, dest);
            self.wake(dest, cpu, Some((rc::OK, badge as usize)));
        } else if let Some(d) = self.registry.thread_mut(dest) {
            d.ipc.callers.push_back(caller);
        }
        log_trace!(target: "ipc", "call {} -> {} paired={}", caller, dest, waiting);
    }

    /// Copies the caller's request into `dest` and makes `dest` owe it a reply.
    fn deliver(&mut self, caller: CapId, dest: CapId) -> u32 {
        let Some(sender) = self.registry.thread(caller) else {
            return 0;
        };
        let from_pd = sender.pd;
        let fault = sender.ipc.fault_msg.is_some();
        let mut msg = sender.ipc.fault_msg.unwrap_or(sender.utcb);
        msg.stamp(Badge::of(caller));
        msg.set_flag(MsgFlags::FAULT, fault);
        msg.set_flag(MsgFlags::CAP_DROPPED, false);
        if let Some(to_pd) = self.registry.thread(dest).map(|d| d.pd) {
            self.transfer_cap(&mut msg, from_pd, to_pd);
        }
        if let Some(d) = self.registry.thread_mut(dest) {
            d.utcb = msg;
            d.ipc.state = IpcState::Idle;
            d.ipc.reply_to = ReplySlot::Caller(caller);
        }
        msg.badge()
    }

    /// Grants the attached capability to `to_pd`, or marks it dropped.
    fn transfer_cap(&mut self, msg: &mut Message, from_pd: CapId, to_pd: CapId) {
        let Some(cap) = msg.cap() else {
            return;
        };
        let granted = self.registry.holds(from_pd, cap) && self.registry.grant(to_pd, cap).is_ok();
        if !granted {
            log_debug!(target: "ipc", "dropped {} in transfer to {}", cap, to_pd);
            msg.drop_cap();
        }
    }

    /// `wait_for_request()`: takes the oldest caller or blocks.
    pub(crate) fn ipc_wait(&mut self, server: CapId, cpu: CpuId) -> SysResult<Completion> {
        let t = self.registry.thread_mut(server).ok_or(Error::InvalidCapability)?;
        let stale = core::mem::take(&mut t.ipc.reply_to);
        let next = t.ipc.callers.pop_front();
        if let ReplySlot::Caller(prev) = stale {
            log_debug!(target: "ipc", "{} abandons reply to {}", server, prev);
            self.cancel_caller(prev, cpu);
        }
        if let Some(caller) = next {
            return Ok(Completion::Done(self.deliver(caller, server) as usize));
        }
        if let Some(t) = self.registry.thread_mut(server) {
            t.ipc.state = IpcState::AwaitRequest;
        }
        self.block(server, ThreadState::BlockedOnIpc);
        Ok(Completion::Blocked)
    }

    /// `reply()`: copies the server's UTCB back to the caller it owes a reply.
    pub(crate) fn ipc_reply(&mut self, platform: &dyn Platform, server: CapId, cpu: CpuId) -> Outcome {
        let Some(t) = self.registry.thread_mut(server) else {
            return Outcome::Invalid;
        };
        let caller = match core::mem::take(&mut t.ipc.reply_to) {
            ReplySlot::Empty => return Outcome::Invalid,
            ReplySlot::Cancelled => return Outcome::Cancelled,
            ReplySlot::Caller(caller) => caller,
        };
        let (reply, server_pd) = (t.utcb, t.pd);
        let Some(c) = self.registry.thread_mut(caller) else {
            return Outcome::Cancelled;
        };
        if c.ipc.state != (IpcState::AwaitReply { dest: server }) {
            return Outcome::Cancelled;
        }
        c.ipc.state = IpcState::Idle;
        let caller_pd = c.pd;
        if c.ipc.fault_msg.take().is_some() {
            self.resolve_fault(platform, caller, &reply, cpu);
            return Outcome::Delivered;
        }
        let mut msg = reply;
        msg.stamp(Badge::of(server));
        msg.set_flag(MsgFlags::FAULT, false);
        msg.set_flag(MsgFlags::CAP_DROPPED, false);
        self.transfer_cap(&mut msg, server_pd, caller_pd);
        if let Some(c) = self.registry.thread_mut(caller) {
            c.utcb = msg;
        }
        self.wake(caller, cpu, Some((rc::OK, 0)));
        log_trace!(target: "ipc", "reply {} -> {}", server, caller);
        Outcome::Delivered
    }

    /// `reply(msg, await_next = true)`: replies, then waits for the next request.
    pub(crate) fn ipc_reply_and_wait(
        &mut self,
        platform: &dyn Platform,
        server: CapId,
        cpu: CpuId,
    ) -> SysResult<Completion> {
        match self.ipc_reply(platform, server, cpu) {
            Outcome::Delivered | Outcome::Invalid => {}
            Outcome::Cancelled => log_debug!(target: "ipc", "{} replied to a cancelled caller", server),
        }
        self.ipc_wait(server, cpu)
    }

    /// Ends a call whose server vanished or gave up on it.
    pub(crate) fn cancel_caller(&mut self, caller: CapId, cpu: CpuId) {
        let Some(c) = self.registry.thread_mut(caller) else {
            return;
        };
        c.ipc.state = IpcState::Idle;
        if c.ipc.fault_msg.take().is_some() {
            c.state = ThreadState::Faulted;
            c.pause_requested = false;
            log_warn!(target: "fault", "{} lost its pager mid-fault; thread stays faulted", caller);
            return;
        }
        self.wake(caller, cpu, Some((rc::CANCELLED, 0)));
    }

    /// Withdraws `id` from the rendezvous it is blocked in (resume of a blocked thread).
    pub(crate) fn abort_ipc_wait(&mut self, id: CapId) {
        let Some(t) = self.registry.thread_mut(id) else {
            return;
        };
        let state = core::mem::take(&mut t.ipc.state);
        t.ipc.fault_msg = None;
        if let IpcState::AwaitReply { dest } = state {
            if let Some(d) = self.registry.thread_mut(dest) {
                d.ipc.callers.retain(|c| *c != id);
                if d.ipc.reply_to == ReplySlot::Caller(id) {
                    d.ipc.reply_to = ReplySlot::Cancelled;
                }
            }
        }
    }

    /// Removes `id` from every rendezvous, cancelling the partners (teardown, Pd halt).
    pub(crate) fn cancel_ipc(&mut self, id: CapId, cpu: CpuId) {
        self.abort_ipc_wait(id);
        let Some(t) = self.registry.thread_mut(id) else {
            return;
        };
        let callers = core::mem::take(&mut t.ipc.callers);
        let owed = core::mem::take(&mut t.ipc.reply_to);
        for caller in callers {
            self.cancel_caller(caller, cpu);
        }
        if let ReplySlot::Caller(caller) = owed {
            self.cancel_caller(caller, cpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::{started_thread, TestKernel};

    #[test]
    fn callers_are_served_fifo_with_badges() {
        let mut k = TestKernel::new(1);
        let server = started_thread(&mut k, 1);
        let a = started_thread(&mut k, 1);
        let b = started_thread(&mut k, 1);
        let cpu = CpuId::BOOT;
        k.state.registry.thread_mut(a).expect("a").utcb = Message::new(7, &[1]);
        k.state.registry.thread_mut(b).expect("b").utcb = Message::new(7, &[2]);
        assert_eq!(k.state.ipc_call(a, server, cpu), Ok(Completion::Blocked));
        assert_eq!(k.state.ipc_call(b, server, cpu), Ok(Completion::Blocked));
        assert_eq!(k.state.ipc_wait(server, cpu), Ok(Completion::Done(a.as_word())));
        assert_eq!(k.state.registry.thread(server).expect("s").utcb.payload(), &[1]);
        assert_eq!(k.state.ipc_reply(&k.platform, server, cpu), Outcome::Delivered);
        assert_eq!(k.state.ipc_wait(server, cpu), Ok(Completion::Done(b.as_word())));
        assert_eq!(k.state.registry.thread(server).expect("s").utcb.payload(), &[2]);
        let a_thread = k.state.registry.thread(a).expect("a");
        assert_eq!(a_thread.state, ThreadState::Ready);
        assert_eq!(a_thread.context.return_code(), rc::OK);
        assert_eq!(a_thread.utcb.badge(), server.as_raw());
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn reply_without_caller_is_invalid() {
        let mut k = TestKernel::new(1);
        let server = started_thread(&mut k, 1);
        assert_eq!(k.state.ipc_reply(&k.platform, server, CpuId::BOOT), Outcome::Invalid);
    }

    #[test]
    fn destroyed_caller_turns_reply_into_cancellation() {
        let mut k = TestKernel::new(1);
        let server = started_thread(&mut k, 1);
        let caller = started_thread(&mut k, 1);
        let cpu = CpuId::BOOT;
        let _ = k.state.ipc_call(caller, server, cpu);
        let _ = k.state.ipc_wait(server, cpu);
        let root = k.state.root_pd;
        k.state.destroy(&k.platform, root, caller, cpu).expect("destroy");
        assert_eq!(k.state.ipc_reply(&k.platform, server, cpu), Outcome::Cancelled);
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn destroyed_server_cancels_queued_callers() {
        let mut k = TestKernel::new(1);
        let server = started_thread(&mut k, 1);
        let caller = started_thread(&mut k, 1);
        let cpu = CpuId::BOOT;
        let _ = k.state.ipc_call(caller, server, cpu);
        let root = k.state.root_pd;
        k.state.destroy(&k.platform, root, server, cpu).expect("destroy");
        let c = k.state.registry.thread(caller).expect("caller");
        assert_eq!(c.state, ThreadState::Ready);
        assert_eq!(c.context.return_code(), rc::CANCELLED);
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn self_call_is_rejected() {
        let mut k = TestKernel::new(1);
        let t = started_thread(&mut k, 1);
        assert_eq!(k.state.ipc_call(t, t, CpuId::BOOT), Err(Error::InvalidArgument));
    }
}
