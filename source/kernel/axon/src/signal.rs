// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Asynchronous notifications: signal contexts submit, one receiver collects
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: SignalContext, SignalReceiver
//! DEPENDS_ON: state::KernelState, cap::Registry
//! INVARIANTS: A context is bound to at most one receiver; a context is queued at its
//!             receiver iff its pending count is non-zero; submit never blocks and never fails
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::collections::{BTreeSet, VecDeque};

use axon_abi::{rc, MsgFlags, SignalInfo, SIGNAL_LABEL};

use crate::ipc::Message;
use crate::state::KernelState;
use crate::syscall::{Completion, Error, SysResult};
use crate::thread::ThreadState;
use crate::types::{CapId, CpuId};

#[derive(Debug, Default)]
pub struct SignalContext {
    pub receiver: Option<CapId>,
    pub imprint: usize,
    /// Submits since the last delivery (saturating).
    pub pending: u32,
}

#[derive(Debug, Default)]
pub struct SignalReceiver {
    pub contexts: BTreeSet<CapId>,
    /// Contexts with a non-zero count, in the order they became pending.
    pub pending: VecDeque<CapId>,
    /// Threads blocked in `wait_for_signal`, oldest first.
    pub waiters: VecDeque<CapId>,
}

impl KernelState {
    /// `submit(context, count)`: silently ignores dead, foreign-kind or unbound contexts.
    pub(crate) fn signal_submit(&mut self, context: CapId, count: u32, cpu: CpuId) {
        if count == 0 {
            return;
        }
        let Some(ctx) = self.registry.signal_context_mut(context) else {
            return;
        };
        let Some(receiver) = ctx.receiver else {
            return;
        };
        let newly_pending = ctx.pending == 0;
        ctx.pending = ctx.pending.saturating_add(count);
        let Some(rx) = self.registry.signal_receiver_mut(receiver) else {
            return;
        };
        if newly_pending {
            rx.pending.push_back(context);
        }
        let Some(waiter) = rx.waiters.pop_front() else {
            return;
        };
        if let Some(info) = self.drain(receiver) {
            self.deliver_signal(waiter, info);
            self.wake(waiter, cpu, Some((rc::OK, info.count as usize)));
        }
    }

    /// Takes the context with the highest count (oldest first on ties) and resets it.
    fn drain(&mut self, receiver: CapId) -> Option<SignalInfo> {
        let rx = self.registry.signal_receiver(receiver)?;
        let mut best: Option<(usize, u32)> = None;
        for (idx, id) in rx.pending.iter().enumerate() {
            let count = self.registry.signal_context(*id).map_or(0, |c| c.pending);
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((idx, count));
            }
        }
        let (idx, _) = best?;
        let id = self.registry.signal_receiver_mut(receiver)?.pending.remove(idx)?;
        let ctx = self.registry.signal_context_mut(id)?;
        let count = core::mem::take(&mut ctx.pending);
        Some(SignalInfo { imprint: ctx.imprint, count })
    }

    fn deliver_signal(&mut self, thread: CapId, info: SignalInfo) {
        if let Some(t) = self.registry.thread_mut(thread) {
            let mut msg = Message::new(SIGNAL_LABEL, &info.to_words());
            msg.set_flag(MsgFlags::SIGNAL, true);
            t.utcb = msg;
            t.signal_wait = None;
        }
    }

    /// `wait_for_signal(receiver)`: returns the coalesced count of one context.
    pub(crate) fn signal_wait(&mut self, thread: CapId, receiver: CapId) -> SysResult<Completion> {
        if let Some(info) = self.drain(receiver) {
            self.deliver_signal(thread, info);
            return Ok(Completion::Done(info.count as usize));
        }
        let rx = self.registry.signal_receiver_mut(receiver).ok_or(Error::InvalidCapability)?;
        rx.waiters.push_back(thread);
        if let Some(t) = self.registry.thread_mut(thread) {
            t.signal_wait = Some(receiver);
        }
        self.block(thread, ThreadState::BlockedOnSignal);
        Ok(Completion::Blocked)
    }

    /// Takes `thread` off the waiter list it sits on.
    pub(crate) fn leave_signal_wait(&mut self, thread: CapId) {
        let Some(receiver) = self.registry.thread_mut(thread).and_then(|t| t.signal_wait.take()) else {
            return;
        };
        if let Some(rx) = self.registry.signal_receiver_mut(receiver) {
            rx.waiters.retain(|w| *w != thread);
        }
    }

    /// Binds a freshly created context to `receiver`.
    pub(crate) fn bind_context(&mut self, context: CapId, receiver: CapId) {
        if let Some(rx) = self.registry.signal_receiver_mut(receiver) {
            rx.contexts.insert(context);
            self.registry.pin(receiver);
        }
    }

    pub(crate) fn teardown_context(&mut self, context: CapId) {
        let Some(receiver) = self.registry.signal_context_mut(context).and_then(|c| c.receiver.take()) else {
            return;
        };
        if let Some(rx) = self.registry.signal_receiver_mut(receiver) {
            rx.contexts.remove(&context);
            rx.pending.retain(|c| *c != context);
        }
        self.registry.unpin(receiver);
    }

    /// Unbinds every context and cancels the blocked waiters.
    pub(crate) fn teardown_receiver(&mut self, receiver: CapId, cpu: CpuId) {
        let Some(rx) = self.registry.signal_receiver_mut(receiver) else {
            return;
        };
        let contexts = core::mem::take(&mut rx.contexts);
        let waiters = core::mem::take(&mut rx.waiters);
        rx.pending.clear();
        for context in contexts {
            if let Some(ctx) = self.registry.signal_context_mut(context) {
                ctx.receiver = None;
                ctx.pending = 0;
            }
            self.registry.unpin(receiver);
        }
        for waiter in waiters {
            if let Some(t) = self.registry.thread_mut(waiter) {
                t.signal_wait = None;
            }
            self.wake(waiter, cpu, Some((rc::CANCELLED, 0)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::{context, receiver, started_thread, TestKernel};

    #[test]
    fn submits_coalesce_into_one_wake() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let rx = receiver(&mut k);
        let ctx = context(&mut k, rx, 0xbeef);
        let t = started_thread(&mut k, 1);
        for _ in 0..5 {
            k.state.signal_submit(ctx, 1, cpu);
        }
        assert_eq!(k.state.signal_wait(t, rx), Ok(Completion::Done(5)));
        let utcb = k.state.registry.thread(t).expect("t").utcb;
        assert_eq!(utcb.label(), SIGNAL_LABEL);
        assert!(utcb.flags().contains(MsgFlags::SIGNAL));
        assert_eq!(SignalInfo::from_words(utcb.payload()), Some(SignalInfo { imprint: 0xbeef, count: 5 }));
        assert_eq!(k.state.signal_wait(t, rx), Ok(Completion::Blocked));
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn blocked_waiter_is_woken_with_count() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let rx = receiver(&mut k);
        let ctx = context(&mut k, rx, 1);
        let t = started_thread(&mut k, 1);
        assert_eq!(k.state.signal_wait(t, rx), Ok(Completion::Blocked));
        k.state.signal_submit(ctx, 3, cpu);
        let thread = k.state.registry.thread(t).expect("t");
        assert_eq!(thread.state, ThreadState::Ready);
        assert_eq!(thread.context.return_code(), rc::OK);
        assert!(thread.utcb.flags().contains(MsgFlags::SIGNAL));
        assert!(!thread.utcb.flags().contains(MsgFlags::FAULT));
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn highest_pending_context_drains_first() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let rx = receiver(&mut k);
        let low = context(&mut k, rx, 1);
        let high = context(&mut k, rx, 2);
        let t = started_thread(&mut k, 1);
        k.state.signal_submit(low, 1, cpu);
        k.state.signal_submit(high, 4, cpu);
        assert_eq!(k.state.signal_wait(t, rx), Ok(Completion::Done(4)));
        assert_eq!(k.state.signal_wait(t, rx), Ok(Completion::Done(1)));
    }

    #[test]
    fn unbound_and_invalid_contexts_are_silent() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let rx = receiver(&mut k);
        let ctx = context(&mut k, rx, 1);
        let root = k.state.root_pd;
        k.state.destroy(&k.platform, root, rx, cpu).expect("destroy receiver");
        k.state.signal_submit(ctx, 1, cpu);
        k.state.signal_submit(CapId::from_raw(999), 1, cpu);
        assert_eq!(k.state.registry.signal_context(ctx).map(|c| c.pending), Some(0));
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn destroying_receiver_cancels_waiters() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let rx = receiver(&mut k);
        let t = started_thread(&mut k, 1);
        let _ = k.state.signal_wait(t, rx);
        let root = k.state.root_pd;
        k.state.destroy(&k.platform, root, rx, cpu).expect("destroy receiver");
        let thread = k.state.registry.thread(t).expect("t");
        assert_eq!(thread.context.return_code(), rc::CANCELLED);
        assert_eq!(thread.state, ThreadState::Ready);
    }

    #[test]
    fn destroyed_context_leaves_pending_queue() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let rx = receiver(&mut k);
        let ctx = context(&mut k, rx, 1);
        let t = started_thread(&mut k, 1);
        k.state.signal_submit(ctx, 2, cpu);
        let root = k.state.root_pd;
        k.state.destroy(&k.platform, root, ctx, cpu).expect("destroy context");
        assert_eq!(k.state.signal_wait(t, rx), Ok(Completion::Blocked));
        k.state.check_invariants().expect("invariants");
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn every_submit_is_delivered_once(submits in proptest::collection::vec((0usize..3, 1u32..50), 0..40)) {
                let mut k = TestKernel::new(1);
                let cpu = CpuId::BOOT;
                let rx = receiver(&mut k);
                let contexts: [CapId; 3] = core::array::from_fn(|i| context(&mut k, rx, i));
                let t = started_thread(&mut k, 1);
                let mut expected = [0u32; 3];
                for (idx, count) in &submits {
                    k.state.signal_submit(contexts[*idx], *count, cpu);
                    expected[*idx] += count;
                }
                let mut seen = [0u32; 3];
                let mut wakes = 0;
                while let Ok(Completion::Done(count)) = k.state.signal_wait(t, rx) {
                    let utcb = k.state.registry.thread(t).map(|t| t.utcb);
                    let info = utcb.and_then(|m| SignalInfo::from_words(m.payload()));
                    prop_assert!(info.is_some());
                    let info = info.unwrap_or(SignalInfo { imprint: 0, count: 0 });
                    prop_assert_eq!(info.count as usize, count);
                    prop_assert_eq!(seen[info.imprint], 0);
                    seen[info.imprint] = info.count;
                    wakes += 1;
                }
                prop_assert_eq!(seen, expected);
                prop_assert!(wakes <= 3);
                prop_assert!(k.state.check_invariants().is_ok());
            }
        }
    }
}
