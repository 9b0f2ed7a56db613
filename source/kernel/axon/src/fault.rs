// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Pager protocol: fault capture, synthetic call to the pager, reply application
//! OWNERS: @kernel-team
//! PUBLIC API: KernelState::{raise_fault, resolve_fault}
//! DEPENDS_ON: ipc (send_request), mm::AddressSpace, axon_abi::{FaultRecord, MappingWords}
//! INVARIANTS: A fault produces exactly one request to the pager; the faulting thread runs
//!             again only after a mapping was installed; without a pager the whole Pd halts
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! Pager reply format: label `PAGER_MAP` with a [`MappingWords`] payload installs the mapping
//! and retries the faulting instruction; any other label declines and leaves the thread in
//! `Faulted` until a supervisor destroys it.

use axon_abi::{FaultKind, FaultRecord, MappingWords, MsgFlags, FAULT_EXEC, FAULT_LABEL, PAGER_MAP};

use crate::hal::Platform;
use crate::ipc::Message;
use crate::mm::{AddressSpace, MapError, Mapping};
use crate::state::KernelState;
use crate::thread::ThreadState;
use crate::types::{CapId, CpuId};

impl KernelState {
    /// Delegates a hardware exception of `thread` to its pager.
    pub(crate) fn raise_fault(&mut self, thread: CapId, record: FaultRecord, cpu: CpuId) {
        let Some(t) = self.registry.thread_mut(thread) else {
            return;
        };
        t.fault = Some(record);
        let (pd, configured) = (t.pd, t.pager);
        let pager = configured.filter(|p| {
            *p != thread
                && self
                    .registry
                    .thread(*p)
                    .is_some_and(|pt| !matches!(pt.state, ThreadState::Faulted | ThreadState::Dead))
        });
        let Some(pager) = pager else {
            if let Some(gone) = configured {
                log_warn!(target: "fault", "{} pager {} cannot serve faults", thread, gone);
            }
            log_error!(
                target: "fault",
                "{} {:?} at {:#x} ip={:#x} without pager; halting pd {}",
                thread, record.kind, record.addr, record.ip, pd
            );
            self.halt_pd(pd, cpu);
            return;
        };
        let mut msg = Message::new(FAULT_LABEL, &record.to_words());
        msg.set_flag(MsgFlags::FAULT, true);
        if let Some(t) = self.registry.thread_mut(thread) {
            t.ipc.fault_msg = Some(msg);
        }
        log_debug!(target: "fault", "{} {:?} at {:#x} -> pager {}", thread, record.kind, record.addr, pager);
        self.send_request(thread, pager, cpu);
    }

    /// Applies the pager's reply to a delegated fault.
    pub(crate) fn resolve_fault(&mut self, platform: &dyn Platform, thread: CapId, reply: &Message, cpu: CpuId) {
        let Some((pd, fault)) = self.registry.thread(thread).map(|t| (t.pd, t.fault)) else {
            return;
        };
        let result = Self::decode_pager_reply(reply).and_then(|mapping| {
            let space = &mut self.registry.pd_mut(pd).ok_or(MapError::NotMapped)?.space;
            space.install(platform.mmu(), mapping)?;
            match fault {
                Some(f) if f.kind == FaultKind::PageFault => Self::check_coverage(space, &f),
                _ => Ok(()),
            }
        });
        match result {
            Ok(()) => {
                if let Some(t) = self.registry.thread_mut(thread) {
                    t.fault = None;
                }
                self.wake(thread, cpu, None);
            }
            Err(err) => {
                let addr = self.registry.thread(thread).and_then(|t| t.fault).map_or(0, |f| f.addr);
                log_warn!(target: "fault", "{} fault at {:#x} unresolved: {:?}", thread, addr, err);
                if let Some(t) = self.registry.thread_mut(thread) {
                    t.state = ThreadState::Faulted;
                    t.pause_requested = false;
                }
            }
        }
    }

    /// A page fault is resolved only once a mapping covers the address with the faulting access.
    fn check_coverage(space: &AddressSpace, fault: &FaultRecord) -> Result<(), MapError> {
        let mapping = space.lookup(fault.addr).ok_or(MapError::NotMapped)?;
        if mapping.permits(fault.is_write(), fault.access & FAULT_EXEC != 0) {
            Ok(())
        } else {
            Err(MapError::PermissionDenied)
        }
    }

    fn decode_pager_reply(reply: &Message) -> Result<Mapping, MapError> {
        if reply.label() != PAGER_MAP {
            return Err(MapError::NotMapped);
        }
        let words = MappingWords::from_words(reply.payload()).ok_or(MapError::InvalidFlags)?;
        Mapping::from_words(&words)
    }

    /// Parks every thread of `pd` after an unresolvable fault.
    pub(crate) fn halt_pd(&mut self, pd: CapId, cpu: CpuId) {
        let Some(threads) = self.registry.pd_mut(pd).map(|p| {
            p.halted = true;
            p.threads.clone()
        }) else {
            return;
        };
        for id in threads {
            let state = self.registry.thread(id).map(|t| t.state);
            if matches!(state, None | Some(ThreadState::Faulted | ThreadState::Dead)) {
                continue;
            }
            self.cancel_ipc(id, cpu);
            self.leave_signal_wait(id);
            self.evict(id, cpu);
            if let Some(t) = self.registry.thread_mut(id) {
                t.state = ThreadState::Faulted;
                t.pause_requested = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::{child_pd, started_thread, started_thread_in, TestKernel};
    use crate::syscall::Completion;
    use axon_abi::{CachePolicy, MapAttrs, FAULT_WRITE, PAGER_DECLINE};

    fn page_fault(addr: usize) -> FaultRecord {
        FaultRecord { kind: FaultKind::PageFault, addr, ip: 0x1000, access: FAULT_WRITE }
    }

    fn map_reply(virt: usize) -> Message {
        let words = MappingWords {
            phys: 0x8000_0000,
            virt,
            size: crate::mm::PAGE_SIZE,
            attrs: MapAttrs::READ | MapAttrs::WRITE | MapAttrs::USER,
            cache: CachePolicy::Cached,
        };
        Message::new(PAGER_MAP, &words.to_words())
    }

    #[test]
    fn pager_sees_one_fault_request() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let pager = started_thread(&mut k, 2);
        let t = started_thread(&mut k, 1);
        k.state.registry.thread_mut(t).expect("t").pager = Some(pager);
        assert_eq!(k.state.ipc_wait(pager, cpu), Ok(Completion::Blocked));
        k.state.raise_fault(t, page_fault(0x4000_0123), cpu);
        let p = k.state.registry.thread(pager).expect("pager");
        assert_eq!(p.context.return_code(), axon_abi::rc::OK);
        assert_eq!(p.utcb.label(), FAULT_LABEL);
        assert!(p.utcb.flags().contains(MsgFlags::FAULT));
        assert_eq!(p.utcb.badge(), t.as_raw());
        assert_eq!(FaultRecord::from_words(p.utcb.payload()), Some(page_fault(0x4000_0123)));
        assert_eq!(k.state.registry.thread(t).map(|x| x.state), Some(ThreadState::BlockedOnIpc));
    }

    #[test]
    fn mapping_reply_installs_and_resumes() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let pager = started_thread(&mut k, 2);
        let t = started_thread(&mut k, 1);
        k.state.registry.thread_mut(t).expect("t").pager = Some(pager);
        k.state.registry.thread_mut(t).expect("t").context.gpr[0] = 0x55;
        k.state.raise_fault(t, page_fault(0x4000_0123), cpu);
        let _ = k.state.ipc_wait(pager, cpu);
        k.state.registry.thread_mut(pager).expect("pager").utcb = map_reply(0x4000_0000);
        assert_eq!(k.state.ipc_reply(&k.platform, pager, cpu), crate::ipc::Outcome::Delivered);
        let thread = k.state.registry.thread(t).expect("t");
        assert_eq!(thread.state, ThreadState::Ready);
        assert_eq!(thread.fault, None);
        assert_eq!(thread.context.gpr[0], 0x55);
        let table = k.state.registry.pd(thread.pd).expect("pd").space.table();
        assert_eq!(k.platform.mmu.translate(table, 0x4000_0123).map(|(pa, _)| pa), Some(0x8000_0123));
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn declined_fault_parks_thread() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let pager = started_thread(&mut k, 2);
        let t = started_thread(&mut k, 1);
        k.state.registry.thread_mut(t).expect("t").pager = Some(pager);
        k.state.raise_fault(t, page_fault(0x4000_0000), cpu);
        let _ = k.state.ipc_wait(pager, cpu);
        k.state.registry.thread_mut(pager).expect("pager").utcb = Message::new(PAGER_DECLINE, &[]);
        let _ = k.state.ipc_reply(&k.platform, pager, cpu);
        let thread = k.state.registry.thread(t).expect("t");
        assert_eq!(thread.state, ThreadState::Faulted);
        assert!(!k.state.sched.is_queued(t));
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn fault_without_pager_halts_pd() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let pd = child_pd(&mut k, 8);
        let a = started_thread_in(&mut k, pd, 1);
        let b = started_thread_in(&mut k, pd, 1);
        let console = crate::hal::sim::CaptureConsole::install();
        k.state.raise_fault(a, page_fault(0x10), cpu);
        assert!(console.contains("without pager"));
        for id in [a, b] {
            assert_eq!(k.state.registry.thread(id).map(|t| t.state), Some(ThreadState::Faulted));
        }
        assert!(k.state.registry.pd(pd).is_some_and(|p| p.halted));
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn faulted_pager_halts_pd_with_warning() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let pd = child_pd(&mut k, 8);
        let pager = started_thread_in(&mut k, pd, 2);
        let t = started_thread_in(&mut k, pd, 1);
        k.state.registry.thread_mut(t).expect("t").pager = Some(pager);
        k.state.block(pager, ThreadState::Faulted);
        let console = crate::hal::sim::CaptureConsole::install();
        k.state.raise_fault(t, page_fault(0x20), cpu);
        assert!(console.contains(&alloc::format!("{} pager {} cannot serve faults", t, pager)));
        assert_eq!(k.state.registry.thread(t).map(|x| x.state), Some(ThreadState::Faulted));
        assert!(k.state.registry.pd(pd).is_some_and(|p| p.halted));
        k.state.check_invariants().expect("invariants");
    }

    #[test]
    fn failed_install_parks_thread() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let pager = started_thread(&mut k, 2);
        let t = started_thread(&mut k, 1);
        k.state.registry.thread_mut(t).expect("t").pager = Some(pager);
        k.state.raise_fault(t, page_fault(0x4000_0000), cpu);
        let _ = k.state.ipc_wait(pager, cpu);
        let mut reply = map_reply(0x4000_0000);
        reply.words[3] |= MapAttrs::EXEC.bits() as usize;
        k.state.registry.thread_mut(pager).expect("pager").utcb = reply;
        let _ = k.state.ipc_reply(&k.platform, pager, cpu);
        assert_eq!(k.state.registry.thread(t).map(|x| x.state), Some(ThreadState::Faulted));
    }

    #[test]
    fn read_only_reply_to_write_fault_parks_thread() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let pager = started_thread(&mut k, 2);
        let t = started_thread(&mut k, 1);
        k.state.registry.thread_mut(t).expect("t").pager = Some(pager);
        k.state.raise_fault(t, page_fault(0x4000_0008), cpu);
        let _ = k.state.ipc_wait(pager, cpu);
        let mut reply = map_reply(0x4000_0000);
        reply.words[3] &= !(MapAttrs::WRITE.bits() as usize);
        k.state.registry.thread_mut(pager).expect("pager").utcb = reply;
        let _ = k.state.ipc_reply(&k.platform, pager, cpu);
        let thread = k.state.registry.thread(t).expect("t");
        assert_eq!(thread.state, ThreadState::Faulted);
        assert!(!k.state.sched.is_queued(t));
    }

    #[test]
    fn reply_for_other_page_parks_thread() {
        let mut k = TestKernel::new(1);
        let cpu = CpuId::BOOT;
        let pager = started_thread(&mut k, 2);
        let t = started_thread(&mut k, 1);
        k.state.registry.thread_mut(t).expect("t").pager = Some(pager);
        k.state.raise_fault(t, page_fault(0x4000_0008), cpu);
        let _ = k.state.ipc_wait(pager, cpu);
        k.state.registry.thread_mut(pager).expect("pager").utcb = map_reply(0x5000_0000);
        let _ = k.state.ipc_reply(&k.platform, pager, cpu);
        assert_eq!(k.state.registry.thread(t).map(|x| x.state), Some(ThreadState::Faulted));
    }
}
