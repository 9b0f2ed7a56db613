// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: state::KernelState, cap::Registry, axon_abi::args
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; every capability argument is
//!             resolved against the caller's Pd before any state changes
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use axon_abi::args::{CreateArgs, CREATE_WORDS, NO_AFFINITY};
use axon_abi::{ObjectKind, Syscall};

use super::{Args, Completion, Error, SysResult, SyscallTable};
use crate::hal::Platform;
use crate::ipc::Outcome;
use crate::state::KernelState;
use crate::types::{CapId, CpuId};

/// Everything a handler may touch while the kernel lock is held.
pub struct Context<'a> {
    pub state: &'a mut KernelState,
    pub platform: &'a dyn Platform,
    pub cpu: CpuId,
    /// Thread that trapped.
    pub caller: CapId,
    /// Pd whose capabilities the caller may invoke.
    pub caller_pd: CapId,
}

impl<'a> Context<'a> {
    pub fn new(state: &'a mut KernelState, platform: &'a dyn Platform, cpu: CpuId, caller: CapId) -> Self {
        let caller_pd = state.thread(caller).map_or(CapId::INVALID, |t| t.pd);
        Self { state, platform, cpu, caller, caller_pd }
    }

    /// Resolves `cap` in the caller's Pd, expecting `kind`.
    fn held(&self, cap: CapId, kind: ObjectKind) -> SysResult<CapId> {
        Ok(self.state.registry.resolve(self.caller_pd, cap, kind)?)
    }
}

// Typed decoders for Decode→Check→Execute

#[derive(Copy, Clone)]
struct CreateArgsTyped {
    pd: CapId,
    args: CreateArgs,
}

impl CreateArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let pd = CapId::from_word(args.get(0));
        let kind = ObjectKind::from_raw(args.get(1)).ok_or(Error::InvalidArgument)?;
        let mut words = [0; CREATE_WORDS];
        for (idx, word) in words.iter_mut().enumerate() {
            *word = args.get(2 + idx);
        }
        let args = CreateArgs::from_words(kind, &words).ok_or(Error::InvalidArgument)?;
        Ok(Self { pd, args })
    }

    /// The caller needs a capability to the Pd that pays for the object.
    #[inline]
    fn check(&self, ctx: &Context<'_>) -> Result<(), Error> {
        match ctx.held(self.pd, ObjectKind::Pd) {
            Err(Error::InvalidCapability) if ctx.state.pd(self.pd).is_some() => Err(Error::Denied),
            other => other.map(drop),
        }
    }
}

#[derive(Copy, Clone)]
struct CapArgsTyped {
    cap: CapId,
}

impl CapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let cap = CapId::from_word(args.get(0));
        if !cap.is_valid() {
            return Err(Error::InvalidCapability);
        }
        Ok(Self { cap })
    }

    #[inline]
    fn check(&self, ctx: &Context<'_>, kind: ObjectKind) -> Result<CapId, Error> {
        ctx.held(self.cap, kind)
    }
}

#[derive(Copy, Clone)]
struct SubmitArgsTyped {
    context: CapId,
    count: u32,
}

impl SubmitArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            context: CapId::from_word(args.get(0)),
            count: u32::try_from(args.get(1)).unwrap_or(u32::MAX),
        })
    }

    /// Submits to contexts the caller cannot name are dropped, not rejected.
    #[inline]
    fn check(&self, ctx: &Context<'_>) -> bool {
        ctx.held(self.context, ObjectKind::SignalContext).is_ok()
    }
}

#[derive(Copy, Clone)]
struct StartArgsTyped {
    thread: CapId,
    ip: usize,
    sp: usize,
}

impl StartArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { thread: CapId::from_word(args.get(0)), ip: args.get(1), sp: args.get(2) })
    }

    #[inline]
    fn check(&self, ctx: &Context<'_>) -> Result<(), Error> {
        ctx.held(self.thread, ObjectKind::Thread)?;
        if self.ip == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct AffinityArgsTyped {
    thread: CapId,
    cpu: Option<CpuId>,
}

impl AffinityArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let cpu = match args.get(1) {
            NO_AFFINITY => None,
            raw => Some(
                u16::try_from(raw).ok().and_then(CpuId::new).ok_or(Error::InvalidArgument)?,
            ),
        };
        Ok(Self { thread: CapId::from_word(args.get(0)), cpu })
    }

    #[inline]
    fn check(&self, ctx: &Context<'_>) -> Result<(), Error> {
        ctx.held(self.thread, ObjectKind::Thread).map(drop)
    }
}

#[derive(Copy, Clone)]
struct PagerArgsTyped {
    thread: CapId,
    pager: Option<CapId>,
}

impl PagerArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let pager = CapId::from_word(args.get(1));
        Ok(Self { thread: CapId::from_word(args.get(0)), pager: pager.is_valid().then_some(pager) })
    }

    #[inline]
    fn check(&self, ctx: &Context<'_>) -> Result<(), Error> {
        ctx.held(self.thread, ObjectKind::Thread)?;
        if let Some(pager) = self.pager {
            ctx.held(pager, ObjectKind::Thread)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct RegisterArgsTyped {
    thread: CapId,
    index: usize,
    value: usize,
}

impl RegisterArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { thread: CapId::from_word(args.get(0)), index: args.get(1), value: args.get(2) })
    }

    #[inline]
    fn check(&self, ctx: &Context<'_>) -> Result<(), Error> {
        ctx.held(self.thread, ObjectKind::Thread)?;
        if self.thread == ctx.caller {
            return Err(Error::BadState);
        }
        Ok(())
    }
}

/// Installs the default handler set.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(Syscall::CreateObject, sys_create_object);
    table.register(Syscall::DestroyObject, sys_destroy_object);
    table.register(Syscall::Call, sys_call);
    table.register(Syscall::WaitForRequest, sys_wait_for_request);
    table.register(Syscall::Reply, sys_reply);
    table.register(Syscall::ReplyAndWait, sys_reply_and_wait);
    table.register(Syscall::SubmitSignal, sys_submit_signal);
    table.register(Syscall::WaitForSignal, sys_wait_for_signal);
    table.register(Syscall::AckIrq, sys_ack_irq);
    table.register(Syscall::UpdatePd, sys_update_pd);
    table.register(Syscall::StartThread, sys_start_thread);
    table.register(Syscall::PauseThread, sys_pause_thread);
    table.register(Syscall::ResumeThread, sys_resume_thread);
    table.register(Syscall::YieldThread, sys_yield_thread);
    table.register(Syscall::SetAffinity, sys_set_affinity);
    table.register(Syscall::SetPager, sys_set_pager);
    table.register(Syscall::ReadRegister, sys_read_register);
    table.register(Syscall::WriteRegister, sys_write_register);
    table.register(Syscall::RunVcpu, sys_run_vcpu);
    table.register(Syscall::PauseVcpu, sys_pause_vcpu);
}

fn sys_create_object(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = CreateArgsTyped::decode(args)?;
    typed.check(ctx)?;
    let id = ctx.state.create_object(ctx.platform, ctx.caller_pd, typed.pd, typed.args, ctx.cpu)?;
    log_debug!(target: "syscall", "{} created {:?} {} in {}", ctx.caller, typed.args.kind(), id, typed.pd);
    Ok(Completion::Done(id.as_word()))
}

fn sys_destroy_object(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = CapArgsTyped::decode(args)?;
    ctx.state.destroy(ctx.platform, ctx.caller_pd, typed.cap, ctx.cpu)?;
    Ok(Completion::Done(0))
}

fn sys_call(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = CapArgsTyped::decode(args)?;
    ctx.state.ipc_call(ctx.caller, typed.cap, ctx.cpu)
}

fn sys_wait_for_request(ctx: &mut Context<'_>, _args: &Args) -> SysResult<Completion> {
    ctx.state.ipc_wait(ctx.caller, ctx.cpu)
}

fn sys_reply(ctx: &mut Context<'_>, _args: &Args) -> SysResult<Completion> {
    match ctx.state.ipc_reply(ctx.platform, ctx.caller, ctx.cpu) {
        Outcome::Delivered => Ok(Completion::Done(0)),
        Outcome::Cancelled => Err(Error::Cancelled),
        Outcome::Invalid => Err(Error::BadState),
    }
}

fn sys_reply_and_wait(ctx: &mut Context<'_>, _args: &Args) -> SysResult<Completion> {
    ctx.state.ipc_reply_and_wait(ctx.platform, ctx.caller, ctx.cpu)
}

fn sys_submit_signal(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = SubmitArgsTyped::decode(args)?;
    if typed.check(ctx) {
        ctx.state.signal_submit(typed.context, typed.count, ctx.cpu);
    }
    Ok(Completion::Done(0))
}

fn sys_wait_for_signal(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = CapArgsTyped::decode(args)?;
    let receiver = typed.check(ctx, ObjectKind::SignalReceiver)?;
    ctx.state.signal_wait(ctx.caller, receiver)
}

fn sys_ack_irq(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = CapArgsTyped::decode(args)?;
    let object = typed.check(ctx, ObjectKind::Interrupt)?;
    ctx.state.irq_ack(ctx.platform, object)?;
    Ok(Completion::Done(0))
}

fn sys_update_pd(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = CapArgsTyped::decode(args)?;
    let pd = typed.check(ctx, ObjectKind::Pd)?;
    ctx.state.update_pd(ctx.platform, ctx.caller, pd, ctx.cpu)
}

fn sys_start_thread(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = StartArgsTyped::decode(args)?;
    typed.check(ctx)?;
    ctx.state.thread_start(typed.thread, typed.ip, typed.sp, ctx.cpu)?;
    Ok(Completion::Done(0))
}

fn sys_pause_thread(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = CapArgsTyped::decode(args)?;
    let thread = typed.check(ctx, ObjectKind::Thread)?;
    ctx.state.thread_pause(thread, ctx.cpu)?;
    Ok(Completion::Done(0))
}

fn sys_resume_thread(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = CapArgsTyped::decode(args)?;
    let thread = typed.check(ctx, ObjectKind::Thread)?;
    ctx.state.thread_resume(thread, ctx.cpu)?;
    Ok(Completion::Done(0))
}

fn sys_yield_thread(ctx: &mut Context<'_>, _args: &Args) -> SysResult<Completion> {
    ctx.state.thread_yield(ctx.cpu);
    Ok(Completion::Done(0))
}

fn sys_set_affinity(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = AffinityArgsTyped::decode(args)?;
    typed.check(ctx)?;
    ctx.state.thread_set_affinity(typed.thread, typed.cpu, ctx.cpu)?;
    Ok(Completion::Done(0))
}

fn sys_set_pager(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = PagerArgsTyped::decode(args)?;
    typed.check(ctx)?;
    ctx.state.thread_set_pager(typed.thread, typed.pager)?;
    Ok(Completion::Done(0))
}

fn sys_read_register(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = RegisterArgsTyped::decode(args)?;
    typed.check(ctx)?;
    Ok(Completion::Done(ctx.state.thread_read_register(typed.thread, typed.index)?))
}

fn sys_write_register(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = RegisterArgsTyped::decode(args)?;
    typed.check(ctx)?;
    ctx.state.thread_write_register(typed.thread, typed.index, typed.value)?;
    Ok(Completion::Done(0))
}

fn sys_run_vcpu(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = CapArgsTyped::decode(args)?;
    let vcpu = typed.check(ctx, ObjectKind::Vcpu)?;
    ctx.state.vcpu_run(vcpu, ctx.cpu)?;
    Ok(Completion::Done(0))
}

fn sys_pause_vcpu(ctx: &mut Context<'_>, args: &Args) -> SysResult<Completion> {
    let typed = CapArgsTyped::decode(args)?;
    let vcpu = typed.check(ctx, ObjectKind::Vcpu)?;
    ctx.state.vcpu_pause(vcpu)?;
    Ok(Completion::Done(0))
}
