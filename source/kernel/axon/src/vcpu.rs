// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual-CPU objects: run/pause state and VM-exit notification
//! OWNERS: @kernel-team
//! PUBLIC API: Vcpu, VcpuState
//! DEPENDS_ON: signal (exit context)
//! INVARIANTS: A VM exit pauses the vCPU and submits exactly once to its exit context
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use crate::state::KernelState;
use crate::syscall::{Error, SysResult};
use crate::types::{CapId, CpuId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Paused,
    Running,
}

#[derive(Debug)]
pub struct Vcpu {
    pub exit_context: CapId,
    pub state: VcpuState,
    /// Core the vCPU was last started on.
    pub cpu: Option<CpuId>,
    pub last_exit: Option<u32>,
    pub exits: u64,
}

impl Vcpu {
    pub fn new(exit_context: CapId) -> Self {
        Self { exit_context, state: VcpuState::Paused, cpu: None, last_exit: None, exits: 0 }
    }
}

impl KernelState {
    pub(crate) fn vcpu_run(&mut self, vcpu: CapId, cpu: CpuId) -> SysResult<()> {
        let v = self.registry.vcpu_mut(vcpu).ok_or(Error::InvalidCapability)?;
        v.state = VcpuState::Running;
        v.cpu = Some(cpu);
        Ok(())
    }

    pub(crate) fn vcpu_pause(&mut self, vcpu: CapId) -> SysResult<()> {
        let v = self.registry.vcpu_mut(vcpu).ok_or(Error::InvalidCapability)?;
        v.state = VcpuState::Paused;
        Ok(())
    }

    /// VM exit reported by the platform.
    pub(crate) fn vcpu_exit(&mut self, vcpu: CapId, reason: u32, cpu: CpuId) {
        let Some(v) = self.registry.vcpu_mut(vcpu) else {
            log_warn!(target: "kernel", "exit of unknown vcpu {}", vcpu);
            return;
        };
        if v.state != VcpuState::Running {
            return;
        }
        v.state = VcpuState::Paused;
        v.last_exit = Some(reason);
        v.exits += 1;
        let context = v.exit_context;
        log_trace!(target: "kernel", "{} exit reason={:#x}", vcpu, reason);
        self.signal_submit(context, 1, cpu);
    }

    pub(crate) fn teardown_vcpu(&mut self, vcpu: CapId) {
        if let Some(context) = self.registry.vcpu(vcpu).map(|v| v.exit_context) {
            self.registry.unpin(context);
        }
    }
}
