// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-level interrupt objects bound to signal contexts
//! OWNERS: @kernel-team
//! PUBLIC API: Interrupt
//! DEPENDS_ON: hal::InterruptController, signal
//! INVARIANTS: One interrupt object per line; the kernel timer line is never handed out; a
//!             line stays masked from delivery until the owner acknowledges it
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use crate::hal::Platform;
use crate::state::KernelState;
use crate::syscall::{Error, SysResult};
use crate::types::{CapId, CpuId};

#[derive(Debug)]
pub struct Interrupt {
    pub irq: u32,
    pub context: CapId,
    pub occurrences: u64,
}

impl KernelState {
    /// Validates that `irq` may be handed to user level.
    pub(crate) fn claim_irq(&self, irq: u32) -> SysResult<()> {
        if irq == self.timer_irq {
            return Err(Error::Denied);
        }
        if self.irq_owners.contains_key(&irq) {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Records the owner of a freshly created interrupt object and masks its line.
    pub(crate) fn bind_irq(&mut self, platform: &dyn Platform, object: CapId, irq: u32, context: CapId) {
        platform.pic().mask(irq);
        self.irq_owners.insert(irq, object);
        self.registry.pin(context);
        log_debug!(target: "irq", "irq {} -> {} via {}", irq, object, context);
    }

    /// Hardware interrupt entry for a user-owned line.
    pub(crate) fn irq_raised(&mut self, platform: &dyn Platform, irq: u32, cpu: CpuId) {
        let pic = platform.pic();
        pic.mask(irq);
        pic.ack(irq);
        let Some(object) = self.irq_owners.get(&irq).copied() else {
            log_warn!(target: "irq", "spurious irq {} on {}", irq, cpu);
            return;
        };
        let Some(int) = self.registry.interrupt_mut(object) else {
            return;
        };
        int.occurrences += 1;
        let context = int.context;
        self.signal_submit(context, 1, cpu);
    }

    /// `ack_irq(cap)`: re-enables delivery of the line.
    pub(crate) fn irq_ack(&self, platform: &dyn Platform, object: CapId) -> SysResult<()> {
        let int = self.registry.interrupt(object).ok_or(Error::InvalidCapability)?;
        platform.pic().unmask(int.irq);
        Ok(())
    }

    pub(crate) fn teardown_irq(&mut self, platform: &dyn Platform, object: CapId) {
        let Some(int) = self.registry.interrupt(object) else {
            return;
        };
        let (irq, context) = (int.irq, int.context);
        platform.pic().mask(irq);
        self.irq_owners.remove(&irq);
        self.registry.unpin(context);
    }
}
