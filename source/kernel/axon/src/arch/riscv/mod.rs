// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: RISC-V `virt` board backend for the hal traits (PLIC, SBI timer and IPI, sfence.vma)
//! OWNERS: @kernel-arch-team
//! PUBLIC API: VirtBoard<M>, VirtPlic, SbiTimer, SbiIpi, flush_asid()
//! DEPENDS_ON: riscv (CSR access, sfence.vma), sbi-rt (timer and IPI calls)
//! INVARIANTS: Only built for riscv64 bare metal; `schedule_tick` and `flush_tlb` act on the
//!             calling hart, which is always the `cpu` argument on this board
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! Translation tables stay board specific: `VirtBoard` is generic over the Sv39 table
//! backend so the kernel core never sees page-table memory.

use core::ptr::{read_volatile, write_volatile};

use sbi_rt as sbi;

use crate::hal::{AddressSpaceBackend, InterruptController, IpiSender, Platform, Timer};
use crate::mm::TableHandle;
use crate::types::CpuId;

const PLIC_BASE: usize = 0x0c00_0000;
const PLIC_ENABLE: usize = 0x2000;
const PLIC_ENABLE_STRIDE: usize = 0x80;
const PLIC_CONTEXT: usize = 0x20_0000;
const PLIC_CONTEXT_STRIDE: usize = 0x1000;
const PLIC_CLAIM: usize = 4;

/// QEMU models a 10 MHz clock.
const TICK_NS: u64 = 100;
/// Supervisor timer interrupt cause, reported as a pseudo line.
pub const TIMER_IRQ: u32 = 5;

/// Invalidates cached translations tagged with `asid` on the calling hart.
#[inline]
pub fn flush_asid(asid: u16) {
    // SAFETY: sfence.vma only drops cached translations; it has no memory operands.
    unsafe { riscv::asm::sfence_vma(usize::from(asid), 0) }
}

/// Platform-level interrupt controller, S-mode context of hart 0.
pub struct VirtPlic;

impl VirtPlic {
    fn enable_word(irq: u32) -> *mut u32 {
        let context = 1;
        (PLIC_BASE + PLIC_ENABLE + context * PLIC_ENABLE_STRIDE + (irq as usize / 32) * 4) as *mut u32
    }

    fn set_enabled(&self, irq: u32, enabled: bool) {
        let word = Self::enable_word(irq);
        let bit = 1u32 << (irq % 32);
        // SAFETY: the PLIC enable window is identity mapped for the kernel on `virt`.
        unsafe {
            let value = read_volatile(word);
            write_volatile(word, if enabled { value | bit } else { value & !bit });
        }
    }
}

impl InterruptController for VirtPlic {
    fn mask(&self, irq: u32) {
        if irq != TIMER_IRQ {
            self.set_enabled(irq, false);
        }
    }

    fn unmask(&self, irq: u32) {
        if irq != TIMER_IRQ {
            self.set_enabled(irq, true);
        }
    }

    fn ack(&self, irq: u32) {
        if irq == TIMER_IRQ {
            return;
        }
        let complete = (PLIC_BASE + PLIC_CONTEXT + PLIC_CONTEXT_STRIDE + PLIC_CLAIM) as *mut u32;
        // SAFETY: writing the claimed id to the complete register is the PLIC EOI protocol.
        unsafe { write_volatile(complete, irq) }
    }
}

/// Timer backed by the `time` CSR and the SBI timer extension.
pub struct SbiTimer;

impl Timer for SbiTimer {
    fn now(&self) -> u64 {
        riscv::register::time::read() as u64 * TICK_NS
    }

    fn schedule_tick(&self, _cpu: CpuId, deadline_ns: u64) {
        let ret = sbi::set_timer(deadline_ns / TICK_NS);
        if ret.error != 0 {
            log_error!(target: "kernel", "sbi set_timer failed: {}", ret.error);
        }
    }

    fn irq(&self) -> u32 {
        TIMER_IRQ
    }
}

/// Supervisor software interrupts through SBI.
pub struct SbiIpi;

impl IpiSender for SbiIpi {
    fn send_ipi(&self, target: CpuId) {
        let ret = sbi::send_ipi(target.mask(), 0);
        if ret.error != 0 {
            log_warn!(target: "smp", "sbi send_ipi to {} failed: {}", target, ret.error);
        }
    }
}

/// The QEMU `virt` board with a board-provided Sv39 table backend.
pub struct VirtBoard<M> {
    pic: VirtPlic,
    timer: SbiTimer,
    ipi: SbiIpi,
    mmu: M,
}

impl<M: AddressSpaceBackend> VirtBoard<M> {
    pub const fn new(mmu: M) -> Self {
        Self { pic: VirtPlic, timer: SbiTimer, ipi: SbiIpi, mmu }
    }

    /// Flushes `table` locally; convenience for backends that only track ASIDs.
    pub fn flush_table(table: TableHandle) {
        flush_asid(table.asid.as_raw());
    }
}

impl<M: AddressSpaceBackend> Platform for VirtBoard<M> {
    fn pic(&self) -> &dyn InterruptController {
        &self.pic
    }

    fn timer(&self) -> &dyn Timer {
        &self.timer
    }

    fn mmu(&self) -> &dyn AddressSpaceBackend {
        &self.mmu
    }

    fn ipi(&self) -> &dyn IpiSender {
        &self.ipi
    }
}
