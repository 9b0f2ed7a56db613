// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Collaborator interfaces the kernel core drives (interrupt controller, timer,
//!          translation backend, IPI, console)
//! OWNERS: @kernel-team
//! PUBLIC API: InterruptController, Timer, AddressSpaceBackend, IpiSender, Console, Platform
//! DEPENDS_ON: mm::{Mapping, MapError, TableHandle}, types::CpuId
//! INVARIANTS: Implemented once per board and selected at build time; the kernel never
//!             reaches past these traits into driver internals
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod sim;

use crate::mm::{MapError, Mapping, TableHandle};
use crate::types::CpuId;

/// Programmable interrupt controller.
pub trait InterruptController: Sync {
    /// Stops delivery of `irq`.
    fn mask(&self, irq: u32);
    /// Resumes delivery of `irq`.
    fn unmask(&self, irq: u32);
    /// Signals end-of-interrupt for `irq`.
    fn ack(&self, irq: u32);
}

/// Monotonic per-core timer.
pub trait Timer: Sync {
    /// Returns the current time in nanoseconds.
    fn now(&self) -> u64;
    /// Programs the next timer interrupt on `cpu` at `deadline_ns`.
    fn schedule_tick(&self, cpu: CpuId, deadline_ns: u64);
    /// Interrupt line the timer raises. Owned by the kernel.
    fn irq(&self) -> u32;
}

/// Architecture translation-table backend.
pub trait AddressSpaceBackend: Sync {
    /// Allocates an empty table with a fresh ASID.
    fn create_table(&self) -> Result<TableHandle, MapError>;
    /// Releases a table and every translation in it.
    fn destroy_table(&self, table: TableHandle);
    fn insert_mapping(&self, table: TableHandle, mapping: &Mapping) -> Result<(), MapError>;
    /// Invalidates cached translations of `table` on the calling core `cpu`.
    fn flush_tlb(&self, cpu: CpuId, table: TableHandle);
}

/// Inter-processor interrupt delivery.
pub trait IpiSender: Sync {
    fn send_ipi(&self, target: CpuId);
}

/// Byte sink for kernel diagnostics.
pub trait Console: Sync {
    fn write_str(&self, s: &str);
}

/// Bundle of collaborators for one board.
pub trait Platform: Sync {
    fn pic(&self) -> &dyn InterruptController;
    fn timer(&self) -> &dyn Timer;
    fn mmu(&self) -> &dyn AddressSpaceBackend;
    fn ipi(&self) -> &dyn IpiSender;
}
