// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-memory platform used by host tests and early bring-up
//! OWNERS: @kernel-team
//! PUBLIC API: SimPlatform, SimPic, SimTimer, SimMmu, SimIpi, CaptureConsole, SIM_TIMER_IRQ
//! DEPENDS_ON: hal traits, spin::Mutex
//! INVARIANTS: Every hardware side effect the kernel requests is observable through an accessor;
//!             time only moves when a test advances it
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};

#[cfg(feature = "failpoints")]
use core::sync::atomic::AtomicBool;

use axon_abi::MapAttrs;
use spin::Mutex;

use super::{AddressSpaceBackend, Console, InterruptController, IpiSender, Platform, Timer};
use crate::mm::{MapError, Mapping, TableHandle, PAGE_SIZE};
use crate::smp::MAX_CPUS;
use crate::types::{Asid, CpuId};

/// Line number the simulated timer raises (supervisor timer cause on RISC-V).
pub const SIM_TIMER_IRQ: u32 = 5;
const MAX_ASIDS: u16 = 256;

#[derive(Clone, Copy, Debug, Default)]
struct LineState {
    masked: bool,
    acks: u32,
}

/// Interrupt controller recording mask state and EOIs per line.
#[derive(Default)]
pub struct SimPic {
    lines: Mutex<BTreeMap<u32, LineState>>,
}

impl SimPic {
    pub fn is_masked(&self, irq: u32) -> bool {
        self.lines.lock().get(&irq).is_some_and(|l| l.masked)
    }

    pub fn ack_count(&self, irq: u32) -> u32 {
        self.lines.lock().get(&irq).map_or(0, |l| l.acks)
    }
}

impl InterruptController for SimPic {
    fn mask(&self, irq: u32) {
        self.lines.lock().entry(irq).or_default().masked = true;
    }

    fn unmask(&self, irq: u32) {
        self.lines.lock().entry(irq).or_default().masked = false;
    }

    fn ack(&self, irq: u32) {
        self.lines.lock().entry(irq).or_default().acks += 1;
    }
}

/// Manually advanced clock with one deadline register per core.
pub struct SimTimer {
    now: AtomicU64,
    deadlines: [AtomicU64; MAX_CPUS],
}

impl SimTimer {
    const NO_DEADLINE: u64 = u64::MAX;

    fn new() -> Self {
        const UNSET: AtomicU64 = AtomicU64::new(SimTimer::NO_DEADLINE);
        Self { now: AtomicU64::new(0), deadlines: [UNSET; MAX_CPUS] }
    }

    /// Moves time forward and returns the new time.
    pub fn advance(&self, ns: u64) -> u64 {
        self.now.fetch_add(ns, Ordering::SeqCst) + ns
    }

    pub fn deadline(&self, cpu: CpuId) -> Option<u64> {
        match self.deadlines[cpu.as_index()].load(Ordering::SeqCst) {
            Self::NO_DEADLINE => None,
            d => Some(d),
        }
    }
}

impl Timer for SimTimer {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn schedule_tick(&self, cpu: CpuId, deadline_ns: u64) {
        self.deadlines[cpu.as_index()].store(deadline_ns, Ordering::SeqCst);
    }

    fn irq(&self) -> u32 {
        SIM_TIMER_IRQ
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Pte {
    phys: usize,
    attrs: MapAttrs,
}

/// Page-granular translation tables plus a log of TLB flushes.
pub struct SimMmu {
    next_asid: AtomicU16,
    tables: Mutex<BTreeMap<u16, BTreeMap<usize, Pte>>>,
    flushes: Mutex<Vec<(CpuId, Asid)>>,
    #[cfg(feature = "failpoints")]
    deny_next_map: AtomicBool,
}

impl SimMmu {
    fn new() -> Self {
        Self {
            next_asid: AtomicU16::new(1),
            tables: Mutex::new(BTreeMap::new()),
            flushes: Mutex::new(Vec::new()),
            #[cfg(feature = "failpoints")]
            deny_next_map: AtomicBool::new(false),
        }
    }

    /// Walks `table` for `addr` the way the hardware would.
    pub fn translate(&self, table: TableHandle, addr: usize) -> Option<(usize, MapAttrs)> {
        let tables = self.tables.lock();
        let pte = tables.get(&table.asid.as_raw())?.get(&(addr & !(PAGE_SIZE - 1)))?;
        Some((pte.phys + (addr & (PAGE_SIZE - 1)), pte.attrs))
    }

    pub fn live_tables(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn flushes_on(&self, cpu: CpuId) -> usize {
        self.flushes.lock().iter().filter(|(c, _)| *c == cpu).count()
    }

    pub fn flushed(&self, cpu: CpuId, asid: Asid) -> bool {
        self.flushes.lock().iter().any(|&(c, a)| c == cpu && a == asid)
    }

    /// Forces the next `insert_mapping` to fail with [`MapError::NoMemory`].
    #[cfg(feature = "failpoints")]
    pub fn deny_next_map(&self) {
        self.deny_next_map.store(true, Ordering::SeqCst);
    }
}

impl AddressSpaceBackend for SimMmu {
    fn create_table(&self) -> Result<TableHandle, MapError> {
        let asid = self.next_asid.fetch_add(1, Ordering::SeqCst);
        if asid >= MAX_ASIDS {
            return Err(MapError::NoMemory);
        }
        self.tables.lock().insert(asid, BTreeMap::new());
        Ok(TableHandle { asid: Asid::from_raw(asid), root: usize::from(asid) * PAGE_SIZE })
    }

    fn destroy_table(&self, table: TableHandle) {
        self.tables.lock().remove(&table.asid.as_raw());
    }

    fn insert_mapping(&self, table: TableHandle, mapping: &Mapping) -> Result<(), MapError> {
        #[cfg(feature = "failpoints")]
        if self.deny_next_map.swap(false, Ordering::SeqCst) {
            return Err(MapError::NoMemory);
        }
        let mut tables = self.tables.lock();
        let ptes = tables.get_mut(&table.asid.as_raw()).ok_or(MapError::OutOfRange)?;
        for offset in (0..mapping.size).step_by(PAGE_SIZE) {
            let pte = Pte { phys: mapping.phys + offset, attrs: mapping.attrs };
            ptes.insert(mapping.virt.raw() + offset, pte);
        }
        Ok(())
    }

    fn flush_tlb(&self, cpu: CpuId, table: TableHandle) {
        self.flushes.lock().push((cpu, table.asid));
    }
}

/// IPI "wires": one pending counter per core.
pub struct SimIpi {
    pending: [AtomicUsize; MAX_CPUS],
}

impl SimIpi {
    fn new() -> Self {
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Self { pending: [ZERO; MAX_CPUS] }
    }

    /// Consumes the IPIs raised for `cpu`; returns how many were raised.
    pub fn take(&self, cpu: CpuId) -> usize {
        self.pending[cpu.as_index()].swap(0, Ordering::SeqCst)
    }

    pub fn pending(&self, cpu: CpuId) -> usize {
        self.pending[cpu.as_index()].load(Ordering::SeqCst)
    }
}

impl IpiSender for SimIpi {
    fn send_ipi(&self, target: CpuId) {
        self.pending[target.as_index()].fetch_add(1, Ordering::SeqCst);
    }
}

/// Simulated board.
pub struct SimPlatform {
    pub pic: SimPic,
    pub timer: SimTimer,
    pub mmu: SimMmu,
    pub ipi: SimIpi,
    cores: usize,
}

impl SimPlatform {
    pub fn new(cores: usize) -> Self {
        Self {
            pic: SimPic::default(),
            timer: SimTimer::new(),
            mmu: SimMmu::new(),
            ipi: SimIpi::new(),
            cores: cores.clamp(1, MAX_CPUS),
        }
    }

    pub fn cores(&self) -> usize {
        self.cores
    }
}

impl Platform for SimPlatform {
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

/// Console that keeps everything written to it, for asserting on diagnostics.
pub struct CaptureConsole {
    buf: Mutex<String>,
}

static CAPTURE: CaptureConsole = CaptureConsole { buf: Mutex::new(String::new()) };

impl CaptureConsole {
    /// Registers the process-wide capture console and returns it.
    pub fn install() -> &'static CaptureConsole {
        crate::console::register(&CAPTURE);
        &CAPTURE
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.buf.lock().contains(needle)
    }
}

impl Console for CaptureConsole {
    fn write_str(&self, s: &str) {
        self.buf.lock().push_str(s);
    }
}
