// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time kernel configuration
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig, ObjectSizes, RootQuota
//! DEPENDS_ON: determinism (defaults), smp::MAX_CPUS, pd::Quota
//! INVARIANTS: 1 <= cores <= MAX_CPUS; quantum > 0; super-period is a whole number of quanta
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use axon_abi::ObjectKind;

use crate::determinism;
use crate::pd::Quota;
use crate::smp::MAX_CPUS;

/// RAM charged to a Pd for each kernel object variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectSizes {
    pub thread: usize,
    pub pd: usize,
    pub signal_context: usize,
    pub signal_receiver: usize,
    pub interrupt: usize,
    pub vcpu: usize,
}

impl ObjectSizes {
    pub const fn of(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::Thread => self.thread,
            ObjectKind::Pd => self.pd,
            ObjectKind::SignalContext => self.signal_context,
            ObjectKind::SignalReceiver => self.signal_receiver,
            ObjectKind::Interrupt => self.interrupt,
            ObjectKind::Vcpu => self.vcpu,
        }
    }
}

impl Default for ObjectSizes {
    fn default() -> Self {
        Self {
            thread: 1024,
            pd: 4096,
            signal_context: 64,
            signal_receiver: 64,
            interrupt: 64,
            vcpu: 4096,
        }
    }
}

/// Kernel configuration consumed once by [`crate::kernel::Kernel::boot`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    pub cores: usize,
    pub quantum_ns: u64,
    pub super_period_ns: u64,
    pub root_quota: Quota,
    pub object_sizes: ObjectSizes,
    /// Upper bound of the capability id space.
    pub max_ids: u32,
    /// Priority of the root thread.
    pub root_priority: u8,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let quantum_ns = determinism::fixed_tick_ns();
        Self {
            cores: 1,
            quantum_ns,
            super_period_ns: quantum_ns * determinism::super_period_quanta(),
            root_quota: Quota { objects: 256, ram: 16 * 1024 * 1024, cap_slots: 512 },
            object_sizes: ObjectSizes::default(),
            max_ids: 4096,
            root_priority: 0,
        }
    }
}

impl KernelConfig {
    /// Clamps the core count to `1..=MAX_CPUS`.
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores.clamp(1, MAX_CPUS);
        self
    }

    /// Sets the quantum; the super-period keeps its length in quanta.
    pub fn with_quantum_ns(mut self, quantum_ns: u64) -> Self {
        let quanta = self.super_period_quanta();
        self.quantum_ns = quantum_ns.max(1);
        self.super_period_ns = self.quantum_ns * quanta;
        self
    }

    pub fn with_super_period_quanta(mut self, quanta: u64) -> Self {
        self.super_period_ns = self.quantum_ns * quanta.max(1);
        self
    }

    pub fn with_root_quota(mut self, quota: Quota) -> Self {
        self.root_quota = quota;
        self
    }

    pub fn with_object_sizes(mut self, sizes: ObjectSizes) -> Self {
        self.object_sizes = sizes;
        self
    }

    pub fn with_max_ids(mut self, max_ids: u32) -> Self {
        self.max_ids = max_ids.max(2);
        self
    }

    pub fn with_root_priority(mut self, priority: u8) -> Self {
        self.root_priority = priority;
        self
    }

    pub fn super_period_quanta(&self) -> u64 {
        (self.super_period_ns / self.quantum_ns.max(1)).max(1)
    }
}
