// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Protection domains: resource quotas, held capabilities, address space
//! OWNERS: @kernel-team
//! PUBLIC API: Pd, Quota, Usage, Resource
//! DEPENDS_ON: mm::AddressSpace, types::CapId
//! INVARIANTS: usage <= quota for objects, RAM and capability slots at all times;
//!             a charge either applies completely or not at all
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::collections::BTreeSet;

use crate::mm::AddressSpace;
use crate::types::{CapId, CpuId};

/// Budget kinds a Pd can run out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Objects,
    Ram,
    CapSlots,
    /// The kernel-wide id space, not a per-Pd budget.
    Ids,
    /// Translation tables or ASIDs of the platform backend.
    AddressSpaces,
}

/// Limits of one Pd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub objects: u32,
    pub ram: usize,
    pub cap_slots: u32,
}

/// Consumption of one Pd.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub objects: u32,
    pub ram: usize,
    pub cap_slots: u32,
}

#[derive(Debug)]
pub struct Pd {
    pub quota: Quota,
    pub used: Usage,
    /// Capabilities this Pd may invoke.
    pub held: BTreeSet<CapId>,
    /// Objects charged to this Pd.
    pub owned: BTreeSet<CapId>,
    /// Threads executing in this Pd (subset of `owned`).
    pub threads: BTreeSet<CapId>,
    pub space: AddressSpace,
    /// Cores that may cache translations of `space`.
    pub active_cpus: usize,
    /// Set after an unresolvable fault parked all threads.
    pub halted: bool,
}

impl Pd {
    pub fn new(quota: Quota, space: AddressSpace) -> Self {
        Self {
            quota,
            used: Usage::default(),
            held: BTreeSet::new(),
            owned: BTreeSet::new(),
            threads: BTreeSet::new(),
            space,
            active_cpus: 0,
            halted: false,
        }
    }

    /// Checks that one more object of `ram` bytes fits.
    pub fn can_charge(&self, ram: usize) -> Result<(), Resource> {
        if self.used.objects >= self.quota.objects {
            return Err(Resource::Objects);
        }
        match self.used.ram.checked_add(ram) {
            Some(total) if total <= self.quota.ram => Ok(()),
            _ => Err(Resource::Ram),
        }
    }

    pub fn charge(&mut self, ram: usize) -> Result<(), Resource> {
        self.can_charge(ram)?;
        self.used.objects += 1;
        self.used.ram += ram;
        Ok(())
    }

    pub fn uncharge(&mut self, ram: usize) {
        self.used.objects = self.used.objects.saturating_sub(1);
        self.used.ram = self.used.ram.saturating_sub(ram);
    }

    /// Checks that `id` can be held, taking a new slot if it is not held yet.
    pub fn can_hold(&self, id: CapId) -> Result<(), Resource> {
        if self.held.contains(&id) || self.used.cap_slots < self.quota.cap_slots {
            Ok(())
        } else {
            Err(Resource::CapSlots)
        }
    }

    /// Records a holding. Returns true if it took a new slot.
    pub fn hold(&mut self, id: CapId) -> Result<bool, Resource> {
        self.can_hold(id)?;
        if self.held.insert(id) {
            self.used.cap_slots += 1;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn release(&mut self, id: CapId) -> bool {
        if self.held.remove(&id) {
            self.used.cap_slots = self.used.cap_slots.saturating_sub(1);
            return true;
        }
        false
    }

    pub fn note_active(&mut self, cpu: CpuId) {
        self.active_cpus |= cpu.mask();
    }

    /// Called once `cpu` has flushed this Pd's translations.
    pub fn note_inactive(&mut self, cpu: CpuId) {
        self.active_cpus &= !cpu.mask();
    }

    pub fn within_quota(&self) -> bool {
        self.used.objects <= self.quota.objects
            && self.used.ram <= self.quota.ram
            && self.used.cap_slots <= self.quota.cap_slots
            && self.used.cap_slots as usize == self.held.len()
    }
}
