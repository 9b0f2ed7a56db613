// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel object registry: capability ids, object lifetime, per-Pd holdings
//! OWNERS: @kernel-cap-team
//! PUBLIC API: Registry, Object, CapError
//! DEPENDS_ON: cap::id_alloc, pd::{Pd, Resource}, thread, signal, irq, vcpu
//! INVARIANTS: Every live id resolves to exactly one object; an id is only recycled once no
//!             Pd holds it and no kernel link pins it; charges move together with the
//!             registry mutation (all or nothing)
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! Reference count of an object = capability holdings (per Pd, counted) + kernel pins.
//! Holdings keep the object alive; pins (pager links, interrupt and vCPU bindings) only
//! keep the id reserved after the object died, so a stale link never reaches a successor.

pub mod id_alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use axon_abi::ObjectKind;

use crate::irq::Interrupt;
use crate::pd::{Pd, Resource};
use crate::signal::{SignalContext, SignalReceiver};
use crate::thread::Thread;
use crate::types::CapId;
use crate::vcpu::Vcpu;

pub use id_alloc::IdAllocator;

/// Errors produced by registry operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    /// The id is dead, never existed, or is not held by the caller.
    Invalid,
    WrongKind { expected: ObjectKind, found: ObjectKind },
    OutOfResources(Resource),
}

/// A live kernel object.
#[derive(Debug)]
pub enum Object {
    Thread(Box<Thread>),
    Pd(Box<Pd>),
    SignalContext(Box<SignalContext>),
    SignalReceiver(Box<SignalReceiver>),
    Interrupt(Box<Interrupt>),
    Vcpu(Box<Vcpu>),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Thread(_) => ObjectKind::Thread,
            Self::Pd(_) => ObjectKind::Pd,
            Self::SignalContext(_) => ObjectKind::SignalContext,
            Self::SignalReceiver(_) => ObjectKind::SignalReceiver,
            Self::Interrupt(_) => ObjectKind::Interrupt,
            Self::Vcpu(_) => ObjectKind::Vcpu,
        }
    }
}

#[derive(Debug)]
struct Entry {
    /// `None` once the object was torn down while pins remain.
    object: Option<Object>,
    owner: CapId,
    ram: usize,
    /// Holding Pd -> number of references it has.
    holders: BTreeMap<CapId, u32>,
    pins: u32,
}

impl Entry {
    fn holdings(&self) -> u32 {
        self.holders.values().sum()
    }
}

macro_rules! typed_access {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        pub fn $get(&self, id: CapId) -> Option<&$ty> {
            match self.get(id)? {
                Object::$variant(obj) => Some(&**obj),
                _ => None,
            }
        }

        pub fn $get_mut(&mut self, id: CapId) -> Option<&mut $ty> {
            match self.get_mut(id)? {
                Object::$variant(obj) => Some(&mut **obj),
                _ => None,
            }
        }
    };
}

/// Maps capability ids to kernel objects.
pub struct Registry {
    ids: IdAllocator,
    entries: BTreeMap<CapId, Entry>,
}

static_assertions::assert_impl_all!(Registry: Send);

impl Registry {
    pub fn new(max_ids: u32) -> Self {
        Self { ids: IdAllocator::new(max_ids), entries: BTreeMap::new() }
    }

    /// Installs the root Pd, which owns, holds and pays for itself.
    pub fn bootstrap(&mut self, ram: usize, make: impl FnOnce(CapId) -> Pd) -> Result<CapId, CapError> {
        let id = self.ids.alloc().ok_or(CapError::OutOfResources(Resource::Ids))?;
        let mut pd = make(id);
        if let Err(resource) = pd.charge(ram).and_then(|()| pd.hold(id)) {
            self.ids.free(id);
            return Err(CapError::OutOfResources(resource));
        }
        pd.owned.insert(id);
        let mut holders = BTreeMap::new();
        holders.insert(id, 1);
        let entry = Entry { object: Some(Object::Pd(Box::new(pd))), owner: id, ram, holders, pins: 0 };
        self.entries.insert(id, entry);
        log_debug!(target: "cap", "bootstrap root pd {}", id);
        Ok(id)
    }

    /// Creates an object charged to `owner` and held by `holder`.
    ///
    /// Every budget is checked before anything is mutated; on error nothing changed.
    pub fn create(
        &mut self,
        owner: CapId,
        holder: CapId,
        ram: usize,
        make: impl FnOnce(CapId) -> Object,
    ) -> Result<CapId, CapError> {
        self.pd(owner).ok_or(CapError::Invalid)?.can_charge(ram).map_err(CapError::OutOfResources)?;
        let holder_pd = self.pd(holder).ok_or(CapError::Invalid)?;
        if holder_pd.used.cap_slots >= holder_pd.quota.cap_slots {
            return Err(CapError::OutOfResources(Resource::CapSlots));
        }
        let id = self.ids.alloc().ok_or(CapError::OutOfResources(Resource::Ids))?;
        if let Err(err) = self.charge_new(owner, holder, id, ram) {
            self.ids.free(id);
            return Err(err);
        }
        let object = make(id);
        log_trace!(target: "cap", "create {:?} {} owner={} holder={}", object.kind(), id, owner, holder);
        let mut holders = BTreeMap::new();
        holders.insert(holder, 1);
        self.entries.insert(id, Entry { object: Some(object), owner, ram, holders, pins: 0 });
        Ok(id)
    }

    fn charge_new(&mut self, owner: CapId, holder: CapId, id: CapId, ram: usize) -> Result<(), CapError> {
        let owner_pd = self.pd_mut(owner).ok_or(CapError::Invalid)?;
        owner_pd.charge(ram).map_err(CapError::OutOfResources)?;
        owner_pd.owned.insert(id);
        let held = self.pd_mut(holder).map(|pd| pd.hold(id));
        match held {
            Some(Ok(_)) => Ok(()),
            failed => {
                if let Some(pd) = self.pd_mut(owner) {
                    pd.uncharge(ram);
                    pd.owned.remove(&id);
                }
                Err(match failed {
                    Some(Err(resource)) => CapError::OutOfResources(resource),
                    _ => CapError::Invalid,
                })
            }
        }
    }

    /// Live object behind `id`.
    pub fn get(&self, id: CapId) -> Option<&Object> {
        self.entries.get(&id)?.object.as_ref()
    }

    pub fn get_mut(&mut self, id: CapId) -> Option<&mut Object> {
        self.entries.get_mut(&id)?.object.as_mut()
    }

    pub fn kind_of(&self, id: CapId) -> Option<ObjectKind> {
        self.get(id).map(Object::kind)
    }

    #[inline]
    pub fn is_live(&self, id: CapId) -> bool {
        self.get(id).is_some()
    }

    typed_access!(thread, thread_mut, Thread, Thread);
    typed_access!(pd, pd_mut, Pd, Pd);
    typed_access!(signal_context, signal_context_mut, SignalContext, SignalContext);
    typed_access!(signal_receiver, signal_receiver_mut, SignalReceiver, SignalReceiver);
    typed_access!(interrupt, interrupt_mut, Interrupt, Interrupt);
    typed_access!(vcpu, vcpu_mut, Vcpu, Vcpu);

    /// Checks that `holder` may invoke `id` as an object of `kind`.
    pub fn resolve(&self, holder: CapId, id: CapId, kind: ObjectKind) -> Result<CapId, CapError> {
        let entry = self.entries.get(&id).ok_or(CapError::Invalid)?;
        let object = entry.object.as_ref().ok_or(CapError::Invalid)?;
        if !entry.holders.contains_key(&holder) {
            return Err(CapError::Invalid);
        }
        match object.kind() {
            found if found == kind => Ok(id),
            found => Err(CapError::WrongKind { expected: kind, found }),
        }
    }

    pub fn holds(&self, pd: CapId, id: CapId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|e| e.object.is_some() && e.holders.contains_key(&pd))
    }

    /// Holdings plus pins.
    pub fn refcount(&self, id: CapId) -> u32 {
        self.entries.get(&id).map_or(0, |e| e.holdings() + e.pins)
    }

    pub fn holdings(&self, id: CapId) -> u32 {
        self.entries.get(&id).map_or(0, Entry::holdings)
    }

    /// Adds one reference of `id` to `pd`, taking a capability slot on first holding.
    pub fn grant(&mut self, pd: CapId, id: CapId) -> Result<(), CapError> {
        if !self.is_live(id) {
            return Err(CapError::Invalid);
        }
        self.pd_mut(pd).ok_or(CapError::Invalid)?.hold(id).map_err(CapError::OutOfResources)?;
        if let Some(entry) = self.entries.get_mut(&id) {
            *entry.holders.entry(pd).or_default() += 1;
        }
        Ok(())
    }

    /// Drops one reference `pd` has on `id`. Returns the holdings left across all Pds.
    pub fn drop_holding(&mut self, pd: CapId, id: CapId) -> Result<u32, CapError> {
        let entry = self.entries.get_mut(&id).filter(|e| e.object.is_some()).ok_or(CapError::Invalid)?;
        let count = entry.holders.get_mut(&pd).ok_or(CapError::Invalid)?;
        *count -= 1;
        if *count == 0 {
            entry.holders.remove(&pd);
            let left = entry.holdings();
            if let Some(holder) = self.pd_mut(pd) {
                holder.release(id);
            }
            return Ok(left);
        }
        Ok(entry.holdings())
    }

    /// Removes every holding of `id` from every Pd.
    pub fn strip_holders(&mut self, id: CapId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let holders: Vec<CapId> = core::mem::take(&mut entry.holders).into_keys().collect();
        for holder in holders {
            if let Some(pd) = self.pd_mut(holder) {
                pd.release(id);
            }
        }
    }

    pub fn pin(&mut self, id: CapId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.pins += 1;
        }
    }

    pub fn unpin(&mut self, id: CapId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.pins = entry.pins.saturating_sub(1);
        self.collect(id);
    }

    /// Kills the object behind `id`: uncharges its owner and hands the payload back.
    ///
    /// Callers unlink the object from queues and wait lists first. The id stays
    /// reserved while pins remain.
    pub fn retire(&mut self, id: CapId) -> Option<Object> {
        let entry = self.entries.get_mut(&id)?;
        let object = entry.object.take()?;
        let (owner, ram) = (entry.owner, entry.ram);
        self.strip_holders(id);
        if let Some(pd) = self.pd_mut(owner) {
            pd.uncharge(ram);
            pd.owned.remove(&id);
        }
        self.collect(id);
        log_trace!(target: "cap", "retire {:?} {}", object.kind(), id);
        Some(object)
    }

    fn collect(&mut self, id: CapId) {
        let reclaimable = self
            .entries
            .get(&id)
            .is_some_and(|e| e.object.is_none() && e.pins == 0 && e.holders.is_empty());
        if reclaimable {
            self.entries.remove(&id);
            self.ids.free(id);
        }
    }

    /// Ids of live objects, ascending.
    pub fn live_ids(&self) -> impl Iterator<Item = CapId> + '_ {
        self.entries.iter().filter(|(_, e)| e.object.is_some()).map(|(id, _)| *id)
    }

    /// Ids still reserved, live or pinned.
    pub fn ids_in_use(&self) -> usize {
        self.ids.in_use()
    }

    pub fn check_invariants(&self) -> Result<(), &'static str> {
        if self.ids.in_use() != self.entries.len() {
            return Err("id allocator out of sync with registry");
        }
        for (id, entry) in &self.entries {
            if !self.ids.is_allocated(*id) {
                return Err("registry entry without allocated id");
            }
            let Some(object) = &entry.object else {
                if !entry.holders.is_empty() {
                    return Err("dead object is still held");
                }
                if entry.pins == 0 {
                    return Err("dead unpinned object kept its id");
                }
                continue;
            };
            let owner = self.pd(entry.owner).ok_or("owner is not a live pd")?;
            if !owner.owned.contains(id) {
                return Err("owner does not list its object");
            }
            for (holder, count) in &entry.holders {
                let pd = self.pd(*holder).ok_or("holder is not a live pd")?;
                if *count == 0 || !pd.held.contains(id) {
                    return Err("holding not recorded by pd");
                }
            }
            if let Object::Thread(thread) = object {
                let pd = self.pd(thread.pd).ok_or("thread outside a live pd")?;
                if !pd.threads.contains(id) {
                    return Err("pd does not list its thread");
                }
            }
        }
        for id in self.live_ids() {
            let Some(pd) = self.pd(id) else {
                continue;
            };
            if !pd.within_quota() {
                return Err("pd exceeds its quota");
            }
            if pd.used.objects as usize != pd.owned.len() {
                return Err("object charge does not match owned objects");
            }
            let ram: usize = pd.owned.iter().filter_map(|o| self.entries.get(o)).map(|e| e.ram).sum();
            if ram != pd.used.ram {
                return Err("ram charge does not match owned objects");
            }
            if pd.held.iter().any(|h| !self.holds(id, *h)) {
                return Err("pd holds a dead or foreign id");
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests_prop;
