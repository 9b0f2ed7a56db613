// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the object registry
//! OWNERS: @kernel-cap-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Valid ids equal live objects under arbitrary create/grant/drop sequences
//!   - Quota bound: charges never exceed the Pd quota, failed creates leave no trace
//!   - No premature reuse of an id while a pin survives
//!
//! TEST_SCENARIOS:
//!   - ids_track_live_objects(): random ops keep the id set equal to the live set
//!   - quota_is_never_exceeded(): create past the limit is OutOfResources and creates nothing
//!   - pinned_ids_are_never_handed_out(): pinned dead ids stay reserved

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use super::{CapError, Object, Registry};
use crate::mm::{AddressSpace, TableHandle};
use crate::pd::{Pd, Quota, Resource};
use crate::types::{Asid, CapId};
use proptest::prelude::*;

const OBJ_RAM: usize = 32;

fn space() -> AddressSpace {
    AddressSpace::new(TableHandle { asid: Asid::from_raw(1), root: 0 })
}

fn root(reg: &mut Registry, objects: u32, ram: usize) -> CapId {
    reg.bootstrap(0, |_| Pd::new(Quota { objects, ram, cap_slots: 64 }, space())).expect("root")
}

fn make_receiver(reg: &mut Registry, pd: CapId) -> Result<CapId, CapError> {
    reg.create(pd, pd, OBJ_RAM, |_| Object::SignalReceiver(Box::default()))
}

/// Tears `id` down once its last holding is gone.
fn destroy(reg: &mut Registry, pd: CapId, id: CapId) {
    if reg.drop_holding(pd, id) == Ok(0) {
        let _ = reg.retire(id);
    }
}

#[derive(Debug, Clone)]
enum Op {
    Create,
    Grant(usize),
    Drop(usize),
    Pin(usize),
    Unpin(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Create),
        1 => (0usize..16).prop_map(Op::Grant),
        2 => (0usize..16).prop_map(Op::Drop),
        1 => (0usize..16).prop_map(Op::Pin),
        1 => (0usize..16).prop_map(Op::Unpin),
    ]
}

proptest! {
    #[test]
    fn ids_track_live_objects(ops in proptest::collection::vec(arb_op(), 1..120)) {
        let mut reg = Registry::new(256);
        let pd = root(&mut reg, 64, 64 * OBJ_RAM);
        let mut created: Vec<CapId> = Vec::new();
        let mut pinned: Vec<CapId> = Vec::new();
        for op in ops {
            match op {
                Op::Create => {
                    if let Ok(id) = make_receiver(&mut reg, pd) {
                        created.push(id);
                    }
                }
                Op::Grant(i) => {
                    if let Some(id) = created.get(i % created.len().max(1)).copied() {
                        let _ = reg.grant(pd, id);
                    }
                }
                Op::Drop(i) => {
                    if let Some(id) = created.get(i % created.len().max(1)).copied() {
                        destroy(&mut reg, pd, id);
                    }
                }
                Op::Pin(i) => {
                    if let Some(id) = created.get(i % created.len().max(1)).copied() {
                        if reg.is_live(id) {
                            reg.pin(id);
                            pinned.push(id);
                        }
                    }
                }
                Op::Unpin(i) => {
                    if !pinned.is_empty() {
                        let id = pinned.swap_remove(i % pinned.len());
                        reg.unpin(id);
                    }
                }
            }
            created.retain(|id| reg.is_live(*id));
            prop_assert_eq!(reg.check_invariants(), Ok(()));
            let live: BTreeSet<CapId> = reg.live_ids().collect();
            let expected: BTreeSet<CapId> = created.iter().copied().chain(core::iter::once(pd)).collect();
            prop_assert_eq!(live, expected);
            prop_assert_eq!(reg.ids_in_use(), reg.live_ids().count() + {
                let dead: BTreeSet<CapId> = pinned.iter().copied().filter(|id| !reg.is_live(*id)).collect();
                dead.len()
            });
        }
    }

    #[test]
    fn quota_is_never_exceeded(limit in 1u32..12, attempts in 1usize..30) {
        let mut reg = Registry::new(256);
        let pd = root(&mut reg, limit + 1, usize::MAX);
        let mut ok = 0u32;
        for _ in 0..attempts {
            let before = reg.ids_in_use();
            match make_receiver(&mut reg, pd) {
                Ok(_) => ok += 1,
                Err(err) => {
                    prop_assert_eq!(err, CapError::OutOfResources(Resource::Objects));
                    prop_assert_eq!(reg.ids_in_use(), before);
                }
            }
            let used = reg.pd(pd).map(|p| p.used.objects).unwrap_or(0);
            prop_assert!(used <= limit + 1);
        }
        prop_assert_eq!(ok, limit.min(attempts as u32));
        prop_assert_eq!(reg.check_invariants(), Ok(()));
    }

    #[test]
    fn pinned_ids_are_never_handed_out(rounds in 1usize..20) {
        let mut reg = Registry::new(256);
        let pd = root(&mut reg, 64, usize::MAX);
        let mut reserved = BTreeSet::new();
        for _ in 0..rounds {
            let id = make_receiver(&mut reg, pd).expect("create");
            prop_assert!(!reserved.contains(&id));
            reg.pin(id);
            destroy(&mut reg, pd, id);
            reserved.insert(id);
        }
        prop_assert_eq!(reg.ids_in_use(), rounds + 1);
    }
}
