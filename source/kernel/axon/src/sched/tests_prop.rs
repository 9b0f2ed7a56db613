// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the band scheduler
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Round-robin fairness within one band
//!   - Queue linkage invariants under arbitrary operation sequences
//!   - Priority dominance: a lower band never runs while a higher band is eligible
//!
//! TEST_SCENARIOS:
//!   - every_job_runs_within_k_quanta(): K equal-priority jobs each appear in every window of K quanta
//!   - linkage_survives_random_ops(): random ready/unready/yield/charge/schedule keeps invariants
//!   - higher_band_dominates(): selected job always belongs to the highest eligible band

use alloc::vec::Vec;

use super::{SchedParams, Scheduler, Selection};
use crate::types::{CapId, CpuId, Priority};
use proptest::prelude::*;

const Q: u64 = 1_000;

fn cpu(idx: usize) -> CpuId {
    CpuId::from_index(idx).expect("cpu")
}

fn params(prio: u8) -> SchedParams {
    SchedParams { priority: Priority::new(prio).expect("prio"), quota_ns: 0, affinity: None }
}

#[derive(Debug, Clone)]
enum Op {
    Ready(u32, usize),
    Unready(u32),
    Yield(usize),
    Charge(usize, u64),
    Schedule(usize),
    Affinity(u32, Option<usize>),
}

fn arb_op(jobs: u32) -> impl Strategy<Value = Op> {
    prop_oneof![
        (1..=jobs, 0usize..2).prop_map(|(j, c)| Op::Ready(j, c)),
        (1..=jobs).prop_map(Op::Unready),
        (0usize..2).prop_map(Op::Yield),
        (0usize..2, 1u64..3 * Q).prop_map(|(c, ns)| Op::Charge(c, ns)),
        (0usize..2).prop_map(Op::Schedule),
        (1..=jobs, proptest::option::of(0usize..2)).prop_map(|(j, c)| Op::Affinity(j, c)),
    ]
}

proptest! {
    #[test]
    fn every_job_runs_within_k_quanta(k in 1u32..8, rounds in 2usize..6) {
        let mut s = Scheduler::new(1, Q, 1_000 * Q);
        for raw in 1..=k {
            s.admit(CapId::from_raw(raw), params(1), cpu(0));
            let _ = s.ready(CapId::from_raw(raw), cpu(0));
        }
        let mut trace = Vec::new();
        for _ in 0..(k as usize * rounds) {
            trace.push(s.schedule(cpu(0)));
            s.charge(cpu(0), Q);
        }
        for window in trace.windows(k as usize) {
            for raw in 1..=k {
                prop_assert!(window.contains(&Selection::Job(CapId::from_raw(raw))));
            }
        }
    }

    #[test]
    fn linkage_survives_random_ops(
        prios in proptest::collection::vec(0u8..4, 1..6),
        ops in proptest::collection::vec(arb_op(5), 1..200),
    ) {
        let mut s = Scheduler::new(2, Q, 20 * Q);
        for (i, prio) in prios.iter().enumerate() {
            s.admit(CapId::from_raw(i as u32 + 1), params(*prio), cpu(0));
        }
        for op in ops {
            match op {
                Op::Ready(j, c) => { let _ = s.ready(CapId::from_raw(j), cpu(c)); }
                Op::Unready(j) => s.unready(CapId::from_raw(j)),
                Op::Yield(c) => s.yield_current(cpu(c)),
                Op::Charge(c, ns) => s.charge(cpu(c), ns),
                Op::Schedule(c) => { let _ = s.schedule(cpu(c)); }
                Op::Affinity(j, c) => { let _ = s.set_affinity(CapId::from_raw(j), c.map(cpu)); }
            }
            prop_assert_eq!(s.check_invariants(), Ok(()));
        }
    }

    #[test]
    fn higher_band_dominates(prios in proptest::collection::vec(0u8..4, 1..8)) {
        let mut s = Scheduler::new(1, Q, 1_000 * Q);
        for (i, prio) in prios.iter().enumerate() {
            let id = CapId::from_raw(i as u32 + 1);
            s.admit(id, params(*prio), cpu(0));
            let _ = s.ready(id, cpu(0));
        }
        let top = prios.iter().copied().max().unwrap_or(0);
        for _ in 0..prios.len() * 2 {
            match s.schedule(cpu(0)) {
                Selection::Job(id) => {
                    let prio = prios[id.as_raw() as usize - 1];
                    prop_assert_eq!(prio, top);
                }
                Selection::Idle => prop_assert!(false, "idle with eligible jobs"),
            }
            s.charge(cpu(0), Q);
        }
    }
}
