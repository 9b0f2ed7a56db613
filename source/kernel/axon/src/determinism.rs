// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic timing knobs shared across the kernel
//! OWNERS: @kernel-team
//! PUBLIC API: fixed_tick_ns(), set_fixed_tick_ns(), super_period_quanta(), set_super_period_quanta()
//! DEPENDS_ON: core::sync::atomic
//! INVARIANTS: Relaxed atomics sufficient; defaults stable across boots; read once at boot
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! The kernel core runs both on the host (unit tests, the simulated platform)
//! and on hardware. For reproducibility the scheduler quantum and the length
//! of a super-period are fixed values that [`crate::config::KernelConfig`]
//! picks up as defaults.

use core::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_TICK_NS: u64 = 1_000_000; // 1 ms slice
const DEFAULT_SUPER_PERIOD_QUANTA: u64 = 100;

static FIXED_TICK_NS: AtomicU64 = AtomicU64::new(DEFAULT_TICK_NS);
static SUPER_PERIOD_QUANTA: AtomicU64 = AtomicU64::new(DEFAULT_SUPER_PERIOD_QUANTA);

/// Returns the fixed timer quantum used for deterministic scheduling.
#[inline]
pub fn fixed_tick_ns() -> u64 {
    FIXED_TICK_NS.load(Ordering::Relaxed)
}

/// Overrides the fixed timer quantum in nanoseconds. Zero is ignored.
#[inline]
pub fn set_fixed_tick_ns(value: u64) {
    if value != 0 {
        FIXED_TICK_NS.store(value, Ordering::Relaxed);
    }
}

/// Number of quanta that make up one super-period.
#[inline]
pub fn super_period_quanta() -> u64 {
    SUPER_PERIOD_QUANTA.load(Ordering::Relaxed)
}

/// Overrides the super-period length in quanta. Zero is ignored.
#[inline]
pub fn set_super_period_quanta(value: u64) {
    if value != 0 {
        SUPER_PERIOD_QUANTA.store(value, Ordering::Relaxed);
    }
}
