// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel synchronization primitives
//! OWNERS: @kernel-sync-team
//! PUBLIC API: KernelLock, KernelLockGuard, LockViolation
//! DEPENDS_ON: spin, diag
//! INVARIANTS: Exactly one core owns the kernel lock at a time; the owner id is published
//!             before the critical section and cleared before release
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

mod kernel_lock;

pub use kernel_lock::{KernelLock, KernelLockGuard, LockViolation};
