// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Owner-tracked kernel lock with same-core re-entrancy detection
//! OWNERS: @kernel-sync-team
//! PUBLIC API: KernelLock::{new, try_acquire, lock, owner, parked}, KernelLockGuard
//! DEPENDS_ON: spin::Mutex, diag::fatal, riscv time CSR (debug_lock, OS)
//! INVARIANTS: Re-entry from the owning core is reported before any spin starts;
//!             unlock clears the owner and fences before the inner mutex is released
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{fence, AtomicUsize, Ordering};

#[cfg(feature = "debug_lock")]
use core::sync::atomic::AtomicU64;

use crate::types::CpuId;

const NO_OWNER: usize = usize::MAX;

/// Misuse of the kernel lock. Always a kernel bug.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockViolation {
    /// The core that holds the lock tried to take it again.
    Reentrant { cpu: CpuId },
}

#[cfg(feature = "debug_lock")]
#[inline(always)]
fn read_time() -> u64 {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        riscv::register::time::read() as u64
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

/// Spin lock recording which core holds it.
pub struct KernelLock<T> {
    inner: spin::Mutex<T>,
    owner: AtomicUsize,
    /// Bitmask of cores currently spinning for the lock.
    parked: AtomicUsize,
    #[cfg(feature = "debug_lock")]
    start_ticks: AtomicU64,
}

impl<T> KernelLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
            owner: AtomicUsize::new(NO_OWNER),
            parked: AtomicUsize::new(0),
            #[cfg(feature = "debug_lock")]
            start_ticks: AtomicU64::new(0),
        }
    }

    /// Core currently holding the lock.
    pub fn owner(&self) -> Option<CpuId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            idx => CpuId::from_index(idx),
        }
    }

    /// Cores currently waiting for the lock.
    pub fn parked(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }

    /// Acquires the lock for `cpu`, spinning while another core holds it.
    ///
    /// Only `cpu` itself ever stores its own id as owner, so observing it here
    /// means this core already holds the lock.
    pub fn try_acquire(&self, cpu: CpuId) -> Result<KernelLockGuard<'_, T>, LockViolation> {
        if self.owner.load(Ordering::Acquire) == cpu.as_index() {
            return Err(LockViolation::Reentrant { cpu });
        }
        let guard = match self.inner.try_lock() {
            Some(guard) => guard,
            None => {
                self.parked.fetch_or(cpu.mask(), Ordering::Relaxed);
                let guard = self.inner.lock();
                self.parked.fetch_and(!cpu.mask(), Ordering::Relaxed);
                guard
            }
        };
        self.owner.store(cpu.as_index(), Ordering::Release);
        #[cfg(feature = "debug_lock")]
        self.start_ticks.store(read_time(), Ordering::Relaxed);
        Ok(KernelLockGuard { parent: self, guard })
    }

    /// Acquires the lock; re-entry is fatal.
    pub fn lock(&self, cpu: CpuId) -> KernelLockGuard<'_, T> {
        match self.try_acquire(cpu) {
            Ok(guard) => guard,
            Err(LockViolation::Reentrant { cpu }) => {
                crate::fatal!(target: "lock", "LOCKDEP: re-entrant kernel lock on {}", cpu)
            }
        }
    }
}

/// Access to the locked state; dropping it releases the lock.
pub struct KernelLockGuard<'a, T> {
    parent: &'a KernelLock<T>,
    guard: spin::MutexGuard<'a, T>,
}

impl<T> KernelLockGuard<'_, T> {
    /// Core holding this guard.
    pub fn cpu(&self) -> Option<CpuId> {
        self.parent.owner()
    }
}

impl<T> Deref for KernelLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for KernelLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T> Drop for KernelLockGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(feature = "debug_lock")]
        {
            // ~1 ms on a 10 MHz time base
            const LONG_HOLD_TICKS: u64 = 10_000;
            let start = self.parent.start_ticks.load(Ordering::Relaxed);
            if read_time().wrapping_sub(start) > LONG_HOLD_TICKS {
                crate::log_warn!(target: "lock", "LOCKDEP: long hold");
            }
        }
        self.parent.owner.store(NO_OWNER, Ordering::Release);
        fence(Ordering::SeqCst);
        // inner guard drops after this, releasing spinning cores
    }
}
