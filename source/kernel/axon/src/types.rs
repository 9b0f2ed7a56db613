// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by every kernel subsystem
//! OWNERS: @kernel-team
//! PUBLIC API: CapId, CpuId, Priority, Badge, Asid, VirtAddr
//! DEPENDS_ON: axon_abi (CAP_INVALID), smp::MAX_CPUS
//! INVARIANTS: CapId 0 is never a live object; CpuId < MAX_CPUS; Priority < Priority::LEVELS
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::fmt;

use crate::mm::PAGE_SIZE;
use crate::smp::MAX_CPUS;

/// Kernel-wide capability id naming exactly one live object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapId(u32);

impl CapId {
    /// The invalid sentinel.
    pub const INVALID: Self = Self(axon_abi::CAP_INVALID);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Decodes a register word; values wider than 32 bit map to [`Self::INVALID`].
    #[inline]
    pub fn from_word(word: usize) -> Self {
        u32::try_from(word).map_or(Self::INVALID, Self)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_word(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != axon_abi::CAP_INVALID
    }
}

impl fmt::Display for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap#{}", self.0)
    }
}

/// Logical core identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u16);

impl CpuId {
    pub const BOOT: Self = Self(0);

    /// Returns `None` for ids outside the supported core range.
    #[inline]
    pub const fn new(raw: u16) -> Option<Self> {
        if (raw as usize) < MAX_CPUS {
            Some(Self(raw))
        } else {
            None
        }
    }

    #[inline]
    pub const fn from_index(idx: usize) -> Option<Self> {
        if idx < MAX_CPUS {
            Some(Self(idx as u16))
        } else {
            None
        }
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    /// Bit of this core in an online / active mask.
    #[inline]
    pub const fn mask(self) -> usize {
        1usize << self.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Scheduling priority band; `0` is the lowest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Priority(u8);

impl Priority {
    /// Number of priority bands.
    pub const LEVELS: usize = 4;
    pub const LOWEST: Self = Self(0);
    pub const HIGHEST: Self = Self((Self::LEVELS - 1) as u8);

    #[inline]
    pub const fn new(raw: u8) -> Option<Self> {
        if (raw as usize) < Self::LEVELS {
            Some(Self(raw))
        } else {
            None
        }
    }

    #[inline]
    pub const fn band(self) -> usize {
        self.0 as usize
    }
}

/// Unforgeable sender identity attached to IPC messages by the kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Badge(u32);

impl Badge {
    /// A thread's badge is its capability id.
    #[inline]
    pub const fn of(thread: CapId) -> Self {
        Self(thread.as_raw())
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// Address-space identifier handed out by the translation backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Asid(u16);

impl Asid {
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }
}

/// User virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        if addr % PAGE_SIZE == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn page_base(self) -> usize {
        self.0 & !(PAGE_SIZE - 1)
    }
}
