// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mapping descriptions and per-Pd address-space bookkeeping
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PAGE_SIZE, TableHandle, Mapping, MapError, AddressSpace
//! DEPENDS_ON: hal::AddressSpaceBackend, axon_abi::{MapAttrs, CachePolicy, MappingWords}
//! INVARIANTS: Mappings are page aligned and non-empty; W^X; installed ranges never overlap;
//!             the bookkeeping only records what the backend accepted
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::collections::BTreeMap;

use axon_abi::{CachePolicy, MapAttrs, MappingWords};

use crate::hal::AddressSpaceBackend;
use crate::types::{Asid, VirtAddr};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Opaque translation-table handle issued by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableHandle {
    pub asid: Asid,
    /// Backend-specific root (physical address of the root table on hardware).
    pub root: usize,
}

/// Error returned by mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Address or size is not page aligned.
    Unaligned,
    /// Range is empty or wraps the address space.
    OutOfRange,
    /// Mapping violates the W^X policy.
    PermissionDenied,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Attribute word does not describe a valid mapping.
    InvalidFlags,
    /// The backend ran out of table memory or ASIDs.
    NoMemory,
    /// Nothing is mapped at the given range.
    NotMapped,
}

/// A validated mapping request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub phys: usize,
    pub virt: VirtAddr,
    pub size: usize,
    pub attrs: MapAttrs,
    pub cache: CachePolicy,
}

impl Mapping {
    pub fn new(
        phys: usize,
        virt: usize,
        size: usize,
        attrs: MapAttrs,
        cache: CachePolicy,
    ) -> Result<Self, MapError> {
        if phys % PAGE_SIZE != 0 || virt % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if size == 0 || virt.checked_add(size).is_none() || phys.checked_add(size).is_none() {
            return Err(MapError::OutOfRange);
        }
        if attrs.contains(MapAttrs::WRITE | MapAttrs::EXEC) {
            return Err(MapError::PermissionDenied);
        }
        if !attrs.intersects(MapAttrs::READ | MapAttrs::WRITE | MapAttrs::EXEC) {
            return Err(MapError::InvalidFlags);
        }
        Ok(Self { phys, virt: VirtAddr::new(virt), size, attrs, cache })
    }

    /// Validates a pager-supplied mapping description.
    pub fn from_words(words: &MappingWords) -> Result<Self, MapError> {
        Self::new(words.phys, words.virt, words.size, words.attrs, words.cache)
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.virt.raw() + self.size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.virt.raw() && addr < self.end()
    }

    fn overlaps(&self, virt: usize, size: usize) -> bool {
        virt < self.end() && self.virt.raw() < virt + size
    }

    /// Physical address backing `addr`, if covered.
    pub fn translate(&self, addr: usize) -> Option<usize> {
        self.contains(addr).then(|| self.phys + (addr - self.virt.raw()))
    }

    /// Returns true if the mapping grants the access described by a fault record.
    pub fn permits(&self, write: bool, exec: bool) -> bool {
        if write {
            self.attrs.contains(MapAttrs::WRITE)
        } else if exec {
            self.attrs.contains(MapAttrs::EXEC)
        } else {
            self.attrs.intersects(MapAttrs::READ | MapAttrs::WRITE)
        }
    }
}

/// Kernel-side record of the translations installed for one Pd.
#[derive(Debug)]
pub struct AddressSpace {
    table: TableHandle,
    mappings: BTreeMap<usize, Mapping>,
}

impl AddressSpace {
    pub fn new(table: TableHandle) -> Self {
        Self { table, mappings: BTreeMap::new() }
    }

    #[inline]
    pub fn table(&self) -> TableHandle {
        self.table
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Finds the mapping covering `addr`.
    pub fn lookup(&self, addr: usize) -> Option<&Mapping> {
        self.mappings.range(..=addr).next_back().map(|(_, m)| m).filter(|m| m.contains(addr))
    }

    /// Installs `mapping` through the backend and records it.
    ///
    /// Re-installing an identical mapping succeeds without touching the backend
    /// (two threads of one Pd faulting on the same page resolve to the same reply).
    pub fn install(
        &mut self,
        backend: &dyn AddressSpaceBackend,
        mapping: Mapping,
    ) -> Result<(), MapError> {
        if let Some(existing) = self.mappings.get(&mapping.virt.raw()) {
            if *existing == mapping {
                return Ok(());
            }
        }
        if self.mappings.values().any(|m| m.overlaps(mapping.virt.raw(), mapping.size)) {
            return Err(MapError::Overlap);
        }
        backend.insert_mapping(self.table, &mapping)?;
        self.mappings.insert(mapping.virt.raw(), mapping);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimPlatform;
    use crate::hal::Platform;

    fn rw(virt: usize) -> Mapping {
        Mapping::new(0x8000_0000 + virt, virt, PAGE_SIZE, MapAttrs::READ | MapAttrs::WRITE, CachePolicy::Cached)
            .expect("valid mapping")
    }

    #[test]
    fn rejects_unaligned_and_wx() {
        assert_eq!(
            Mapping::new(0x1001, 0x2000, PAGE_SIZE, MapAttrs::READ, CachePolicy::Cached),
            Err(MapError::Unaligned)
        );
        assert_eq!(
            Mapping::new(0, 0x2000, PAGE_SIZE, MapAttrs::WRITE | MapAttrs::EXEC, CachePolicy::Cached),
            Err(MapError::PermissionDenied)
        );
        assert_eq!(
            Mapping::new(0, 0x2000, 0, MapAttrs::READ, CachePolicy::Cached),
            Err(MapError::OutOfRange)
        );
    }

    #[test]
    fn install_detects_overlap_and_is_idempotent() {
        let platform = SimPlatform::new(1);
        let table = platform.mmu().create_table().expect("table");
        let mut space = AddressSpace::new(table);
        space.install(platform.mmu(), rw(0x4000)).expect("install");
        space.install(platform.mmu(), rw(0x4000)).expect("identical install");
        let wider = Mapping::new(0x9000_0000, 0x3000, 2 * PAGE_SIZE, MapAttrs::READ, CachePolicy::Cached)
            .expect("valid");
        assert_eq!(space.install(platform.mmu(), wider), Err(MapError::Overlap));
        assert_eq!(space.lookup(0x4ff8).map(|m| m.translate(0x4ff8)), Some(Some(0x8000_4ff8)));
        assert!(space.lookup(0x5000).is_none());
    }
}
