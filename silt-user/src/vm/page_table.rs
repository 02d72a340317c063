//! Page table.
//!
//! Maps user virtual pages to frames. The hardware walks a radix tree;
//! this model keeps the same observable contract in a map: presence,
//! writability, and the accessed/dirty bits that the paging hardware
//! would set on loads and stores. The memory-mapped-file machinery
//! depends on those bits to decide what needs writing back.

use silt::addressing::Va;
use silt::mm::Page;
use std::collections::BTreeMap;

bitflags::bitflags! {
    /// Flags of a present page-table entry.
    pub struct PteFlags: u32 {
        /// Stores are permitted.
        const WRITABLE = 1 << 1;
        /// The page has been read or written since the bit was cleared.
        const ACCESSED = 1 << 5;
        /// The page has been written since the bit was cleared.
        const DIRTY = 1 << 6;
    }
}

/// A present page-table entry: the backing frame plus its flags.
pub struct Pte {
    pub page: Page,
    pub flags: PteFlags,
}

/// Per-process virtual-to-physical mapping.
pub struct PageTable {
    entries: BTreeMap<usize, Pte>,
}

impl PageTable {
    /// Creates an empty page table.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Installs a mapping for the page containing `va`.
    ///
    /// Remapping a present page is a bug in the caller.
    pub fn map(&mut self, va: Va, page: Page, writable: bool) {
        let flags = if writable {
            PteFlags::WRITABLE
        } else {
            PteFlags::empty()
        };
        let prev = self
            .entries
            .insert(va.page_base().into_usize(), Pte { page, flags });
        assert!(prev.is_none(), "page mapped twice");
    }

    /// Removes the mapping for the page containing `va`, returning its
    /// frame.
    pub fn unmap(&mut self, va: Va) -> Option<Page> {
        self.entries
            .remove(&va.page_base().into_usize())
            .map(|pte| pte.page)
    }

    /// The entry for the page containing `va`, if present.
    pub fn get(&self, va: Va) -> Option<&Pte> {
        self.entries.get(&va.page_base().into_usize())
    }

    /// Whether the page containing `va` has been written.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.get(va)
            .map(|pte| pte.flags.contains(PteFlags::DIRTY))
            .unwrap_or(false)
    }

    /// Records a hardware-visible access to the page containing `va`.
    pub fn mark_access(&mut self, va: Va, write: bool) {
        if let Some(pte) = self.entries.get_mut(&va.page_base().into_usize()) {
            pte.flags.insert(PteFlags::ACCESSED);
            if write {
                pte.flags.insert(PteFlags::DIRTY);
            }
        }
    }

    /// Iterates over the present mappings.
    pub fn iter(&self) -> impl Iterator<Item = (Va, &Pte)> {
        self.entries
            .iter()
            .map(|(&base, pte)| (Va::new(base).unwrap(), pte))
    }

    /// Number of present mappings.
    pub fn present_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
