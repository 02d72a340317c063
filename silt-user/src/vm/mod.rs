//! Virtual-memory support: frames, page tables, and the supplemental
//! page table.
//!
//! The hardware page table only knows about pages that are present in a
//! frame. The kernel promises more than it materializes: a memory-mapped
//! file region, a demand-zeroed stack, or a page pushed out to swap all
//! exist only as metadata until the first touch. That metadata is the
//! supplemental page table: one [`PageInfo`] per promised page, naming
//! where its bytes come from when the fault finally arrives.

pub mod frame;
pub mod page_table;

pub use frame::{FrameAllocator, SwapDevice, DEFAULT_FRAMES};
pub use page_table::{PageTable, Pte, PteFlags};

use silt::addressing::Va;
use silt_fs::file::FileHandle;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identifies one `mmap` mapping within a process.
pub type MapId = usize;

/// Where an absent page's bytes come from.
pub enum Backing {
    /// Lazily loaded from a file.
    File {
        /// The mapping's own handle; closing the descriptor it came
        /// from does not invalidate it.
        file: Arc<FileHandle>,
        /// Byte offset of this page within the file.
        ofs: usize,
        /// Bytes actually backed by the file; the tail of the page is
        /// zero.
        read_bytes: usize,
        /// Whether stores to the page are permitted.
        writable: bool,
    },
    /// Demand-zeroed.
    Zero,
    /// Evicted to a swap slot.
    Swap {
        /// Slot index on the swap device.
        slot: usize,
    },
}

/// Supplemental metadata for one promised virtual page.
pub struct PageInfo {
    /// The mapping this page belongs to, for file-backed `mmap` pages.
    pub mapid: Option<MapId>,
    /// Whether the page currently sits in a frame.
    pub loaded: bool,
    /// Source of the page's bytes while it is not loaded.
    pub backing: Backing,
}

impl PageInfo {
    /// Whether stores to the page are permitted.
    pub fn writable(&self) -> bool {
        match &self.backing {
            Backing::File { writable, .. } => *writable,
            Backing::Zero | Backing::Swap { .. } => true,
        }
    }
}

/// Per-process supplemental page table, keyed by page base address.
pub struct SupplementalPageTable {
    entries: BTreeMap<usize, PageInfo>,
}

impl SupplementalPageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Promises the page containing `va`. Fails when the page is
    /// already promised.
    pub fn insert(&mut self, va: Va, info: PageInfo) -> Result<(), ()> {
        match self.entries.entry(va.page_base().into_usize()) {
            std::collections::btree_map::Entry::Occupied(_) => Err(()),
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(info);
                Ok(())
            }
        }
    }

    /// Withdraws the promise for the page containing `va`.
    pub fn remove(&mut self, va: Va) -> Option<PageInfo> {
        self.entries.remove(&va.page_base().into_usize())
    }

    /// The metadata for the page containing `va`.
    pub fn get(&self, va: Va) -> Option<&PageInfo> {
        self.entries.get(&va.page_base().into_usize())
    }

    /// Mutable metadata for the page containing `va`.
    pub fn get_mut(&mut self, va: Va) -> Option<&mut PageInfo> {
        self.entries.get_mut(&va.page_base().into_usize())
    }

    /// Whether the page containing `va` is promised.
    pub fn contains(&self, va: Va) -> bool {
        self.entries.contains_key(&va.page_base().into_usize())
    }

    /// Iterates over `(page base, metadata)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Va, &PageInfo)> {
        self.entries
            .iter()
            .map(|(&base, info)| (Va::new(base).unwrap(), info))
    }

    /// Page bases currently promised.
    pub fn page_bases(&self) -> Vec<Va> {
        self.entries.keys().map(|&b| Va::new(b).unwrap()).collect()
    }

    /// Number of promised pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no pages are promised.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}
