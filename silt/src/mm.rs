//! Physical page buffers.
//!
//! A [`Page`] is one page worth of bytes with shared ownership. The frame
//! allocator hands pages to user address spaces, and the same page may be
//! reachable both through a page-table entry and through the bookkeeping
//! that later writes it back to a file or swap, so access is serialized by
//! a per-page spinlock.

use crate::addressing::PGSIZE;
use crate::sync::SpinLock;
use std::sync::Arc;

/// A reference-counted page of memory.
///
/// Cloning shares the underlying bytes.
#[derive(Clone)]
pub struct Page {
    data: Arc<SpinLock<Box<[u8; PGSIZE]>>>,
}

impl Page {
    /// Allocates a new zero-filled page.
    pub fn new() -> Self {
        Self {
            data: Arc::new(SpinLock::new(Box::new([0; PGSIZE]))),
        }
    }

    /// Copies `dst.len()` bytes out of the page starting at `ofs`.
    pub fn read(&self, ofs: usize, dst: &mut [u8]) {
        assert!(ofs + dst.len() <= PGSIZE);
        let data = self.data.lock();
        dst.copy_from_slice(&data[ofs..ofs + dst.len()]);
    }

    /// Copies `src` into the page starting at `ofs`.
    pub fn write(&self, ofs: usize, src: &[u8]) {
        assert!(ofs + src.len() <= PGSIZE);
        let mut data = self.data.lock();
        data[ofs..ofs + src.len()].copy_from_slice(src);
    }

    /// Copies the whole page into `dst`.
    pub fn copy_to(&self, dst: &mut [u8; PGSIZE]) {
        let data = self.data.lock();
        dst.copy_from_slice(&data[..]);
    }

    /// Replaces the whole page with `src`.
    pub fn copy_from(&self, src: &[u8; PGSIZE]) {
        let mut data = self.data.lock();
        data.copy_from_slice(src);
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}
