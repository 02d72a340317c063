//! Frame allocator.
//!
//! Tracks the physical frames handed out to user pages against a fixed
//! budget. Allocation and release go through `frame_lock`, the lowest
//! lock in the kernel order. When the budget is exhausted the allocator
//! itself refuses; reclaiming a frame is the address space's job, which
//! evicts one of its own pages and retries.

use silt::addressing::PGSIZE;
use silt::mm::Page;
use silt::sync::SpinLock;

/// Default number of frames available to user pages.
pub const DEFAULT_FRAMES: usize = 256;

/// The pool of user frames.
pub struct FrameAllocator {
    capacity: usize,
    used: SpinLock<usize>,
}

impl FrameAllocator {
    /// Creates a pool of `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            used: SpinLock::new(0),
        }
    }

    /// Takes one zero-filled frame, or `None` when the pool is
    /// exhausted.
    pub fn allocate(&self) -> Option<Page> {
        let mut used = self.used.lock();
        if *used < self.capacity {
            *used += 1;
            Some(Page::new())
        } else {
            None
        }
    }

    /// Returns a frame to the pool.
    pub fn free(&self, page: Page) {
        drop(page);
        let mut used = self.used.lock();
        assert!(*used > 0, "freed more frames than were allocated");
        *used -= 1;
    }

    /// Frames currently handed out.
    pub fn used(&self) -> usize {
        *self.used.lock()
    }

    /// Size of the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Swap device: a page-granular backing store for evicted anonymous
/// pages.
pub struct SwapDevice {
    slots: SpinLock<Vec<Option<Box<[u8; PGSIZE]>>>>,
}

impl SwapDevice {
    /// Creates an empty swap device.
    pub fn new() -> Self {
        Self {
            slots: SpinLock::new(Vec::new()),
        }
    }

    /// Copies `page` out to a fresh slot and returns its index.
    pub fn swap_out(&self, page: &Page) -> usize {
        let mut bytes = Box::new([0u8; PGSIZE]);
        page.copy_to(&mut bytes);
        let mut slots = self.slots.lock();
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(bytes);
                return idx;
            }
        }
        slots.push(Some(bytes));
        slots.len() - 1
    }

    /// Fills `page` from slot `idx` and releases the slot.
    pub fn swap_in(&self, idx: usize, page: &Page) {
        let bytes = self.slots.lock()[idx]
            .take()
            .expect("swapped in an empty swap slot");
        page.copy_from(&bytes);
    }

    /// Releases slot `idx` without reading it.
    pub fn discard(&self, idx: usize) {
        self.slots.lock()[idx] = None;
    }

    /// Number of slots currently in use.
    pub fn used_slots(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }
}

impl Default for SwapDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_bounded() {
        let frames = FrameAllocator::new(2);
        let a = frames.allocate().unwrap();
        let _b = frames.allocate().unwrap();
        assert!(frames.allocate().is_none());
        frames.free(a);
        assert!(frames.allocate().is_some());
    }

    #[test]
    fn swap_round_trip() {
        let swap = SwapDevice::new();
        let page = Page::new();
        page.write(10, &[1, 2, 3]);
        let slot = swap.swap_out(&page);
        assert_eq!(swap.used_slots(), 1);

        let restored = Page::new();
        swap.swap_in(slot, &restored);
        let mut out = [0u8; 3];
        restored.read(10, &mut out);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(swap.used_slots(), 0);
    }
}
