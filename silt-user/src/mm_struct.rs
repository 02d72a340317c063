//! Memory state of a process.
//!
//! [`MmStruct`] owns everything a process's address space is made of:
//! the page table, the supplemental page table, and the process's share
//! of the frame pool. System calls reach user memory exclusively through
//! [`copy_from_user`] and [`copy_to_user`], which resolve pages on
//! demand exactly the way a fault would: consulting the supplemental
//! page table, taking a frame, and filling it from file, zeros, or swap.
//! Stores mark the page dirty in the page table; the write-back on
//! `munmap` trusts those bits.
//!
//! When the frame pool runs dry, the address space evicts one of its own
//! loaded pages: dirty file-backed pages go back to their file,
//! anonymous pages go to swap.
//!
//! [`copy_from_user`]: MmStruct::copy_from_user
//! [`copy_to_user`]: MmStruct::copy_to_user

use crate::vm::{
    Backing, FrameAllocator, MapId, PageInfo, PageTable, SupplementalPageTable, SwapDevice,
};
use silt::addressing::{Va, KERNEL_BASE, PGSIZE};
use silt::mm::Page;
use silt::sync::Mutex;
use silt::KernelError;
use silt_fs::file::FileHandle;
use std::sync::Arc;

/// Number of demand-zeroed pages under the user stack top.
pub const STACK_PAGES: usize = 64;

enum Populate {
    FromFile(Arc<FileHandle>, usize, usize),
    Zeroed,
    FromSwap(usize),
}

/// The memory state for a process.
pub struct MmStruct {
    /// Virtual-to-frame mappings for the pages that are present.
    pub page_table: PageTable,
    spt: SupplementalPageTable,
    frames: Arc<FrameAllocator>,
    swap: Arc<SwapDevice>,
    // The coarse file-system lock, taken around every file transfer the
    // paging machinery performs on its own.
    fs_lock: Arc<Mutex<()>>,
    max_mapid: MapId,
}

impl MmStruct {
    /// Creates an empty address space drawing frames from `frames`.
    pub fn new(
        frames: Arc<FrameAllocator>,
        swap: Arc<SwapDevice>,
        fs_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            page_table: PageTable::new(),
            spt: SupplementalPageTable::new(),
            frames,
            swap,
            fs_lock,
            max_mapid: 0,
        }
    }

    /// Promises the demand-zeroed stack region ending at the kernel
    /// boundary.
    pub fn setup_stack(&mut self) {
        let base = KERNEL_BASE - STACK_PAGES * PGSIZE;
        for i in 0..STACK_PAGES {
            self.spt
                .insert(
                    Va::new(base + i * PGSIZE).unwrap(),
                    PageInfo {
                        mapid: None,
                        loaded: false,
                        backing: Backing::Zero,
                    },
                )
                .expect("stack region promised twice");
        }
    }

    /// Lowest address of the stack region.
    pub fn stack_base(&self) -> Va {
        Va::new(KERNEL_BASE - STACK_PAGES * PGSIZE).unwrap()
    }

    /// Checks that `[addr, addr + len)` lies in user space and every
    /// page of it is promised (writably, for `write`). Never loads
    /// anything.
    pub fn access_ok(&self, addr: usize, len: usize, write: bool) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        if end > KERNEL_BASE {
            return false;
        }
        if len == 0 {
            return true;
        }
        let mut base = addr - addr % PGSIZE;
        while base < end {
            let Some(va) = Va::new(base) else { return false };
            match self.spt.get(va) {
                Some(info) if !write || info.writable() => {}
                _ => return false,
            }
            base += PGSIZE;
        }
        true
    }

    // Resolve the page containing `va` into a frame, faulting it in if
    // needed, and return that frame.
    fn page_in(&mut self, va: Va) -> Result<Page, KernelError> {
        let base = va.page_base();
        if let Some(pte) = self.page_table.get(base) {
            return Ok(pte.page.clone());
        }

        let (writable, populate) = match self.spt.get(base) {
            Some(info) => (
                info.writable(),
                match &info.backing {
                    Backing::File {
                        file,
                        ofs,
                        read_bytes,
                        ..
                    } => Populate::FromFile(file.clone(), *ofs, *read_bytes),
                    Backing::Zero => Populate::Zeroed,
                    Backing::Swap { slot } => Populate::FromSwap(*slot),
                },
            ),
            None => return Err(KernelError::BadAddress),
        };

        let page = loop {
            match self.frames.allocate() {
                Some(page) => break page,
                None => self.evict_one()?,
            }
        };

        match populate {
            Populate::FromFile(file, ofs, read_bytes) => {
                let guard = self.fs_lock.lock();
                let mut buf = vec![0u8; read_bytes];
                let read = file.read_at(&mut buf, ofs);
                guard.unlock();
                match read {
                    Ok(n) => page.write(0, &buf[..n]),
                    Err(e) => {
                        self.frames.free(page);
                        return Err(e);
                    }
                }
            }
            Populate::Zeroed => {}
            Populate::FromSwap(slot) => {
                self.swap.swap_in(slot, &page);
            }
        }

        let info = self.spt.get_mut(base).unwrap();
        info.loaded = true;
        if matches!(info.backing, Backing::Swap { .. }) {
            // The slot is consumed; from here the page behaves like any
            // other anonymous page.
            info.backing = Backing::Zero;
        }
        self.page_table.map(base, page.clone(), writable);
        Ok(page)
    }

    // Push one of this address space's loaded pages out of its frame:
    // dirty file pages go back to the file, anonymous pages to swap.
    fn evict_one(&mut self) -> Result<(), KernelError> {
        let victim = self
            .spt
            .iter()
            .find(|(_, info)| info.loaded)
            .map(|(va, _)| va)
            .ok_or(KernelError::NoMemory)?;

        let dirty = self.page_table.is_dirty(victim);
        let page = self
            .page_table
            .unmap(victim)
            .expect("loaded page missing from the page table");
        let writable = self.spt.get(victim).unwrap().writable();

        let file_target = match &self.spt.get(victim).unwrap().backing {
            Backing::File {
                file,
                ofs,
                read_bytes,
                ..
            } => Some((file.clone(), *ofs, *read_bytes)),
            Backing::Zero => None,
            Backing::Swap { .. } => unreachable!("a loaded page cannot live in swap"),
        };
        match file_target {
            Some((file, ofs, read_bytes)) => {
                if dirty {
                    let mut bytes = Box::new([0u8; PGSIZE]);
                    page.copy_to(&mut bytes);
                    let guard = self.fs_lock.lock();
                    let written = file.write_at(&bytes[..read_bytes], ofs);
                    guard.unlock();
                    if let Err(e) = written {
                        // A failed write-back keeps the page resident
                        // (and dirty) rather than losing its bytes.
                        self.page_table.map(victim, page, writable);
                        self.page_table.mark_access(victim, true);
                        return Err(e);
                    }
                }
            }
            None => {
                let slot = self.swap.swap_out(&page);
                self.spt.get_mut(victim).unwrap().backing = Backing::Swap { slot };
            }
        }
        self.spt.get_mut(victim).unwrap().loaded = false;
        self.frames.free(page);
        Ok(())
    }

    /// Copies `len` bytes of user memory at `addr` into the kernel.
    ///
    /// Fails with [`KernelError::BadAddress`] when any byte of the range
    /// is outside the user's promised pages.
    pub fn copy_from_user(&mut self, addr: usize, len: usize) -> Result<Vec<u8>, KernelError> {
        if !self.access_ok(addr, len, false) {
            return Err(KernelError::BadAddress);
        }
        let mut out = Vec::with_capacity(len);
        let mut pos = addr;
        let end = addr + len;
        while pos < end {
            let va = Va::new(pos).ok_or(KernelError::BadAddress)?;
            let page = self.page_in(va)?;
            let ofs = va.page_offset();
            let chunk = (PGSIZE - ofs).min(end - pos);
            let mut buf = vec![0u8; chunk];
            page.read(ofs, &mut buf);
            out.extend_from_slice(&buf);
            self.page_table.mark_access(va, false);
            pos += chunk;
        }
        Ok(out)
    }

    /// Copies `src` into user memory at `addr`, dirtying the touched
    /// pages.
    ///
    /// Fails with [`KernelError::BadAddress`] when the range is not
    /// writably promised.
    pub fn copy_to_user(&mut self, addr: usize, src: &[u8]) -> Result<(), KernelError> {
        if !self.access_ok(addr, src.len(), true) {
            return Err(KernelError::BadAddress);
        }
        let mut pos = addr;
        let end = addr + src.len();
        while pos < end {
            let va = Va::new(pos).ok_or(KernelError::BadAddress)?;
            let page = self.page_in(va)?;
            let ofs = va.page_offset();
            let chunk = (PGSIZE - ofs).min(end - pos);
            page.write(ofs, &src[pos - addr..pos - addr + chunk]);
            self.page_table.mark_access(va, true);
            pos += chunk;
        }
        Ok(())
    }

    /// Maps `file` at `addr`, one lazy page per file-backed chunk.
    ///
    /// `addr` must be nonzero, page-aligned, and in user space; the file
    /// must have positive length; no covered page may already be
    /// promised. A collision rolls back every page installed so far and
    /// reuses the mapping identifier.
    pub fn mmap(&mut self, addr: Va, file: FileHandle) -> Result<MapId, KernelError> {
        if addr.into_usize() == 0 || addr.page_offset() != 0 || !addr.is_user() {
            return Err(KernelError::InvalidArgument);
        }
        let guard = self.fs_lock.lock();
        let len = file.length()?;
        guard.unlock();
        if len == 0 || addr.into_usize() + len > KERNEL_BASE {
            return Err(KernelError::InvalidArgument);
        }

        let file = Arc::new(file);
        let mapid = self.max_mapid;
        self.max_mapid += 1;

        let mut installed = Vec::new();
        let mut ofs = 0;
        while ofs < len {
            let va = Va::new(addr.into_usize() + ofs).unwrap();
            let info = PageInfo {
                mapid: Some(mapid),
                loaded: false,
                backing: Backing::File {
                    file: file.clone(),
                    ofs,
                    read_bytes: (len - ofs).min(PGSIZE),
                    writable: true,
                },
            };
            if self.spt.insert(va, info).is_err() {
                for va in installed {
                    self.spt.remove(va);
                }
                self.max_mapid -= 1;
                return Err(KernelError::InvalidArgument);
            }
            installed.push(va);
            ofs += PGSIZE;
        }
        Ok(mapid)
    }

    /// Tears down mapping `mapid`: present-and-dirty pages write their
    /// file-backed bytes back, frames return to the pool, promises
    /// disappear. Pages never faulted in need no write-back.
    pub fn munmap(&mut self, mapid: MapId) -> Result<(), KernelError> {
        let targets: Vec<Va> = self
            .spt
            .iter()
            .filter(|(_, info)| info.mapid == Some(mapid))
            .map(|(va, _)| va)
            .collect();

        for va in targets {
            let dirty = self.page_table.is_dirty(va);
            let info = self.spt.remove(va).unwrap();
            if let Some(page) = self.page_table.unmap(va) {
                if dirty {
                    if let Backing::File {
                        file,
                        ofs,
                        read_bytes,
                        ..
                    } = &info.backing
                    {
                        let mut bytes = Box::new([0u8; PGSIZE]);
                        page.copy_to(&mut bytes);
                        let guard = self.fs_lock.lock();
                        file.write_at(&bytes[..*read_bytes], *ofs)?;
                        guard.unlock();
                    }
                }
                self.frames.free(page);
            }
        }
        Ok(())
    }

    /// Tears down every `mmap` mapping.
    pub fn munmap_all(&mut self) -> Result<(), KernelError> {
        let mut mapids: Vec<MapId> = self
            .spt
            .iter()
            .filter_map(|(_, info)| info.mapid)
            .collect();
        mapids.sort_unstable();
        mapids.dedup();
        for mapid in mapids {
            self.munmap(mapid)?;
        }
        Ok(())
    }

    /// Releases every remaining frame and swap slot. The address space
    /// is unusable afterwards.
    pub fn destroy(&mut self) {
        for va in self.spt.page_bases() {
            let info = self.spt.remove(va).unwrap();
            if let Some(page) = self.page_table.unmap(va) {
                self.frames.free(page);
            } else if let Backing::Swap { slot } = info.backing {
                self.swap.discard(slot);
            }
        }
    }

    /// Number of promised pages, for introspection.
    pub fn promised_pages(&self) -> usize {
        self.spt.len()
    }
}
