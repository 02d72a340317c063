//! Indexed on-disk inodes.
//!
//! An inode occupies exactly one sector and maps a file's byte range onto
//! data sectors through three tiers: twelve direct pointers, one indirect
//! sector of 128 pointers, and one double-indirect sector of pointers to
//! indirect sectors. Index sectors are created lazily, exactly when the
//! file first grows past 12 and past 12 + 128 sectors.
//!
//! The kernel never keeps an inode's on-disk image in memory across
//! operations: every query re-reads it through the buffer cache, so there
//! is exactly one authoritative copy and no coherence problem. What stays
//! in memory is the open-inode table: opening a sector that is already
//! open yields the same [`OpenInode`] with a bumped reference count.
//! Removal is deferred; the sectors of a removed inode are returned to
//! the free map only when the last opener lets go.
//!
//! Growing a file is serialized by the per-inode mutex. Reads take no
//! inode lock and may run concurrently with each other and with writes;
//! overlapping ranges then interleave at sector granularity, which is the
//! promised (and only promised) outcome.

use crate::cache::BufferCache;
use crate::FsInner;
use silt::fs::{Sector, SECTOR_SIZE};
use silt::sync::Mutex;
use silt::KernelError;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Number of direct data pointers in an inode.
pub const DIRECT_BLOCKS: usize = 12;

/// Number of pointers held by one index sector.
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / 4;

/// Largest number of data sectors a single inode can address.
pub const MAX_FILE_SECTORS: usize =
    DIRECT_BLOCKS + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR;

// Byte offsets of the fixed fields inside the on-disk inode.
const INODE_OFFSET_LENGTH: usize = 0;
const INODE_OFFSET_IS_DIR: usize = 8;
const INODE_OFFSET_PARENT: usize = 12;

/// A pointer to an allocated sector, stored on disk as a little-endian
/// `u32`.
///
/// Sector 0 holds the root-directory inode and is never handed out as a
/// data or index sector, so zero encodes "no pointer": an
/// `Option<BlockPtr>` is exactly four bytes and an all-zero inode has
/// every pointer unset.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPtr(NonZeroU32);

const_assert!(core::mem::size_of::<Option<BlockPtr>>() == 4);

impl BlockPtr {
    /// Creates a [`BlockPtr`] if the given sector number is not zero.
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// The sector this pointer names.
    #[inline]
    pub fn into_sector(self) -> Sector {
        Sector(self.0.get() as usize)
    }
}

impl From<Sector> for BlockPtr {
    fn from(sec: Sector) -> Self {
        BlockPtr::new(sec.into_usize() as u32).expect("sector 0 cannot back file data")
    }
}

/// On-disk inode. Must be exactly one sector long.
#[repr(C)]
pub struct DiskInode {
    /// File size in bytes.
    pub length: u32,
    /// Number of data sectors currently installed.
    pub sector_count: u32,
    /// Nonzero when the inode is a directory.
    pub is_dir: u32,
    /// Sector of the parent directory's inode.
    pub parent: u32,
    /// Direct data pointers.
    pub directs: [Option<BlockPtr>; DIRECT_BLOCKS],
    /// Single indirect index sector.
    pub indirect: Option<BlockPtr>,
    /// Double indirect index sector.
    pub double_indirect: Option<BlockPtr>,
    /// Magic number.
    pub magic: u32,
    _pad: [u8; 436],
}

const_assert!(core::mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    fn new(is_dir: bool, parent: Sector) -> Box<Self> {
        Box::new(DiskInode {
            length: 0,
            sector_count: 0,
            is_dir: is_dir as u32,
            parent: parent.into_usize() as u32,
            directs: [None; DIRECT_BLOCKS],
            indirect: None,
            double_indirect: None,
            magic: INODE_MAGIC,
            _pad: [0; 436],
        })
    }

    fn read_from(cache: &BufferCache, sec: Sector) -> Result<Box<Self>, KernelError> {
        let mut inode = Self::new(false, Sector(0));
        {
            // Safety: DiskInode is repr(C), one sector long, and every
            // bit pattern is a valid value for its fields.
            let raw = unsafe {
                core::slice::from_raw_parts_mut(&mut *inode as *mut _ as *mut u8, SECTOR_SIZE)
            };
            cache.read(sec, raw, 0)?;
        }
        Ok(inode)
    }

    fn write_to(&self, cache: &BufferCache, sec: Sector) -> Result<(), KernelError> {
        // Safety: as in `read_from`.
        let raw =
            unsafe { core::slice::from_raw_parts(self as *const _ as *const u8, SECTOR_SIZE) };
        cache.write(sec, raw, 0)
    }
}

// Helpers for one pointer inside an index sector, read and written as
// bare four-byte cache transfers.
fn read_entry(
    cache: &BufferCache,
    index: Sector,
    slot: usize,
) -> Result<Option<BlockPtr>, KernelError> {
    let mut raw = [0u8; 4];
    cache.read(index, &mut raw, slot * 4)?;
    Ok(BlockPtr::new(u32::from_le_bytes(raw)))
}

fn write_entry(
    cache: &BufferCache,
    index: Sector,
    slot: usize,
    ptr: BlockPtr,
) -> Result<(), KernelError> {
    let raw = (ptr.into_sector().into_usize() as u32).to_le_bytes();
    cache.write(index, &raw, slot * 4)
}

// Allocate an index sector and zero it; the zeroing write covers the
// whole sector, so no read is issued for it.
fn fresh_index_sector(fs: &FsInner) -> Result<Sector, KernelError> {
    let sec = fs.free_map.allocate(&fs.cache)?;
    static ZEROS: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];
    fs.cache.write(sec, &ZEROS, 0)?;
    Ok(sec)
}

/// In-memory state shared by every opener of one inode sector.
pub(crate) struct OpenInode {
    sector: Sector,
    /// Serializes file extension (and clearing) on this inode.
    lock: Mutex<()>,
    counts: Mutex<Counts>,
}

struct Counts {
    open_cnt: usize,
    deny_write_cnt: usize,
    removed: bool,
}

/// The process-wide table of open inodes, keyed by sector.
pub(crate) struct InodeTable {
    inner: Mutex<BTreeMap<usize, Arc<OpenInode>>>,
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of distinct inodes currently open.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// A counted reference to an open inode.
///
/// Cloning reopens the inode; dropping closes it. When the last handle
/// for a removed inode goes away, the inode's data, its index sectors,
/// and the inode sector itself return to the free map.
pub struct InodeHandle {
    fs: Arc<FsInner>,
    inode: Arc<OpenInode>,
}

/// Writes a fresh inode of `length` bytes at `sector` and opens it.
///
/// The sector must already be claimed in the free map. On failure to
/// grow the fresh inode to `length`, every sector it acquired (the
/// inode sector included) goes back to the free map, so the caller has
/// nothing to roll back.
pub(crate) fn create(
    fs: &Arc<FsInner>,
    sector: Sector,
    length: usize,
    is_dir: bool,
    parent: Sector,
) -> Result<InodeHandle, KernelError> {
    DiskInode::new(is_dir, parent).write_to(&fs.cache, sector)?;
    let handle = open(fs, sector)?;
    if let Err(e) = handle.extend_by(length) {
        handle.remove();
        return Err(e);
    }
    Ok(handle)
}

/// Opens the inode at `sector`, sharing the existing handle if some
/// thread already has it open.
pub(crate) fn open(fs: &Arc<FsInner>, sector: Sector) -> Result<InodeHandle, KernelError> {
    let disk = DiskInode::read_from(&fs.cache, sector)?;
    if disk.magic != INODE_MAGIC {
        return Err(KernelError::FilesystemCorrupted("inode magic mismatch"));
    }

    let mut table = fs.inodes.inner.lock();
    let inode = match table.get(&sector.into_usize()) {
        Some(inode) => {
            inode.counts.lock().open_cnt += 1;
            inode.clone()
        }
        None => {
            let inode = Arc::new(OpenInode {
                sector,
                lock: Mutex::new(()),
                counts: Mutex::new(Counts {
                    open_cnt: 1,
                    deny_write_cnt: 0,
                    removed: false,
                }),
            });
            table.insert(sector.into_usize(), inode.clone());
            inode
        }
    };
    table.unlock();
    Ok(InodeHandle {
        fs: fs.clone(),
        inode,
    })
}

impl InodeHandle {
    /// The sector number that identifies this inode.
    pub fn inumber(&self) -> Sector {
        self.inode.sector
    }

    /// File size in bytes.
    pub fn length(&self) -> Result<usize, KernelError> {
        let mut raw = [0u8; 4];
        self.fs
            .cache
            .read(self.inode.sector, &mut raw, INODE_OFFSET_LENGTH)?;
        Ok(u32::from_le_bytes(raw) as usize)
    }

    /// Whether the inode is a directory.
    pub fn is_dir(&self) -> Result<bool, KernelError> {
        let mut raw = [0u8; 4];
        self.fs
            .cache
            .read(self.inode.sector, &mut raw, INODE_OFFSET_IS_DIR)?;
        Ok(u32::from_le_bytes(raw) != 0)
    }

    /// Sector of the parent directory's inode.
    pub fn parent(&self) -> Result<Sector, KernelError> {
        let mut raw = [0u8; 4];
        self.fs
            .cache
            .read(self.inode.sector, &mut raw, INODE_OFFSET_PARENT)?;
        Ok(Sector(u32::from_le_bytes(raw) as usize))
    }

    /// Marks the inode for deletion when the last opener closes it. The
    /// sectors stay owned until then.
    pub fn remove(&self) {
        self.inode.counts.lock().removed = true;
    }

    /// Disables writes through any handle of this inode.
    ///
    /// May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut counts = self.inode.counts.lock();
        counts.deny_write_cnt += 1;
        assert!(counts.deny_write_cnt <= counts.open_cnt);
    }

    /// Re-enables writes; undoes one [`deny_write`].
    ///
    /// [`deny_write`]: Self::deny_write
    pub fn allow_write(&self) {
        let mut counts = self.inode.counts.lock();
        assert!(counts.deny_write_cnt > 0);
        assert!(counts.deny_write_cnt <= counts.open_cnt);
        counts.deny_write_cnt -= 1;
    }

    /// Whether writes are currently denied.
    pub fn write_denied(&self) -> bool {
        self.inode.counts.lock().deny_write_cnt > 0
    }

    // Maps a byte offset onto the data sector holding it. `None` past
    // the end of the file.
    fn byte_to_sector(&self, pos: usize) -> Result<Option<Sector>, KernelError> {
        if pos >= self.length()? {
            return Ok(None);
        }
        let blk = pos / SECTOR_SIZE;
        let disk = DiskInode::read_from(&self.fs.cache, self.inode.sector)?;
        let cache = &self.fs.cache;

        let ptr = if blk < DIRECT_BLOCKS {
            disk.directs[blk]
        } else if blk < DIRECT_BLOCKS + PTRS_PER_SECTOR {
            let indirect = disk
                .indirect
                .ok_or(KernelError::FilesystemCorrupted("missing indirect sector"))?;
            read_entry(cache, indirect.into_sector(), blk - DIRECT_BLOCKS)?
        } else if blk < MAX_FILE_SECTORS {
            let double = disk.double_indirect.ok_or(KernelError::FilesystemCorrupted(
                "missing double indirect sector",
            ))?;
            let k = blk - DIRECT_BLOCKS - PTRS_PER_SECTOR;
            let indirect = read_entry(cache, double.into_sector(), k / PTRS_PER_SECTOR)?
                .ok_or(KernelError::FilesystemCorrupted("missing indirect sector"))?;
            read_entry(cache, indirect.into_sector(), k % PTRS_PER_SECTOR)?
        } else {
            None
        };
        match ptr {
            Some(p) => Ok(Some(p.into_sector())),
            None => Err(KernelError::FilesystemCorrupted(
                "unallocated sector inside file bounds",
            )),
        }
    }

    // Installs `sector` as data block number `sector_count`, creating
    // index sectors exactly when the thresholds are crossed, and
    // persists the updated inode.
    fn append(&self, disk: &mut DiskInode, sector: Sector) -> Result<(), KernelError> {
        let cache = &self.fs.cache;
        let count = disk.sector_count as usize;

        if count < DIRECT_BLOCKS {
            disk.directs[count] = Some(BlockPtr::from(sector));
        } else if count < DIRECT_BLOCKS + PTRS_PER_SECTOR {
            let slot = count - DIRECT_BLOCKS;
            if slot == 0 {
                disk.indirect = Some(BlockPtr::from(fresh_index_sector(&self.fs)?));
            }
            let indirect = disk.indirect.unwrap().into_sector();
            write_entry(cache, indirect, slot, BlockPtr::from(sector))?;
        } else if count < MAX_FILE_SECTORS {
            let k = count - DIRECT_BLOCKS - PTRS_PER_SECTOR;
            if k == 0 {
                disk.double_indirect = Some(BlockPtr::from(fresh_index_sector(&self.fs)?));
            }
            let double = disk.double_indirect.unwrap().into_sector();
            if k % PTRS_PER_SECTOR == 0 {
                let indirect = fresh_index_sector(&self.fs)?;
                write_entry(cache, double, k / PTRS_PER_SECTOR, BlockPtr::from(indirect))?;
            }
            let indirect = read_entry(cache, double, k / PTRS_PER_SECTOR)?
                .ok_or(KernelError::FilesystemCorrupted("missing indirect sector"))?;
            write_entry(
                cache,
                indirect.into_sector(),
                k % PTRS_PER_SECTOR,
                BlockPtr::from(sector),
            )?;
        } else {
            return Err(KernelError::NoSpace);
        }

        disk.sector_count += 1;
        disk.write_to(cache, self.inode.sector)
    }

    /// Grows the file by `extra` bytes.
    ///
    /// New data sectors are claimed from the free map and zeroed. If
    /// allocation fails partway, the inode keeps every sector actually
    /// installed and the on-disk length grows only to what those sectors
    /// can hold; the caller surfaces the shortfall as a short write.
    pub(crate) fn extend_by(&self, extra: usize) -> Result<(), KernelError> {
        if extra == 0 {
            return Ok(());
        }
        let guard = self.inode.lock.lock();
        let cache = &self.fs.cache;
        let mut disk = DiskInode::read_from(cache, self.inode.sector)?;

        let free_bytes = disk.sector_count as usize * SECTOR_SIZE - disk.length as usize;
        let needed = extra.saturating_sub(free_bytes).div_ceil(SECTOR_SIZE);

        static ZEROS: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];
        let mut shortfall = false;
        for _ in 0..needed {
            let sector = match self.fs.free_map.allocate(cache) {
                Ok(sector) => sector,
                Err(_) => {
                    shortfall = true;
                    break;
                }
            };
            cache.write(sector, &ZEROS, 0)?;
            if let Err(e) = self.append(&mut disk, sector) {
                let _ = self.fs.free_map.release(cache, sector);
                if e == KernelError::NoSpace {
                    shortfall = true;
                    break;
                }
                guard.unlock();
                return Err(e);
            }
        }

        // The length reflects only sectors actually installed.
        disk.length = if shortfall {
            disk.sector_count * SECTOR_SIZE as u32
        } else {
            disk.length + extra as u32
        };
        cache.write(
            self.inode.sector,
            &disk.length.to_le_bytes(),
            INODE_OFFSET_LENGTH,
        )?;
        guard.unlock();
        if shortfall {
            Err(KernelError::NoSpace)
        } else {
            Ok(())
        }
    }

    /// Reads up to `dst.len()` bytes starting at byte `ofs`.
    ///
    /// Returns the number of bytes read, which is short exactly when the
    /// range crosses the end of the file. Each touched sector queues a
    /// read-ahead hint for its successor.
    pub fn read_at(&self, dst: &mut [u8], ofs: usize) -> Result<usize, KernelError> {
        let mut bytes_read = 0;
        while bytes_read < dst.len() {
            let pos = ofs + bytes_read;
            let sector = match self.byte_to_sector(pos)? {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = pos % SECTOR_SIZE;

            let inode_left = self.length()? - pos;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (dst.len() - bytes_read).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }

            self.fs
                .cache
                .read(sector, &mut dst[bytes_read..bytes_read + chunk], sector_ofs)?;
            self.fs.cache.request(sector + 1);
            bytes_read += chunk;
        }
        Ok(bytes_read)
    }

    /// Writes `src` starting at byte `ofs`, growing the file first when
    /// the range extends past the current end.
    ///
    /// Returns the number of bytes written: 0 when writes are denied, and
    /// short of `src.len()` when the disk filled up mid-extension.
    pub fn write_at(&self, src: &[u8], ofs: usize) -> Result<usize, KernelError> {
        if self.write_denied() {
            return Ok(0);
        }

        let length = self.length()?;
        if ofs + src.len() > length {
            // A failed extension still leaves whatever fits writable.
            let _ = self.extend_by(ofs + src.len() - length);
        }

        let mut bytes_written = 0;
        while bytes_written < src.len() {
            let pos = ofs + bytes_written;
            let sector = match self.byte_to_sector(pos)? {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = pos % SECTOR_SIZE;

            let inode_left = self.length()? - pos;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (src.len() - bytes_written).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }

            self.fs
                .cache
                .write(sector, &src[bytes_written..bytes_written + chunk], sector_ofs)?;
            bytes_written += chunk;
        }
        Ok(bytes_written)
    }

    // Returns every data sector and index sector to the free map and
    // rewrites the inode as empty. Runs under the inode mutex.
    fn clear(&self) -> Result<(), KernelError> {
        let guard = self.inode.lock.lock();
        let cache = &self.fs.cache;
        let mut disk = DiskInode::read_from(cache, self.inode.sector)?;
        let count = disk.sector_count as usize;
        assert!(count <= MAX_FILE_SECTORS);

        // Double-indirect region first, highest entries downward.
        if count > DIRECT_BLOCKS + PTRS_PER_SECTOR {
            let double = disk
                .double_indirect
                .ok_or(KernelError::FilesystemCorrupted(
                    "missing double indirect sector",
                ))?
                .into_sector();
            let entries = count - DIRECT_BLOCKS - PTRS_PER_SECTOR;
            for sub in (0..entries.div_ceil(PTRS_PER_SECTOR)).rev() {
                let indirect = read_entry(cache, double, sub)?
                    .ok_or(KernelError::FilesystemCorrupted("missing indirect sector"))?
                    .into_sector();
                let in_sub = (entries - sub * PTRS_PER_SECTOR).min(PTRS_PER_SECTOR);
                for slot in (0..in_sub).rev() {
                    let data = read_entry(cache, indirect, slot)?
                        .ok_or(KernelError::FilesystemCorrupted("missing data sector"))?;
                    self.fs.free_map.release(cache, data.into_sector())?;
                }
                self.fs.free_map.release(cache, indirect)?;
            }
            self.fs.free_map.release(cache, double)?;
        }

        // Indirect region.
        if count > DIRECT_BLOCKS {
            let indirect = disk
                .indirect
                .ok_or(KernelError::FilesystemCorrupted("missing indirect sector"))?
                .into_sector();
            let entries = (count - DIRECT_BLOCKS).min(PTRS_PER_SECTOR);
            for slot in (0..entries).rev() {
                let data = read_entry(cache, indirect, slot)?
                    .ok_or(KernelError::FilesystemCorrupted("missing data sector"))?;
                self.fs.free_map.release(cache, data.into_sector())?;
            }
            self.fs.free_map.release(cache, indirect)?;
        }

        // Direct pointers.
        for slot in (0..count.min(DIRECT_BLOCKS)).rev() {
            let data = disk.directs[slot]
                .ok_or(KernelError::FilesystemCorrupted("missing data sector"))?;
            self.fs.free_map.release(cache, data.into_sector())?;
        }

        disk.length = 0;
        disk.sector_count = 0;
        disk.directs = [None; DIRECT_BLOCKS];
        disk.indirect = None;
        disk.double_indirect = None;
        disk.write_to(cache, self.inode.sector)?;
        guard.unlock();
        Ok(())
    }
}

impl Clone for InodeHandle {
    /// Reopens the inode: same shared state, one more opener.
    fn clone(&self) -> Self {
        self.inode.counts.lock().open_cnt += 1;
        InodeHandle {
            fs: self.fs.clone(),
            inode: self.inode.clone(),
        }
    }
}

impl Drop for InodeHandle {
    fn drop(&mut self) {
        let mut table = self.fs.inodes.inner.lock();
        let (last, removed) = {
            let mut counts = self.inode.counts.lock();
            counts.open_cnt -= 1;
            (counts.open_cnt == 0, counts.removed)
        };
        if last {
            table.remove(&self.inode.sector.into_usize());
        }
        table.unlock();

        // Deallocate everything once nobody can reach the inode anymore.
        if last && removed {
            let _ = self.clear();
            let _ = self.fs.free_map.release(&self.fs.cache, self.inode.sector);
        }
    }
}
