//! Free-sector map.
//!
//! One bit per disk sector: set means owned by an inode (or by the file
//! system's own metadata), clear means free. The map lives on disk right
//! after the root-directory inode, starting at [`FREE_MAP_START`], and
//! every change is written through the buffer cache so a flush makes the
//! allocation state durable.
//!
//! The map's mutex sits below the per-inode mutex and above the cache
//! lock in the kernel lock order.

use crate::cache::BufferCache;
use silt::fs::{Sector, SECTOR_SIZE};
use silt::sync::Mutex;
use silt::KernelError;

/// First sector of the on-disk bitmap.
pub const FREE_MAP_START: Sector = Sector(1);

const BITS_PER_SECTOR: usize = SECTOR_SIZE * 8;

struct Bits {
    words: Vec<u64>,
}

impl Bits {
    fn is_set(&self, pos: usize) -> bool {
        let (word, bit) = (pos / 64, pos % 64);
        self.words[word] & (1 << bit) != 0
    }

    fn try_set(&mut self, pos: usize) -> bool {
        let (word, bit) = (pos / 64, pos % 64);
        if self.words[word] & (1 << bit) == 0 {
            self.words[word] |= 1 << bit;
            true
        } else {
            false
        }
    }

    fn clear(&mut self, pos: usize) -> bool {
        let (word, bit) = (pos / 64, pos % 64);
        if self.words[word] & (1 << bit) != 0 {
            self.words[word] &= !(1 << bit);
            true
        } else {
            false
        }
    }
}

/// Persistent registry of sector ownership.
pub struct FreeMap {
    inner: Mutex<Bits>,
    disk_sectors: usize,
    map_sectors: usize,
}

impl FreeMap {
    /// Number of sectors the bitmap for a `disk_sectors`-sector disk
    /// occupies on disk.
    pub fn sector_span(disk_sectors: usize) -> usize {
        disk_sectors.div_ceil(BITS_PER_SECTOR)
    }

    /// First sector available for inodes and file data.
    pub fn data_start(disk_sectors: usize) -> Sector {
        FREE_MAP_START + Self::sector_span(disk_sectors)
    }

    fn empty(disk_sectors: usize) -> Self {
        let map_sectors = Self::sector_span(disk_sectors);
        let words = vec![0; map_sectors * SECTOR_SIZE / 8];
        Self {
            inner: Mutex::new(Bits { words }),
            disk_sectors,
            map_sectors,
        }
    }

    /// Builds a fresh map for a `disk_sectors`-sector disk and persists
    /// it.
    ///
    /// The root-inode sector, the bitmap's own sectors, and the padding
    /// bits past the end of the disk are pre-marked as taken.
    pub fn format(cache: &BufferCache, disk_sectors: usize) -> Result<Self, KernelError> {
        let map = Self::empty(disk_sectors);
        {
            let mut bits = map.inner.lock();
            for sec in 0..map.map_sectors + 1 {
                assert!(bits.try_set(sec));
            }
            for pad in disk_sectors..map.map_sectors * BITS_PER_SECTOR {
                bits.try_set(pad);
            }
        }
        map.write_all(cache)?;
        Ok(map)
    }

    /// Reads the map back from `cache`.
    pub fn load(cache: &BufferCache, disk_sectors: usize) -> Result<Self, KernelError> {
        let map = Self::empty(disk_sectors);
        {
            let mut bits = map.inner.lock();
            for i in 0..map.map_sectors {
                let mut raw = [0u8; SECTOR_SIZE];
                cache.read(FREE_MAP_START + i, &mut raw, 0)?;
                for (w, chunk) in raw.chunks_exact(8).enumerate() {
                    bits.words[i * SECTOR_SIZE / 8 + w] =
                        u64::from_le_bytes(chunk.try_into().unwrap());
                }
            }
        }
        Ok(map)
    }

    fn write_all(&self, cache: &BufferCache) -> Result<(), KernelError> {
        let bits = self.inner.lock();
        for i in 0..self.map_sectors {
            let mut raw = [0u8; SECTOR_SIZE];
            for (chunk, w) in raw
                .chunks_exact_mut(8)
                .zip(&bits.words[i * SECTOR_SIZE / 8..])
            {
                chunk.copy_from_slice(&w.to_le_bytes());
            }
            cache.write(FREE_MAP_START + i, &raw, 0)?;
        }
        Ok(())
    }

    // Persist the bitmap sector containing `pos`. Caller holds the map
    // lock.
    fn write_containing(
        &self,
        bits: &Bits,
        cache: &BufferCache,
        pos: usize,
    ) -> Result<(), KernelError> {
        let idx = pos / BITS_PER_SECTOR;
        let mut raw = [0u8; SECTOR_SIZE];
        for (chunk, w) in raw
            .chunks_exact_mut(8)
            .zip(&bits.words[idx * SECTOR_SIZE / 8..])
        {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        cache.write(FREE_MAP_START + idx, &raw, 0)
    }

    /// Claims one free sector.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::NoSpace`] when the disk is full.
    pub fn allocate(&self, cache: &BufferCache) -> Result<Sector, KernelError> {
        let mut bits = self.inner.lock();
        for pos in 0..self.disk_sectors {
            if bits.try_set(pos) {
                self.write_containing(&bits, cache, pos)?;
                return Ok(Sector(pos));
            }
        }
        Err(KernelError::NoSpace)
    }

    /// Returns `sec` to the free pool.
    ///
    /// Releasing a sector that is not allocated is a bug in the caller.
    pub fn release(&self, cache: &BufferCache, sec: Sector) -> Result<(), KernelError> {
        let mut bits = self.inner.lock();
        assert!(
            bits.clear(sec.into_usize()),
            "released sector {} twice",
            sec.into_usize()
        );
        self.write_containing(&bits, cache, sec.into_usize())
    }

    /// Whether `sec` is currently owned.
    pub fn is_allocated(&self, sec: Sector) -> bool {
        self.inner.lock().is_set(sec.into_usize())
    }

    /// Number of allocated sectors, padding bits excluded.
    pub fn allocated_count(&self) -> usize {
        let bits = self.inner.lock();
        (0..self.disk_sectors).filter(|&p| bits.is_set(p)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt::fs::MemDisk;
    use std::sync::Arc;

    fn fresh(sectors: usize) -> (BufferCache, FreeMap) {
        let cache = BufferCache::new(Arc::new(MemDisk::new(sectors)));
        let map = FreeMap::format(&cache, sectors).unwrap();
        (cache, map)
    }

    #[test]
    fn format_reserves_metadata() {
        let (_cache, map) = fresh(1024);
        // Root inode + one bitmap sector (1024 bits fit in one sector).
        assert_eq!(FreeMap::sector_span(1024), 1);
        assert!(map.is_allocated(Sector(0)));
        assert!(map.is_allocated(Sector(1)));
        assert!(!map.is_allocated(Sector(2)));
        assert_eq!(map.allocated_count(), 2);
    }

    #[test]
    fn allocate_release_round_trip() {
        let (cache, map) = fresh(1024);
        let a = map.allocate(&cache).unwrap();
        let b = map.allocate(&cache).unwrap();
        assert_ne!(a, b);
        assert!(map.is_allocated(a));
        map.release(&cache, a).unwrap();
        assert!(!map.is_allocated(a));
        // The freed sector is reused.
        assert_eq!(map.allocate(&cache).unwrap(), a);
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let (cache, map) = fresh(16);
        let usable = 16 - 2;
        for _ in 0..usable {
            map.allocate(&cache).unwrap();
        }
        assert_eq!(map.allocate(&cache), Err(KernelError::NoSpace));
    }

    #[test]
    fn survives_flush_and_reload() {
        let disk = Arc::new(MemDisk::new(1024));
        let cache = BufferCache::new(Arc::clone(&disk) as _);
        let map = FreeMap::format(&cache, 1024).unwrap();
        let a = map.allocate(&cache).unwrap();
        cache.flush_all().unwrap();

        let reloaded = FreeMap::load(&cache, 1024).unwrap();
        assert!(reloaded.is_allocated(a));
        assert_eq!(reloaded.allocated_count(), map.allocated_count());
    }
}
