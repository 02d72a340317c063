//! Buffer cache.
//!
//! Every sector the file system touches goes through this write-back
//! cache. At most [`CACHE_SIZE`] sectors are resident at a time, kept in
//! least-recently-used order; the oldest entry is the eviction victim and
//! is written back first when dirty. Modified sectors stay in memory until
//! a background flusher, an eviction, or [`flush_all`] persists them, and
//! [`request`] lets readers hint the next sector so a background thread
//! can pull it in ahead of use.
//!
//! ## Locking
//!
//! Two levels: a cache-wide mutex protecting list membership and the
//! sector lookup, and one mutex per entry protecting that entry's buffer
//! and flags. The cache mutex is always acquired before an entry mutex,
//! never the reverse. The cache mutex stays held across disk transfers;
//! that serializes I/O, which is an accepted cost at this cache's scale.
//! Public entry points take the cache lock once; the helpers they call
//! assume it is already held.
//!
//! [`flush_all`]: BufferCache::flush_all
//! [`request`]: BufferCache::request

use crate::lru::LruList;
use silt::channel::{channel, Receiver, Sender};
use silt::fs::{Disk, Sector, SECTOR_SIZE};
use silt::sync::{Mutex, MutexGuard, SpinLock};
use silt::thread::{Current, JoinHandle, ThreadBuilder};
use silt::{info, KernelError};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

/// Number of sectors the cache keeps resident.
pub const CACHE_SIZE: usize = 64;

/// How often the write-behind thread flushes dirty entries.
const FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Depth of the read-ahead request queue.
const READAHEAD_QUEUE: usize = 100;

struct EntryState {
    sec_no: Sector,
    buf: Box<[u8; SECTOR_SIZE]>,
    /// The buffer holds the sector's authoritative bytes.
    loaded: bool,
    /// The buffer diverges from the bytes on disk. Implies `loaded`.
    dirty: bool,
}

/// One cache slot. The mutex serializes buffer and flag access.
struct CacheEntry {
    state: Mutex<EntryState>,
}

impl CacheEntry {
    fn new() -> Arc<Self> {
        Arc::new(CacheEntry {
            state: Mutex::new(EntryState {
                sec_no: Sector(0),
                buf: Box::new([0; SECTOR_SIZE]),
                loaded: false,
                dirty: false,
            }),
        })
    }
}

/// List membership: every entry is either resident (`in_use`, LRU order)
/// or idle (`free`), never both.
struct CacheState {
    in_use: LruList<Sector, Arc<CacheEntry>>,
    free: Vec<Arc<CacheEntry>>,
}

struct CacheInner {
    disk: Arc<dyn Disk>,
    state: Mutex<CacheState>,
    shutdown: AtomicBool,
}

impl CacheInner {
    // Take an idle slot, evicting the least recently used resident entry
    // if none is free. Caller holds the cache lock.
    fn take_slot<'a>(
        &self,
        state: &mut MutexGuard<'a, CacheState>,
    ) -> Result<Arc<CacheEntry>, KernelError> {
        if let Some(entry) = state.free.pop() {
            return Ok(entry);
        }
        let (sec, entry) = state
            .in_use
            .pop_oldest()
            .expect("buffer cache has no entries at all");
        {
            let mut es = entry.state.lock();
            if es.dirty && es.loaded {
                if let Err(e) = self.disk.write(es.sec_no, &es.buf) {
                    // Keep the victim resident so the dirty bytes are not
                    // lost; the caller sees the failure.
                    es.unlock();
                    state.in_use.insert(sec, entry);
                    return Err(e);
                }
                es.dirty = false;
            }
            es.loaded = false;
            es.dirty = false;
        }
        Ok(entry)
    }

    // Find the resident entry for `sec`, or move a slot into `in_use` for
    // it. Caller holds the cache lock; the returned entry is promoted to
    // most recently used.
    fn find_or_insert<'a>(
        &self,
        state: &mut MutexGuard<'a, CacheState>,
        sec: Sector,
    ) -> Result<Arc<CacheEntry>, KernelError> {
        if let Some(entry) = state.in_use.get(&sec) {
            return Ok(entry.clone());
        }
        let entry = self.take_slot(state)?;
        {
            let mut es = entry.state.lock();
            es.sec_no = sec;
            es.loaded = false;
            es.dirty = false;
        }
        state.in_use.insert(sec, entry.clone());
        Ok(entry)
    }

    fn read(&self, sec: Sector, dst: &mut [u8], ofs: usize) -> Result<(), KernelError> {
        assert!(ofs + dst.len() <= SECTOR_SIZE);
        let mut state = self.state.lock();
        let entry = self.find_or_insert(&mut state, sec)?;
        let mut es = entry.state.lock();
        if !es.loaded {
            let EntryState { buf, loaded, .. } = &mut *es;
            self.disk.read(sec, buf)?;
            *loaded = true;
        }
        dst.copy_from_slice(&es.buf[ofs..ofs + dst.len()]);
        es.unlock();
        state.unlock();
        Ok(())
    }

    fn write(&self, sec: Sector, src: &[u8], ofs: usize) -> Result<(), KernelError> {
        assert!(ofs + src.len() <= SECTOR_SIZE);
        let mut state = self.state.lock();
        let entry = self.find_or_insert(&mut state, sec)?;
        let mut es = entry.state.lock();
        if !es.loaded {
            // A write covering the whole sector replaces every byte, so
            // the read from disk is elided.
            if ofs > 0 || src.len() < SECTOR_SIZE {
                let EntryState { buf, .. } = &mut *es;
                self.disk.read(sec, buf)?;
            }
            es.loaded = true;
        }
        es.buf[ofs..ofs + src.len()].copy_from_slice(src);
        es.dirty = true;
        es.unlock();
        state.unlock();
        Ok(())
    }

    // Populate the entry for `sec` like a read miss, copying nothing out.
    // Prefetching is advisory; failures leave the slot idle again.
    fn prefetch(&self, sec: Sector) {
        let mut state = self.state.lock();
        if state.in_use.peek(&sec).is_some() {
            return;
        }
        let entry = match self.take_slot(&mut state) {
            Ok(entry) => entry,
            Err(_) => return,
        };
        let mut es = entry.state.lock();
        es.sec_no = sec;
        es.dirty = false;
        es.loaded = self.disk.read(sec, &mut es.buf).is_ok();
        let populated = es.loaded;
        es.unlock();
        if populated {
            state.in_use.insert(sec, entry);
        } else {
            state.free.push(entry);
        }
    }

    fn flush_all(&self) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        for (_, entry) in state.in_use.iter_mut() {
            let mut es = entry.state.lock();
            if es.dirty && es.loaded {
                self.disk.write(es.sec_no, &es.buf)?;
                es.dirty = false;
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        while let Some((_, entry)) = state.in_use.pop_oldest() {
            {
                let mut es = entry.state.lock();
                if es.dirty && es.loaded {
                    self.disk.write(es.sec_no, &es.buf)?;
                }
                es.dirty = false;
                es.loaded = false;
            }
            state.free.push(entry);
        }
        Ok(())
    }
}

/// The sector cache in front of a disk.
pub struct BufferCache {
    inner: Arc<CacheInner>,
    readahead: SpinLock<Option<Sender<Sector>>>,
    workers: SpinLock<Vec<JoinHandle>>,
}

impl BufferCache {
    /// Creates a cache of [`CACHE_SIZE`] empty entries in front of `disk`
    /// and starts the write-behind and read-ahead threads.
    pub fn new(disk: Arc<dyn Disk>) -> Self {
        let mut free = Vec::with_capacity(CACHE_SIZE);
        for _ in 0..CACHE_SIZE {
            free.push(CacheEntry::new());
        }
        let inner = Arc::new(CacheInner {
            disk,
            state: Mutex::new(CacheState {
                in_use: LruList::new(),
                free,
            }),
            shutdown: AtomicBool::new(false),
        });

        let (tx, rx) = channel(READAHEAD_QUEUE);
        let flusher = Self::spawn_write_behind(Arc::clone(&inner));
        let reader = Self::spawn_read_ahead(Arc::clone(&inner), rx);

        BufferCache {
            inner,
            readahead: SpinLock::new(Some(tx)),
            workers: SpinLock::new(vec![flusher, reader]),
        }
    }

    fn spawn_write_behind(inner: Arc<CacheInner>) -> JoinHandle {
        ThreadBuilder::new("[WriteBehind]").spawn(move || {
            info!("Start [WriteBehind]");
            loop {
                Current::sleep(FLUSH_INTERVAL);
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                // Flushing is best effort here; a failing sector stays
                // dirty and is retried on the next pass.
                let _ = inner.flush_all();
            }
        })
    }

    fn spawn_read_ahead(inner: Arc<CacheInner>, rx: Receiver<Sector>) -> JoinHandle {
        ThreadBuilder::new("[ReadAhead]").spawn(move || {
            info!("Start [ReadAhead]");
            while let Ok(sec) = rx.recv() {
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                inner.prefetch(sec);
            }
        })
    }

    /// Copies `dst.len()` bytes from sector `sec` starting at byte `ofs`
    /// of the sector into `dst`. `ofs + dst.len()` must not exceed
    /// [`SECTOR_SIZE`].
    pub fn read(&self, sec: Sector, dst: &mut [u8], ofs: usize) -> Result<(), KernelError> {
        self.inner.read(sec, dst, ofs)
    }

    /// Writes `src` into sector `sec` starting at byte `ofs` of the
    /// sector and marks the entry dirty. A sector that is not yet resident
    /// is first read from disk unless the write covers all of it.
    pub fn write(&self, sec: Sector, src: &[u8], ofs: usize) -> Result<(), KernelError> {
        self.inner.write(sec, src, ofs)
    }

    /// Hints that sector `sec` will be read soon.
    ///
    /// The sector is queued for the read-ahead thread; each accepted
    /// request populates the cache at most once, and a sector that is
    /// already resident is left alone. Never blocks; hints are dropped
    /// when the queue is full.
    pub fn request(&self, sec: Sector) {
        if let Some(tx) = self.readahead.lock().as_ref() {
            let _ = tx.try_send(sec);
        }
    }

    /// Writes every dirty resident entry back to disk.
    ///
    /// Entries stay resident; only their dirty flag changes. The snapshot
    /// includes every write that completed before this call took the
    /// cache lock.
    pub fn flush_all(&self) -> Result<(), KernelError> {
        self.inner.flush_all()
    }

    /// Flushes every dirty entry, then drops all resident entries.
    pub fn clear(&self) -> Result<(), KernelError> {
        self.inner.clear()
    }

    /// Stops the background threads and flushes the cache.
    ///
    /// Idempotent; also invoked on drop.
    pub fn shutdown(&self) -> Result<(), KernelError> {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        // Dropping the sender wakes the read-ahead thread.
        self.readahead.lock().take();
        let workers: Vec<JoinHandle> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.join();
        }
        self.inner.clear()
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt::fs::MemDisk;
    use std::sync::atomic::AtomicUsize;

    struct Counts {
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    fn counting_disk(sectors: usize) -> (Arc<MemDisk>, Arc<Counts>) {
        let counts = Arc::new(Counts {
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        });
        let c = Arc::clone(&counts);
        let disk = Arc::new(MemDisk::new(sectors).hook(Arc::new(move |_, _, is_write| {
            if is_write {
                c.writes.fetch_add(1, Ordering::SeqCst);
            } else {
                c.reads.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })));
        (disk, counts)
    }

    #[test]
    fn cache_is_transparent() {
        let (disk, _) = counting_disk(16);
        let cache = BufferCache::new(disk);
        let payload = [0x5a_u8; 100];
        cache.write(Sector(3), &payload, 17).unwrap();

        let mut out = [0u8; 100];
        cache.read(Sector(3), &mut out, 17).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn full_sector_write_elides_read() {
        let (disk, counts) = counting_disk(16);
        let cache = BufferCache::new(disk);

        let full = [1u8; SECTOR_SIZE];
        cache.write(Sector(0), &full, 0).unwrap();
        assert_eq!(counts.reads.load(Ordering::SeqCst), 0);

        // A partial write to a cold sector must read it first.
        cache.write(Sector(1), &full[..10], 4).unwrap();
        assert_eq!(counts.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lru_victim_is_oldest_unreferenced_sector() {
        let (disk, counts) = counting_disk(CACHE_SIZE + 8);
        let cache = BufferCache::new(disk);
        let mut buf = [0u8; 1];

        for i in 0..CACHE_SIZE {
            cache.read(Sector(i), &mut buf, 0).unwrap();
        }
        assert_eq!(counts.reads.load(Ordering::SeqCst), CACHE_SIZE);

        // Re-reading sector 0 promotes it, so sector 1 is now the victim.
        cache.read(Sector(0), &mut buf, 0).unwrap();
        assert_eq!(counts.reads.load(Ordering::SeqCst), CACHE_SIZE);

        cache.read(Sector(CACHE_SIZE), &mut buf, 0).unwrap();
        assert_eq!(counts.reads.load(Ordering::SeqCst), CACHE_SIZE + 1);

        // Sector 1 was evicted; sector 2 and sector 0 are still resident.
        cache.read(Sector(1), &mut buf, 0).unwrap();
        assert_eq!(counts.reads.load(Ordering::SeqCst), CACHE_SIZE + 2);
        cache.read(Sector(3), &mut buf, 0).unwrap();
        cache.read(Sector(0), &mut buf, 0).unwrap();
        assert_eq!(counts.reads.load(Ordering::SeqCst), CACHE_SIZE + 2);
    }

    #[test]
    fn flush_all_persists_writes() {
        let disk = Arc::new(MemDisk::new(8));
        let cache = BufferCache::new(Arc::clone(&disk) as Arc<dyn Disk>);
        let payload = [0xab_u8; SECTOR_SIZE];
        cache.write(Sector(5), &payload, 0).unwrap();
        cache.flush_all().unwrap();

        let mut raw = [0u8; SECTOR_SIZE];
        disk.read(Sector(5), &mut raw).unwrap();
        assert_eq!(raw, payload);
    }

    #[test]
    fn write_behind_flushes_without_being_asked() {
        let disk = Arc::new(MemDisk::new(8));
        let cache = BufferCache::new(Arc::clone(&disk) as Arc<dyn Disk>);
        let payload = [0x77_u8; SECTOR_SIZE];
        cache.write(Sector(2), &payload, 0).unwrap();

        let mut raw = [0u8; SECTOR_SIZE];
        for _ in 0..100 {
            Current::sleep(Duration::from_millis(10));
            disk.read(Sector(2), &mut raw).unwrap();
            if raw == payload {
                break;
            }
        }
        assert_eq!(raw, payload);
        drop(cache);
    }

    #[test]
    fn read_ahead_populates_in_background() {
        let (disk, counts) = counting_disk(16);
        let cache = BufferCache::new(disk);

        cache.request(Sector(9));
        for _ in 0..100 {
            if counts.reads.load(Ordering::SeqCst) == 1 {
                break;
            }
            Current::sleep(Duration::from_millis(10));
        }
        assert_eq!(counts.reads.load(Ordering::SeqCst), 1);

        // The sector is already resident, so this is a hit.
        let mut buf = [0u8; 1];
        cache.read(Sector(9), &mut buf, 0).unwrap();
        assert_eq!(counts.reads.load(Ordering::SeqCst), 1);

        // And further requests for it are a no-op.
        cache.request(Sector(9));
        Current::sleep(Duration::from_millis(50));
        assert_eq!(counts.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_drops_residency() {
        let (disk, counts) = counting_disk(8);
        let cache = BufferCache::new(disk);
        let mut buf = [0u8; 1];
        cache.read(Sector(4), &mut buf, 0).unwrap();
        cache.clear().unwrap();
        cache.read(Sector(4), &mut buf, 0).unwrap();
        assert_eq!(counts.reads.load(Ordering::SeqCst), 2);
    }
}
