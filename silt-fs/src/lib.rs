//! Silt storage stack.
//!
//! The disk is owned by three cooperating layers. The [`cache`] keeps
//! recently used sectors in memory, writes them back lazily, and
//! prefetches ahead of sequential readers. The [`inode`] layer gives
//! files their on-disk shape: multi-level indexed inodes that grow on
//! demand and free their sectors when the last opener of a removed file
//! lets go. On top, [`directory`] maps names to inode sectors and
//! [`file`] hands out per-opener positions.
//!
//! [`FileSys`] ties the layers together behind path-based operations and
//! owns the mount/unmount lifecycle, including the cache's background
//! threads.

macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

pub mod cache;
pub mod directory;
pub mod file;
pub mod free_map;
pub mod inode;
pub mod lru;

use cache::BufferCache;
use directory::Directory;
use file::FileHandle;
use free_map::FreeMap;
use inode::InodeTable;
use silt::fs::{Disk, Sector};
use silt::{info, KernelError};
use std::sync::Arc;

/// Sector of the root directory's inode.
pub const ROOT_SECTOR: Sector = Sector(0);

pub(crate) struct FsInner {
    pub(crate) cache: BufferCache,
    pub(crate) free_map: FreeMap,
    pub(crate) inodes: InodeTable,
}

/// A mounted file system.
///
/// Cloning shares the mount; the underlying cache, free map, and open
/// inode table are common to all clones.
#[derive(Clone)]
pub struct FileSys {
    inner: Arc<FsInner>,
}

impl FileSys {
    /// Writes a fresh, empty file system onto `disk` and mounts it.
    pub fn format(disk: Arc<dyn Disk>) -> Result<Self, KernelError> {
        let sectors = disk.sector_count();
        let cache = BufferCache::new(disk);
        let free_map = FreeMap::format(&cache, sectors)?;
        let inner = Arc::new(FsInner {
            cache,
            free_map,
            inodes: InodeTable::new(),
        });
        // The free map already owns sector 0 for the root directory.
        inode::create(&inner, ROOT_SECTOR, 0, true, ROOT_SECTOR)?;
        info!("Formatted disk of {} sectors.", sectors);
        Ok(FileSys { inner })
    }

    /// Mounts the file system already present on `disk`.
    pub fn mount(disk: Arc<dyn Disk>) -> Result<Self, KernelError> {
        let sectors = disk.sector_count();
        let cache = BufferCache::new(disk);
        let free_map = FreeMap::load(&cache, sectors)?;
        let inner = Arc::new(FsInner {
            cache,
            free_map,
            inodes: InodeTable::new(),
        });
        let root = inode::open(&inner, ROOT_SECTOR)?;
        if !root.is_dir()? {
            return Err(KernelError::FilesystemCorrupted("root is not a directory"));
        }
        Ok(FileSys { inner })
    }

    fn open_dir_at(&self, sector: Sector) -> Result<Directory, KernelError> {
        let handle = inode::open(&self.inner, sector)?;
        if handle.is_dir()? {
            Ok(Directory::new(handle))
        } else {
            Err(KernelError::NotDirectory)
        }
    }

    fn step(&self, dir: Directory, part: &str) -> Result<Directory, KernelError> {
        match part {
            "." => Ok(dir),
            ".." => self.open_dir_at(dir.parent()?),
            _ => {
                let sector = dir.lookup(part)?.ok_or(KernelError::NoSuchEntry)?;
                self.open_dir_at(sector)
            }
        }
    }

    // Walks `path` up to (but not including) its final component.
    // Returns the containing directory and that final name.
    fn resolve_parent<'a>(
        &self,
        path: &'a str,
        cwd: Sector,
    ) -> Result<(Directory, &'a str), KernelError> {
        let start = if path.starts_with('/') { ROOT_SECTOR } else { cwd };
        let mut parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let name = parts.pop().ok_or(KernelError::InvalidArgument)?;
        let mut dir = self.open_dir_at(start)?;
        for part in parts {
            dir = self.step(dir, part)?;
        }
        Ok((dir, name))
    }

    // Resolves `path` to the sector of its inode.
    fn resolve(&self, path: &str, cwd: Sector) -> Result<Sector, KernelError> {
        let start = if path.starts_with('/') { ROOT_SECTOR } else { cwd };
        let mut dir = self.open_dir_at(start)?;
        let mut parts = path.split('/').filter(|s| !s.is_empty()).peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() && !matches!(part, "." | "..") {
                return dir.lookup(part)?.ok_or(KernelError::NoSuchEntry);
            }
            dir = self.step(dir, part)?;
        }
        Ok(dir.inumber())
    }

    /// Creates a file (or directory) of `initial_size` bytes at `path`.
    ///
    /// Rolls everything back when any step fails; in particular a full
    /// disk mid-growth leaves no half-created file behind.
    pub fn create(
        &self,
        path: &str,
        initial_size: usize,
        is_dir: bool,
        cwd: Sector,
    ) -> Result<(), KernelError> {
        let (dir, name) = self.resolve_parent(path, cwd)?;
        if dir.lookup(name)?.is_some() {
            return Err(KernelError::FileExist);
        }
        let sector = self.inner.free_map.allocate(&self.inner.cache)?;
        let handle = inode::create(&self.inner, sector, initial_size, is_dir, dir.inumber())?;
        if let Err(e) = dir.add(name, sector) {
            handle.remove();
            return Err(e);
        }
        Ok(())
    }

    /// Opens the file at `path`.
    pub fn open(&self, path: &str, cwd: Sector) -> Result<FileHandle, KernelError> {
        let sector = self.resolve(path, cwd)?;
        let handle = inode::open(&self.inner, sector)?;
        Ok(FileHandle::new(handle))
    }

    /// Opens the directory at `path`.
    pub fn open_dir(&self, path: &str, cwd: Sector) -> Result<Directory, KernelError> {
        let sector = self.resolve(path, cwd)?;
        self.open_dir_at(sector)
    }

    /// Removes the file or empty directory at `path`.
    ///
    /// The name disappears immediately; openers that still hold the file
    /// keep using it, and its sectors are freed on the last close.
    pub fn remove(&self, path: &str, cwd: Sector) -> Result<(), KernelError> {
        let (dir, name) = self.resolve_parent(path, cwd)?;
        if matches!(name, "." | "..") {
            return Err(KernelError::InvalidArgument);
        }
        let sector = dir.lookup(name)?.ok_or(KernelError::NoSuchEntry)?;
        let handle = inode::open(&self.inner, sector)?;
        if handle.is_dir()? {
            let target = Directory::new(handle);
            if !target.is_empty()? {
                return Err(KernelError::DirectoryNotEmpty);
            }
            dir.remove_entry(name)?;
            target.inode().remove();
        } else {
            dir.remove_entry(name)?;
            handle.remove();
        }
        Ok(())
    }

    /// Writes every dirty cached sector back to the disk.
    pub fn flush(&self) -> Result<(), KernelError> {
        self.inner.cache.flush_all()
    }

    /// Flushes and stops the cache's background threads.
    ///
    /// The disk image then holds everything; a later [`mount`] of the
    /// same disk sees it all.
    ///
    /// [`mount`]: FileSys::mount
    pub fn shutdown(&self) -> Result<(), KernelError> {
        self.inner.cache.shutdown()
    }

    /// Queues a read-ahead hint for `sector`.
    pub fn request(&self, sector: Sector) {
        self.inner.cache.request(sector)
    }

    /// Number of sectors currently owned, file-system metadata included.
    pub fn allocated_sector_count(&self) -> usize {
        self.inner.free_map.allocated_count()
    }

    /// Number of distinct inodes currently open.
    pub fn open_inode_count(&self) -> usize {
        self.inner.inodes.len()
    }
}
