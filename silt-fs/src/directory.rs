//! Directories.
//!
//! A directory is an inode whose data is an array of fixed 32-byte
//! entries mapping names to inode sectors. A cleared entry has no inode
//! pointer; adding a name reuses the first cleared slot before growing
//! the directory. `.` and `..` are not stored: the inode's parent field
//! covers them during path resolution.

use crate::inode::{BlockPtr, InodeHandle};
use silt::fs::Sector;
use silt::KernelError;

/// Longest allowed entry name, in bytes.
pub const NAME_MAX: usize = 27;

const ENTRY_SIZE: usize = core::mem::size_of::<DirEntry>();

/// One on-disk directory entry.
#[repr(C)]
#[derive(Clone, Copy)]
struct DirEntry {
    /// `None` marks an unused or deleted slot.
    inode: Option<BlockPtr>,
    name_len: u8,
    name: [u8; NAME_MAX],
}

const_assert!(core::mem::size_of::<DirEntry>() == 32);

impl DirEntry {
    fn empty() -> Self {
        Self {
            inode: None,
            name_len: 0,
            name: [0; NAME_MAX],
        }
    }

    fn from_name(name: &str, sector: Sector) -> Result<Self, KernelError> {
        if name.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if name.len() > NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        let mut entry = Self {
            inode: Some(BlockPtr::from(sector)),
            name_len: name.len() as u8,
            name: [0; NAME_MAX],
        };
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(entry)
    }

    fn name_matches(&self, name: &str) -> bool {
        self.inode.is_some()
            && self.name_len as usize == name.len()
            && &self.name[..name.len()] == name.as_bytes()
    }

    fn as_bytes(&self) -> &[u8] {
        // Safety: DirEntry is repr(C) with no padding and every bit
        // pattern of its fields is valid.
        unsafe { core::slice::from_raw_parts(self as *const _ as *const u8, ENTRY_SIZE) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // Safety: as in `as_bytes`.
        unsafe { core::slice::from_raw_parts_mut(self as *mut _ as *mut u8, ENTRY_SIZE) }
    }
}

/// An open directory.
pub struct Directory {
    inode: InodeHandle,
}

impl Directory {
    pub(crate) fn new(inode: InodeHandle) -> Self {
        Self { inode }
    }

    /// The sector number identifying the directory's inode.
    pub fn inumber(&self) -> Sector {
        self.inode.inumber()
    }

    /// Sector of the parent directory's inode.
    pub fn parent(&self) -> Result<Sector, KernelError> {
        self.inode.parent()
    }

    pub(crate) fn inode(&self) -> &InodeHandle {
        &self.inode
    }

    // Scans entries; returns the first for which `pred` is true, along
    // with its byte offset.
    fn scan(
        &self,
        mut pred: impl FnMut(&DirEntry) -> bool,
    ) -> Result<Option<(usize, DirEntry)>, KernelError> {
        let mut ofs = 0;
        loop {
            let mut entry = DirEntry::empty();
            let n = self.inode.read_at(entry.as_bytes_mut(), ofs)?;
            if n < ENTRY_SIZE {
                return Ok(None);
            }
            if pred(&entry) {
                return Ok(Some((ofs, entry)));
            }
            ofs += ENTRY_SIZE;
        }
    }

    /// Looks up `name`, returning the sector of its inode.
    pub fn lookup(&self, name: &str) -> Result<Option<Sector>, KernelError> {
        Ok(self
            .scan(|e| e.name_matches(name))?
            .map(|(_, e)| e.inode.unwrap().into_sector()))
    }

    /// Binds `name` to the inode at `sector`.
    ///
    /// # Errors
    ///
    /// [`KernelError::FileExist`] when the name is already bound,
    /// [`KernelError::NameTooLong`] when it does not fit an entry.
    pub fn add(&self, name: &str, sector: Sector) -> Result<(), KernelError> {
        let entry = DirEntry::from_name(name, sector)?;
        if self.lookup(name)?.is_some() {
            return Err(KernelError::FileExist);
        }
        // Reuse a cleared slot; otherwise append, growing the directory.
        let ofs = match self.scan(|e| e.inode.is_none())? {
            Some((ofs, _)) => ofs,
            None => self.inode.length()?,
        };
        let written = self.inode.write_at(entry.as_bytes(), ofs)?;
        if written != ENTRY_SIZE {
            return Err(KernelError::NoSpace);
        }
        Ok(())
    }

    /// Unbinds `name`, returning the sector its entry pointed at.
    pub fn remove_entry(&self, name: &str) -> Result<Sector, KernelError> {
        let (ofs, entry) = self
            .scan(|e| e.name_matches(name))?
            .ok_or(KernelError::NoSuchEntry)?;
        let sector = entry.inode.unwrap().into_sector();
        let cleared = DirEntry::empty();
        if self.inode.write_at(cleared.as_bytes(), ofs)? != ENTRY_SIZE {
            return Err(KernelError::IOError);
        }
        Ok(sector)
    }

    /// Lists the live entries as `(name, sector)` pairs.
    pub fn entries(&self) -> Result<Vec<(String, Sector)>, KernelError> {
        let mut out = Vec::new();
        let mut ofs = 0;
        loop {
            let mut entry = DirEntry::empty();
            let n = self.inode.read_at(entry.as_bytes_mut(), ofs)?;
            if n < ENTRY_SIZE {
                return Ok(out);
            }
            if let Some(ptr) = entry.inode {
                let name = core::str::from_utf8(&entry.name[..entry.name_len as usize])
                    .map_err(|_| KernelError::FilesystemCorrupted("directory entry name"))?;
                out.push((name.to_string(), ptr.into_sector()));
            }
            ofs += ENTRY_SIZE;
        }
    }

    /// Whether the directory holds no live entries.
    pub fn is_empty(&self) -> Result<bool, KernelError> {
        Ok(self.scan(|e| e.inode.is_some())?.is_none())
    }
}
