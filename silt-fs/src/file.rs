//! File handles.
//!
//! A [`FileHandle`] is one opener's view of an inode: a byte position
//! that sequential reads and writes advance, plus an optional write-deny
//! pin on the underlying inode. Distinct handles on the same inode keep
//! independent positions.

use crate::inode::InodeHandle;
use silt::fs::Sector;
use silt::KernelError;

/// An open file.
pub struct FileHandle {
    inode: InodeHandle,
    pos: usize,
    deny: bool,
}

impl FileHandle {
    pub(crate) fn new(inode: InodeHandle) -> Self {
        Self {
            inode,
            pos: 0,
            deny: false,
        }
    }

    /// The sector number identifying the underlying inode.
    pub fn inumber(&self) -> Sector {
        self.inode.inumber()
    }

    /// File size in bytes.
    pub fn length(&self) -> Result<usize, KernelError> {
        self.inode.length()
    }

    /// Reads up to `dst.len()` bytes at the current position, advancing
    /// it by the number of bytes actually read.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize, KernelError> {
        let n = self.inode.read_at(dst, self.pos)?;
        self.pos += n;
        Ok(n)
    }

    /// Writes `src` at the current position, advancing it by the number
    /// of bytes actually written.
    pub fn write(&mut self, src: &[u8]) -> Result<usize, KernelError> {
        let n = self.inode.write_at(src, self.pos)?;
        self.pos += n;
        Ok(n)
    }

    /// Reads at an explicit offset without touching the position.
    pub fn read_at(&self, dst: &mut [u8], ofs: usize) -> Result<usize, KernelError> {
        self.inode.read_at(dst, ofs)
    }

    /// Writes at an explicit offset without touching the position.
    pub fn write_at(&self, src: &[u8], ofs: usize) -> Result<usize, KernelError> {
        self.inode.write_at(src, ofs)
    }

    /// Moves the position to `pos`. Seeking past the end is allowed; a
    /// later write there grows the file.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// The current position.
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Pins the underlying inode against writes from any handle.
    ///
    /// Idempotent per handle; the pin is dropped by [`allow_write`] or
    /// when the handle closes.
    ///
    /// [`allow_write`]: Self::allow_write
    pub fn deny_write(&mut self) {
        if !self.deny {
            self.deny = true;
            self.inode.deny_write();
        }
    }

    /// Releases this handle's write pin, if it holds one.
    pub fn allow_write(&mut self) {
        if self.deny {
            self.deny = false;
            self.inode.allow_write();
        }
    }

    /// Opens an independent handle on the same inode, positioned at the
    /// start and without a write pin.
    pub fn duplicate(&self) -> FileHandle {
        FileHandle::new(self.inode.clone())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.allow_write();
    }
}
