//! Disk abstraction.
//!
//! Storage is exposed sector by sector: 512 bytes, numbered from zero.
//! The [`Disk`] trait is the only thing the file system layers see; the
//! in-memory [`MemDisk`] stands in for the raw device. A disk can carry a
//! [`Hook`] that observes (or fails) every transfer, which is how tests
//! count the I/O a code path actually issues.

use crate::sync::SpinLock;
use crate::KernelError;
use std::sync::Arc;

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector, the access granularity of the disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Sector(pub usize);

impl Sector {
    /// Get the byte offset of the start of this sector.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 * SECTOR_SIZE
    }

    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for Sector {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

/// The type for disk hooking.
///
/// Called with the sector, the buffer involved, and whether the transfer
/// is a write. Returning an error aborts the transfer.
pub type Hook =
    Arc<dyn Fn(Sector, &[u8; SECTOR_SIZE], bool) -> Result<(), KernelError> + Send + Sync>;

/// A device that reads and writes fixed-size sectors.
pub trait Disk
where
    Self: Send + Sync,
{
    /// Number of sectors on the device.
    fn sector_count(&self) -> usize;

    /// Read one sector into `buf`.
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError>;

    /// Write one sector from `buf`.
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError>;
}

/// An in-memory disk image.
///
/// Cloning the `Arc` it is usually wrapped in gives another view of the
/// same image, so a file system can be unmounted and "the disk" opened
/// again with all persisted bytes intact.
pub struct MemDisk {
    image: SpinLock<Vec<u8>>,
    sectors: usize,
    is_ro: bool,
    hook: Option<Hook>,
}

impl MemDisk {
    /// Create a zero-filled disk with `sectors` sectors.
    pub fn new(sectors: usize) -> Self {
        Self {
            image: SpinLock::new(vec![0; sectors * SECTOR_SIZE]),
            sectors,
            is_ro: false,
            hook: None,
        }
    }

    /// Make the disk read-only.
    pub fn ro(mut self) -> Self {
        self.is_ro = true;
        self
    }

    /// Add a hook for the disk.
    pub fn hook(mut self, hook: Hook) -> Self {
        self.hook = Some(hook);
        self
    }

    fn check(&self, sector: Sector) -> Result<usize, KernelError> {
        if sector.into_usize() < self.sectors {
            Ok(sector.into_offset())
        } else {
            Err(KernelError::IOError)
        }
    }
}

impl Disk for MemDisk {
    fn sector_count(&self) -> usize {
        self.sectors
    }

    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let ofs = self.check(sector)?;
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, false)?;
        }
        let image = self.image.lock();
        buf.copy_from_slice(&image[ofs..ofs + SECTOR_SIZE]);
        Ok(())
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let ofs = self.check(sector)?;
        if self.is_ro {
            return Err(KernelError::NotSupportedOperation);
        }
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, true)?;
        }
        let mut image = self.image.lock();
        image[ofs..ofs + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn read_back_written_sector() {
        let disk = MemDisk::new(8);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 0xab;
        buf[SECTOR_SIZE - 1] = 0xcd;
        disk.write(Sector(3), &buf).unwrap();

        let mut out = [0u8; SECTOR_SIZE];
        disk.read(Sector(3), &mut out).unwrap();
        assert_eq!(buf, out);
    }

    #[test]
    fn out_of_range() {
        let disk = MemDisk::new(2);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(disk.read(Sector(2), &mut buf), Err(KernelError::IOError));
    }

    #[test]
    fn read_only_rejects_writes() {
        let disk = MemDisk::new(2).ro();
        let buf = [0u8; SECTOR_SIZE];
        assert_eq!(
            disk.write(Sector(0), &buf),
            Err(KernelError::NotSupportedOperation)
        );
    }

    #[test]
    fn hook_observes_transfers() {
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&writes);
        let disk = MemDisk::new(4).hook(Arc::new(move |_, _, is_write| {
            if is_write {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }));
        let buf = [0u8; SECTOR_SIZE];
        disk.write(Sector(0), &buf).unwrap();
        disk.write(Sector(1), &buf).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        disk.read(Sector(0), &mut out).unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }
}
