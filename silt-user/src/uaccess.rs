//! Safe access to user-space memory.
//!
//! The kernel must not believe user input: a system-call argument may
//! point anywhere, including at the kernel itself. Every read or write
//! of user memory therefore goes through the one-shot wrappers here,
//! which bound the range to the user half of the address space, check
//! it against the process's promised pages, and only then copy. Each
//! wrapper consumes itself on use, so an address cannot be re-validated
//! and then reused after the fact.
//!
//! All failures are [`KernelError::BadAddress`]; the system-call layer
//! turns that into termination of the offending process.

use crate::mm_struct::MmStruct;
use silt::KernelError;

/// A one-time, read-only pointer to a user-space object of type `T`.
#[derive(Debug, PartialEq, Eq)]
pub struct UserPtrRO<T>
where
    T: Copy,
{
    addr: usize,
    _ty: core::marker::PhantomData<T>,
}

impl<T> UserPtrRO<T>
where
    T: Copy,
{
    /// Wraps the user-space address `addr`.
    pub fn new(addr: usize) -> Self {
        Self {
            addr,
            _ty: core::marker::PhantomData,
        }
    }

    /// Reads a `T` from user space.
    pub fn get(self, mm: &mut MmStruct) -> Result<T, KernelError> {
        let bytes = mm.copy_from_user(self.addr, core::mem::size_of::<T>())?;
        // Safety: the buffer is exactly size_of::<T>() bytes, and the
        // callers only instantiate T with plain integer types, for
        // which any bit pattern is valid.
        Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }
}

/// A one-time, write-only pointer to a user-space object of type `T`.
#[derive(Debug, PartialEq, Eq)]
pub struct UserPtrWO<T>
where
    T: Copy,
{
    addr: usize,
    _ty: core::marker::PhantomData<T>,
}

impl<T> UserPtrWO<T>
where
    T: Copy,
{
    /// Wraps the user-space address `addr`.
    pub fn new(addr: usize) -> Self {
        Self {
            addr,
            _ty: core::marker::PhantomData,
        }
    }

    /// Writes `value` to user space, returning the bytes written.
    pub fn put(self, mm: &mut MmStruct, value: T) -> Result<usize, KernelError> {
        let size = core::mem::size_of::<T>();
        // Safety: `value` is a plain Copy integer type; viewing it as
        // bytes is well-defined.
        let bytes =
            unsafe { core::slice::from_raw_parts(&value as *const T as *const u8, size) };
        mm.copy_to_user(self.addr, bytes)?;
        Ok(size)
    }
}

/// A one-time, read-only user-space byte slice.
#[derive(Debug, PartialEq, Eq)]
pub struct UserU8SliceRO {
    addr: usize,
    len: usize,
}

impl UserU8SliceRO {
    /// Wraps `len` bytes of user space at `addr`.
    pub fn new(addr: usize, len: usize) -> Self {
        Self { addr, len }
    }

    /// Copies the slice into the kernel.
    pub fn get(self, mm: &mut MmStruct) -> Result<Vec<u8>, KernelError> {
        mm.copy_from_user(self.addr, self.len)
    }
}

/// A one-time, write-only user-space byte slice.
#[derive(Debug, PartialEq, Eq)]
pub struct UserU8SliceWO {
    addr: usize,
    len: usize,
}

impl UserU8SliceWO {
    /// Wraps `len` bytes of user space at `addr`.
    pub fn new(addr: usize, len: usize) -> Self {
        Self { addr, len }
    }

    /// Verifies the slice is writably mapped without loading anything.
    ///
    /// Used to reject a bad buffer before blocking work starts, so no
    /// lock is held when the process gets killed for it.
    pub fn check(&self, mm: &MmStruct) -> Result<(), KernelError> {
        if mm.access_ok(self.addr, self.len, true) {
            Ok(())
        } else {
            Err(KernelError::BadAddress)
        }
    }

    /// Copies `src` out to user space; short when `src` outgrows the
    /// slice. Returns the bytes written.
    pub fn put(self, mm: &mut MmStruct, src: &[u8]) -> Result<usize, KernelError> {
        let n = self.len.min(src.len());
        mm.copy_to_user(self.addr, &src[..n])?;
        Ok(n)
    }
}

/// A pointer to a NUL-terminated string in user space.
#[derive(Debug, PartialEq, Eq)]
pub struct UserCString {
    addr: usize,
}

impl UserCString {
    /// Longest string `read` accepts, terminator excluded.
    const MAX: usize = 4096;

    /// Wraps the user-space address `addr`.
    pub fn new(addr: usize) -> Self {
        Self { addr }
    }

    /// Reads the string, byte by byte, until its NUL terminator.
    pub fn read(self, mm: &mut MmStruct) -> Result<String, KernelError> {
        let mut result = Vec::new();
        let mut ptr = self.addr;
        loop {
            match UserPtrRO::<u8>::new(ptr).get(mm)? {
                0 => {
                    return String::from_utf8(result)
                        .map_err(|_| KernelError::InvalidArgument);
                }
                v => {
                    if result.len() == Self::MAX {
                        return Err(KernelError::NameTooLong);
                    }
                    ptr += 1;
                    result.push(v);
                }
            }
        }
    }
}
