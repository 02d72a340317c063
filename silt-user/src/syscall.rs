//! System call dispatch.
//!
//! A trap delivers a frame holding the user stack pointer and the
//! return-value register. The syscall number sits at the stack pointer
//! and up to three word arguments right above it. Nothing about that
//! stack is trusted: the highest argument slot in use is bounds-checked
//! against the kernel boundary before any slot is read, and every slot
//! read goes through the process page tables. A violation anywhere,
//! including a descriptor that was never issued, terminates the
//! process with exit code -1.
//!
//! One coarse mutex (`filesys_lock` on the kernel) serializes every
//! call into the file-system layer. It is taken after user memory has
//! been validated and copied kernel-side, and released before results
//! are copied back out, so the lock is never held while a fault might
//! be resolved.

use crate::file_struct::{STDIN_FD, STDOUT_FD};
use crate::process::{Exited, Kernel, Process};
use crate::uaccess::{UserCString, UserPtrRO, UserPtrWO, UserU8SliceRO, UserU8SliceWO};
use num_enum::TryFromPrimitive;
use silt::addressing::{Va, KERNEL_BASE};
use std::sync::Arc;

/// Value `mmap` returns when the mapping cannot be established.
pub const MAP_FAILED: u32 = u32::MAX;

/// The register state a trap hands to the dispatcher.
pub struct TrapFrame {
    /// User stack pointer at the time of the trap.
    pub esp: usize,
    /// Return-value register, written back to the user.
    pub eax: u32,
}

/// Recognized system calls, numbered as user programs invoke them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
pub enum SyscallNumber {
    /// Powers the machine off.
    Halt = 0,
    /// Terminates the calling process.
    Exit = 1,
    /// Starts a child process from a command line.
    Exec = 2,
    /// Reaps a child, returning its exit status.
    Wait = 3,
    /// Creates a file of a given initial size.
    Create = 4,
    /// Unlinks a file or empty directory.
    Remove = 5,
    /// Opens a file and returns a descriptor.
    Open = 6,
    /// Size in bytes of an open file.
    Filesize = 7,
    /// Reads from a descriptor.
    Read = 8,
    /// Writes to a descriptor.
    Write = 9,
    /// Moves a descriptor's position.
    Seek = 10,
    /// Reports a descriptor's position.
    Tell = 11,
    /// Closes a descriptor.
    Close = 12,
    /// Maps an open file into the address space.
    Mmap = 13,
    /// Tears a mapping down.
    Munmap = 14,
    /// Changes the working directory.
    Chdir = 15,
    /// Creates a directory.
    Mkdir = 16,
}

impl SyscallNumber {
    // Word-sized argument slots each call consumes.
    fn arg_count(self) -> usize {
        match self {
            SyscallNumber::Halt => 0,
            SyscallNumber::Exit
            | SyscallNumber::Exec
            | SyscallNumber::Wait
            | SyscallNumber::Remove
            | SyscallNumber::Open
            | SyscallNumber::Filesize
            | SyscallNumber::Tell
            | SyscallNumber::Close
            | SyscallNumber::Munmap
            | SyscallNumber::Chdir
            | SyscallNumber::Mkdir => 1,
            SyscallNumber::Create | SyscallNumber::Seek | SyscallNumber::Mmap => 2,
            SyscallNumber::Read | SyscallNumber::Write => 3,
        }
    }
}

// Why a handler stopped instead of producing a return value.
enum Trap {
    // Untrusted input was bad; the process dies with -1.
    Fault,
    // The process already terminated through this call.
    Exited,
}

impl From<silt::KernelError> for Trap {
    fn from(_: silt::KernelError) -> Trap {
        Trap::Fault
    }
}

/// Serves one trap. `Err(Exited)` means the calling process is gone and
/// its thread must unwind.
pub fn syscall(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    frame: &mut TrapFrame,
) -> Result<(), Exited> {
    match dispatch(kernel, process, frame) {
        Ok(value) => {
            frame.eax = value;
            Ok(())
        }
        Err(Trap::Exited) => Err(Exited),
        Err(Trap::Fault) => Err(kernel.do_exit(process, -1, true)),
    }
}

// Reads argument word `slot` above the stack pointer through the
// process page tables.
fn read_word(process: &Arc<Process>, esp: usize, slot: usize) -> Result<u32, Trap> {
    let mut st = process.state.lock();
    Ok(UserPtrRO::<u32>::new(esp + 4 * slot).get(&mut st.mm)?)
}

fn dispatch(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    frame: &mut TrapFrame,
) -> Result<u32, Trap> {
    if Va::new(frame.esp).map_or(true, |va| !va.is_user()) {
        return Err(Trap::Fault);
    }
    let nr = read_word(process, frame.esp, 0)? as usize;
    let call = SyscallNumber::try_from(nr).map_err(|_| Trap::Fault)?;

    // The slots are adjacent, so bounding the highest one in use
    // suffices before any argument is read.
    let argc = call.arg_count();
    if frame.esp + 4 * (argc + 1) > KERNEL_BASE {
        return Err(Trap::Fault);
    }
    let mut args = [0usize; 3];
    for (slot, arg) in args.iter_mut().enumerate().take(argc) {
        *arg = read_word(process, frame.esp, slot + 1)? as usize;
    }

    match call {
        SyscallNumber::Halt => {
            kernel.power_off();
            let _ = kernel.do_exit(process, 0, false);
            Err(Trap::Exited)
        }
        SyscallNumber::Exit => {
            let _ = kernel.do_exit(process, args[0] as u32 as i32, true);
            Err(Trap::Exited)
        }
        SyscallNumber::Exec => sys_exec(kernel, process, args[0]),
        SyscallNumber::Wait => Ok(kernel.wait_child(process, args[0]) as u32),
        SyscallNumber::Create => sys_create(kernel, process, args[0], args[1], false),
        SyscallNumber::Mkdir => sys_create(kernel, process, args[0], 0, true),
        SyscallNumber::Remove => sys_remove(kernel, process, args[0]),
        SyscallNumber::Open => sys_open(kernel, process, args[0]),
        SyscallNumber::Filesize => sys_filesize(kernel, process, args[0]),
        SyscallNumber::Read => sys_read(kernel, process, args[0], args[1], args[2]),
        SyscallNumber::Write => sys_write(kernel, process, args[0], args[1], args[2]),
        SyscallNumber::Seek => sys_seek(kernel, process, args[0], args[1]),
        SyscallNumber::Tell => sys_tell(kernel, process, args[0]),
        SyscallNumber::Close => sys_close(kernel, process, args[0]),
        SyscallNumber::Mmap => sys_mmap(kernel, process, args[0], args[1]),
        SyscallNumber::Munmap => sys_munmap(process, args[0]),
        SyscallNumber::Chdir => sys_chdir(kernel, process, args[0]),
    }
}

fn read_path(process: &Arc<Process>, addr: usize) -> Result<String, Trap> {
    let mut st = process.state.lock();
    Ok(UserCString::new(addr).read(&mut st.mm)?)
}

fn sys_exec(kernel: &Arc<Kernel>, process: &Arc<Process>, cmdline: usize) -> Result<u32, Trap> {
    let cmdline = read_path(process, cmdline)?;
    Ok(kernel.exec_child(process, &cmdline) as u32)
}

fn sys_create(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    path: usize,
    size: usize,
    is_dir: bool,
) -> Result<u32, Trap> {
    let path = read_path(process, path)?;
    let cwd = process.state.lock().files.cwd;
    let guard = kernel.filesys_lock.lock();
    let created = kernel.fs().create(&path, size, is_dir, cwd).is_ok();
    guard.unlock();
    Ok(created as u32)
}

fn sys_remove(kernel: &Arc<Kernel>, process: &Arc<Process>, path: usize) -> Result<u32, Trap> {
    let path = read_path(process, path)?;
    let cwd = process.state.lock().files.cwd;
    let guard = kernel.filesys_lock.lock();
    let removed = kernel.fs().remove(&path, cwd).is_ok();
    guard.unlock();
    Ok(removed as u32)
}

fn sys_open(kernel: &Arc<Kernel>, process: &Arc<Process>, path: usize) -> Result<u32, Trap> {
    let path = read_path(process, path)?;
    let cwd = process.state.lock().files.cwd;
    let guard = kernel.filesys_lock.lock();
    let opened = kernel.fs().open(&path, cwd);
    guard.unlock();
    match opened {
        Ok(file) => {
            let mut st = process.state.lock();
            match st.files.install(file) {
                Ok(fd) => Ok(fd as u32),
                Err(_) => Ok(-1i32 as u32),
            }
        }
        Err(_) => Ok(-1i32 as u32),
    }
}

fn sys_filesize(kernel: &Arc<Kernel>, process: &Arc<Process>, fd: usize) -> Result<u32, Trap> {
    let file = process.state.lock().files.get(fd).ok_or(Trap::Fault)?;
    let guard = kernel.filesys_lock.lock();
    let size = file.lock().length().unwrap_or(0);
    guard.unlock();
    Ok(size as u32)
}

fn sys_read(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    fd: usize,
    buf: usize,
    n: usize,
) -> Result<u32, Trap> {
    if fd == STDIN_FD {
        // One keyboard character at a time, stopping at NUL. The NUL is
        // stored but not counted.
        let mut count = 0;
        while count < n {
            let c = kernel.tty().getc();
            let mut st = process.state.lock();
            UserPtrWO::<u8>::new(buf + count).put(&mut st.mm, c)?;
            st.unlock();
            if c == 0 {
                break;
            }
            count += 1;
        }
        return Ok(count as u32);
    }

    let (file, dst) = {
        let st = process.state.lock();
        let dst = UserU8SliceWO::new(buf, n);
        dst.check(&st.mm)?;
        (st.files.get(fd).ok_or(Trap::Fault)?, dst)
    };

    let mut data = vec![0u8; n];
    let guard = kernel.filesys_lock.lock();
    let bytes = file.lock().read(&mut data).unwrap_or(0);
    guard.unlock();

    let mut st = process.state.lock();
    dst.put(&mut st.mm, &data[..bytes])?;
    Ok(bytes as u32)
}

fn sys_write(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    fd: usize,
    buf: usize,
    n: usize,
) -> Result<u32, Trap> {
    let data = {
        let mut st = process.state.lock();
        UserU8SliceRO::new(buf, n).get(&mut st.mm)?
    };

    if fd == STDOUT_FD {
        kernel.tty().putbuf(&data);
        return Ok(n as u32);
    }

    let file = process.state.lock().files.get(fd).ok_or(Trap::Fault)?;
    let guard = kernel.filesys_lock.lock();
    let bytes = file.lock().write(&data).unwrap_or(0);
    guard.unlock();
    Ok(bytes as u32)
}

fn sys_seek(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    fd: usize,
    pos: usize,
) -> Result<u32, Trap> {
    let file = process.state.lock().files.get(fd).ok_or(Trap::Fault)?;
    let guard = kernel.filesys_lock.lock();
    file.lock().seek(pos);
    guard.unlock();
    Ok(0)
}

fn sys_tell(kernel: &Arc<Kernel>, process: &Arc<Process>, fd: usize) -> Result<u32, Trap> {
    let file = process.state.lock().files.get(fd).ok_or(Trap::Fault)?;
    let guard = kernel.filesys_lock.lock();
    let pos = file.lock().tell();
    guard.unlock();
    Ok(pos as u32)
}

fn sys_close(kernel: &Arc<Kernel>, process: &Arc<Process>, fd: usize) -> Result<u32, Trap> {
    let file = process.state.lock().files.remove(fd).ok_or(Trap::Fault)?;
    let guard = kernel.filesys_lock.lock();
    drop(file);
    guard.unlock();
    Ok(0)
}

fn sys_mmap(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    fd: usize,
    addr: usize,
) -> Result<u32, Trap> {
    // Descriptors 0 and 1 are not mappable; an unmapped descriptor is
    // reported, not fatal.
    let Some(file) = process.state.lock().files.get(fd) else {
        return Ok(MAP_FAILED);
    };
    let Some(va) = Va::new(addr) else {
        return Ok(MAP_FAILED);
    };
    let mapping = file.lock().duplicate();

    let mut st = process.state.lock();
    match st.mm.mmap(va, mapping) {
        Ok(mapid) => Ok(mapid as u32),
        Err(_) => Ok(MAP_FAILED),
    }
}

fn sys_munmap(process: &Arc<Process>, mapid: usize) -> Result<u32, Trap> {
    let mut st = process.state.lock();
    let _ = st.mm.munmap(mapid);
    Ok(0)
}

fn sys_chdir(kernel: &Arc<Kernel>, process: &Arc<Process>, path: usize) -> Result<u32, Trap> {
    let path = read_path(process, path)?;
    let cwd = process.state.lock().files.cwd;
    let guard = kernel.filesys_lock.lock();
    let dir = kernel.fs().open_dir(&path, cwd);
    guard.unlock();
    match dir {
        Ok(dir) => {
            process.state.lock().files.cwd = dir.inumber();
            Ok(1)
        }
        Err(_) => Ok(0),
    }
}
