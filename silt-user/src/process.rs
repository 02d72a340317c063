//! Processes.
//!
//! A process is one kernel thread running a user program against its own
//! file state and address space. The [`Kernel`] owns what processes
//! share: the mounted file system and the coarse lock serializing
//! syscall access to it, the console and keyboard, the frame pool, and
//! the swap device.
//!
//! Programs are looked up in a registry by the first whitespace token of
//! the command line; the same name must also exist as a file in the file
//! system, standing in for the executable image. While a process runs,
//! its image is held open with writes denied.
//!
//! `exec` hands the new process to the scheduler and then blocks the
//! parent on the child's load semaphore; the child ups it once it knows
//! whether loading worked, so the parent's return value can honestly
//! report a load failure. `wait` reaps a child exactly once through the
//! child's exit semaphore.

use crate::file_struct::FileStruct;
use crate::mm_struct::MmStruct;
use crate::syscall::{self, TrapFrame};
use crate::vm::{FrameAllocator, SwapDevice, DEFAULT_FRAMES};
use silt::addressing::KERNEL_BASE;
use silt::sync::{Mutex, Semaphore, SpinLock};
use silt::teletype::Teletype;
use silt::thread::ThreadBuilder;
use silt::KernelError;
use silt_fs::FileSys;
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

/// Process identifier.
pub type Pid = usize;

/// The current process has terminated; the program must unwind.
#[derive(Debug, PartialEq, Eq)]
pub struct Exited;

/// Entry point of a registered user program.
///
/// Returning `Ok(status)` behaves like calling exit with that status;
/// `Err(Exited)` means the program already left through a terminating
/// system call.
pub type ProgramMain = Arc<dyn Fn(&UserCtx) -> Result<i32, Exited> + Send + Sync>;

pub(crate) struct ProcessState {
    pub files: FileStruct,
    pub mm: MmStruct,
    pub exe: Option<silt_fs::file::FileHandle>,
}

/// One user process.
pub struct Process {
    /// Process identifier.
    pub pid: Pid,
    name: String,
    pub(crate) state: Mutex<ProcessState>,
    exited: AtomicBool,
    exit_status: SpinLock<Option<i32>>,
    exit_sema: Semaphore,
    load_ok: SpinLock<Option<bool>>,
    load_sema: Semaphore,
    children: Mutex<BTreeMap<Pid, Arc<Process>>>,
}

impl Process {
    /// The full command line the process was started with.
    pub fn name(&self) -> &str {
        &self.name
    }

    // The program name: everything up to the first whitespace.
    fn first_token(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }

    /// The recorded exit status, once the process has exited.
    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock()
    }
}

/// The machine: shared kernel services plus the process table's root.
pub struct Kernel {
    fs: FileSys,
    tty: Arc<Teletype>,
    pub(crate) frames: Arc<FrameAllocator>,
    pub(crate) swap: Arc<SwapDevice>,
    /// Serializes every syscall-originated call into the file system.
    pub(crate) filesys_lock: Arc<Mutex<()>>,
    programs: SpinLock<BTreeMap<String, ProgramMain>>,
    next_pid: AtomicUsize,
    halted: AtomicBool,
}

impl Kernel {
    /// Brings up a kernel over a mounted file system with the default
    /// frame budget.
    pub fn new(fs: FileSys) -> Arc<Self> {
        Self::with_frame_capacity(fs, DEFAULT_FRAMES)
    }

    /// Brings up a kernel with an explicit user-frame budget.
    pub fn with_frame_capacity(fs: FileSys, frames: usize) -> Arc<Self> {
        Arc::new(Self {
            fs,
            tty: Arc::new(Teletype::new()),
            frames: Arc::new(FrameAllocator::new(frames)),
            swap: Arc::new(SwapDevice::new()),
            filesys_lock: Arc::new(Mutex::new(())),
            programs: SpinLock::new(BTreeMap::new()),
            next_pid: AtomicUsize::new(1),
            halted: AtomicBool::new(false),
        })
    }

    /// The mounted file system.
    pub fn fs(&self) -> &FileSys {
        &self.fs
    }

    /// The console/keyboard pair.
    pub fn tty(&self) -> &Arc<Teletype> {
        &self.tty
    }

    /// Whether a process has powered the machine off.
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Frames currently backing user pages.
    pub fn frames_in_use(&self) -> usize {
        self.frames.used()
    }

    /// Swap slots currently holding evicted pages.
    pub fn swap_slots_in_use(&self) -> usize {
        self.swap.used_slots()
    }

    pub(crate) fn power_off(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Registers the program `name` runs.
    pub fn register_program<F>(&self, name: &str, main: F)
    where
        F: Fn(&UserCtx) -> Result<i32, Exited> + Send + Sync + 'static,
    {
        self.programs
            .lock()
            .insert(name.to_string(), Arc::new(main));
    }

    /// Starts a top-level process running `cmdline`.
    pub fn spawn(self: &Arc<Self>, cmdline: &str) -> Arc<Process> {
        self.spawn_with_state(cmdline, FileStruct::new())
    }

    fn spawn_with_state(self: &Arc<Self>, cmdline: &str, files: FileStruct) -> Arc<Process> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let process = Arc::new(Process {
            pid,
            name: cmdline.to_string(),
            state: Mutex::new(ProcessState {
                files,
                mm: MmStruct::new(
                    self.frames.clone(),
                    self.swap.clone(),
                    self.filesys_lock.clone(),
                ),
                exe: None,
            }),
            exited: AtomicBool::new(false),
            exit_status: SpinLock::new(None),
            exit_sema: Semaphore::new(0),
            load_ok: SpinLock::new(None),
            load_sema: Semaphore::new(0),
            children: Mutex::new(BTreeMap::new()),
        });

        let kernel = self.clone();
        let child = process.clone();
        ThreadBuilder::new(cmdline).spawn(move || kernel.start_process(child));
        process
    }

    /// Runs `cmdline` to completion and returns its exit status.
    pub fn run(self: &Arc<Self>, cmdline: &str) -> i32 {
        let process = self.spawn(cmdline);
        process.exit_sema.wait();
        process.exit_status().unwrap_or(-1)
    }

    // EXEC: start a child inheriting the caller's descriptors and
    // working directory, then block until it reports on loading.
    pub(crate) fn exec_child(self: &Arc<Self>, parent: &Arc<Process>, cmdline: &str) -> isize {
        let files = {
            let st = parent.state.lock();
            st.files.inherit()
        };
        let child = self.spawn_with_state(cmdline, files);
        parent.children.lock().insert(child.pid, child.clone());

        child.load_sema.wait();
        let result = match *child.load_ok.lock() {
            Some(true) => child.pid as isize,
            _ => -1,
        };
        result
    }

    // WAIT: reap `pid` once; -1 for anything that is not an unreaped
    // child.
    pub(crate) fn wait_child(&self, parent: &Arc<Process>, pid: Pid) -> isize {
        let child = parent.children.lock().remove(&pid);
        match child {
            Some(child) => {
                child.exit_sema.wait();
                child.exit_status().unwrap_or(-1) as isize
            }
            None => -1,
        }
    }

    fn load(self: &Arc<Self>, process: &Arc<Process>) -> Result<ProgramMain, KernelError> {
        let name = process.first_token().to_string();
        let main = self
            .programs
            .lock()
            .get(&name)
            .cloned()
            .ok_or(KernelError::NoExec)?;

        let cwd = process.state.lock().files.cwd;
        let guard = self.filesys_lock.lock();
        let exe = self.fs.open(&name, cwd);
        guard.unlock();
        let mut exe = exe?;
        // The running image must not change underneath the process.
        exe.deny_write();

        let mut st = process.state.lock();
        st.mm.setup_stack();
        st.exe = Some(exe);
        st.unlock();
        Ok(main)
    }

    fn start_process(self: Arc<Self>, process: Arc<Process>) {
        match self.load(&process) {
            Ok(main) => {
                *process.load_ok.lock() = Some(true);
                process.load_sema.signal();

                let ctx = UserCtx {
                    kernel: self.clone(),
                    process: process.clone(),
                };
                if let Ok(status) = main(&ctx) {
                    let _ = self.do_exit(&process, status, true);
                }
            }
            Err(_) => {
                // Never ran; it exits silently and the parent's exec
                // reports the failure.
                *process.load_ok.lock() = Some(false);
                let _ = self.do_exit(&process, -1, false);
                process.load_sema.signal();
            }
        }
    }

    // The one exit path. Announces, closes descriptors, tears down
    // mappings and the executable pin, then publishes the status.
    pub(crate) fn do_exit(&self, process: &Arc<Process>, status: i32, announce: bool) -> Exited {
        if process.exited.swap(true, Ordering::SeqCst) {
            return Exited;
        }
        if announce {
            self.tty
                .putbuf(format!("{}: exit({})\n", process.first_token(), status).as_bytes());
        }

        let mut st = process.state.lock();
        {
            let guard = self.filesys_lock.lock();
            st.files.drain();
            if let Some(mut exe) = st.exe.take() {
                exe.allow_write();
            }
            guard.unlock();
        }
        // Dirty mapped pages land in their files before the address
        // space goes away.
        let _ = st.mm.munmap_all();
        st.mm.destroy();
        st.unlock();

        *process.exit_status.lock() = Some(status);
        process.exit_sema.signal();
        Exited
    }
}

/// The view a running user program has of the machine.
///
/// Stores and loads of user memory go through the process page tables
/// exactly as hardware accesses would: they fault pages in on demand,
/// set accessed and dirty bits, and an access to an unpromised address
/// terminates the process the way the fault handler would.
pub struct UserCtx {
    pub(crate) kernel: Arc<Kernel>,
    pub(crate) process: Arc<Process>,
}

impl UserCtx {
    /// The kernel this program runs on.
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// The calling process's identifier.
    pub fn pid(&self) -> Pid {
        self.process.pid
    }

    /// The command line the process was started with.
    pub fn cmdline(&self) -> String {
        self.process.name.clone()
    }

    /// Lowest address of the process stack region, usable as scratch
    /// space for buffers handed to system calls.
    pub fn stack_base(&self) -> usize {
        self.process.state.lock().mm.stack_base().into_usize()
    }

    /// Issues a system call: lays the number and arguments out on the
    /// user stack, traps, and returns the value left in the return
    /// register.
    pub fn syscall(&self, nr: usize, args: &[usize]) -> Result<isize, Exited> {
        assert!(args.len() <= 3);
        let sp = KERNEL_BASE - 4 * 4;
        let mut bytes = Vec::with_capacity(16);
        bytes.extend((nr as u32).to_le_bytes());
        for &arg in args {
            bytes.extend((arg as u32).to_le_bytes());
        }

        let result = {
            let mut st = self.process.state.lock();
            st.mm.copy_to_user(sp, &bytes)
        };
        if result.is_err() {
            return Err(self.kernel.do_exit(&self.process, -1, true));
        }

        let mut frame = TrapFrame { esp: sp, eax: 0 };
        syscall::syscall(&self.kernel, &self.process, &mut frame)?;
        Ok(frame.eax as i32 as isize)
    }

    /// A user-mode store to `addr`.
    pub fn poke(&self, addr: usize, bytes: &[u8]) -> Result<(), Exited> {
        let result = {
            let mut st = self.process.state.lock();
            st.mm.copy_to_user(addr, bytes)
        };
        result.map_err(|_| self.kernel.do_exit(&self.process, -1, true))
    }

    /// A user-mode load of `len` bytes at `addr`.
    pub fn peek(&self, addr: usize, len: usize) -> Result<Vec<u8>, Exited> {
        let result = {
            let mut st = self.process.state.lock();
            st.mm.copy_from_user(addr, len)
        };
        result.map_err(|_| self.kernel.do_exit(&self.process, -1, true))
    }
}
