//! Shared scaffolding for userland tests.

use silt::fs::MemDisk;
use silt_fs::{FileSys, ROOT_SECTOR};
use silt_user::process::{Exited, Kernel, UserCtx};
use std::sync::Arc;

/// Formats a disk and brings a kernel up over it.
pub fn boot() -> Arc<Kernel> {
    let fs = FileSys::format(Arc::new(MemDisk::new(4096))).unwrap();
    Kernel::new(fs)
}

/// Registers `main` as program `name` and gives it an executable image
/// on disk.
pub fn install_program<F>(kernel: &Arc<Kernel>, name: &str, main: F)
where
    F: Fn(&UserCtx) -> Result<i32, Exited> + Send + Sync + 'static,
{
    kernel.fs().create(name, 64, false, ROOT_SECTOR).unwrap();
    kernel.register_program(name, main);
}

/// Lays a NUL-terminated string into user memory at `addr`.
pub fn cstr(ctx: &UserCtx, addr: usize, s: &str) -> Result<(), Exited> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    ctx.poke(addr, &bytes)
}

/// Everything printed to the console so far.
pub fn console(kernel: &Arc<Kernel>) -> String {
    String::from_utf8(kernel.tty().output()).unwrap()
}
