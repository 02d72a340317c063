//! Memory-mapped files, demand paging, and frame pressure.

mod common;

use common::{boot, cstr, install_program};
use silt::addressing::PGSIZE;
use silt::fs::MemDisk;
use silt_fs::{FileSys, ROOT_SECTOR};
use silt_user::process::Kernel;
use silt_user::syscall::SyscallNumber as N;
use std::sync::Arc;

const MAP_AT: usize = 0x1000_0000;

fn file_with_pattern(kernel: &Arc<Kernel>, name: &str, len: usize) -> Vec<u8> {
    let pattern: Vec<u8> = (0..len as u32).map(|i| (i * 13 % 241) as u8).collect();
    kernel.fs().create(name, 0, false, ROOT_SECTOR).unwrap();
    let f = kernel.fs().open(name, ROOT_SECTOR).unwrap();
    assert_eq!(f.write_at(&pattern, 0).unwrap(), len);
    pattern
}

fn read_file(kernel: &Arc<Kernel>, name: &str) -> Vec<u8> {
    let f = kernel.fs().open(name, ROOT_SECTOR).unwrap();
    let len = f.length().unwrap();
    let mut out = vec![0u8; len];
    assert_eq!(f.read_at(&mut out, 0).unwrap(), len);
    out
}

#[test]
fn mmap_modify_munmap_writes_back() {
    let kernel = boot();
    let pattern = file_with_pattern(&kernel, "m", 5000);

    install_program(&kernel, "mapper", |ctx| {
        let name = ctx.stack_base();
        cstr(ctx, name, "m")?;
        let fd = ctx.syscall(N::Open as usize, &[name])? as usize;
        let mapid = ctx.syscall(N::Mmap as usize, &[fd, MAP_AT])?;
        if mapid < 0 {
            return Ok(-1);
        }
        // Closing the descriptor must not tear the mapping down.
        ctx.syscall(N::Close as usize, &[fd])?;

        // Lazily faulted contents match the file.
        let before = ctx.peek(MAP_AT, 5000)?;

        // Scribble over the middle page only.
        ctx.poke(MAP_AT + PGSIZE, &[0xEE; 16])?;

        ctx.syscall(N::Munmap as usize, &[mapid as usize])?;
        if before.is_empty() { Ok(-2) } else { Ok(0) }
    });
    assert_eq!(kernel.run("mapper"), 0);

    let after = read_file(&kernel, "m");
    assert_eq!(after.len(), 5000);
    assert_eq!(&after[..PGSIZE], &pattern[..PGSIZE]);
    assert_eq!(&after[PGSIZE..PGSIZE + 16], &[0xEE; 16]);
    assert_eq!(&after[PGSIZE + 16..], &pattern[PGSIZE + 16..]);
}

#[test]
fn clean_mapping_leaves_file_untouched() {
    let kernel = boot();
    let pattern = file_with_pattern(&kernel, "ro", 5000);

    install_program(&kernel, "peeker", |ctx| {
        let name = ctx.stack_base();
        cstr(ctx, name, "ro")?;
        let fd = ctx.syscall(N::Open as usize, &[name])? as usize;
        let mapid = ctx.syscall(N::Mmap as usize, &[fd, MAP_AT])?;
        if mapid < 0 {
            return Ok(-1);
        }
        let bytes = ctx.peek(MAP_AT, 5000)?;
        ctx.syscall(N::Munmap as usize, &[mapid as usize])?;
        Ok(i32::from(!bytes.is_empty()))
    });
    assert_eq!(kernel.run("peeker"), 1);
    assert_eq!(read_file(&kernel, "ro"), pattern);
}

#[test]
fn exit_tears_mappings_down_with_write_back() {
    let kernel = boot();
    file_with_pattern(&kernel, "leak", 3000);

    install_program(&kernel, "sloppy", |ctx| {
        let name = ctx.stack_base();
        cstr(ctx, name, "leak")?;
        let fd = ctx.syscall(N::Open as usize, &[name])? as usize;
        if ctx.syscall(N::Mmap as usize, &[fd, MAP_AT])? < 0 {
            return Ok(-1);
        }
        ctx.poke(MAP_AT, b"written-before-exit")?;
        // No munmap: exit must do it.
        Ok(0)
    });
    assert_eq!(kernel.run("sloppy"), 0);
    assert_eq!(&read_file(&kernel, "leak")[..19], b"written-before-exit");
    // Frames went back to the pool.
    assert_eq!(kernel.frames_in_use(), 0);
}

#[test]
fn mmap_rejects_bad_arguments() {
    let kernel = boot();
    file_with_pattern(&kernel, "ok", 100);
    kernel.fs().create("empty", 0, false, ROOT_SECTOR).unwrap();

    install_program(&kernel, "picky", |ctx| {
        let base = ctx.stack_base();
        let name = base;
        cstr(ctx, name, "ok")?;
        let fd = ctx.syscall(N::Open as usize, &[name])? as usize;

        // Null and misaligned addresses.
        if ctx.syscall(N::Mmap as usize, &[fd, 0])? >= 0 {
            return Ok(-1);
        }
        if ctx.syscall(N::Mmap as usize, &[fd, MAP_AT + 12])? >= 0 {
            return Ok(-2);
        }
        // Console and keyboard descriptors.
        if ctx.syscall(N::Mmap as usize, &[0, MAP_AT])? >= 0 {
            return Ok(-3);
        }
        if ctx.syscall(N::Mmap as usize, &[1, MAP_AT])? >= 0 {
            return Ok(-4);
        }
        // Zero-length files.
        let ename = base + 0x40;
        cstr(ctx, ename, "empty")?;
        let efd = ctx.syscall(N::Open as usize, &[ename])? as usize;
        if ctx.syscall(N::Mmap as usize, &[efd, MAP_AT])? >= 0 {
            return Ok(-5);
        }

        // Overlap with an existing mapping rolls back cleanly...
        let first = ctx.syscall(N::Mmap as usize, &[fd, MAP_AT])?;
        if first < 0 {
            return Ok(-6);
        }
        if ctx.syscall(N::Mmap as usize, &[fd, MAP_AT])? >= 0 {
            return Ok(-7);
        }
        // ...and the overlap with the stack is refused too.
        let stack_page = ctx.stack_base();
        if ctx.syscall(N::Mmap as usize, &[fd, stack_page])? >= 0 {
            return Ok(-8);
        }

        // The surviving mapping still works.
        let got = ctx.peek(MAP_AT, 2)?;
        if got.len() == 2 { Ok(0) } else { Ok(-9) }
    });
    assert_eq!(kernel.run("picky"), 0);
}

#[test]
fn anonymous_pages_survive_swap_pressure() {
    let fs = FileSys::format(Arc::new(MemDisk::new(4096))).unwrap();
    let kernel = Kernel::with_frame_capacity(fs, 8);

    install_program(&kernel, "presser", |ctx| {
        let base = ctx.stack_base();
        // Touch three times the frame budget.
        for i in 0..24usize {
            ctx.poke(base + i * PGSIZE, &[i as u8 + 1; 32])?;
        }
        for i in 0..24usize {
            let got = ctx.peek(base + i * PGSIZE, 32)?;
            if got != vec![i as u8 + 1; 32] {
                return Ok(-(i as i32) - 1);
            }
        }
        Ok(0)
    });
    assert_eq!(kernel.run("presser"), 0);
    // Everything was handed back on exit, swap included.
    assert_eq!(kernel.frames_in_use(), 0);
    assert_eq!(kernel.swap_slots_in_use(), 0);
}

#[test]
fn mapped_file_survives_frame_pressure() {
    let fs = FileSys::format(Arc::new(MemDisk::new(4096))).unwrap();
    let kernel = Kernel::with_frame_capacity(fs, 4);
    let len = 5 * PGSIZE + 100;
    file_with_pattern(&kernel, "big", len);

    install_program(&kernel, "churner", |ctx| {
        let name = ctx.stack_base();
        cstr(ctx, name, "big")?;
        let fd = ctx.syscall(N::Open as usize, &[name])? as usize;
        let mapid = ctx.syscall(N::Mmap as usize, &[fd, MAP_AT])?;
        if mapid < 0 {
            return Ok(-1);
        }
        // Dirty more pages than there are frames.
        for i in 0..6usize {
            ctx.poke(MAP_AT + i * PGSIZE, &[0xD0 + i as u8; 8])?;
        }
        for i in 0..6usize {
            let got = ctx.peek(MAP_AT + i * PGSIZE, 8)?;
            if got != vec![0xD0 + i as u8; 8] {
                return Ok(-10 - i as i32);
            }
        }
        ctx.syscall(N::Munmap as usize, &[mapid as usize])?;
        Ok(0)
    });
    assert_eq!(kernel.run("churner"), 0);

    let after = read_file(&kernel, "big");
    for i in 0..6usize {
        assert_eq!(&after[i * PGSIZE..i * PGSIZE + 8], &[0xD0 + i as u8; 8]);
    }
}
