//! User-process and system-call behavior.

mod common;

use common::{boot, console, cstr, install_program};
use silt::addressing::KERNEL_BASE;
use silt_fs::ROOT_SECTOR;
use silt_user::syscall::SyscallNumber as N;

#[test]
fn exit_announces_closes_and_flushes() {
    let kernel = boot();
    install_program(&kernel, "writer3", |ctx| {
        let base = ctx.stack_base();
        for i in 0..3usize {
            let name = base + 0x100 + i * 0x20;
            cstr(ctx, name, &format!("out{i}"))?;
            ctx.syscall(N::Create as usize, &[name, 0])?;
            let fd = ctx.syscall(N::Open as usize, &[name])? as usize;
            let buf = base + 0x1000 + i * 0x100;
            ctx.poke(buf, &[0x40 + i as u8; 100])?;
            ctx.syscall(N::Write as usize, &[fd, buf, 100])?;
        }
        ctx.syscall(N::Exit as usize, &[7])?;
        unreachable!("exit returns to no one");
    });

    assert_eq!(kernel.run("writer3"), 7);
    assert!(console(&kernel).contains("writer3: exit(7)\n"));
    // Every descriptor (and the executable) was closed on the way out.
    assert_eq!(kernel.fs().open_inode_count(), 0);

    kernel.fs().flush().unwrap();
    for i in 0..3usize {
        let f = kernel.fs().open(&format!("out{i}"), ROOT_SECTOR).unwrap();
        let mut out = [0u8; 100];
        assert_eq!(f.read_at(&mut out, 0).unwrap(), 100);
        assert!(out.iter().all(|&b| b == 0x40 + i as u8));
    }
}

#[test]
fn returning_from_main_exits_with_that_status() {
    let kernel = boot();
    install_program(&kernel, "quiet", |_| Ok(3));
    assert_eq!(kernel.run("quiet"), 3);
    assert!(console(&kernel).contains("quiet: exit(3)\n"));
}

#[test]
fn console_write_reaches_tty() {
    let kernel = boot();
    install_program(&kernel, "hello", |ctx| {
        let buf = ctx.stack_base();
        ctx.poke(buf, b"hello, console\n")?;
        let n = ctx.syscall(N::Write as usize, &[1, buf, 15])?;
        Ok(n as i32)
    });
    assert_eq!(kernel.run("hello"), 15);
    assert!(console(&kernel).starts_with("hello, console\n"));
}

#[test]
fn keyboard_read_stops_at_nul() {
    let kernel = boot();
    kernel.tty().feed_input(b"hi\0rest");
    install_program(&kernel, "reader", |ctx| {
        let buf = ctx.stack_base();
        let n = ctx.syscall(N::Read as usize, &[0, buf, 10])?;
        // The terminator is stored but not counted.
        let seen = ctx.peek(buf, 3)?;
        if seen == b"hi\0" { Ok(n as i32) } else { Ok(-100) }
    });
    assert_eq!(kernel.run("reader"), 2);
}

#[test]
fn kernel_pointer_kills_process() {
    let kernel = boot();
    install_program(&kernel, "badptr", |ctx| {
        ctx.syscall(N::Write as usize, &[1, KERNEL_BASE, 4])?;
        Ok(0)
    });
    assert_eq!(kernel.run("badptr"), -1);
    assert!(console(&kernel).contains("badptr: exit(-1)\n"));
}

#[test]
fn unmapped_pointer_kills_process() {
    let kernel = boot();
    install_program(&kernel, "wildptr", |ctx| {
        let name = ctx.stack_base();
        cstr(ctx, name, "somefile")?;
        ctx.syscall(N::Create as usize, &[name, 16])?;
        let fd = ctx.syscall(N::Open as usize, &[name])? as usize;
        // 0x5000 was never promised to this process.
        ctx.syscall(N::Read as usize, &[fd, 0x5000, 8])?;
        Ok(0)
    });
    assert_eq!(kernel.run("wildptr"), -1);
}

#[test]
fn unbound_descriptor_kills_process() {
    let kernel = boot();
    install_program(&kernel, "badfd", |ctx| {
        ctx.syscall(N::Close as usize, &[9])?;
        Ok(0)
    });
    assert_eq!(kernel.run("badfd"), -1);

    install_program(&kernel, "badfd2", |ctx| {
        ctx.syscall(N::Filesize as usize, &[2])?;
        Ok(0)
    });
    assert_eq!(kernel.run("badfd2"), -1);
}

#[test]
fn unknown_syscall_number_kills_process() {
    let kernel = boot();
    install_program(&kernel, "nocall", |ctx| {
        ctx.syscall(99, &[])?;
        Ok(0)
    });
    assert_eq!(kernel.run("nocall"), -1);
}

#[test]
fn file_syscalls_round_trip() {
    let kernel = boot();
    install_program(&kernel, "fileops", |ctx| {
        let base = ctx.stack_base();
        let name = base;
        cstr(ctx, name, "notes")?;
        if ctx.syscall(N::Create as usize, &[name, 0])? != 1 {
            return Ok(-10);
        }
        let fd = ctx.syscall(N::Open as usize, &[name])? as usize;

        let data = base + 0x100;
        let pattern: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        ctx.poke(data, &pattern)?;
        if ctx.syscall(N::Write as usize, &[fd, data, 300])? != 300 {
            return Ok(-11);
        }
        if ctx.syscall(N::Filesize as usize, &[fd])? != 300 {
            return Ok(-12);
        }

        ctx.syscall(N::Seek as usize, &[fd, 100])?;
        let readback = base + 0x800;
        if ctx.syscall(N::Read as usize, &[fd, readback, 50])? != 50 {
            return Ok(-13);
        }
        if ctx.syscall(N::Tell as usize, &[fd])? != 150 {
            return Ok(-14);
        }
        if ctx.peek(readback, 50)?.as_slice() != &pattern[100..150] {
            return Ok(-15);
        }

        ctx.syscall(N::Close as usize, &[fd])?;
        Ok(0)
    });
    assert_eq!(kernel.run("fileops"), 0);
}

#[test]
fn open_missing_file_returns_minus_one() {
    let kernel = boot();
    install_program(&kernel, "openmiss", |ctx| {
        let name = ctx.stack_base();
        cstr(ctx, name, "does-not-exist")?;
        Ok(ctx.syscall(N::Open as usize, &[name])? as i32)
    });
    assert_eq!(kernel.run("openmiss"), -1);
    // Failing a recoverable call is not fatal: no kill message.
    assert!(console(&kernel).contains("openmiss: exit(-1)\n"));
}

#[test]
fn exec_and_wait_reap_once() {
    let kernel = boot();
    install_program(&kernel, "child", |_| Ok(42));
    install_program(&kernel, "parent", |ctx| {
        let cmd = ctx.stack_base();
        cstr(ctx, cmd, "child")?;
        let pid = ctx.syscall(N::Exec as usize, &[cmd])?;
        if pid < 0 {
            return Ok(-20);
        }
        let status = ctx.syscall(N::Wait as usize, &[pid as usize])?;
        let again = ctx.syscall(N::Wait as usize, &[pid as usize])?;
        if again != -1 {
            return Ok(-21);
        }
        Ok(status as i32)
    });
    assert_eq!(kernel.run("parent"), 42);
    assert!(console(&kernel).contains("child: exit(42)\n"));
}

#[test]
fn exec_load_failure_returns_minus_one() {
    let kernel = boot();
    install_program(&kernel, "execfail", |ctx| {
        let cmd = ctx.stack_base();
        cstr(ctx, cmd, "phantom")?;
        Ok(ctx.syscall(N::Exec as usize, &[cmd])? as i32)
    });
    assert_eq!(kernel.run("execfail"), -1);
    // The phantom child never ran, so only the parent announced.
    assert_eq!(console(&kernel), "execfail: exit(-1)\n");
}

#[test]
fn inherited_descriptor_interleaves_concurrent_writes() {
    let kernel = boot();
    install_program(&kernel, "pusher", |ctx| {
        let tag = match ctx.cmdline().split_whitespace().nth(1) {
            Some("a") => b'a',
            _ => b'b',
        };
        let buf = ctx.stack_base();
        ctx.poke(buf, &[tag; 10])?;
        for _ in 0..100 {
            // Descriptor 2 was inherited from the parent.
            if ctx.syscall(N::Write as usize, &[2, buf, 10])? != 10 {
                return Ok(-30);
            }
        }
        Ok(0)
    });
    install_program(&kernel, "spawner", |ctx| {
        let base = ctx.stack_base();
        let name = base;
        cstr(ctx, name, "log")?;
        ctx.syscall(N::Create as usize, &[name, 0])?;
        if ctx.syscall(N::Open as usize, &[name])? != 2 {
            return Ok(-31);
        }

        let (cmd_a, cmd_b) = (base + 0x40, base + 0x60);
        cstr(ctx, cmd_a, "pusher a")?;
        cstr(ctx, cmd_b, "pusher b")?;
        let pid_a = ctx.syscall(N::Exec as usize, &[cmd_a])?;
        let pid_b = ctx.syscall(N::Exec as usize, &[cmd_b])?;
        if pid_a < 0 || pid_b < 0 {
            return Ok(-32);
        }
        let ra = ctx.syscall(N::Wait as usize, &[pid_a as usize])?;
        let rb = ctx.syscall(N::Wait as usize, &[pid_b as usize])?;
        Ok((ra + rb) as i32)
    });

    assert_eq!(kernel.run("spawner"), 0);

    // Both writers' bytes are all present: nothing lost, nothing made
    // up, in whatever interleaving the scheduler produced.
    let f = kernel.fs().open("log", ROOT_SECTOR).unwrap();
    assert_eq!(f.length().unwrap(), 2000);
    let mut out = vec![0u8; 2000];
    assert_eq!(f.read_at(&mut out, 0).unwrap(), 2000);
    assert_eq!(out.iter().filter(|&&b| b == b'a').count(), 1000);
    assert_eq!(out.iter().filter(|&&b| b == b'b').count(), 1000);
}

#[test]
fn mkdir_and_chdir_shape_paths() {
    let kernel = boot();
    install_program(&kernel, "dirs", |ctx| {
        let base = ctx.stack_base();
        let sub = base;
        cstr(ctx, sub, "sub")?;
        if ctx.syscall(N::Mkdir as usize, &[sub])? != 1 {
            return Ok(-40);
        }
        if ctx.syscall(N::Chdir as usize, &[sub])? != 1 {
            return Ok(-41);
        }
        let name = base + 0x40;
        cstr(ctx, name, "inner")?;
        if ctx.syscall(N::Create as usize, &[name, 8])? != 1 {
            return Ok(-42);
        }
        Ok(0)
    });
    assert_eq!(kernel.run("dirs"), 0);
    assert!(kernel.fs().open("/sub/inner", ROOT_SECTOR).is_ok());
}

#[test]
fn remove_syscall_unlinks() {
    let kernel = boot();
    install_program(&kernel, "unlinker", |ctx| {
        let name = ctx.stack_base();
        cstr(ctx, name, "gone")?;
        ctx.syscall(N::Create as usize, &[name, 16])?;
        if ctx.syscall(N::Remove as usize, &[name])? != 1 {
            return Ok(-50);
        }
        // Second removal has nothing to unlink.
        Ok(ctx.syscall(N::Remove as usize, &[name])? as i32)
    });
    assert_eq!(kernel.run("unlinker"), 0);
    assert!(kernel.fs().open("gone", ROOT_SECTOR).is_err());
}

#[test]
fn halt_powers_off() {
    let kernel = boot();
    install_program(&kernel, "plug", |ctx| {
        ctx.syscall(N::Halt as usize, &[])?;
        unreachable!("halt does not return");
    });
    assert_eq!(kernel.run("plug"), 0);
    assert!(kernel.halted());
    // Power-off is silent.
    assert_eq!(console(&kernel), "");
}

#[test]
fn missing_program_fails_silently() {
    let kernel = boot();
    assert_eq!(kernel.run("ghost"), -1);
    assert_eq!(console(&kernel), "");
}

#[test]
fn executable_is_write_protected_while_running() {
    let kernel = boot();
    install_program(&kernel, "selfish", |ctx| {
        let name = ctx.stack_base();
        cstr(ctx, name, "selfish")?;
        let fd = ctx.syscall(N::Open as usize, &[name])? as usize;
        let buf = name + 0x100;
        ctx.poke(buf, &[1, 2, 3, 4])?;
        // Writing one's own image is a no-op while it is running.
        Ok(ctx.syscall(N::Write as usize, &[fd, buf, 4])? as i32)
    });
    assert_eq!(kernel.run("selfish"), 0);
}
