//! File syscalls: descriptors, the console device, and pipes.
//!
//! Reads and writes that cannot make progress block before any byte moves,
//! so re-issuing the call after a wakeup never duplicates data.

use storage::InodeKind;
use types::abi::{Stat, CONSOLE_MAJOR, O_CREATE, O_RDONLY, O_RDWR, O_WRONLY, T_DEV, T_DIR, T_FILE};

use crate::config::NOFILE;
use crate::file::FileKind;
use crate::kernel::Kernel;
use crate::proc::Channel;
use crate::syscall::{self, Outcome};
use crate::vm;

fn fd_lookup(k: &Kernel, slot: usize, fd: i32) -> Option<usize> {
    if fd < 0 || fd as usize >= NOFILE {
        return None;
    }
    k.ptable.get(slot).files[fd as usize]
}

fn alloc_fd(k: &mut Kernel, slot: usize, file: usize) -> Option<usize> {
    let files = &mut k.ptable.get_mut(slot).files;
    let fd = files.iter().position(|f| f.is_none())?;
    files[fd] = Some(file);
    Some(fd)
}

pub(crate) fn sys_open(k: &mut Kernel, slot: usize) -> Outcome {
    let Ok(path) = syscall::arg_path(k, slot, 0) else {
        return Outcome::Ret(-1);
    };
    let Ok(mode) = syscall::arg_raw(k, slot, 1) else {
        return Outcome::Ret(-1);
    };
    let cwd = k.ptable.get(slot).cwd;

    k.fs.begin_op();
    let ino = if mode & O_CREATE != 0 {
        k.fs.create(cwd, &path, InodeKind::File)
    } else {
        k.fs.namei(cwd, &path)
    };
    let ino = match ino {
        Ok(ino) => ino,
        Err(_) => {
            k.fs.end_op();
            return Outcome::Ret(-1);
        }
    };
    k.fs.ilock(ino);
    let st = k.fs.stati(ino);

    let access = mode & 0x3;
    let readable = access == O_RDONLY || access == O_RDWR;
    let writable = access == O_WRONLY || access == O_RDWR;
    if st.kind == InodeKind::Dir && writable {
        k.fs.iunlockput(ino);
        k.fs.end_op();
        return Outcome::Ret(-1);
    }

    let kind = match st.kind {
        InodeKind::Dev { major, .. } => FileKind::Device { major, ino },
        _ => FileKind::Inode { ino },
    };
    let Some(file) = k.files.alloc(kind, readable, writable) else {
        k.fs.iunlockput(ino);
        k.fs.end_op();
        return Outcome::Ret(-1);
    };
    let Some(fd) = alloc_fd(k, slot, file) else {
        k.files.close(file);
        k.fs.iunlockput(ino);
        k.fs.end_op();
        return Outcome::Ret(-1);
    };
    // The descriptor keeps the namei reference; only the lock is dropped.
    k.fs.iunlock(ino);
    k.fs.end_op();
    Outcome::Ret(fd as i32)
}

pub(crate) fn sys_close(k: &mut Kernel, slot: usize) -> Outcome {
    let Ok(fd) = syscall::arg_int(k, slot, 0) else {
        return Outcome::Ret(-1);
    };
    if fd_lookup(k, slot, fd).is_none() {
        return Outcome::Ret(-1);
    }
    k.close_fd(slot, fd as usize);
    Outcome::Ret(0)
}

pub(crate) fn sys_dup(k: &mut Kernel, slot: usize) -> Outcome {
    let Ok(fd) = syscall::arg_int(k, slot, 0) else {
        return Outcome::Ret(-1);
    };
    let Some(id) = fd_lookup(k, slot, fd) else {
        return Outcome::Ret(-1);
    };
    let Some(new_fd) = alloc_fd(k, slot, id) else {
        return Outcome::Ret(-1);
    };
    k.files.dup(id);
    Outcome::Ret(new_fd as i32)
}

pub(crate) fn sys_read(k: &mut Kernel, slot: usize) -> Outcome {
    let (Ok(fd), Ok(buf), Ok(n)) = (
        syscall::arg_int(k, slot, 0),
        syscall::arg_raw(k, slot, 1),
        syscall::arg_int(k, slot, 2),
    ) else {
        return Outcome::Ret(-1);
    };
    if n < 0 {
        return Outcome::Ret(-1);
    }
    let Some(id) = fd_lookup(k, slot, fd) else {
        return Outcome::Ret(-1);
    };
    let (kind, readable, offset) = {
        let f = k.files.get(id);
        (f.kind, f.readable, f.offset)
    };
    if !readable {
        return Outcome::Ret(-1);
    }
    let space = syscall::proc_space(k, slot);
    // Refuse the range before sizing any staging buffer off `n`.
    if vm::check_user_range(&space, buf, n as usize).is_err() {
        return Outcome::Ret(-1);
    }

    match kind {
        FileKind::Inode { ino } => {
            let mut data = vec![0u8; n as usize];
            k.fs.ilock(ino);
            let r = k.fs.readi(ino, offset, &mut data);
            k.fs.iunlock(ino);
            let r = match r {
                Ok(r) => r,
                Err(_) => return Outcome::Ret(-1),
            };
            if vm::copy_out(&mut k.machine.mem, &space, buf, &data[..r]).is_err() {
                return Outcome::Ret(-1);
            }
            k.files.get_mut(id).offset = offset + r as u32;
            Outcome::Ret(r as i32)
        }
        FileKind::Device { major, .. } => {
            if major != CONSOLE_MAJOR {
                return Outcome::Ret(-1);
            }
            if !k.console.has_input() {
                if k.ptable.get(slot).killed {
                    return Outcome::Ret(-1);
                }
                return Outcome::Block(Channel::ConsoleInput);
            }
            let data = k.console.read(n as usize);
            if vm::copy_out(&mut k.machine.mem, &space, buf, &data).is_err() {
                return Outcome::Ret(-1);
            }
            Outcome::Ret(data.len() as i32)
        }
        FileKind::Pipe { pipe, .. } => {
            if k.pipes.get(pipe).is_empty() {
                if !k.pipes.get(pipe).write_open {
                    // Writers are gone: end of stream.
                    return Outcome::Ret(0);
                }
                if k.ptable.get(slot).killed {
                    return Outcome::Ret(-1);
                }
                return Outcome::Block(Channel::PipeRead(pipe));
            }
            let data = k.pipes.get_mut(pipe).pop(n as usize);
            if vm::copy_out(&mut k.machine.mem, &space, buf, &data).is_err() {
                return Outcome::Ret(-1);
            }
            k.ptable.wakeup(Channel::PipeWrite(pipe));
            Outcome::Ret(data.len() as i32)
        }
    }
}

pub(crate) fn sys_write(k: &mut Kernel, slot: usize) -> Outcome {
    let (Ok(fd), Ok(buf), Ok(n)) = (
        syscall::arg_int(k, slot, 0),
        syscall::arg_raw(k, slot, 1),
        syscall::arg_int(k, slot, 2),
    ) else {
        return Outcome::Ret(-1);
    };
    if n < 0 {
        return Outcome::Ret(-1);
    }
    let Some(id) = fd_lookup(k, slot, fd) else {
        return Outcome::Ret(-1);
    };
    let (kind, writable, offset) = {
        let f = k.files.get(id);
        (f.kind, f.writable, f.offset)
    };
    if !writable {
        return Outcome::Ret(-1);
    }
    let space = syscall::proc_space(k, slot);
    // Refuse the range before sizing any staging buffer off `n`.
    if vm::check_user_range(&space, buf, n as usize).is_err() {
        return Outcome::Ret(-1);
    }

    match kind {
        FileKind::Inode { ino } => {
            let mut data = vec![0u8; n as usize];
            if vm::copy_in(&k.machine.mem, &space, buf, &mut data).is_err() {
                return Outcome::Ret(-1);
            }
            k.fs.begin_op();
            k.fs.ilock(ino);
            let r = k.fs.writei(ino, offset, &data);
            k.fs.iunlock(ino);
            k.fs.end_op();
            match r {
                Ok(r) => {
                    k.files.get_mut(id).offset = offset + r as u32;
                    Outcome::Ret(r as i32)
                }
                Err(_) => Outcome::Ret(-1),
            }
        }
        FileKind::Device { major, .. } => {
            if major != CONSOLE_MAJOR {
                return Outcome::Ret(-1);
            }
            let mut data = vec![0u8; n as usize];
            if vm::copy_in(&k.machine.mem, &space, buf, &mut data).is_err() {
                return Outcome::Ret(-1);
            }
            for b in data {
                k.machine.serial_transmit(b);
            }
            Outcome::Ret(n)
        }
        FileKind::Pipe { pipe, .. } => {
            if !k.pipes.get(pipe).read_open {
                // No reader will ever drain this.
                return Outcome::Ret(-1);
            }
            let room = k.pipes.get(pipe).space();
            if room == 0 {
                if k.ptable.get(slot).killed {
                    return Outcome::Ret(-1);
                }
                return Outcome::Block(Channel::PipeWrite(pipe));
            }
            let take = (n as usize).min(room);
            let mut data = vec![0u8; take];
            if vm::copy_in(&k.machine.mem, &space, buf, &mut data).is_err() {
                return Outcome::Ret(-1);
            }
            let pushed = k.pipes.get_mut(pipe).push(&data);
            k.ptable.wakeup(Channel::PipeRead(pipe));
            Outcome::Ret(pushed as i32)
        }
    }
}

pub(crate) fn sys_fstat(k: &mut Kernel, slot: usize) -> Outcome {
    let (Ok(fd), Ok(ptr)) = (
        syscall::arg_int(k, slot, 0),
        syscall::arg_raw(k, slot, 1),
    ) else {
        return Outcome::Ret(-1);
    };
    let Some(id) = fd_lookup(k, slot, fd) else {
        return Outcome::Ret(-1);
    };
    let ino = match k.files.get(id).kind {
        FileKind::Inode { ino } | FileKind::Device { ino, .. } => ino,
        FileKind::Pipe { .. } => return Outcome::Ret(-1),
    };
    let st = k.fs.stati(ino);
    let stat = Stat {
        kind: match st.kind {
            InodeKind::Dir => T_DIR,
            InodeKind::File => T_FILE,
            InodeKind::Dev { .. } => T_DEV,
        },
        ino: st.ino,
        size: st.size,
        nlink: st.nlink,
    };
    let space = syscall::proc_space(k, slot);
    if vm::copy_out(&mut k.machine.mem, &space, ptr, &stat.to_bytes()).is_err() {
        return Outcome::Ret(-1);
    }
    Outcome::Ret(0)
}

pub(crate) fn sys_mknod(k: &mut Kernel, slot: usize) -> Outcome {
    let (Ok(path), Ok(major), Ok(minor)) = (
        syscall::arg_path(k, slot, 0),
        syscall::arg_int(k, slot, 1),
        syscall::arg_int(k, slot, 2),
    ) else {
        return Outcome::Ret(-1);
    };
    let cwd = k.ptable.get(slot).cwd;
    k.fs.begin_op();
    let r = k.fs.create(
        cwd,
        &path,
        InodeKind::Dev {
            major: major as u16,
            minor: minor as u16,
        },
    );
    let out = match r {
        Ok(ino) => {
            k.fs.iput(ino);
            Outcome::Ret(0)
        }
        Err(_) => Outcome::Ret(-1),
    };
    k.fs.end_op();
    out
}

pub(crate) fn sys_mkdir(k: &mut Kernel, slot: usize) -> Outcome {
    let Ok(path) = syscall::arg_path(k, slot, 0) else {
        return Outcome::Ret(-1);
    };
    let cwd = k.ptable.get(slot).cwd;
    k.fs.begin_op();
    let out = match k.fs.create(cwd, &path, InodeKind::Dir) {
        Ok(ino) => {
            k.fs.iput(ino);
            Outcome::Ret(0)
        }
        Err(_) => Outcome::Ret(-1),
    };
    k.fs.end_op();
    out
}

pub(crate) fn sys_chdir(k: &mut Kernel, slot: usize) -> Outcome {
    let Ok(path) = syscall::arg_path(k, slot, 0) else {
        return Outcome::Ret(-1);
    };
    let cwd = k.ptable.get(slot).cwd;
    let ino = match k.fs.namei(cwd, &path) {
        Ok(ino) => ino,
        Err(_) => return Outcome::Ret(-1),
    };
    if k.fs.stati(ino).kind != InodeKind::Dir {
        k.fs.iput(ino);
        return Outcome::Ret(-1);
    }
    k.ptable.get_mut(slot).cwd = ino;
    k.fs.iput(cwd);
    Outcome::Ret(0)
}

pub(crate) fn sys_unlink(k: &mut Kernel, slot: usize) -> Outcome {
    let Ok(path) = syscall::arg_path(k, slot, 0) else {
        return Outcome::Ret(-1);
    };
    let cwd = k.ptable.get(slot).cwd;
    k.fs.begin_op();
    let r = k.fs.unlink(cwd, &path);
    k.fs.end_op();
    match r {
        Ok(()) => Outcome::Ret(0),
        Err(_) => Outcome::Ret(-1),
    }
}

pub(crate) fn sys_link(k: &mut Kernel, slot: usize) -> Outcome {
    let (Ok(old), Ok(new)) = (
        syscall::arg_path(k, slot, 0),
        syscall::arg_path(k, slot, 1),
    ) else {
        return Outcome::Ret(-1);
    };
    let cwd = k.ptable.get(slot).cwd;
    k.fs.begin_op();
    let r = k.fs.link(cwd, &old, &new);
    k.fs.end_op();
    match r {
        Ok(()) => Outcome::Ret(0),
        Err(_) => Outcome::Ret(-1),
    }
}

pub(crate) fn sys_pipe(k: &mut Kernel, slot: usize) -> Outcome {
    let Ok(ptr) = syscall::arg_raw(k, slot, 0) else {
        return Outcome::Ret(-1);
    };
    let pipe = k.pipes.alloc();
    let release_pipe = |k: &mut Kernel| {
        k.pipes.close_end(pipe, false);
        k.pipes.close_end(pipe, true);
    };

    let Some(rfile) = k.files.alloc(
        FileKind::Pipe { pipe, write_end: false },
        true,
        false,
    ) else {
        release_pipe(k);
        return Outcome::Ret(-1);
    };
    let Some(wfile) = k.files.alloc(
        FileKind::Pipe { pipe, write_end: true },
        false,
        true,
    ) else {
        k.files.close(rfile);
        release_pipe(k);
        return Outcome::Ret(-1);
    };
    let Some(rfd) = alloc_fd(k, slot, rfile) else {
        k.files.close(rfile);
        k.files.close(wfile);
        release_pipe(k);
        return Outcome::Ret(-1);
    };
    let Some(wfd) = alloc_fd(k, slot, wfile) else {
        k.ptable.get_mut(slot).files[rfd] = None;
        k.files.close(rfile);
        k.files.close(wfile);
        release_pipe(k);
        return Outcome::Ret(-1);
    };

    let space = syscall::proc_space(k, slot);
    let words = [rfd as u32, wfd as u32];
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&words[0].to_le_bytes());
    bytes[4..].copy_from_slice(&words[1].to_le_bytes());
    if vm::copy_out(&mut k.machine.mem, &space, ptr, &bytes).is_err() {
        k.close_fd(slot, rfd);
        k.close_fd(slot, wfd);
        return Outcome::Ret(-1);
    }
    Outcome::Ret(0)
}
