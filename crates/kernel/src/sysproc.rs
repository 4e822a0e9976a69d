//! Process syscalls.

use log::info;
use types::abi::REG_RET;

use crate::kalloc::KernelPager;
use crate::kernel::Kernel;
use crate::proc::{Channel, ProcState};
use crate::syscall::{self, Outcome};
use crate::vm;

pub(crate) fn sys_fork(k: &mut Kernel, slot: usize) -> Outcome {
    let Some(child) = k.ptable.alloc(Some(slot)) else {
        return Outcome::Ret(-1);
    };

    let parent_space = *k.ptable.get(slot).space.as_ref().expect("fork without a space");
    let mut pager = KernelPager {
        mem: &mut k.machine.mem,
        frames: &mut k.frames,
    };
    let child_space = match vm::duplicate(&mut pager, &parent_space) {
        Ok(space) => space,
        Err(_) => {
            k.ptable.release(child);
            return Outcome::Ret(-1);
        }
    };

    // Same frame as the parent, but fork returns 0 in the child.
    let mut frame = k.ptable.get(slot).frame;
    frame.regs[REG_RET] = 0;
    let files = k.ptable.get(slot).files;
    for id in files.into_iter().flatten() {
        k.files.dup(id);
    }
    let cwd = k.ptable.get(slot).cwd;
    let cwd = k.fs.idup(cwd);
    let name = k.ptable.get(slot).name.clone();

    let p = k.ptable.get_mut(child);
    p.space = Some(child_space);
    p.frame = frame;
    p.files = files;
    p.cwd = cwd;
    p.name = name;
    p.state = ProcState::Runnable;
    let child_pid = p.pid;

    Outcome::Ret(child_pid as i32)
}

pub(crate) fn sys_exit(k: &mut Kernel, slot: usize) -> Outcome {
    let status = syscall::arg_int(k, slot, 0).unwrap_or(-1);
    Outcome::Exit(status)
}

pub(crate) fn sys_wait(k: &mut Kernel, slot: usize) -> Outcome {
    let Ok(status_ptr) = syscall::arg_raw(k, slot, 0) else {
        return Outcome::Ret(-1);
    };

    let children = k.ptable.children_of(slot);
    if children.is_empty() {
        return Outcome::Ret(-1);
    }
    for child in children {
        if k.ptable.get(child).state != ProcState::Zombie {
            continue;
        }
        let pid = k.ptable.get(child).pid;
        let status = k.ptable.get(child).exit_status;
        // Status pointer zero means the caller does not care.
        if status_ptr != 0 {
            let space = syscall::proc_space(k, slot);
            if vm::copy_out_u32(&mut k.machine.mem, &space, status_ptr, status as u32).is_err() {
                return Outcome::Ret(-1);
            }
        }
        // Reaping is what finally frees the zombie's memory.
        k.release_process(child);
        return Outcome::Ret(pid as i32);
    }

    if k.ptable.get(slot).killed {
        return Outcome::Ret(-1);
    }
    Outcome::Block(Channel::Wait(slot))
}

pub(crate) fn sys_kill(k: &mut Kernel, slot: usize) -> Outcome {
    let Ok(pid) = syscall::arg_int(k, slot, 0) else {
        return Outcome::Ret(-1);
    };
    if pid <= 0 || !k.ptable.kill(pid as u32) {
        return Outcome::Ret(-1);
    }
    Outcome::Ret(0)
}

pub(crate) fn sys_getpid(k: &mut Kernel, slot: usize) -> Outcome {
    Outcome::Ret(k.ptable.get(slot).pid as i32)
}

pub(crate) fn sys_sbrk(k: &mut Kernel, slot: usize) -> Outcome {
    let Ok(n) = syscall::arg_int(k, slot, 0) else {
        return Outcome::Ret(-1);
    };
    // The break only moves up; releasing memory is not supported.
    if n < 0 {
        return Outcome::Ret(-1);
    }
    let mut space = *k.ptable.get(slot).space.as_ref().expect("sbrk without a space");
    let old = space.size;
    let Some(new_size) = old.checked_add(n as u32) else {
        return Outcome::Ret(-1);
    };
    let mut pager = KernelPager {
        mem: &mut k.machine.mem,
        frames: &mut k.frames,
    };
    if vm::grow(&mut pager, &mut space, new_size).is_err() {
        return Outcome::Ret(-1);
    }
    k.ptable.get_mut(slot).space = Some(space);
    Outcome::Ret(old as i32)
}

pub(crate) fn sys_sleep(k: &mut Kernel, slot: usize) -> Outcome {
    let Ok(n) = syscall::arg_int(k, slot, 0) else {
        return Outcome::Ret(-1);
    };
    if n < 0 {
        return Outcome::Ret(-1);
    }
    if k.ptable.get(slot).killed {
        k.ptable.get_mut(slot).sleep_deadline = None;
        return Outcome::Ret(-1);
    }
    // A woken sleeper re-issues the call; the stored deadline keeps the
    // original end time instead of restarting the interval.
    match k.ptable.get(slot).sleep_deadline {
        Some(deadline) if k.ticks >= deadline => {
            k.ptable.get_mut(slot).sleep_deadline = None;
            Outcome::Ret(0)
        }
        Some(_) => Outcome::Block(Channel::Ticks),
        None => {
            if n == 0 {
                return Outcome::Ret(0);
            }
            k.ptable.get_mut(slot).sleep_deadline = Some(k.ticks + n as u64);
            Outcome::Block(Channel::Ticks)
        }
    }
}

pub(crate) fn sys_uptime(k: &mut Kernel, slot: usize) -> Outcome {
    let _ = slot;
    Outcome::Ret(k.ticks as i32)
}

pub(crate) fn sys_halt(k: &mut Kernel, slot: usize) -> Outcome {
    info!("halt requested by pid {}", k.ptable.get(slot).pid);
    Outcome::Halt
}
