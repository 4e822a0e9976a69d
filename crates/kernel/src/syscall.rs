//! Syscall gateway: argument fetch, dispatch, and outcome application.
//!
//! The call number arrives in r1; arguments live on the user stack at
//! `sp + ARG_BASE + 4n` and are fetched through the process's own page
//! table, so a bad pointer fails the call instead of touching kernel state.

use log::warn;
use types::abi::{self, ARG_BASE, INSTRUCTION_BYTES, REG_RET, REG_SP};

use crate::config::MAX_PATH;
use crate::kernel::{Kernel, TrapFlow};
use crate::proc::{Channel, ProcState};
use crate::vm::{self, VmError};
use crate::{exec, sysfile, sysproc};

/// What a syscall handler decided; the dispatcher turns this into process
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Return a value in r1 and resume after the `sys` instruction.
    Ret(i32),
    /// Sleep on a channel and re-issue the syscall when woken.
    Block(Channel),
    /// The process is done.
    Exit(i32),
    /// Exec replaced the register frame; resume it untouched.
    Exec,
    /// Stop the whole machine.
    Halt,
}

pub(crate) fn dispatch(k: &mut Kernel, slot: usize) -> Outcome {
    let num = k.ptable.get(slot).frame.regs[REG_RET];
    match num {
        abi::SYS_FORK => sysproc::sys_fork(k, slot),
        abi::SYS_EXIT => sysproc::sys_exit(k, slot),
        abi::SYS_WAIT => sysproc::sys_wait(k, slot),
        abi::SYS_PIPE => sysfile::sys_pipe(k, slot),
        abi::SYS_READ => sysfile::sys_read(k, slot),
        abi::SYS_KILL => sysproc::sys_kill(k, slot),
        abi::SYS_EXEC => exec::sys_exec(k, slot),
        abi::SYS_FSTAT => sysfile::sys_fstat(k, slot),
        abi::SYS_CHDIR => sysfile::sys_chdir(k, slot),
        abi::SYS_DUP => sysfile::sys_dup(k, slot),
        abi::SYS_GETPID => sysproc::sys_getpid(k, slot),
        abi::SYS_SBRK => sysproc::sys_sbrk(k, slot),
        abi::SYS_SLEEP => sysproc::sys_sleep(k, slot),
        abi::SYS_UPTIME => sysproc::sys_uptime(k, slot),
        abi::SYS_OPEN => sysfile::sys_open(k, slot),
        abi::SYS_WRITE => sysfile::sys_write(k, slot),
        abi::SYS_MKNOD => sysfile::sys_mknod(k, slot),
        abi::SYS_UNLINK => sysfile::sys_unlink(k, slot),
        abi::SYS_LINK => sysfile::sys_link(k, slot),
        abi::SYS_MKDIR => sysfile::sys_mkdir(k, slot),
        abi::SYS_CLOSE => sysfile::sys_close(k, slot),
        abi::SYS_HALT => sysproc::sys_halt(k, slot),
        _ => {
            // An out-of-range number means the process is off the rails;
            // flag it for termination rather than limping on.
            let p = k.ptable.get_mut(slot);
            warn!("pid {} ({}): unknown syscall {}", p.pid, p.name, num as i32);
            p.killed = true;
            Outcome::Ret(-1)
        }
    }
}

pub(crate) fn apply_outcome(k: &mut Kernel, slot: usize, epc: u32, outcome: Outcome) -> TrapFlow {
    match outcome {
        Outcome::Ret(val) => {
            let p = k.ptable.get_mut(slot);
            p.frame.regs[REG_RET] = val as u32;
            p.frame.pc = epc;
            TrapFlow::Continue
        }
        Outcome::Block(chan) => {
            let p = k.ptable.get_mut(slot);
            p.state = ProcState::Sleeping;
            p.chan = Some(chan);
            // Rewind onto the `sys` instruction; the wakeup re-issues it.
            p.frame.pc = epc.wrapping_sub(INSTRUCTION_BYTES);
            TrapFlow::Continue
        }
        Outcome::Exit(status) => {
            k.exit_process(slot, status);
            TrapFlow::Continue
        }
        Outcome::Exec => TrapFlow::Continue,
        Outcome::Halt => TrapFlow::Halt,
    }
}

/// Raw word of syscall argument `n`.
pub(crate) fn arg_raw(k: &Kernel, slot: usize, n: usize) -> Result<u32, VmError> {
    let p = k.ptable.get(slot);
    let space = p.space.as_ref().expect("syscall without a space");
    let sp = p.frame.regs[REG_SP];
    let addr = sp
        .wrapping_add(ARG_BASE)
        .wrapping_add((n as u32) * 4);
    vm::copy_in_u32(&k.machine.mem, space, addr)
}

pub(crate) fn arg_int(k: &Kernel, slot: usize, n: usize) -> Result<i32, VmError> {
    arg_raw(k, slot, n).map(|v| v as i32)
}

/// Fetch argument `n` as a pointer to a NUL-terminated string.
pub(crate) fn arg_str(k: &Kernel, slot: usize, n: usize, max: usize) -> Result<String, VmError> {
    let ptr = arg_raw(k, slot, n)?;
    let p = k.ptable.get(slot);
    let space = p.space.as_ref().expect("syscall without a space");
    vm::copy_in_str(&k.machine.mem, space, ptr, max)
}

pub(crate) fn arg_path(k: &Kernel, slot: usize, n: usize) -> Result<String, VmError> {
    arg_str(k, slot, n, MAX_PATH)
}

/// Address space of the current process.
pub(crate) fn proc_space(k: &Kernel, slot: usize) -> vm::AddressSpace {
    *k.ptable
        .get(slot)
        .space
        .as_ref()
        .expect("syscall without a space")
}
