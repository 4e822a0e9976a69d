//! User trap dispatch.
//!
//! The machine latches the syscall EPC as the address after the `sys`
//! instruction, but every other cause reports the last completed (or
//! faulting) instruction, so those get a uniform +4 before the process can
//! resume. A blocked syscall instead rewinds to the `sys` itself; waking the
//! process re-issues the call, which re-checks its condition.

use log::debug;
use machine::{Cause, Trap};
use types::abi::INSTRUCTION_BYTES;

use crate::kernel::{Kernel, TrapFlow};
use crate::proc::ProcState;
use crate::syscall;

pub(crate) fn handle_user_trap(k: &mut Kernel, slot: usize, trap: Trap) -> TrapFlow {
    match trap.cause {
        Cause::Syscall => {
            // Default resume point: the instruction after `sys`.
            k.ptable.get_mut(slot).frame.pc = trap.epc;
            if k.ptable.get(slot).killed {
                k.exit_process(slot, -1);
                return TrapFlow::Continue;
            }
            let outcome = syscall::dispatch(k, slot);
            syscall::apply_outcome(k, slot, trap.epc, outcome)
        }
        Cause::Timer => {
            k.ptable.get_mut(slot).frame.pc = trap.epc.wrapping_add(INSTRUCTION_BYTES);
            k.clock_tick();
            // Preempt: back of the run queue.
            let p = k.ptable.get_mut(slot);
            if p.state == ProcState::Running {
                p.state = ProcState::Runnable;
            }
            TrapFlow::Continue
        }
        Cause::Serial => {
            k.ptable.get_mut(slot).frame.pc = trap.epc.wrapping_add(INSTRUCTION_BYTES);
            k.drain_serial();
            TrapFlow::Continue
        }
        Cause::Spurious => {
            k.ptable.get_mut(slot).frame.pc = trap.epc.wrapping_add(INSTRUCTION_BYTES);
            debug!("spurious interrupt, pid {}", k.ptable.get(slot).pid);
            TrapFlow::Continue
        }
        Cause::PageFault | Cause::IllegalInstruction => {
            k.warn_fault(slot, &trap);
            k.exit_process(slot, -1);
            TrapFlow::Continue
        }
    }
}
