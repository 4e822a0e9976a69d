//! Trap reporting: why control left user execution, and where to resume.

use core::fmt;

/// Cause code latched by the hardware when a trap fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// Explicit `sys` instruction.
    Syscall,
    /// Interval timer tick.
    Timer,
    /// Serial line has a received byte pending.
    Serial,
    /// A device raised an interrupt nothing claims.
    Spurious,
    /// Translation failed or the access violated page permissions.
    PageFault,
    /// The fetched word does not decode.
    IllegalInstruction,
}

/// Privilege the core held when the trap fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Supervisor,
}

/// Hardware trap state handed to the dispatcher.
///
/// EPC contract: for `Cause::Syscall` it already holds the address of the
/// instruction after the trapping one; for every other cause it holds the
/// address of the last completed (or faulting) instruction, and the kernel
/// adds the fixed instruction width before resuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    pub cause: Cause,
    pub epc: u32,
    /// Faulting address (page faults) or undecodable word (illegal
    /// instruction); zero otherwise.
    pub tval: u32,
    pub privilege: Privilege,
}

/// User-visible register snapshot saved at trap entry and restored on
/// resume. Opaque to everything but the context-switch primitive and the
/// few syscalls that edit the resume PC/SP.
#[derive(Clone, Copy)]
pub struct TrapFrame {
    pub regs: [u32; 32],
    pub pc: u32,
}

impl TrapFrame {
    pub fn zeroed() -> Self {
        Self {
            regs: [0; 32],
            pc: 0,
        }
    }
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrapFrame")
            .field("pc", &format_args!("0x{:08x}", self.pc))
            .field("sp", &format_args!("0x{:08x}", self.regs[types::abi::REG_SP]))
            .finish()
    }
}
