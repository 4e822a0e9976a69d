//! The numeric ABI between user programs and the kernel.
//!
//! A program traps with the call number in r1 and arguments pushed on its
//! stack one word above the saved return address: argument `n` lives at
//! `sp + ARG_BASE + 4 * n`. The result comes back in r1; any negative value
//! means the call failed with no side effect.

/// Register carrying the syscall number in and the result out.
pub const REG_RET: usize = 1;
/// User stack pointer register.
pub const REG_SP: usize = 30;
/// Link register.
pub const REG_RA: usize = 31;

/// Byte offset from the saved stack pointer to syscall argument 0.
pub const ARG_BASE: u32 = 4;

/// Fixed instruction width of the machine.
pub const INSTRUCTION_BYTES: u32 = 4;

/// Maximum number of exec arguments.
pub const MAX_ARG: usize = 16;

pub const SYS_FORK: u32 = 1;
pub const SYS_EXIT: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_PIPE: u32 = 4;
pub const SYS_READ: u32 = 5;
pub const SYS_KILL: u32 = 6;
pub const SYS_EXEC: u32 = 7;
pub const SYS_FSTAT: u32 = 8;
pub const SYS_CHDIR: u32 = 9;
pub const SYS_DUP: u32 = 10;
pub const SYS_GETPID: u32 = 11;
pub const SYS_SBRK: u32 = 12;
pub const SYS_SLEEP: u32 = 13;
pub const SYS_UPTIME: u32 = 14;
pub const SYS_OPEN: u32 = 15;
pub const SYS_WRITE: u32 = 16;
pub const SYS_MKNOD: u32 = 17;
pub const SYS_UNLINK: u32 = 18;
pub const SYS_LINK: u32 = 19;
pub const SYS_MKDIR: u32 = 20;
pub const SYS_CLOSE: u32 = 21;
/// Stops the machine; the scheduler loop exits.
pub const SYS_HALT: u32 = 22;

pub const O_RDONLY: u32 = 0x000;
pub const O_WRONLY: u32 = 0x001;
pub const O_RDWR: u32 = 0x002;
pub const O_CREATE: u32 = 0x200;

/// Device major number of the serial console.
pub const CONSOLE_MAJOR: u16 = 1;

/// Inode kind reported by `fstat` and stored by the filesystem.
pub const T_DIR: u16 = 1;
pub const T_FILE: u16 = 2;
pub const T_DEV: u16 = 3;

/// Record copied out by `fstat`: four little-endian u32 words
/// (kind, inode number, byte size, link count).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub kind: u16,
    pub ino: u32,
    pub size: u32,
    pub nlink: u16,
}

/// Encoded byte length of a `Stat`.
pub const STAT_LEN: usize = 16;

impl Stat {
    pub fn to_bytes(self) -> [u8; STAT_LEN] {
        let mut out = [0u8; STAT_LEN];
        out[0..4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        out[4..8].copy_from_slice(&self.ino.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..16].copy_from_slice(&(self.nlink as u32).to_le_bytes());
        out
    }
}
