//! A small preemptive-multitasking kernel for the simulated machine.
//!
//! The kernel runs natively and drives user programs on the [`machine`]
//! crate's CPU: it installs an address space and register frame, lets the
//! machine run until a trap, and handles the trap — syscall, timer tick,
//! device interrupt, or fault — before picking the next runnable process.

pub mod config;
pub mod console;
pub mod exec;
pub mod file;
pub mod kalloc;
pub mod kernel;
pub mod pipe;
pub mod proc;
pub mod syscall;
pub mod sysfile;
pub mod sysproc;
pub mod trap;
pub mod vm;

pub use config::KernelConfig;
pub use exec::ExecError;
pub use kernel::{Kernel, KernelError, RunExit};
pub use proc::{Channel, ProcState};
pub use vm::{AddressSpace, VmError};
