//! Sizing constants and boot-time configuration.

/// Process table slots.
pub const NPROC: usize = 64;

/// Per-process open file descriptors.
pub const NOFILE: usize = 16;

/// System-wide open file table entries.
pub const NFILE: usize = 100;

/// Pipe ring buffer capacity in bytes.
pub const PIPE_SIZE: usize = 512;

/// Pages mapped for a fresh user stack.
pub const USER_STACK_PAGES: u32 = 1;

/// Longest path accepted from userspace.
pub const MAX_PATH: usize = 128;

/// Longest string argument accepted from userspace.
pub const MAX_STR: usize = 256;

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Physical memory size in 4 KiB frames.
    pub phys_frames: usize,
    /// Instructions between timer ticks; zero disables preemption.
    pub timer_interval: u32,
    /// Stop the scheduler after this many ticks; `None` runs to completion.
    pub tick_budget: Option<u64>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            phys_frames: 1024,
            timer_interval: 10_000,
            tick_budget: None,
        }
    }
}
