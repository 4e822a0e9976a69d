//! CPU register state.

/// Program counter plus the 32 general registers. r0 is hardwired to zero;
/// writes to it are dropped.
#[derive(Debug, Clone)]
pub struct Cpu {
    pub pc: u32,
    pub regs: [u32; 32],
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            pc: 0,
            regs: [0; 32],
        }
    }

    pub fn write_reg(&mut self, rd: usize, value: u32) {
        if rd != 0 {
            self.regs[rd] = value;
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
