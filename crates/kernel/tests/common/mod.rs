#![allow(dead_code)]

//! Guest program builder for integration tests.
//!
//! Assembles tiny user programs against the syscall ABI: call number in r1,
//! arguments stored on the stack at `sp + 4 + 4n`, result back in r1. By
//! convention here r20 holds the console fd and r5/r6 are scratch.

use machine::isa::encode;
use types::abi::{self, REG_SP};
use types::image::ImageBuilder;

/// Where the data segment of a built program lands.
pub const DATA_BASE: u32 = 0x1000;

/// One syscall argument: an immediate or a register holding the value.
#[derive(Clone, Copy)]
pub enum Arg {
    Imm(u32),
    Reg(usize),
}

pub struct Program {
    code: Vec<u32>,
    data: Vec<u8>,
}

impl Program {
    /// Fresh program with scratch stack space reserved below the exec
    /// argument block.
    pub fn new() -> Self {
        let mut p = Self {
            code: Vec::new(),
            data: Vec::new(),
        };
        p.op(encode::addi(REG_SP, REG_SP, -64));
        p
    }

    pub fn op(&mut self, word: u32) -> &mut Self {
        self.code.push(word);
        self
    }

    /// Current position in instruction words, for branch targets.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn li(&mut self, rd: usize, value: u32) -> &mut Self {
        self.code.extend(encode::li(rd, value));
        self
    }

    /// Append a NUL-terminated string to the data segment.
    pub fn str_data(&mut self, s: &str) -> u32 {
        let addr = DATA_BASE + self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        addr
    }

    /// Reserve zeroed, word-aligned space in the data segment.
    pub fn scratch(&mut self, len: usize) -> u32 {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
        let addr = DATA_BASE + self.data.len() as u32;
        self.data.extend(std::iter::repeat(0).take(len));
        addr
    }

    /// Store args at `sp+4+4n`, load the call number into r1, trap.
    pub fn syscall(&mut self, num: u32, args: &[Arg]) -> &mut Self {
        for (i, arg) in args.iter().enumerate() {
            let off = 4 + 4 * i as i32;
            match *arg {
                Arg::Imm(v) => {
                    self.li(5, v);
                    self.op(encode::sw(5, REG_SP, off));
                }
                Arg::Reg(r) => {
                    self.op(encode::sw(r, REG_SP, off));
                }
            }
        }
        self.li(1, num);
        self.op(encode::sys());
        self
    }

    pub fn syscall_imm(&mut self, num: u32, args: &[u32]) -> &mut Self {
        let args: Vec<Arg> = args.iter().map(|&v| Arg::Imm(v)).collect();
        self.syscall(num, &args)
    }

    /// mknod + open the console device; leaves the fd in r20.
    pub fn open_console(&mut self) -> &mut Self {
        let path = self.str_data("console");
        self.syscall_imm(abi::SYS_MKNOD, &[path, abi::CONSOLE_MAJOR as u32, 0]);
        self.syscall_imm(abi::SYS_OPEN, &[path, abi::O_RDWR]);
        self.op(encode::add(20, 1, 0));
        self
    }

    pub fn write_console(&mut self, buf: Arg, len: u32) -> &mut Self {
        self.syscall(abi::SYS_WRITE, &[Arg::Reg(20), buf, Arg::Imm(len)])
    }

    /// Write a literal string to the console.
    pub fn print(&mut self, s: &str) -> &mut Self {
        let addr = self.str_data(s);
        let len = s.len() as u32;
        self.write_console(Arg::Imm(addr), len)
    }

    pub fn halt(&mut self) -> &mut Self {
        self.syscall(abi::SYS_HALT, &[])
    }

    pub fn exit(&mut self, status: u32) -> &mut Self {
        self.syscall_imm(abi::SYS_EXIT, &[status])
    }

    /// Emit a branch with a dummy offset; returns its index for patching.
    pub fn branch_placeholder(&mut self, word: u32) -> usize {
        let at = self.code.len();
        self.op(word);
        at
    }

    /// Point the branch at `at` to the current position.
    pub fn patch_to_here(&mut self, at: usize) {
        let off = ((self.code.len() - at) * 4) as i32;
        let w = self.code[at];
        self.code[at] = (w & !0x3fff) | ((off as u32) & 0x3fff);
    }

    /// Unconditional jump back to an earlier position.
    pub fn jump_back(&mut self, to: usize) -> &mut Self {
        let off = -(((self.code.len() - to) * 4) as i32);
        self.op(encode::jal(0, off))
    }

    pub fn build(&self) -> Vec<u8> {
        let code = encode::to_bytes(&self.code);
        let mut image = ImageBuilder::new(0).segment(0, code.len() as u32, code);
        if !self.data.is_empty() {
            image = image.segment(DATA_BASE, self.data.len() as u32, self.data.clone());
        }
        image.build()
    }
}

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}
