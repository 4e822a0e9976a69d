//! The simulated machine: a single-core 32-bit load/store CPU with paged
//! virtual memory, an interval timer, and a serial line.
//!
//! Only user code executes here. The kernel runs natively: it installs an
//! address-space root, loads a register frame, and calls [`Machine::run`],
//! which executes instructions until something traps, then hands back a
//! [`Trap`] describing why. Saving and reloading the frame around each run is
//! the context-switch primitive the kernel builds its scheduler on.

pub mod cpu;
pub mod isa;
pub mod memory;
pub mod trap;

use std::collections::VecDeque;

use log::{debug, trace};
use types::pagetable::{self, UserAccess};

pub use cpu::Cpu;
pub use memory::PhysMemory;
pub use trap::{Cause, Privilege, Trap, TrapFrame};

use isa::Instruction;

enum Exception {
    PageFault { va: u32 },
}

pub struct Machine {
    pub mem: PhysMemory,
    cpu: Cpu,
    root: Option<u32>,
    intr_enabled: bool,
    /// Instructions per timer tick; zero disables the timer.
    timer_interval: u32,
    timer_countdown: u32,
    timer_pending: bool,
    spurious_pending: bool,
    serial_rx: VecDeque<u8>,
    serial_tx: Vec<u8>,
}

impl Machine {
    pub fn new(phys_frames: usize, timer_interval: u32) -> Self {
        Self {
            mem: PhysMemory::new(phys_frames),
            cpu: Cpu::new(),
            root: None,
            intr_enabled: true,
            timer_interval,
            timer_countdown: timer_interval,
            timer_pending: false,
            spurious_pending: false,
            serial_rx: VecDeque::new(),
            serial_tx: Vec::new(),
        }
    }

    /// Make `root` the active translation root. The caller masks interrupts
    /// around this so no trap can observe a half-switched root/frame pair.
    pub fn install_root(&mut self, root: u32) {
        self.root = Some(root);
    }

    pub fn active_root(&self) -> Option<u32> {
        self.root
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.intr_enabled
    }

    pub fn set_interrupts(&mut self, enabled: bool) {
        self.intr_enabled = enabled;
    }

    pub fn load_frame(&mut self, frame: &TrapFrame) {
        self.cpu.regs = frame.regs;
        self.cpu.regs[0] = 0;
        self.cpu.pc = frame.pc;
    }

    pub fn save_frame(&self) -> TrapFrame {
        TrapFrame {
            regs: self.cpu.regs,
            pc: self.cpu.pc,
        }
    }

    /// Queue bytes on the serial receive line; each pending byte raises an
    /// interrupt until the kernel drains it.
    pub fn serial_input(&mut self, bytes: &[u8]) {
        self.serial_rx.extend(bytes);
    }

    pub fn serial_take_byte(&mut self) -> Option<u8> {
        self.serial_rx.pop_front()
    }

    pub fn serial_transmit(&mut self, byte: u8) {
        self.serial_tx.push(byte);
    }

    pub fn serial_output(&self) -> &[u8] {
        &self.serial_tx
    }

    /// Raise an interrupt no device claims (test hook for the ignore path).
    pub fn inject_spurious(&mut self) {
        self.spurious_pending = true;
    }

    /// Execute user instructions until a trap fires.
    pub fn run(&mut self) -> Trap {
        loop {
            if let Some(t) = self.take_pending_irq(Privilege::User) {
                return t;
            }

            let iaddr = self.cpu.pc;
            let word = match self.fetch_word(iaddr) {
                Ok(word) => word,
                Err(Exception::PageFault { va }) => {
                    return self.user_trap(Cause::PageFault, iaddr, va)
                }
            };
            let instr = match isa::decode(word) {
                Some(instr) => instr,
                None => {
                    debug!(
                        "undecodable instruction at 0x{:08x}: {}",
                        iaddr,
                        hex::encode(word.to_le_bytes())
                    );
                    return self.user_trap(Cause::IllegalInstruction, iaddr, word);
                }
            };
            self.cpu.pc = iaddr.wrapping_add(4);

            match self.execute(instr, iaddr) {
                Ok(false) => {}
                Ok(true) => {
                    // EPC already points past the sys instruction.
                    return self.user_trap(Cause::Syscall, self.cpu.pc, 0);
                }
                Err(Exception::PageFault { va }) => {
                    return self.user_trap(Cause::PageFault, iaddr, va)
                }
            }

            self.advance_timer();
        }
    }

    /// Idle until an interrupt is pending. Used by the scheduler when no
    /// process is runnable; traps report supervisor privilege because the
    /// core was not executing user code.
    pub fn wait_for_interrupt(&mut self) -> Trap {
        loop {
            if let Some(t) = self.take_pending_irq(Privilege::Supervisor) {
                return t;
            }
            if self.timer_interval == 0 && self.serial_rx.is_empty() && !self.spurious_pending {
                panic!("idle with no interrupt source");
            }
            self.advance_timer();
        }
    }

    fn take_pending_irq(&mut self, privilege: Privilege) -> Option<Trap> {
        if !self.intr_enabled {
            return None;
        }
        let cause = if self.timer_pending {
            self.timer_pending = false;
            Cause::Timer
        } else if !self.serial_rx.is_empty() {
            Cause::Serial
        } else if self.spurious_pending {
            self.spurious_pending = false;
            Cause::Spurious
        } else {
            return None;
        };
        // Interrupt EPC reports the last completed instruction; the kernel's
        // uniform +4 fixup lands back on the current PC.
        let epc = match privilege {
            Privilege::User => self.cpu.pc.wrapping_sub(4),
            Privilege::Supervisor => 0,
        };
        trace!("irq {:?} epc=0x{:08x}", cause, epc);
        Some(Trap {
            cause,
            epc,
            tval: 0,
            privilege,
        })
    }

    fn advance_timer(&mut self) {
        if self.timer_interval == 0 {
            return;
        }
        self.timer_countdown -= 1;
        if self.timer_countdown == 0 {
            self.timer_pending = true;
            self.timer_countdown = self.timer_interval;
        }
    }

    fn user_trap(&self, cause: Cause, epc: u32, tval: u32) -> Trap {
        trace!("trap {:?} epc=0x{:08x} tval=0x{:08x}", cause, epc, tval);
        Trap {
            cause,
            epc,
            tval,
            privilege: Privilege::User,
        }
    }

    fn root(&self) -> u32 {
        match self.root {
            Some(root) => root,
            None => panic!("machine run with no address space installed"),
        }
    }

    fn translate(&self, va: u32, access: UserAccess) -> Result<usize, Exception> {
        pagetable::translate(&self.mem, self.root(), va, access)
            .ok_or(Exception::PageFault { va })
    }

    fn fetch_word(&self, va: u32) -> Result<u32, Exception> {
        if va % 4 != 0 {
            return Err(Exception::PageFault { va });
        }
        let phys = self.translate(va, UserAccess::Fetch)?;
        Ok(self.mem.load_u32(phys))
    }

    fn load_u32(&self, va: u32) -> Result<u32, Exception> {
        if va % 4 != 0 {
            return Err(Exception::PageFault { va });
        }
        let phys = self.translate(va, UserAccess::Read)?;
        Ok(self.mem.load_u32(phys))
    }

    fn load_u8(&self, va: u32) -> Result<u8, Exception> {
        let phys = self.translate(va, UserAccess::Read)?;
        Ok(self.mem.load_u8(phys))
    }

    fn store_u32(&mut self, va: u32, val: u32) -> Result<(), Exception> {
        if va % 4 != 0 {
            return Err(Exception::PageFault { va });
        }
        let phys = self.translate(va, UserAccess::Write)?;
        self.mem.store_u32(phys, val);
        Ok(())
    }

    fn store_u8(&mut self, va: u32, val: u8) -> Result<(), Exception> {
        let phys = self.translate(va, UserAccess::Write)?;
        self.mem.store_u8(phys, val);
        Ok(())
    }

    /// Returns Ok(true) when the instruction was `sys`.
    fn execute(&mut self, instr: Instruction, iaddr: u32) -> Result<bool, Exception> {
        let regs = |r: usize| self.cpu.regs[r];
        match instr {
            Instruction::Add { rd, rs1, rs2 } => {
                self.cpu.write_reg(rd, regs(rs1).wrapping_add(regs(rs2)))
            }
            Instruction::Sub { rd, rs1, rs2 } => {
                self.cpu.write_reg(rd, regs(rs1).wrapping_sub(regs(rs2)))
            }
            Instruction::And { rd, rs1, rs2 } => self.cpu.write_reg(rd, regs(rs1) & regs(rs2)),
            Instruction::Or { rd, rs1, rs2 } => self.cpu.write_reg(rd, regs(rs1) | regs(rs2)),
            Instruction::Xor { rd, rs1, rs2 } => self.cpu.write_reg(rd, regs(rs1) ^ regs(rs2)),
            Instruction::Slt { rd, rs1, rs2 } => self
                .cpu
                .write_reg(rd, ((regs(rs1) as i32) < (regs(rs2) as i32)) as u32),
            Instruction::Sltu { rd, rs1, rs2 } => {
                self.cpu.write_reg(rd, (regs(rs1) < regs(rs2)) as u32)
            }
            Instruction::Addi { rd, rs1, imm } => {
                self.cpu.write_reg(rd, regs(rs1).wrapping_add(imm as u32))
            }
            Instruction::Lui { rd, imm } => self.cpu.write_reg(rd, imm << 16),
            Instruction::Slli { rd, rs1, shamt } => self.cpu.write_reg(rd, regs(rs1) << shamt),
            Instruction::Srli { rd, rs1, shamt } => self.cpu.write_reg(rd, regs(rs1) >> shamt),
            Instruction::Lw { rd, rs1, off } => {
                let val = self.load_u32(regs(rs1).wrapping_add(off as u32))?;
                self.cpu.write_reg(rd, val);
            }
            Instruction::Lb { rd, rs1, off } => {
                let val = self.load_u8(regs(rs1).wrapping_add(off as u32))?;
                self.cpu.write_reg(rd, val as i8 as i32 as u32);
            }
            Instruction::Lbu { rd, rs1, off } => {
                let val = self.load_u8(regs(rs1).wrapping_add(off as u32))?;
                self.cpu.write_reg(rd, val as u32);
            }
            Instruction::Sw { rs2, rs1, off } => {
                self.store_u32(regs(rs1).wrapping_add(off as u32), regs(rs2))?
            }
            Instruction::Sb { rs2, rs1, off } => {
                self.store_u8(regs(rs1).wrapping_add(off as u32), regs(rs2) as u8)?
            }
            Instruction::Beq { rs1, rs2, off } => {
                if regs(rs1) == regs(rs2) {
                    self.cpu.pc = iaddr.wrapping_add(off as u32);
                }
            }
            Instruction::Bne { rs1, rs2, off } => {
                if regs(rs1) != regs(rs2) {
                    self.cpu.pc = iaddr.wrapping_add(off as u32);
                }
            }
            Instruction::Blt { rs1, rs2, off } => {
                if (regs(rs1) as i32) < (regs(rs2) as i32) {
                    self.cpu.pc = iaddr.wrapping_add(off as u32);
                }
            }
            Instruction::Bge { rs1, rs2, off } => {
                if (regs(rs1) as i32) >= (regs(rs2) as i32) {
                    self.cpu.pc = iaddr.wrapping_add(off as u32);
                }
            }
            Instruction::Jal { rd, off } => {
                self.cpu.write_reg(rd, iaddr.wrapping_add(4));
                self.cpu.pc = iaddr.wrapping_add(off as u32);
            }
            Instruction::Jalr { rd, rs1, off } => {
                let target = regs(rs1).wrapping_add(off as u32);
                self.cpu.write_reg(rd, iaddr.wrapping_add(4));
                self.cpu.pc = target;
            }
            Instruction::Sys => return Ok(true),
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isa::encode;
    use types::abi::REG_SP;
    use types::pagetable::{map_range, PageTableAccess, PteFlags, PteReader, PAGE_SIZE};

    /// Page-table builder over machine memory with a bump frame allocator,
    /// standing in for the kernel side in these tests.
    struct Mapper<'a> {
        mem: &'a mut PhysMemory,
        next_frame: u32,
    }

    impl PteReader for Mapper<'_> {
        fn read_pte(&self, phys_addr: usize) -> Option<u32> {
            self.mem.read_pte(phys_addr)
        }
    }

    impl PageTableAccess for Mapper<'_> {
        fn write_pte(&mut self, phys_addr: usize, val: u32) {
            self.mem.store_u32(phys_addr, val);
        }

        fn alloc_frame(&mut self) -> Option<u32> {
            if self.next_frame >= self.mem.frames() {
                return None;
            }
            let frame = self.next_frame;
            self.next_frame += 1;
            Some(frame)
        }

        fn zero_frame(&mut self, frame: u32) {
            self.mem.zero_frame(frame);
        }
    }

    /// Build a machine with `code` mapped at VA 0 and a writable page at
    /// 0x2000 for scratch data.
    fn machine_with(code: &[u32], timer_interval: u32) -> Machine {
        let mut m = Machine::new(64, timer_interval);
        let root = 0;
        let mut mapper = Mapper {
            mem: &mut m.mem,
            next_frame: 1,
        };
        assert!(map_range(
            &mut mapper,
            root,
            0,
            PAGE_SIZE,
            PteFlags::USER | PteFlags::WRITABLE,
        ));
        assert!(map_range(
            &mut mapper,
            root,
            0x2000,
            PAGE_SIZE,
            PteFlags::USER | PteFlags::WRITABLE,
        ));
        let bytes = encode::to_bytes(code);
        for (i, b) in bytes.iter().enumerate() {
            let phys = pagetable::translate(&m.mem, root, i as u32, UserAccess::Read).unwrap();
            m.mem.store_u8(phys, *b);
        }
        m.install_root(root);
        m
    }

    #[test]
    fn syscall_epc_points_past_sys() {
        let mut m = machine_with(&[encode::addi(1, 0, 7), encode::sys()], 0);
        let trap = m.run();
        assert_eq!(trap.cause, Cause::Syscall);
        assert_eq!(trap.epc, 8);
        assert_eq!(trap.privilege, Privilege::User);
        assert_eq!(m.save_frame().regs[1], 7);
    }

    #[test]
    fn timer_trap_epc_resumes_at_current_pc() {
        // Infinite loop: jal r0, 0 keeps jumping to itself.
        let mut m = machine_with(&[encode::jal(0, 0)], 10);
        let trap = m.run();
        assert_eq!(trap.cause, Cause::Timer);
        // The +4 fixup must land exactly where the CPU stopped.
        assert_eq!(trap.epc.wrapping_add(4), m.save_frame().pc);
    }

    #[test]
    fn store_and_load_round_trip() {
        let mut code = encode::li(2, 0x2000); // r2 = scratch base
        code.extend([
            encode::addi(3, 0, 1234),
            encode::sw(3, 2, 8),
            encode::lw(4, 2, 8),
            encode::sys(),
        ]);
        let mut m = machine_with(&code, 0);
        let trap = m.run();
        assert_eq!(trap.cause, Cause::Syscall);
        assert_eq!(m.save_frame().regs[4], 1234);
    }

    #[test]
    fn unmapped_store_page_faults() {
        let code = [encode::lui(2, 0x0100), encode::sw(0, 2, 0)];
        let mut m = machine_with(&code, 0);
        let trap = m.run();
        assert_eq!(trap.cause, Cause::PageFault);
        assert_eq!(trap.tval, 0x0100_0000);
        // EPC names the faulting instruction.
        assert_eq!(trap.epc, 4);
    }

    #[test]
    fn illegal_instruction_traps() {
        let mut m = machine_with(&[0xff00_0000], 0);
        let trap = m.run();
        assert_eq!(trap.cause, Cause::IllegalInstruction);
        assert_eq!(trap.epc, 0);
        assert_eq!(trap.tval, 0xff00_0000);
    }

    #[test]
    fn branches_and_arithmetic() {
        // Count r5 from 0 to 3, then trap.
        let code = [
            encode::addi(5, 0, 0),
            encode::addi(6, 0, 3),
            encode::addi(5, 5, 1), // 0x08: loop body
            encode::blt(5, 6, -4),
            encode::sys(),
        ];
        let mut m = machine_with(&code, 0);
        let trap = m.run();
        assert_eq!(trap.cause, Cause::Syscall);
        assert_eq!(m.save_frame().regs[5], 3);
    }

    #[test]
    fn serial_byte_raises_interrupt() {
        let mut m = machine_with(&[encode::jal(0, 0)], 0);
        m.serial_input(b"x");
        let trap = m.run();
        assert_eq!(trap.cause, Cause::Serial);
        assert_eq!(m.serial_take_byte(), Some(b'x'));
        assert_eq!(m.serial_take_byte(), None);
    }

    #[test]
    fn masked_interrupts_are_not_delivered() {
        let mut m = machine_with(&[encode::addi(1, 0, 1), encode::sys()], 0);
        m.set_interrupts(false);
        m.inject_spurious();
        // With interrupts off the program runs to its syscall untouched.
        let trap = m.run();
        assert_eq!(trap.cause, Cause::Syscall);
        m.set_interrupts(true);
        let trap = m.run();
        assert_eq!(trap.cause, Cause::Spurious);
    }

    #[test]
    fn idle_wait_returns_supervisor_trap() {
        let mut m = machine_with(&[], 10);
        let trap = m.wait_for_interrupt();
        assert_eq!(trap.cause, Cause::Timer);
        assert_eq!(trap.privilege, Privilege::Supervisor);
    }

    #[test]
    fn spurious_irq_is_reported() {
        let mut m = machine_with(&[encode::jal(0, 0)], 0);
        m.inject_spurious();
        let trap = m.run();
        assert_eq!(trap.cause, Cause::Spurious);
    }

    #[test]
    fn sp_register_round_trips_through_frame() {
        let mut frame = TrapFrame::zeroed();
        frame.regs[REG_SP] = 0x8000;
        frame.pc = 0x40;
        let mut m = machine_with(&[], 0);
        m.load_frame(&frame);
        let saved = m.save_frame();
        assert_eq!(saved.regs[REG_SP], 0x8000);
        assert_eq!(saved.pc, 0x40);
    }
}
