//! Instruction set of the simulated CPU.
//!
//! Fixed 4-byte instructions, opcode in the top byte. Field layout by format:
//!
//! ```text
//! R      [31:24 op] [23:19 rd]  [18:14 rs1] [13:9 rs2]
//! I      [31:24 op] [23:19 rd]  [18:14 rs1] [13:0 imm14, signed]
//! LUI    [31:24 op] [23:19 rd]  [15:0 imm16]            rd = imm << 16
//! store  [31:24 op] [23:19 rs2] [18:14 rs1] [13:0 imm14]  mem[rs1+imm] = rs2
//! branch [31:24 op] [23:19 rs1] [18:14 rs2] [13:0 imm14]  pc-relative bytes
//! J      [31:24 op] [23:19 rd]  [18:0 imm19, signed]
//! ```
//!
//! The `encode` module is the inverse of `decode` and doubles as the
//! assembler for guest programs in tests.

/// Hardwired zero register.
pub const REG_ZERO: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Add { rd: usize, rs1: usize, rs2: usize },
    Sub { rd: usize, rs1: usize, rs2: usize },
    And { rd: usize, rs1: usize, rs2: usize },
    Or { rd: usize, rs1: usize, rs2: usize },
    Xor { rd: usize, rs1: usize, rs2: usize },
    Slt { rd: usize, rs1: usize, rs2: usize },
    Sltu { rd: usize, rs1: usize, rs2: usize },
    Addi { rd: usize, rs1: usize, imm: i32 },
    Lui { rd: usize, imm: u32 },
    Slli { rd: usize, rs1: usize, shamt: u32 },
    Srli { rd: usize, rs1: usize, shamt: u32 },
    Lw { rd: usize, rs1: usize, off: i32 },
    Lb { rd: usize, rs1: usize, off: i32 },
    Lbu { rd: usize, rs1: usize, off: i32 },
    Sw { rs2: usize, rs1: usize, off: i32 },
    Sb { rs2: usize, rs1: usize, off: i32 },
    Beq { rs1: usize, rs2: usize, off: i32 },
    Bne { rs1: usize, rs2: usize, off: i32 },
    Blt { rs1: usize, rs2: usize, off: i32 },
    Bge { rs1: usize, rs2: usize, off: i32 },
    Jal { rd: usize, off: i32 },
    Jalr { rd: usize, rs1: usize, off: i32 },
    Sys,
}

const OP_ADD: u32 = 0x01;
const OP_SUB: u32 = 0x02;
const OP_AND: u32 = 0x03;
const OP_OR: u32 = 0x04;
const OP_XOR: u32 = 0x05;
const OP_SLT: u32 = 0x06;
const OP_SLTU: u32 = 0x07;
const OP_ADDI: u32 = 0x10;
const OP_LUI: u32 = 0x11;
const OP_SLLI: u32 = 0x12;
const OP_SRLI: u32 = 0x13;
const OP_LW: u32 = 0x20;
const OP_LB: u32 = 0x21;
const OP_LBU: u32 = 0x22;
const OP_SW: u32 = 0x28;
const OP_SB: u32 = 0x29;
const OP_BEQ: u32 = 0x30;
const OP_BNE: u32 = 0x31;
const OP_BLT: u32 = 0x32;
const OP_BGE: u32 = 0x33;
const OP_JAL: u32 = 0x38;
const OP_JALR: u32 = 0x39;
const OP_SYS: u32 = 0x40;

fn field_rd(word: u32) -> usize {
    ((word >> 19) & 0x1f) as usize
}

fn field_rs1(word: u32) -> usize {
    ((word >> 14) & 0x1f) as usize
}

fn field_rs2(word: u32) -> usize {
    ((word >> 9) & 0x1f) as usize
}

fn imm14(word: u32) -> i32 {
    // Sign-extend bits [13:0].
    ((word as i32) << 18) >> 18
}

fn imm19(word: u32) -> i32 {
    ((word as i32) << 13) >> 13
}

pub fn decode(word: u32) -> Option<Instruction> {
    let rd = field_rd(word);
    let rs1 = field_rs1(word);
    let rs2 = field_rs2(word);
    let instr = match word >> 24 {
        OP_ADD => Instruction::Add { rd, rs1, rs2 },
        OP_SUB => Instruction::Sub { rd, rs1, rs2 },
        OP_AND => Instruction::And { rd, rs1, rs2 },
        OP_OR => Instruction::Or { rd, rs1, rs2 },
        OP_XOR => Instruction::Xor { rd, rs1, rs2 },
        OP_SLT => Instruction::Slt { rd, rs1, rs2 },
        OP_SLTU => Instruction::Sltu { rd, rs1, rs2 },
        OP_ADDI => Instruction::Addi { rd, rs1, imm: imm14(word) },
        OP_LUI => Instruction::Lui { rd, imm: word & 0xffff },
        OP_SLLI => Instruction::Slli { rd, rs1, shamt: word & 0x1f },
        OP_SRLI => Instruction::Srli { rd, rs1, shamt: word & 0x1f },
        OP_LW => Instruction::Lw { rd, rs1, off: imm14(word) },
        OP_LB => Instruction::Lb { rd, rs1, off: imm14(word) },
        OP_LBU => Instruction::Lbu { rd, rs1, off: imm14(word) },
        OP_SW => Instruction::Sw { rs2: rd, rs1, off: imm14(word) },
        OP_SB => Instruction::Sb { rs2: rd, rs1, off: imm14(word) },
        OP_BEQ => Instruction::Beq { rs1: rd, rs2: rs1, off: imm14(word) },
        OP_BNE => Instruction::Bne { rs1: rd, rs2: rs1, off: imm14(word) },
        OP_BLT => Instruction::Blt { rs1: rd, rs2: rs1, off: imm14(word) },
        OP_BGE => Instruction::Bge { rs1: rd, rs2: rs1, off: imm14(word) },
        OP_JAL => Instruction::Jal { rd, off: imm19(word) },
        OP_JALR => Instruction::Jalr { rd, rs1, off: imm14(word) },
        OP_SYS => Instruction::Sys,
        _ => return None,
    };
    Some(instr)
}

/// Instruction encoders; each checks its immediate fits the field.
pub mod encode {
    use super::*;

    fn r_type(op: u32, rd: usize, rs1: usize, rs2: usize) -> u32 {
        debug_assert!(rd < 32 && rs1 < 32 && rs2 < 32);
        (op << 24) | ((rd as u32) << 19) | ((rs1 as u32) << 14) | ((rs2 as u32) << 9)
    }

    fn i_type(op: u32, rd: usize, rs1: usize, imm: i32) -> u32 {
        debug_assert!(rd < 32 && rs1 < 32);
        assert!((-(1 << 13)..1 << 13).contains(&imm), "imm14 out of range: {imm}");
        (op << 24) | ((rd as u32) << 19) | ((rs1 as u32) << 14) | ((imm as u32) & 0x3fff)
    }

    pub fn add(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(OP_ADD, rd, rs1, rs2)
    }

    pub fn sub(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(OP_SUB, rd, rs1, rs2)
    }

    pub fn and(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(OP_AND, rd, rs1, rs2)
    }

    pub fn or(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(OP_OR, rd, rs1, rs2)
    }

    pub fn xor(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(OP_XOR, rd, rs1, rs2)
    }

    pub fn slt(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(OP_SLT, rd, rs1, rs2)
    }

    pub fn sltu(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(OP_SLTU, rd, rs1, rs2)
    }

    pub fn addi(rd: usize, rs1: usize, imm: i32) -> u32 {
        i_type(OP_ADDI, rd, rs1, imm)
    }

    pub fn lui(rd: usize, imm: u32) -> u32 {
        assert!(imm <= 0xffff, "imm16 out of range: {imm}");
        (OP_LUI << 24) | ((rd as u32) << 19) | imm
    }

    /// Load a full 32-bit constant into `rd`, using the shortest of: a lone
    /// `addi` or `lui`, `lui` + `addi`, a shifted `addi`, or a shift-and-add
    /// chain of 13-bit chunks (the `addi` immediate is signed 14-bit, so a
    /// low half of 0x2000 or more cannot ride on a `lui` directly).
    pub fn li(rd: usize, value: u32) -> Vec<u32> {
        if value < (1 << 13) {
            return vec![addi(rd, REG_ZERO, value as i32)];
        }
        let hi = value >> 16;
        let lo = value & 0xffff;
        if lo == 0 {
            return vec![lui(rd, hi)];
        }
        if lo < (1 << 13) {
            return vec![lui(rd, hi), addi(rd, rd, lo as i32)];
        }
        let tz = value.trailing_zeros();
        if (value >> tz) < (1 << 13) {
            return vec![addi(rd, REG_ZERO, (value >> tz) as i32), slli(rd, rd, tz)];
        }
        vec![
            addi(rd, REG_ZERO, (value >> 19) as i32),
            slli(rd, rd, 13),
            addi(rd, rd, ((value >> 6) & 0x1fff) as i32),
            slli(rd, rd, 6),
            addi(rd, rd, (value & 0x3f) as i32),
        ]
    }

    pub fn slli(rd: usize, rs1: usize, shamt: u32) -> u32 {
        assert!(shamt < 32);
        (OP_SLLI << 24) | ((rd as u32) << 19) | ((rs1 as u32) << 14) | shamt
    }

    pub fn srli(rd: usize, rs1: usize, shamt: u32) -> u32 {
        assert!(shamt < 32);
        (OP_SRLI << 24) | ((rd as u32) << 19) | ((rs1 as u32) << 14) | shamt
    }

    pub fn lw(rd: usize, rs1: usize, off: i32) -> u32 {
        i_type(OP_LW, rd, rs1, off)
    }

    pub fn lb(rd: usize, rs1: usize, off: i32) -> u32 {
        i_type(OP_LB, rd, rs1, off)
    }

    pub fn lbu(rd: usize, rs1: usize, off: i32) -> u32 {
        i_type(OP_LBU, rd, rs1, off)
    }

    pub fn sw(rs2: usize, rs1: usize, off: i32) -> u32 {
        i_type(OP_SW, rs2, rs1, off)
    }

    pub fn sb(rs2: usize, rs1: usize, off: i32) -> u32 {
        i_type(OP_SB, rs2, rs1, off)
    }

    pub fn beq(rs1: usize, rs2: usize, off: i32) -> u32 {
        i_type(OP_BEQ, rs1, rs2, off)
    }

    pub fn bne(rs1: usize, rs2: usize, off: i32) -> u32 {
        i_type(OP_BNE, rs1, rs2, off)
    }

    pub fn blt(rs1: usize, rs2: usize, off: i32) -> u32 {
        i_type(OP_BLT, rs1, rs2, off)
    }

    pub fn bge(rs1: usize, rs2: usize, off: i32) -> u32 {
        i_type(OP_BGE, rs1, rs2, off)
    }

    pub fn jal(rd: usize, off: i32) -> u32 {
        assert!((-(1 << 18)..1 << 18).contains(&off), "imm19 out of range: {off}");
        (OP_JAL << 24) | ((rd as u32) << 19) | ((off as u32) & 0x7ffff)
    }

    pub fn jalr(rd: usize, rs1: usize, off: i32) -> u32 {
        i_type(OP_JALR, rd, rs1, off)
    }

    pub fn sys() -> u32 {
        OP_SYS << 24
    }

    /// Flatten encoded words into the little-endian byte stream programs are
    /// stored as.
    pub fn to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round() {
        let cases = [
            (encode::add(3, 4, 5), Instruction::Add { rd: 3, rs1: 4, rs2: 5 }),
            (encode::addi(1, 0, -7), Instruction::Addi { rd: 1, rs1: 0, imm: -7 }),
            (encode::lui(2, 0xbeef), Instruction::Lui { rd: 2, imm: 0xbeef }),
            (encode::lw(6, 30, 12), Instruction::Lw { rd: 6, rs1: 30, off: 12 }),
            (encode::sw(7, 30, -4), Instruction::Sw { rs2: 7, rs1: 30, off: -4 }),
            (encode::beq(1, 2, -8), Instruction::Beq { rs1: 1, rs2: 2, off: -8 }),
            (encode::jal(31, 0x100), Instruction::Jal { rd: 31, off: 0x100 }),
            (encode::jalr(0, 31, 0), Instruction::Jalr { rd: 0, rs1: 31, off: 0 }),
            (encode::sys(), Instruction::Sys),
        ];
        for (word, expected) in cases {
            assert_eq!(decode(word), Some(expected), "word 0x{word:08x}");
        }
    }

    #[test]
    fn unknown_opcode_decodes_to_none() {
        assert_eq!(decode(0xff00_0000), None);
        assert_eq!(decode(0x0900_0000), None);
    }

    #[test]
    fn li_materializes_large_constants() {
        // Check li against a tiny interpreter of just lui/addi/slli. The
        // values with a low half of 0x2000 or more are the interesting ones:
        // they cannot ride on a lui with a single addi.
        for value in [
            0u32,
            5,
            0x2000,
            0x5f77, // 24439
            0xffff,
            0x1_0000,
            0x1234_5678,
            0xdead_beef,
            u32::MAX,
        ] {
            let mut reg = 0u32;
            for word in encode::li(9, value) {
                match decode(word).unwrap() {
                    Instruction::Lui { imm, .. } => reg = imm << 16,
                    Instruction::Addi { rs1, imm, .. } => {
                        let base = if rs1 == 0 { 0 } else { reg };
                        reg = base.wrapping_add(imm as u32);
                    }
                    Instruction::Slli { shamt, .. } => reg <<= shamt,
                    other => panic!("unexpected instruction {other:?}"),
                }
            }
            assert_eq!(reg, value, "value 0x{value:08x}");
        }
    }

    #[test]
    fn li_immediates_all_fit_their_fields() {
        // The encoders assert their immediate ranges, so materializing a
        // spread of awkward constants is itself the check: any chunk out of
        // the signed 14-bit addi field would panic here.
        for value in (0..=20u32).map(|i| 0xbeef_u32.wrapping_mul(i * i + 1)) {
            for word in encode::li(7, value) {
                assert!(decode(word).is_some(), "word 0x{word:08x}");
            }
        }
    }
}
