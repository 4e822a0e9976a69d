//! Flat physical memory.
//!
//! Accessors take physical byte addresses the kernel or MMU has already
//! validated; going out of range here means a kernel bug, so it panics rather
//! than limping on.

use types::pagetable::{PteReader, PAGE_SIZE};

pub struct PhysMemory {
    bytes: Vec<u8>,
}

impl PhysMemory {
    pub fn new(frames: usize) -> Self {
        Self {
            bytes: vec![0u8; frames * PAGE_SIZE],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of physical frames.
    pub fn frames(&self) -> u32 {
        (self.bytes.len() / PAGE_SIZE) as u32
    }

    pub fn load_u8(&self, addr: usize) -> u8 {
        self.check(addr, 1);
        self.bytes[addr]
    }

    pub fn store_u8(&mut self, addr: usize, val: u8) {
        self.check(addr, 1);
        self.bytes[addr] = val;
    }

    pub fn load_u32(&self, addr: usize) -> u32 {
        self.check(addr, 4);
        u32::from_le_bytes(self.bytes[addr..addr + 4].try_into().unwrap())
    }

    pub fn store_u32(&mut self, addr: usize, val: u32) {
        self.check(addr, 4);
        self.bytes[addr..addr + 4].copy_from_slice(&val.to_le_bytes());
    }

    pub fn slice(&self, addr: usize, len: usize) -> &[u8] {
        self.check(addr, len);
        &self.bytes[addr..addr + len]
    }

    pub fn slice_mut(&mut self, addr: usize, len: usize) -> &mut [u8] {
        self.check(addr, len);
        &mut self.bytes[addr..addr + len]
    }

    pub fn zero_frame(&mut self, frame: u32) {
        let base = frame as usize * PAGE_SIZE;
        self.check(base, PAGE_SIZE);
        self.bytes[base..base + PAGE_SIZE].fill(0);
    }

    fn check(&self, addr: usize, len: usize) {
        let end = addr.checked_add(len);
        match end {
            Some(end) if end <= self.bytes.len() => {}
            _ => panic!("physical access out of range: addr=0x{addr:08x} len={len}"),
        }
    }
}

impl PteReader for PhysMemory {
    fn read_pte(&self, phys_addr: usize) -> Option<u32> {
        let end = phys_addr.checked_add(4)?;
        if end > self.bytes.len() {
            return None;
        }
        Some(u32::from_le_bytes(
            self.bytes[phys_addr..end].try_into().unwrap(),
        ))
    }
}
