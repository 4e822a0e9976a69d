//! Physical frame allocator.

use machine::PhysMemory;
use types::pagetable::{PageTableAccess, PteReader};

/// Free list of 4 KiB frames. Frame 0 is never handed out so a zeroed frame
/// number in kernel structures always means "none".
pub struct FrameAllocator {
    free: Vec<u32>,
}

impl FrameAllocator {
    pub fn new(total_frames: usize) -> Self {
        // Popping from the back hands out low frames first.
        let free = (1..total_frames as u32).rev().collect();
        Self { free }
    }

    pub fn alloc(&mut self) -> Option<u32> {
        self.free.pop()
    }

    pub fn free(&mut self, frame: u32) {
        debug_assert!(frame != 0, "freeing frame 0");
        debug_assert!(!self.free.contains(&frame), "double free of frame {frame}");
        self.free.push(frame);
    }

    /// Frames currently available.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// Page-table walker backend: couples physical memory with the frame
/// allocator for the duration of a mapping operation.
pub struct KernelPager<'a> {
    pub mem: &'a mut PhysMemory,
    pub frames: &'a mut FrameAllocator,
}

impl PteReader for KernelPager<'_> {
    fn read_pte(&self, phys_addr: usize) -> Option<u32> {
        self.mem.read_pte(phys_addr)
    }
}

impl PageTableAccess for KernelPager<'_> {
    fn write_pte(&mut self, phys_addr: usize, val: u32) {
        self.mem.store_u32(phys_addr, val);
    }

    fn alloc_frame(&mut self) -> Option<u32> {
        self.frames.alloc()
    }

    fn zero_frame(&mut self, frame: u32) {
        self.mem.zero_frame(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cycle_through_free_list() {
        let mut alloc = FrameAllocator::new(4);
        assert_eq!(alloc.alloc(), Some(1));
        assert_eq!(alloc.alloc(), Some(2));
        assert_eq!(alloc.alloc(), Some(3));
        assert_eq!(alloc.alloc(), None);
        alloc.free(2);
        assert_eq!(alloc.alloc(), Some(2));
    }
}
