//! User address spaces.
//!
//! Each process owns a two-level page table rooted at a physical frame. User
//! pages sit below [`KERNEL_BASE`]; above it every space carries the shared
//! kernel window, a supervisor-only identity mapping of physical memory that
//! user code can never touch because its PTEs lack the USER flag. All frames
//! reachable from a root except the window's leaves belong to that space and
//! go back to the allocator when it is destroyed.

use log::trace;
use machine::PhysMemory;
use thiserror::Error;
use types::pagetable::{
    align_up, clear_user, find_pte, leaf_pte, map_fixed, map_range, pte_flags, pte_frame,
    translate, visit_leaves, visit_tables, PteFlags, PteReader, UserAccess, PAGE_SIZE,
};
use types::KERNEL_BASE;

use crate::kalloc::KernelPager;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("bad user address 0x{0:08x}")]
    BadAddress(u32),
}

/// A process's translation root plus the top of its user image. Everything in
/// `[0, size)` is (or was) user-mapped; the stack and guard live inside that
/// range as laid out by exec.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpace {
    pub root: u32,
    pub size: u32,
}

/// Allocate a fresh table with only the kernel window mapped.
pub fn new_kernel_space(pager: &mut KernelPager) -> Result<AddressSpace, VmError> {
    let root = pager.frames.alloc().ok_or(VmError::OutOfMemory)?;
    pager.mem.zero_frame(root);
    let window = pager
        .mem
        .len()
        .min((u32::MAX - KERNEL_BASE) as usize + 1);
    if !map_fixed(pager, root, KERNEL_BASE, 0, window, PteFlags::WRITABLE) {
        destroy(pager, root);
        return Err(VmError::OutOfMemory);
    }
    Ok(AddressSpace { root, size: 0 })
}

/// Extend the user image to `new_size` bytes, allocating zeroed pages.
/// Shrinking is not supported; partial allocation is rolled back.
pub fn grow(pager: &mut KernelPager, space: &mut AddressSpace, new_size: u32) -> Result<(), VmError> {
    if new_size < space.size {
        return Err(VmError::BadAddress(new_size));
    }
    if new_size as usize > KERNEL_BASE as usize {
        return Err(VmError::BadAddress(new_size));
    }
    let start = align_up(space.size as usize, PAGE_SIZE);
    let end = align_up(new_size as usize, PAGE_SIZE);
    if !map_range(
        pager,
        space.root,
        start as u32,
        end - start,
        PteFlags::USER | PteFlags::WRITABLE,
    ) {
        unmap_range(pager, space.root, start, end);
        return Err(VmError::OutOfMemory);
    }
    space.size = new_size;
    Ok(())
}

/// Drop the USER flag on the page at `va`, turning it into an inaccessible
/// guard. The frame stays owned by the space.
pub fn protect_guard(pager: &mut KernelPager, root: u32, va: u32) -> Result<(), VmError> {
    if clear_user(pager, root, va) {
        Ok(())
    } else {
        Err(VmError::BadAddress(va))
    }
}

/// Clone the user half of `src` into a new space, preserving per-page flags
/// (so the guard page stays a guard in the child).
pub fn duplicate(pager: &mut KernelPager, src: &AddressSpace) -> Result<AddressSpace, VmError> {
    let mut new = new_kernel_space(pager)?;

    let mut pages = Vec::new();
    visit_leaves(pager.mem, src.root, |va, pte| {
        if va < KERNEL_BASE {
            pages.push((va, pte));
        }
    });

    for &(va, pte) in &pages {
        let flags = pte_flags(pte) & (PteFlags::WRITABLE | PteFlags::USER);
        if !map_range(pager, new.root, va, PAGE_SIZE, flags) {
            destroy(pager, new.root);
            return Err(VmError::OutOfMemory);
        }
        let dst_pte_addr = match find_pte(pager.mem, new.root, va) {
            Some(addr) => addr,
            None => {
                destroy(pager, new.root);
                return Err(VmError::OutOfMemory);
            }
        };
        // map_range tags fresh leaves with the source's flags, but a
        // USER-less guard page comes back untranslatable, so copy by frame.
        let dst_frame = pte_frame(pager.mem.load_u32(dst_pte_addr));
        let src_frame = pte_frame(pte);
        let from = pager.mem.slice(src_frame as usize * PAGE_SIZE, PAGE_SIZE).to_vec();
        pager
            .mem
            .slice_mut(dst_frame as usize * PAGE_SIZE, PAGE_SIZE)
            .copy_from_slice(&from);
        // Reapply exact flags in case the page was a guard.
        pager.mem.store_u32(dst_pte_addr, leaf_pte(dst_frame, flags));
    }

    new.size = src.size;
    Ok(new)
}

/// Return every frame owned by the table to the allocator: user leaves, the
/// second-level tables, and the root. Kernel-window leaves map physical
/// memory that was never allocated to this space, so they are skipped.
pub fn destroy(pager: &mut KernelPager, root: u32) {
    let mut leaves = Vec::new();
    visit_leaves(pager.mem, root, |va, pte| {
        if va < KERNEL_BASE {
            leaves.push(pte_frame(pte));
        }
    });
    let mut tables = Vec::new();
    visit_tables(pager.mem, root, |frame| tables.push(frame));

    trace!(
        "vm: destroy root={} leaves={} tables={}",
        root,
        leaves.len(),
        tables.len()
    );
    for frame in leaves {
        pager.frames.free(frame);
    }
    for frame in tables {
        pager.frames.free(frame);
    }
    pager.frames.free(root);
}

fn unmap_range(pager: &mut KernelPager, root: u32, start: usize, end: usize) {
    let mut va = start;
    while va < end {
        if let Some(pte_addr) = find_pte(pager.mem, root, va as u32) {
            if let Some(pte) = pager.mem.read_pte(pte_addr) {
                if pte_flags(pte).contains(PteFlags::VALID) {
                    pager.frames.free(pte_frame(pte));
                    pager.mem.store_u32(pte_addr, 0);
                }
            }
        }
        va += PAGE_SIZE;
    }
}

/// Reject user ranges that leave `[0, size)`. The mapped page a stray
/// pointer lands on is irrelevant; only the image extent counts, and the
/// arithmetic is widened so `va + len` cannot wrap.
pub fn check_user_range(space: &AddressSpace, va: u32, len: usize) -> Result<(), VmError> {
    if va as u64 + len as u64 > space.size as u64 {
        return Err(VmError::BadAddress(va));
    }
    Ok(())
}

/// Copy kernel bytes into user memory at `va`. The whole range must sit
/// inside the image; past that, the copy fails on the first byte that does
/// not translate as a user write, leaving earlier pages written.
pub fn copy_out(
    mem: &mut PhysMemory,
    space: &AddressSpace,
    va: u32,
    bytes: &[u8],
) -> Result<(), VmError> {
    check_user_range(space, va, bytes.len())?;
    let mut va = va as usize;
    let mut rest = bytes;
    while !rest.is_empty() {
        let pa = translate(mem, space.root, va as u32, UserAccess::Write)
            .ok_or(VmError::BadAddress(va as u32))?;
        let n = rest.len().min(PAGE_SIZE - va % PAGE_SIZE);
        mem.slice_mut(pa, n).copy_from_slice(&rest[..n]);
        va += n;
        rest = &rest[n..];
    }
    Ok(())
}

/// Copy user memory at `va` into a kernel buffer. Same bounds rule as
/// [`copy_out`].
pub fn copy_in(
    mem: &PhysMemory,
    space: &AddressSpace,
    va: u32,
    buf: &mut [u8],
) -> Result<(), VmError> {
    check_user_range(space, va, buf.len())?;
    let mut va = va as usize;
    let mut rest = buf;
    while !rest.is_empty() {
        let pa = translate(mem, space.root, va as u32, UserAccess::Read)
            .ok_or(VmError::BadAddress(va as u32))?;
        let n = rest.len().min(PAGE_SIZE - va % PAGE_SIZE);
        let (head, tail) = rest.split_at_mut(n);
        head.copy_from_slice(mem.slice(pa, n));
        va += n;
        rest = tail;
    }
    Ok(())
}

/// Read a NUL-terminated user string of at most `max` bytes. The scan stops
/// at the image boundary; a string with no terminator inside it fails.
pub fn copy_in_str(
    mem: &PhysMemory,
    space: &AddressSpace,
    va: u32,
    max: usize,
) -> Result<String, VmError> {
    let mut out = Vec::new();
    for i in 0..max {
        if va as u64 + i as u64 >= space.size as u64 {
            return Err(VmError::BadAddress(va));
        }
        let addr = va + i as u32;
        let pa = translate(mem, space.root, addr, UserAccess::Read)
            .ok_or(VmError::BadAddress(addr))?;
        let b = mem.load_u8(pa);
        if b == 0 {
            return String::from_utf8(out).map_err(|_| VmError::BadAddress(va));
        }
        out.push(b);
    }
    Err(VmError::BadAddress(va))
}

/// Read a little-endian word from user memory.
pub fn copy_in_u32(mem: &PhysMemory, space: &AddressSpace, va: u32) -> Result<u32, VmError> {
    let mut buf = [0u8; 4];
    copy_in(mem, space, va, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn copy_out_u32(
    mem: &mut PhysMemory,
    space: &AddressSpace,
    va: u32,
    val: u32,
) -> Result<(), VmError> {
    copy_out(mem, space, va, &val.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::FrameAllocator;

    fn setup(frames: usize) -> (PhysMemory, FrameAllocator) {
        (PhysMemory::new(frames), FrameAllocator::new(frames))
    }

    #[test]
    fn kernel_window_is_supervisor_only() {
        let (mut mem, mut frames) = setup(64);
        let mut pager = KernelPager { mem: &mut mem, frames: &mut frames };
        let space = new_kernel_space(&mut pager).unwrap();
        // Mapped, but not translatable as a user access.
        assert!(find_pte(pager.mem, space.root, KERNEL_BASE).is_some());
        assert!(translate(pager.mem, space.root, KERNEL_BASE, UserAccess::Read).is_none());
    }

    #[test]
    fn grow_and_copy_round_trip() {
        let (mut mem, mut frames) = setup(64);
        let mut pager = KernelPager { mem: &mut mem, frames: &mut frames };
        let mut space = new_kernel_space(&mut pager).unwrap();
        grow(&mut pager, &mut space, 2 * PAGE_SIZE as u32).unwrap();

        copy_out(&mut mem, &space, 100, b"payload").unwrap();
        let mut buf = [0u8; 7];
        copy_in(&mem, &space, 100, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
        // Past the image boundary nothing is mapped.
        assert!(copy_out(&mut mem, &space, 2 * PAGE_SIZE as u32, b"x").is_err());
    }

    #[test]
    fn fetches_beyond_the_image_size_fail() {
        let (mut mem, mut frames) = setup(64);
        let mut pager = KernelPager { mem: &mut mem, frames: &mut frames };
        let mut space = new_kernel_space(&mut pager).unwrap();
        grow(&mut pager, &mut space, 100).unwrap();

        // grow mapped a whole page, but only [0, 100) belongs to the image;
        // a pointer past that must fail even though it still translates.
        let mut buf = [0u8; 4];
        assert!(copy_in(&mem, &space, 3000, &mut buf).is_err());
        assert!(copy_out(&mut mem, &space, 98, b"abc").is_err());
        assert!(copy_in(&mem, &space, u32::MAX, &mut buf).is_err());
        copy_in(&mem, &space, 96, &mut buf).unwrap();

        // A string running into the boundary has no room for its terminator.
        copy_out(&mut mem, &space, 96, b"aaaa").unwrap();
        assert!(copy_in_str(&mem, &space, 96, 32).is_err());
    }

    #[test]
    fn grow_failure_rolls_back() {
        let (mut mem, mut frames) = setup(8);
        let mut pager = KernelPager { mem: &mut mem, frames: &mut frames };
        let mut space = new_kernel_space(&mut pager).unwrap();
        let before = pager.frames.available();
        // Far more pages than physical memory holds.
        assert_eq!(
            grow(&mut pager, &mut space, 64 * PAGE_SIZE as u32),
            Err(VmError::OutOfMemory)
        );
        assert_eq!(space.size, 0);
        // L0 table frames may remain, but no leaves leak.
        assert!(pager.frames.available() >= before.saturating_sub(1));
    }

    #[test]
    fn guard_page_blocks_user_access() {
        let (mut mem, mut frames) = setup(64);
        let mut pager = KernelPager { mem: &mut mem, frames: &mut frames };
        let mut space = new_kernel_space(&mut pager).unwrap();
        grow(&mut pager, &mut space, 3 * PAGE_SIZE as u32).unwrap();
        protect_guard(&mut pager, space.root, PAGE_SIZE as u32).unwrap();

        assert!(copy_out(&mut mem, &space, PAGE_SIZE as u32, b"x").is_err());
        // Neighbours stay accessible.
        copy_out(&mut mem, &space, 0, b"x").unwrap();
        copy_out(&mut mem, &space, 2 * PAGE_SIZE as u32, b"x").unwrap();
    }

    #[test]
    fn duplicate_preserves_data_and_isolation() {
        let (mut mem, mut frames) = setup(64);
        let mut pager = KernelPager { mem: &mut mem, frames: &mut frames };
        let mut parent = new_kernel_space(&mut pager).unwrap();
        grow(&mut pager, &mut parent, 2 * PAGE_SIZE as u32).unwrap();
        copy_out(pager.mem, &parent, 64, b"parent").unwrap();

        let mut pager = KernelPager { mem: &mut mem, frames: &mut frames };
        let child = duplicate(&mut pager, &parent).unwrap();
        assert_eq!(child.size, parent.size);

        let mut buf = [0u8; 6];
        copy_in(&mem, &child, 64, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");

        // Writes after the fork do not bleed across.
        copy_out(&mut mem, &child, 64, b"child!").unwrap();
        copy_in(&mem, &parent, 64, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
    }

    #[test]
    fn duplicate_keeps_guard_unmapped_for_user() {
        let (mut mem, mut frames) = setup(64);
        let mut pager = KernelPager { mem: &mut mem, frames: &mut frames };
        let mut parent = new_kernel_space(&mut pager).unwrap();
        grow(&mut pager, &mut parent, 2 * PAGE_SIZE as u32).unwrap();
        protect_guard(&mut pager, parent.root, 0).unwrap();
        let child = duplicate(&mut pager, &parent).unwrap();
        assert!(translate(&mem, child.root, 0, UserAccess::Read).is_none());
        assert!(translate(&mem, child.root, PAGE_SIZE as u32, UserAccess::Read).is_some());
    }

    #[test]
    fn destroy_returns_every_owned_frame() {
        let (mut mem, mut frames) = setup(64);
        let before = frames.available();
        let mut pager = KernelPager { mem: &mut mem, frames: &mut frames };
        let mut space = new_kernel_space(&mut pager).unwrap();
        grow(&mut pager, &mut space, 5 * PAGE_SIZE as u32).unwrap();
        protect_guard(&mut pager, space.root, PAGE_SIZE as u32).unwrap();
        destroy(&mut pager, space.root);
        assert_eq!(frames.available(), before);
    }

    #[test]
    fn string_fetch_stops_at_nul_and_rejects_runaway() {
        let (mut mem, mut frames) = setup(64);
        let mut pager = KernelPager { mem: &mut mem, frames: &mut frames };
        let mut space = new_kernel_space(&mut pager).unwrap();
        grow(&mut pager, &mut space, PAGE_SIZE as u32).unwrap();
        copy_out(&mut mem, &space, 0, b"hello\0").unwrap();

        assert_eq!(copy_in_str(&mem, &space, 0, 32).unwrap(), "hello");
        // No terminator within the limit.
        copy_out(&mut mem, &space, 100, &[b'a'; 32]).unwrap();
        assert!(copy_in_str(&mem, &space, 100, 16).is_err());
    }
}
