//! Two-level page tables over physical frame indices.
//!
//! A table root is a physical frame; each of its 1024 entries may point at a
//! second-level frame whose 1024 entries are leaves. A PTE packs a frame index
//! in the high bits and flag bits in the low bits, so "ownership" of a mapped
//! frame is always expressed as an index, never a raw pointer. The walking
//! helpers below are shared by the machine's MMU (translation) and the
//! kernel's address-space builder (mapping), each side supplying its own
//! accessor implementation.

use bitflags::bitflags;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of PTEs per table frame.
pub const ENTRIES_PER_TABLE: u32 = (PAGE_SIZE / 4) as u32;

const INDEX_MASK: u32 = ENTRIES_PER_TABLE - 1;
const PTE_FRAME_SHIFT: u32 = 10;

bitflags! {
    /// Flag bits of a page-table entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const VALID    = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
    }
}

/// Kind of user-mode access being translated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserAccess {
    Read,
    Write,
    Fetch,
}

/// Read-only PTE traffic; all a translation walk needs.
pub trait PteReader {
    /// Read the PTE stored at a physical byte address, or None if the address
    /// is outside physical memory.
    fn read_pte(&self, phys_addr: usize) -> Option<u32>;
}

/// Full PTE traffic plus frame allocation, for building mappings.
pub trait PageTableAccess: PteReader {
    fn write_pte(&mut self, phys_addr: usize, val: u32);
    fn alloc_frame(&mut self) -> Option<u32>;
    fn zero_frame(&mut self, frame: u32);
}

/// Build a leaf PTE for `frame` with `flags` (VALID implied).
pub fn leaf_pte(frame: u32, flags: PteFlags) -> u32 {
    (frame << PTE_FRAME_SHIFT) | (flags | PteFlags::VALID).bits()
}

/// Frame index held by a PTE.
pub fn pte_frame(pte: u32) -> u32 {
    pte >> PTE_FRAME_SHIFT
}

/// Flag bits held by a PTE.
pub fn pte_flags(pte: u32) -> PteFlags {
    PteFlags::from_bits_truncate(pte)
}

fn l1_index(va: u32) -> u32 {
    (va >> 22) & INDEX_MASK
}

fn l0_index(va: u32) -> u32 {
    (va >> 12) & INDEX_MASK
}

/// Physical byte address of the leaf PTE covering `va`, if the walk reaches
/// one. Does not allocate.
pub fn find_pte<T: PteReader>(pt: &T, root: u32, va: u32) -> Option<usize> {
    let root_base = (root as usize).checked_mul(PAGE_SIZE)?;
    let l1_addr = root_base + l1_index(va) as usize * 4;
    let l1 = pt.read_pte(l1_addr)?;
    if pte_flags(l1) & PteFlags::VALID == PteFlags::empty() {
        return None;
    }
    let l0_base = (pte_frame(l1) as usize).checked_mul(PAGE_SIZE)?;
    Some(l0_base + l0_index(va) as usize * 4)
}

/// Translate a user-mode access to a physical byte address. Fails when the
/// page is unmapped, lacks the USER flag, or a write hits a read-only page.
pub fn translate<T: PteReader>(pt: &T, root: u32, va: u32, access: UserAccess) -> Option<usize> {
    let pte_addr = find_pte(pt, root, va)?;
    let pte = pt.read_pte(pte_addr)?;
    let flags = pte_flags(pte);
    if !flags.contains(PteFlags::VALID | PteFlags::USER) {
        return None;
    }
    if access == UserAccess::Write && !flags.contains(PteFlags::WRITABLE) {
        return None;
    }
    let base = (pte_frame(pte) as usize).checked_mul(PAGE_SIZE)?;
    Some(base + (va as usize & (PAGE_SIZE - 1)))
}

/// Map `[va_start, va_start + len)` by allocating a fresh zeroed frame per
/// page. Already-mapped pages are left alone. Returns false on allocation
/// failure or address overflow; the caller owns rollback.
pub fn map_range<T: PageTableAccess>(
    pt: &mut T,
    root: u32,
    va_start: u32,
    len: usize,
    flags: PteFlags,
) -> bool {
    map_range_internal(pt, root, va_start, len, flags, None)
}

/// Map `[va_start, va_start + len)` onto an existing physical range starting
/// at `phys_start` (page aligned). Used for the shared kernel window.
pub fn map_fixed<T: PageTableAccess>(
    pt: &mut T,
    root: u32,
    va_start: u32,
    phys_start: u32,
    len: usize,
    flags: PteFlags,
) -> bool {
    if phys_start as usize % PAGE_SIZE != 0 {
        return false;
    }
    map_range_internal(pt, root, va_start, len, flags, Some(phys_start))
}

fn map_range_internal<T: PageTableAccess>(
    pt: &mut T,
    root: u32,
    va_start: u32,
    len: usize,
    flags: PteFlags,
    phys_start: Option<u32>,
) -> bool {
    if len == 0 {
        return true;
    }
    let start = align_down(va_start as usize, PAGE_SIZE);
    let end = match (va_start as usize).checked_add(len) {
        Some(v) => align_up(v, PAGE_SIZE),
        None => return false,
    };
    if end > u32::MAX as usize + 1 {
        return false;
    }

    let mut va = start;
    let mut phys = phys_start;
    while va < end {
        if !map_page(pt, root, va as u32, flags, phys) {
            return false;
        }
        va += PAGE_SIZE;
        phys = phys.map(|p| p.wrapping_add(PAGE_SIZE as u32));
    }
    true
}

fn map_page<T: PageTableAccess>(
    pt: &mut T,
    root: u32,
    va: u32,
    flags: PteFlags,
    phys: Option<u32>,
) -> bool {
    let root_base = match (root as usize).checked_mul(PAGE_SIZE) {
        Some(base) => base,
        None => return false,
    };
    let l1_addr = root_base + l1_index(va) as usize * 4;
    let mut l1 = match pt.read_pte(l1_addr) {
        Some(pte) => pte,
        None => return false,
    };
    if pte_flags(l1) & PteFlags::VALID == PteFlags::empty() {
        let table = match pt.alloc_frame() {
            Some(frame) => frame,
            None => return false,
        };
        pt.zero_frame(table);
        l1 = (table << PTE_FRAME_SHIFT) | PteFlags::VALID.bits();
        pt.write_pte(l1_addr, l1);
    }

    let l0_base = match (pte_frame(l1) as usize).checked_mul(PAGE_SIZE) {
        Some(base) => base,
        None => return false,
    };
    let l0_addr = l0_base + l0_index(va) as usize * 4;
    if let Some(existing) = pt.read_pte(l0_addr) {
        if pte_flags(existing).contains(PteFlags::VALID) {
            // Already mapped.
            return true;
        }
    }

    let frame = match phys {
        Some(p) => {
            if p as usize % PAGE_SIZE != 0 {
                return false;
            }
            p / PAGE_SIZE as u32
        }
        None => match pt.alloc_frame() {
            Some(frame) => {
                pt.zero_frame(frame);
                frame
            }
            None => return false,
        },
    };
    pt.write_pte(l0_addr, leaf_pte(frame, flags));
    true
}

/// Strip the USER flag from the page mapping `va`, leaving it mapped but
/// inaccessible from user mode. Returns false if `va` is unmapped.
pub fn clear_user<T: PageTableAccess>(pt: &mut T, root: u32, va: u32) -> bool {
    let pte_addr = match find_pte(pt, root, va) {
        Some(addr) => addr,
        None => return false,
    };
    let pte = match pt.read_pte(pte_addr) {
        Some(pte) => pte,
        None => return false,
    };
    if !pte_flags(pte).contains(PteFlags::VALID) {
        return false;
    }
    pt.write_pte(pte_addr, pte & !PteFlags::USER.bits());
    true
}

/// Visit every valid leaf mapping in the table as `(va, pte)`.
pub fn visit_leaves<T: PteReader>(pt: &T, root: u32, mut f: impl FnMut(u32, u32)) {
    let root_base = root as usize * PAGE_SIZE;
    for i in 0..ENTRIES_PER_TABLE {
        let l1 = match pt.read_pte(root_base + i as usize * 4) {
            Some(pte) => pte,
            None => return,
        };
        if pte_flags(l1) & PteFlags::VALID == PteFlags::empty() {
            continue;
        }
        let l0_base = pte_frame(l1) as usize * PAGE_SIZE;
        for j in 0..ENTRIES_PER_TABLE {
            let l0 = match pt.read_pte(l0_base + j as usize * 4) {
                Some(pte) => pte,
                None => break,
            };
            if pte_flags(l0).contains(PteFlags::VALID) {
                f((i << 22) | (j << 12), l0);
            }
        }
    }
}

/// Visit every second-level table frame referenced by the root.
pub fn visit_tables<T: PteReader>(pt: &T, root: u32, mut f: impl FnMut(u32)) {
    let root_base = root as usize * PAGE_SIZE;
    for i in 0..ENTRIES_PER_TABLE {
        let l1 = match pt.read_pte(root_base + i as usize * 4) {
            Some(pte) => pte,
            None => return,
        };
        if pte_flags(l1).contains(PteFlags::VALID) {
            f(pte_frame(l1));
        }
    }
}

pub const fn align_up(val: usize, align: usize) -> usize {
    (val + (align - 1)) & !(align - 1)
}

pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}
