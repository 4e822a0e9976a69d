pub mod abi;
pub mod image;
pub mod pagetable;

pub use image::{ImageBuilder, ImageError, ImageHeader, Segment, IMAGE_MAGIC};
pub use pagetable::{PageTableAccess, PteFlags, PteReader, UserAccess, PAGE_SIZE};

/// Virtual base of the kernel window mapped (supervisor-only) into every
/// address space. User-owned frames are exactly the leaves mapped below it.
pub const KERNEL_BASE: u32 = 0xf000_0000;
