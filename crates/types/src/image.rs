//! Executable image format.
//!
//! A header names an entry point and a table of loadable segments; each
//! segment carries its in-file extent and a (possibly larger) in-memory
//! extent whose remainder is zero-filled by the loader. All fields are
//! little-endian u32s.

use thiserror::Error;

/// "KX32" in little-endian byte order.
pub const IMAGE_MAGIC: u32 = 0x3233_584b;

/// Byte length of the fixed header.
pub const HEADER_LEN: usize = 16;

/// Byte length of one segment record.
pub const SEGMENT_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("bad magic number 0x{0:08x}")]
    BadMagic(u32),
    #[error("truncated image")]
    Truncated,
}

/// Fixed image header: magic, entry VA, segment table offset and count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub entry: u32,
    pub seg_off: u32,
    pub seg_count: u32,
}

impl ImageHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < HEADER_LEN {
            return Err(ImageError::Truncated);
        }
        let magic = read_u32(bytes, 0);
        if magic != IMAGE_MAGIC {
            return Err(ImageError::BadMagic(magic));
        }
        Ok(Self {
            entry: read_u32(bytes, 4),
            seg_off: read_u32(bytes, 8),
            seg_count: read_u32(bytes, 12),
        })
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        write_u32(&mut out, 0, IMAGE_MAGIC);
        write_u32(&mut out, 4, self.entry);
        write_u32(&mut out, 8, self.seg_off);
        write_u32(&mut out, 12, self.seg_count);
        out
    }
}

/// One loadable segment: `filesz` bytes at `offset` land at `vaddr`; the
/// remainder up to `memsz` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u32,
    pub offset: u32,
    pub filesz: u32,
    pub memsz: u32,
}

impl Segment {
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < SEGMENT_LEN {
            return Err(ImageError::Truncated);
        }
        Ok(Self {
            vaddr: read_u32(bytes, 0),
            offset: read_u32(bytes, 4),
            filesz: read_u32(bytes, 8),
            memsz: read_u32(bytes, 12),
        })
    }

    pub fn to_bytes(self) -> [u8; SEGMENT_LEN] {
        let mut out = [0u8; SEGMENT_LEN];
        write_u32(&mut out, 0, self.vaddr);
        write_u32(&mut out, 4, self.offset);
        write_u32(&mut out, 8, self.filesz);
        write_u32(&mut out, 12, self.memsz);
        out
    }
}

/// Assembles image files for tests and host tooling: header, segment table,
/// then segment payloads.
pub struct ImageBuilder {
    entry: u32,
    segments: Vec<(u32, u32, Vec<u8>)>, // (vaddr, memsz, payload)
}

impl ImageBuilder {
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    /// Add a segment loading `payload` at `vaddr`, zero-filled up to `memsz`.
    pub fn segment(mut self, vaddr: u32, memsz: u32, payload: Vec<u8>) -> Self {
        self.segments.push((vaddr, memsz, payload));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let seg_off = HEADER_LEN as u32;
        let mut payload_off = seg_off + (self.segments.len() * SEGMENT_LEN) as u32;
        let header = ImageHeader {
            entry: self.entry,
            seg_off,
            seg_count: self.segments.len() as u32,
        };

        let mut table = Vec::new();
        let mut payloads = Vec::new();
        for (vaddr, memsz, payload) in &self.segments {
            let seg = Segment {
                vaddr: *vaddr,
                offset: payload_off,
                filesz: payload.len() as u32,
                memsz: *memsz,
            };
            table.extend_from_slice(&seg.to_bytes());
            payload_off += payload.len() as u32;
            payloads.extend_from_slice(payload);
        }

        let mut out = Vec::with_capacity(payload_off as usize);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&table);
        out.extend_from_slice(&payloads);
        out
    }
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
}

fn write_u32(bytes: &mut [u8], off: usize, val: u32) {
    bytes[off..off + 4].copy_from_slice(&val.to_le_bytes());
}
