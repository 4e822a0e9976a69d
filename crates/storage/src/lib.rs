//! Filesystem layer the kernel mounts.
//!
//! The kernel never touches directory entries or inode contents directly; it
//! drives everything through [`FileSystem`], so the backing store can be the
//! in-memory tree used here or a real on-disk format later. The locking and
//! transaction calls mirror the usual inode discipline: multi-write
//! operations are bracketed by `begin_op`/`end_op`, and an inode is locked
//! while its contents or metadata are read or written.

pub mod memfs;

use thiserror::Error;

pub use memfs::MemFs;

/// Inode number. The root directory is always [`ROOT_INO`].
pub type InodeId = u32;

pub const ROOT_INO: InodeId = 1;

/// Maximum file size. Writes past this fail rather than grow unbounded.
pub const MAX_FILE_BYTES: u32 = 1 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("file exists")]
    Exists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("invalid path")]
    BadPath,
    #[error("file too large")]
    TooLarge,
    #[error("operation not supported on this inode")]
    NotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Dir,
    File,
    /// Character device; reads and writes are routed to the driver for
    /// `major` instead of inode data.
    Dev { major: u16, minor: u16 },
}

/// Inode metadata snapshot, as reported to userspace by fstat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeStat {
    pub kind: InodeKind,
    pub ino: InodeId,
    pub size: u32,
    pub nlink: u16,
}

pub trait FileSystem {
    /// Open a transaction covering a multi-write operation.
    fn begin_op(&mut self);
    fn end_op(&mut self);

    /// Resolve `path` to an inode, starting at the root for absolute paths
    /// and at `cwd` otherwise. Takes a reference on the result.
    fn namei(&mut self, cwd: InodeId, path: &str) -> Result<InodeId, FsError>;

    fn ilock(&mut self, ino: InodeId);
    fn iunlock(&mut self, ino: InodeId);
    /// Unlock and drop the reference taken by `namei`/`create`/`idup`.
    fn iunlockput(&mut self, ino: InodeId);
    fn idup(&mut self, ino: InodeId) -> InodeId;
    fn iput(&mut self, ino: InodeId);

    /// Read from inode contents at `off`. Short reads at end of file are
    /// normal; reading past the end returns 0.
    fn readi(&mut self, ino: InodeId, off: u32, buf: &mut [u8]) -> Result<usize, FsError>;
    /// Write inode contents at `off`, growing the file as needed.
    fn writei(&mut self, ino: InodeId, off: u32, buf: &[u8]) -> Result<usize, FsError>;

    fn stati(&self, ino: InodeId) -> InodeStat;

    /// Create `path` with the given kind. Creating an existing regular file
    /// as a regular file returns the existing inode; any other collision is
    /// an error. Takes a reference on the result.
    fn create(&mut self, cwd: InodeId, path: &str, kind: InodeKind) -> Result<InodeId, FsError>;

    /// Add a second directory entry for an existing regular file.
    fn link(&mut self, cwd: InodeId, old: &str, new: &str) -> Result<(), FsError>;

    /// Remove a directory entry. The inode is freed once its link count and
    /// reference count both reach zero.
    fn unlink(&mut self, cwd: InodeId, path: &str) -> Result<(), FsError>;
}
