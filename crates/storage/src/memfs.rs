//! In-memory filesystem.
//!
//! Inodes live in a map keyed by inode number; directories hold their
//! entries as an ordered name-to-inode map plus a parent pointer that backs
//! `..`. Reference counts pin inodes that are open while unlinked, and the
//! lock/transaction bookkeeping is asserted so misuse by a caller fails
//! loudly instead of corrupting the tree.

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::{FileSystem, FsError, InodeId, InodeKind, InodeStat, MAX_FILE_BYTES, ROOT_INO};

struct Inode {
    kind: InodeKind,
    nlink: u16,
    data: Vec<u8>,
    children: BTreeMap<String, InodeId>,
    parent: InodeId,
    refs: u32,
    locked: bool,
}

impl Inode {
    fn new(kind: InodeKind, parent: InodeId) -> Self {
        Self {
            kind,
            nlink: 1,
            data: Vec::new(),
            children: BTreeMap::new(),
            parent,
            refs: 1,
            locked: false,
        }
    }

    fn is_dir(&self) -> bool {
        self.kind == InodeKind::Dir
    }
}

pub struct MemFs {
    inodes: HashMap<InodeId, Inode>,
    next_ino: InodeId,
    tx_depth: u32,
}

impl MemFs {
    pub fn new() -> Self {
        let mut inodes = HashMap::new();
        // Root is its own parent and stays pinned forever.
        inodes.insert(ROOT_INO, Inode::new(InodeKind::Dir, ROOT_INO));
        Self {
            inodes,
            next_ino: ROOT_INO + 1,
            tx_depth: 0,
        }
    }

    /// Install a file at `path` (relative paths resolve from the root),
    /// replacing existing contents. Convenience for populating the tree
    /// before the first process runs.
    pub fn add_file(&mut self, path: &str, bytes: &[u8]) -> Result<InodeId, FsError> {
        self.begin_op();
        let result = (|| {
            let ino = self.create(ROOT_INO, path, InodeKind::File)?;
            self.ilock(ino);
            self.node_mut(ino).data.clear();
            let r = self.writei(ino, 0, bytes);
            self.iunlockput(ino);
            r.map(|_| ino)
        })();
        self.end_op();
        result
    }

    fn node(&self, ino: InodeId) -> &Inode {
        self.inodes.get(&ino).expect("stale inode reference")
    }

    fn node_mut(&mut self, ino: InodeId) -> &mut Inode {
        self.inodes.get_mut(&ino).expect("stale inode reference")
    }

    /// Walk `path` without touching reference counts.
    fn walk(&self, cwd: InodeId, path: &str) -> Result<InodeId, FsError> {
        if path.is_empty() {
            return Err(FsError::BadPath);
        }
        let mut cur = if path.starts_with('/') { ROOT_INO } else { cwd };
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            let node = self.node(cur);
            if !node.is_dir() {
                return Err(FsError::NotADirectory);
            }
            cur = match comp {
                "." => cur,
                ".." => node.parent,
                name => *node.children.get(name).ok_or(FsError::NotFound)?,
            };
        }
        Ok(cur)
    }

    /// Resolve everything but the last component; returns the parent
    /// directory and the final name.
    fn walk_parent<'p>(&self, cwd: InodeId, path: &'p str) -> Result<(InodeId, &'p str), FsError> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(FsError::BadPath);
        }
        let (dir_part, name) = match trimmed.rfind('/') {
            Some(i) => (&trimmed[..i + 1], &trimmed[i + 1..]),
            None => ("", trimmed),
        };
        if name.is_empty() || name == "." || name == ".." {
            return Err(FsError::BadPath);
        }
        let dir = if dir_part.is_empty() {
            if path.starts_with('/') {
                ROOT_INO
            } else {
                cwd
            }
        } else {
            self.walk(cwd, dir_part)?
        };
        if !self.node(dir).is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok((dir, name))
    }

    fn maybe_free(&mut self, ino: InodeId) {
        if ino == ROOT_INO {
            return;
        }
        let node = self.node(ino);
        if node.nlink == 0 && node.refs == 0 {
            debug!("fs: freeing inode {}", ino);
            self.inodes.remove(&ino);
        }
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemFs {
    fn begin_op(&mut self) {
        self.tx_depth += 1;
    }

    fn end_op(&mut self) {
        assert!(self.tx_depth > 0, "end_op without begin_op");
        self.tx_depth -= 1;
    }

    fn namei(&mut self, cwd: InodeId, path: &str) -> Result<InodeId, FsError> {
        let ino = self.walk(cwd, path)?;
        self.node_mut(ino).refs += 1;
        Ok(ino)
    }

    fn ilock(&mut self, ino: InodeId) {
        let node = self.node_mut(ino);
        assert!(!node.locked, "inode {} locked twice", ino);
        node.locked = true;
    }

    fn iunlock(&mut self, ino: InodeId) {
        let node = self.node_mut(ino);
        assert!(node.locked, "inode {} not locked", ino);
        node.locked = false;
    }

    fn iunlockput(&mut self, ino: InodeId) {
        self.iunlock(ino);
        self.iput(ino);
    }

    fn idup(&mut self, ino: InodeId) -> InodeId {
        self.node_mut(ino).refs += 1;
        ino
    }

    fn iput(&mut self, ino: InodeId) {
        let node = self.node_mut(ino);
        assert!(node.refs > 0, "iput on dead inode {}", ino);
        node.refs -= 1;
        self.maybe_free(ino);
    }

    fn readi(&mut self, ino: InodeId, off: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        let node = self.node(ino);
        match node.kind {
            InodeKind::File => {}
            InodeKind::Dir => return Err(FsError::IsADirectory),
            InodeKind::Dev { .. } => return Err(FsError::NotSupported),
        }
        let off = off as usize;
        if off >= node.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(node.data.len() - off);
        buf[..n].copy_from_slice(&node.data[off..off + n]);
        Ok(n)
    }

    fn writei(&mut self, ino: InodeId, off: u32, buf: &[u8]) -> Result<usize, FsError> {
        assert!(self.tx_depth > 0, "fs write outside a transaction");
        let node = self.node_mut(ino);
        match node.kind {
            InodeKind::File => {}
            InodeKind::Dir => return Err(FsError::IsADirectory),
            InodeKind::Dev { .. } => return Err(FsError::NotSupported),
        }
        let end = off as usize + buf.len();
        if end > MAX_FILE_BYTES as usize {
            return Err(FsError::TooLarge);
        }
        if end > node.data.len() {
            node.data.resize(end, 0);
        }
        node.data[off as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn stati(&self, ino: InodeId) -> InodeStat {
        let node = self.node(ino);
        let size = match node.kind {
            InodeKind::File => node.data.len() as u32,
            _ => 0,
        };
        InodeStat {
            kind: node.kind,
            ino,
            size,
            nlink: node.nlink,
        }
    }

    fn create(&mut self, cwd: InodeId, path: &str, kind: InodeKind) -> Result<InodeId, FsError> {
        assert!(self.tx_depth > 0, "fs write outside a transaction");
        let (dir, name) = self.walk_parent(cwd, path)?;
        if let Some(&existing) = self.node(dir).children.get(name) {
            // Opening an existing regular file with create semantics is
            // fine; anything else is a collision.
            if kind == InodeKind::File && self.node(existing).kind == InodeKind::File {
                self.node_mut(existing).refs += 1;
                return Ok(existing);
            }
            return Err(FsError::Exists);
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(ino, Inode::new(kind, dir));
        self.node_mut(dir).children.insert(name.to_string(), ino);
        debug!("fs: created {:?} {} as inode {}", kind, name, ino);
        Ok(ino)
    }

    fn link(&mut self, cwd: InodeId, old: &str, new: &str) -> Result<(), FsError> {
        assert!(self.tx_depth > 0, "fs write outside a transaction");
        let target = self.walk(cwd, old)?;
        if self.node(target).kind != InodeKind::File {
            return Err(FsError::NotSupported);
        }
        let (dir, name) = self.walk_parent(cwd, new)?;
        if self.node(dir).children.contains_key(name) {
            return Err(FsError::Exists);
        }
        self.node_mut(dir).children.insert(name.to_string(), target);
        self.node_mut(target).nlink += 1;
        Ok(())
    }

    fn unlink(&mut self, cwd: InodeId, path: &str) -> Result<(), FsError> {
        assert!(self.tx_depth > 0, "fs write outside a transaction");
        let (dir, name) = self.walk_parent(cwd, path)?;
        let ino = *self.node(dir).children.get(name).ok_or(FsError::NotFound)?;
        let node = self.node(ino);
        if node.is_dir() && !node.children.is_empty() {
            return Err(FsError::NotEmpty);
        }
        self.node_mut(dir).children.remove(name);
        self.node_mut(ino).nlink -= 1;
        self.maybe_free(ino);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_resolve_nested_path() {
        let mut fs = MemFs::new();
        fs.begin_op();
        let bin = fs.create(ROOT_INO, "/bin", InodeKind::Dir).unwrap();
        let sh = fs.create(ROOT_INO, "/bin/sh", InodeKind::File).unwrap();
        fs.end_op();

        assert_eq!(fs.namei(ROOT_INO, "/bin/sh").unwrap(), sh);
        // Relative resolution from /bin, including dot components.
        assert_eq!(fs.namei(bin, "sh").unwrap(), sh);
        assert_eq!(fs.namei(bin, "../bin/./sh").unwrap(), sh);
        assert_eq!(fs.namei(bin, "nope"), Err(FsError::NotFound));
    }

    #[test]
    fn read_write_round_trip_and_growth() {
        let mut fs = MemFs::new();
        let ino = fs.add_file("greeting", b"hello").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(fs.readi(ino, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(fs.readi(ino, 5, &mut buf).unwrap(), 0);

        fs.begin_op();
        // Sparse write past the end zero-fills the gap.
        fs.writei(ino, 8, b"x").unwrap();
        fs.end_op();
        assert_eq!(fs.stati(ino).size, 9);
        assert_eq!(fs.readi(ino, 5, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"\0\0\0x");
    }

    #[test]
    fn create_existing_file_returns_same_inode() {
        let mut fs = MemFs::new();
        fs.begin_op();
        let a = fs.create(ROOT_INO, "f", InodeKind::File).unwrap();
        let b = fs.create(ROOT_INO, "f", InodeKind::File).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            fs.create(ROOT_INO, "f", InodeKind::Dir),
            Err(FsError::Exists)
        );
        fs.end_op();
    }

    #[test]
    fn unlinked_open_file_survives_until_released() {
        let mut fs = MemFs::new();
        let ino = fs.add_file("tmp", b"data").unwrap();
        let held = fs.namei(ROOT_INO, "tmp").unwrap();

        fs.begin_op();
        fs.unlink(ROOT_INO, "tmp").unwrap();
        fs.end_op();

        assert_eq!(fs.namei(ROOT_INO, "tmp"), Err(FsError::NotFound));
        // Still readable through the held reference.
        let mut buf = [0u8; 4];
        assert_eq!(fs.readi(held, 0, &mut buf).unwrap(), 4);
        fs.iput(held);
        assert!(!fs.inodes.contains_key(&ino));
    }

    #[test]
    fn link_shares_contents_across_names() {
        let mut fs = MemFs::new();
        fs.add_file("a", b"shared").unwrap();
        fs.begin_op();
        fs.link(ROOT_INO, "a", "b").unwrap();
        fs.unlink(ROOT_INO, "a").unwrap();
        fs.end_op();

        let ino = fs.namei(ROOT_INO, "b").unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(fs.readi(ino, 0, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"shared");
        fs.iput(ino);
    }

    #[test]
    fn unlink_refuses_populated_directory() {
        let mut fs = MemFs::new();
        fs.begin_op();
        fs.create(ROOT_INO, "d", InodeKind::Dir).unwrap();
        fs.create(ROOT_INO, "d/f", InodeKind::File).unwrap();
        assert_eq!(fs.unlink(ROOT_INO, "d"), Err(FsError::NotEmpty));
        fs.unlink(ROOT_INO, "d/f").unwrap();
        fs.unlink(ROOT_INO, "d").unwrap();
        fs.end_op();
        assert_eq!(fs.namei(ROOT_INO, "d"), Err(FsError::NotFound));
    }

    #[test]
    fn device_inodes_have_no_data_plane() {
        let mut fs = MemFs::new();
        fs.begin_op();
        let dev = fs
            .create(ROOT_INO, "console", InodeKind::Dev { major: 1, minor: 0 })
            .unwrap();
        fs.end_op();
        let mut buf = [0u8; 1];
        assert_eq!(fs.readi(dev, 0, &mut buf), Err(FsError::NotSupported));
        assert_eq!(fs.stati(dev).kind, InodeKind::Dev { major: 1, minor: 0 });
    }

    #[test]
    #[should_panic(expected = "outside a transaction")]
    fn write_outside_transaction_is_a_bug() {
        let mut fs = MemFs::new();
        let ino = fs.add_file("f", b"").unwrap();
        let _ = fs.writei(ino, 0, b"x");
    }
}
