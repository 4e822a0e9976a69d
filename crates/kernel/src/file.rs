//! System-wide open file table.
//!
//! Descriptors in a process map to entries here; fork and dup share entries
//! by bumping a reference count, so shared descriptors see one file offset.
//! The table stores no inode or pipe state itself, only which object the
//! entry points at; the last close hands the kind back to the caller so it
//! can drop the underlying reference.

use storage::InodeId;

use crate::config::NFILE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Inode { ino: InodeId },
    Device { major: u16, ino: InodeId },
    Pipe { pipe: usize, write_end: bool },
}

#[derive(Debug)]
pub struct OpenFile {
    pub kind: FileKind,
    pub readable: bool,
    pub writable: bool,
    /// Byte offset for inode-backed files; unused for devices and pipes.
    pub offset: u32,
    refs: u32,
}

pub struct FileTable {
    files: Vec<Option<OpenFile>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            files: (0..NFILE).map(|_| None).collect(),
        }
    }

    pub fn alloc(&mut self, kind: FileKind, readable: bool, writable: bool) -> Option<usize> {
        let id = self.files.iter().position(|f| f.is_none())?;
        self.files[id] = Some(OpenFile {
            kind,
            readable,
            writable,
            offset: 0,
            refs: 1,
        });
        Some(id)
    }

    pub fn get(&self, id: usize) -> &OpenFile {
        self.files[id].as_ref().expect("stale file id")
    }

    pub fn get_mut(&mut self, id: usize) -> &mut OpenFile {
        self.files[id].as_mut().expect("stale file id")
    }

    /// Add a reference, as fork and dup do.
    pub fn dup(&mut self, id: usize) {
        self.get_mut(id).refs += 1;
    }

    /// Drop a reference. Returns the file's kind when the entry dies so the
    /// caller can release the inode or pipe end behind it.
    pub fn close(&mut self, id: usize) -> Option<FileKind> {
        let file = self.files[id].as_mut().expect("stale file id");
        file.refs -= 1;
        if file.refs > 0 {
            return None;
        }
        let kind = file.kind;
        self.files[id] = None;
        Some(kind)
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_entries_die_on_last_close() {
        let mut ft = FileTable::new();
        let id = ft.alloc(FileKind::Inode { ino: 7 }, true, false).unwrap();
        ft.dup(id);
        assert_eq!(ft.close(id), None);
        assert_eq!(ft.close(id), Some(FileKind::Inode { ino: 7 }));
        // Slot is reusable afterwards.
        assert_eq!(ft.alloc(FileKind::Device { major: 1, ino: 3 }, true, true), Some(id));
    }

    #[test]
    fn offset_is_shared_through_the_entry() {
        let mut ft = FileTable::new();
        let id = ft.alloc(FileKind::Inode { ino: 2 }, true, true).unwrap();
        ft.dup(id);
        ft.get_mut(id).offset += 16;
        assert_eq!(ft.get(id).offset, 16);
    }

    #[test]
    fn table_exhaustion_returns_none() {
        let mut ft = FileTable::new();
        for _ in 0..NFILE {
            assert!(ft.alloc(FileKind::Device { major: 1, ino: 3 }, true, true).is_some());
        }
        assert!(ft.alloc(FileKind::Device { major: 1, ino: 3 }, true, true).is_none());
    }
}
