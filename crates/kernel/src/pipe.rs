//! Pipes: bounded byte rings between a read end and a write end.

use std::collections::VecDeque;

use crate::config::PIPE_SIZE;

pub struct Pipe {
    buf: VecDeque<u8>,
    pub read_open: bool,
    pub write_open: bool,
}

impl Pipe {
    fn new() -> Self {
        Self {
            buf: VecDeque::new(),
            read_open: true,
            write_open: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn space(&self) -> usize {
        PIPE_SIZE - self.buf.len()
    }

    /// Queue up to the available space; the short count keeps a blocked
    /// writer restartable without duplicating bytes.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.space());
        self.buf.extend(&bytes[..n]);
        n
    }

    /// Drain up to `n` bytes.
    pub fn pop(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buf.len());
        self.buf.drain(..n).collect()
    }
}

pub struct PipeTable {
    pipes: Vec<Option<Pipe>>,
}

impl PipeTable {
    pub fn new() -> Self {
        Self { pipes: Vec::new() }
    }

    pub fn alloc(&mut self) -> usize {
        if let Some(id) = self.pipes.iter().position(|p| p.is_none()) {
            self.pipes[id] = Some(Pipe::new());
            return id;
        }
        self.pipes.push(Some(Pipe::new()));
        self.pipes.len() - 1
    }

    pub fn get(&self, id: usize) -> &Pipe {
        self.pipes[id].as_ref().expect("stale pipe id")
    }

    pub fn get_mut(&mut self, id: usize) -> &mut Pipe {
        self.pipes[id].as_mut().expect("stale pipe id")
    }

    /// Mark one end closed; the ring is freed once both ends are gone.
    pub fn close_end(&mut self, id: usize, write_end: bool) {
        let pipe = self.get_mut(id);
        if write_end {
            pipe.write_open = false;
        } else {
            pipe.read_open = false;
        }
        if !pipe.read_open && !pipe.write_open {
            self.pipes[id] = None;
        }
    }
}

impl Default for PipeTable {
    fn default() -> Self {
        Self::new()
    }
}
