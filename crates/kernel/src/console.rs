//! Console input queue.
//!
//! The serial interrupt handler moves received bytes from the machine into
//! this queue; console reads drain it. Raw bytes only, no line discipline.
//! Output needs no buffering here and goes straight to the serial
//! transmitter.

use std::collections::VecDeque;

pub struct Console {
    input: VecDeque<u8>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            input: VecDeque::new(),
        }
    }

    pub fn push(&mut self, byte: u8) {
        self.input.push_back(byte);
    }

    pub fn has_input(&self) -> bool {
        !self.input.is_empty()
    }

    /// Take up to `n` bytes; a short read when less is buffered.
    pub fn read(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.input.len());
        self.input.drain(..n).collect()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_short_when_little_is_buffered() {
        let mut c = Console::new();
        for b in b"hi" {
            c.push(*b);
        }
        assert_eq!(c.read(8), b"hi");
        assert!(!c.has_input());
        assert!(c.read(8).is_empty());
    }
}
