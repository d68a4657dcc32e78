//! Proddable blocks.
//!
//! A sanity check only: the list of address ranges a module's relocations may
//! write to. Every loaded section and the module's trampoline pool is
//! registered when it is placed. A patch that lands anywhere else means the
//! loader computed a bad site or trusted a bad record.

use std::ops::Range;

#[derive(Debug, Default, Clone)]
pub struct ProddableBlocks {
    /// Sorted by start.
    blocks: Vec<Range<u64>>,
}

impl ProddableBlocks {
    /// Registers `[start, start + size)`. Neighbouring blocks stay separate, so
    /// a write straddling two sections is still caught.
    pub fn add(&mut self, start: u64, size: u64) {
        if size == 0 {
            return;
        }
        let new = start..start + size;
        let at = self.blocks.partition_point(|b| b.start < new.start);
        self.blocks.insert(at, new);
    }

    /// Whether `[address, address + size)` lies entirely inside one block.
    pub fn check(&self, address: u64, size: usize) -> bool {
        let end = match address.checked_add(size as u64) {
            Some(end) => end,
            None => return false,
        };
        let at = self.blocks.partition_point(|b| b.start <= address);
        self.blocks[..at].iter().rev().any(|b| end <= b.end)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
