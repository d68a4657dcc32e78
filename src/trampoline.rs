//! Jump islands.
//!
//! Each module gets a fixed pool of 16-byte entries placed right after its
//! image. An entry holds a 64-bit target and a short stub that jumps to it, so
//! the same entry serves as a jump island for branches and as a pointer cell
//! for GOT-style loads. Entries are keyed by target address and reused.

use std::collections::HashMap;

use crate::memory::Region;

/// Stub layout, selected once per target architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineLayout {
    /// `.quad target; jmp *-14(%rip)`
    X86_64,
    /// `ldr x16, #8; br x16; .quad target`
    Aarch64,
}

const X86_64_TEMPLATE: [u8; 16] = [
    0, 0, 0, 0, 0, 0, 0, 0, // target
    0xff, 0x25, 0xf2, 0xff, 0xff, 0xff, // jmp *-14(%rip)
    0xcc, 0xcc,
];

const AARCH64_TEMPLATE: [u8; 16] = [
    0x50, 0x00, 0x00, 0x58, // ldr x16, #8
    0x00, 0x02, 0x1f, 0xd6, // br x16
    0, 0, 0, 0, 0, 0, 0, 0, // target
];

impl TrampolineLayout {
    pub const ENTRY_SIZE: usize = 16;

    pub fn template(self) -> &'static [u8; 16] {
        match self {
            TrampolineLayout::X86_64 => &X86_64_TEMPLATE,
            TrampolineLayout::Aarch64 => &AARCH64_TEMPLATE,
        }
    }

    /// Where the 64-bit target sits inside an entry.
    pub fn target_offset(self) -> usize {
        match self {
            TrampolineLayout::X86_64 => 0,
            TrampolineLayout::Aarch64 => 8,
        }
    }

    /// Where execution enters an entry.
    pub fn entry_offset(self) -> usize {
        match self {
            TrampolineLayout::X86_64 => 8,
            TrampolineLayout::Aarch64 => 0,
        }
    }

    /// Bytes needed for `count` entries.
    pub fn pool_size(self, count: usize) -> u64 {
        (count * Self::ENTRY_SIZE) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    Exhausted,
    NotWritable,
}

/// A module's jump islands and pointer cells.
#[derive(Debug)]
pub struct TrampolinePool {
    layout: TrampolineLayout,
    /// Index of the segment holding the pool.
    segment: usize,
    base: u64,
    capacity: usize,
    used: usize,
    by_target: HashMap<u64, usize>,
    tls_pairs: HashMap<(u64, u64), usize>,
}

impl TrampolinePool {
    pub fn new(layout: TrampolineLayout, segment: usize, base: u64, capacity: usize) -> Self {
        Self {
            layout,
            segment,
            base,
            capacity,
            used: 0,
            by_target: HashMap::new(),
            tls_pairs: HashMap::new(),
        }
    }

    pub fn segment(&self) -> usize {
        self.segment
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn size(&self) -> u64 {
        self.layout.pool_size(self.capacity)
    }

    /// Address of a jump island that continues at `target`.
    pub fn jump_to(&mut self, target: u64, region: &mut Region) -> Result<u64, PoolError> {
        let index = self.entry_for(target, region)?;
        Ok(self.entry_address(index) + self.layout.entry_offset() as u64)
    }

    /// Address of an 8-byte cell holding `target`.
    pub fn cell_for(&mut self, target: u64, region: &mut Region) -> Result<u64, PoolError> {
        let index = self.entry_for(target, region)?;
        Ok(self.entry_address(index) + self.layout.target_offset() as u64)
    }

    /// Address of a 16-byte `(module, offset)` pair, as `__tls_get_addr` expects.
    pub fn tls_pair(&mut self, module: u64, offset: u64, region: &mut Region) -> Result<u64, PoolError> {
        if let Some(&index) = self.tls_pairs.get(&(module, offset)) {
            return Ok(self.entry_address(index));
        }
        let index = self.claim()?;
        let mut pair = [0u8; 16];
        pair[..8].copy_from_slice(&module.to_le_bytes());
        pair[8..].copy_from_slice(&offset.to_le_bytes());
        self.write_entry(index, &pair, region)?;
        self.tls_pairs.insert((module, offset), index);
        Ok(self.entry_address(index))
    }

    fn entry_for(&mut self, target: u64, region: &mut Region) -> Result<usize, PoolError> {
        if let Some(&index) = self.by_target.get(&target) {
            return Ok(index);
        }
        let index = self.claim()?;
        let mut entry = *self.layout.template();
        let at = self.layout.target_offset();
        entry[at..at + 8].copy_from_slice(&target.to_le_bytes());
        self.write_entry(index, &entry, region)?;
        self.by_target.insert(target, index);
        tracing::trace!(target = format_args!("{target:#x}"), index, "new jump island");
        Ok(index)
    }

    fn claim(&mut self) -> Result<usize, PoolError> {
        if self.used == self.capacity {
            return Err(PoolError::Exhausted);
        }
        self.used += 1;
        Ok(self.used - 1)
    }

    fn entry_address(&self, index: usize) -> u64 {
        self.base + (index * TrampolineLayout::ENTRY_SIZE) as u64
    }

    fn write_entry(&self, index: usize, entry: &[u8; 16], region: &mut Region) -> Result<(), PoolError> {
        let start = (self.entry_address(index) - region.base()) as usize;
        let bytes = region.bytes_mut().ok_or(PoolError::NotWritable)?;
        bytes[start..start + TrampolineLayout::ENTRY_SIZE].copy_from_slice(entry);
        Ok(())
    }
}
