//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which encapsulates all architecture-specific logic.
//! The relocation engine stays generic: it decides *what* value a site needs (the target itself,
//! a jump island, or a pointer cell) and the backend decides *how* that value is encoded.

use thiserror::Error;

use crate::trampoline::TrampolineLayout;

pub mod aarch64;
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub type HostArch = x86_64::X86_64;
#[cfg(target_arch = "aarch64")]
pub type HostArch = aarch64::Aarch64;

/// Relocation kinds after decoding, independent of the container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// S + A, 64 bits.
    Abs64,
    /// S + A, zero-extended 32 bits.
    Abs32,
    /// S + A, sign-extended 32 bits.
    Abs32S,
    /// S + A - P, signed 32 bits.
    Rel32,
    /// Call or jump displacement. May be redirected through a jump island.
    Branch,
    /// P-relative reference to a pointer cell holding S.
    GotRel32,
    /// P-relative reference to a `(module, offset)` pair for a TLS symbol.
    TlsGd,
    /// Page(S + A) - Page(P), as an `ADRP` immediate.
    Page21,
    /// Low 12 bits of S + A, divided by `1 << shift`, as an `ADD` or load/store offset.
    Lo12 { shift: u8 },
    /// Page of a pointer cell holding S + A, relative to Page(P).
    GotPage21,
    /// Low 12 bits of a pointer cell's address, as a 64-bit load offset.
    GotLo12,
    /// Anything else; carries the raw format-specific type.
    Unsupported(u32),
}

impl RelocKind {
    /// Kinds whose encoding is relative to the site, and so bounded in reach.
    pub fn is_pc_relative(self) -> bool {
        matches!(
            self,
            RelocKind::Rel32
                | RelocKind::Branch
                | RelocKind::GotRel32
                | RelocKind::TlsGd
                | RelocKind::Page21
                | RelocKind::GotPage21
        )
    }

    /// Kinds that may need an entry in the trampoline pool. A page/offset pair
    /// shares one cell, so only the page half is counted.
    pub fn may_need_indirection(self) -> bool {
        matches!(
            self,
            RelocKind::Rel32 | RelocKind::Branch | RelocKind::GotRel32 | RelocKind::TlsGd | RelocKind::GotPage21
        )
    }

    /// Kinds whose site holds the address of a pointer cell rather than of S.
    pub fn uses_cell(self) -> bool {
        matches!(self, RelocKind::GotRel32 | RelocKind::GotPage21 | RelocKind::GotLo12)
    }
}

/// Why a value could not be written at a site.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PatchError {
    #[error("value {value:#x} does not fit the encoding")]
    OutOfRange { value: i64 },
    #[error("displacement {value:#x} is not instruction aligned")]
    Misaligned { value: i64 },
    #[error("site at offset {offset:#x} runs past the section")]
    OutOfBounds { offset: usize },
    #[error("relocation kind is not handled by this architecture")]
    Unsupported,
}

/// A trait representing a target architecture (e.g., x86_64, AArch64).
pub trait Architecture: Send + Sync {
    fn name(&self) -> &'static str;

    /// The object crate's name for this architecture, used to reject foreign objects.
    fn machine(&self) -> object::Architecture;

    /// Layout of this architecture's jump islands.
    fn trampoline(&self) -> TrampolineLayout;

    /// Distance from the load anchor that every placed region must stay within,
    /// if the architecture's short encodings cannot be bridged otherwise.
    fn placement_reach(&self) -> Option<u64>;

    /// Number of bytes written at the site for `kind`, or `None` if unsupported.
    fn patch_width(&self, kind: RelocKind) -> Option<usize>;

    /// Applies a relocation to a buffer.
    ///
    /// # Arguments
    /// * `offset` - The offset within `data` where the relocation is applied.
    /// * `kind` - The decoded relocation kind.
    /// * `p` - The runtime address of the location being relocated (P).
    /// * `s` - The value the site must reach: symbol, jump island or cell (S).
    /// * `a` - The addend (A).
    /// * `data` - The writable bytes of the segment holding the site.
    fn apply_relocation(
        &self,
        offset: usize,
        kind: RelocKind,
        p: u64,
        s: u64,
        a: i64,
        data: &mut [u8],
    ) -> Result<(), PatchError>;
}

/// Writes `bytes` at `offset`, refusing to run past the end of `data`.
pub(crate) fn write_at(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), PatchError> {
    let site = offset
        .checked_add(bytes.len())
        .and_then(|end| data.get_mut(offset..end))
        .ok_or(PatchError::OutOfBounds { offset })?;
    site.copy_from_slice(bytes);
    Ok(())
}

/// Reads a little-endian `u32` at `offset`.
pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32, PatchError> {
    let site = data.get(offset..offset + 4).ok_or(PatchError::OutOfBounds { offset })?;
    let mut word = [0u8; 4];
    word.copy_from_slice(site);
    Ok(u32::from_le_bytes(word))
}
