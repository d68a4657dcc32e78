//! x86_64 Architecture backend.
//!
//! Implements the `Architecture` trait for 64-bit x86 systems.

use super::{write_at, Architecture, PatchError, RelocKind};
use crate::trampoline::TrampolineLayout;
use crate::utils::fits_signed;

/// The x86_64 architecture backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86_64;

impl Architecture for X86_64 {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn machine(&self) -> object::Architecture {
        object::Architecture::X86_64
    }

    fn trampoline(&self) -> TrampolineLayout {
        TrampolineLayout::X86_64
    }

    // Calls and GOT loads reach anywhere through the pool, so placement is free.
    fn placement_reach(&self) -> Option<u64> {
        None
    }

    fn patch_width(&self, kind: RelocKind) -> Option<usize> {
        match kind {
            RelocKind::Abs64 => Some(8),
            RelocKind::Abs32
            | RelocKind::Abs32S
            | RelocKind::Rel32
            | RelocKind::Branch
            | RelocKind::GotRel32
            | RelocKind::TlsGd => Some(4),
            RelocKind::Page21
            | RelocKind::Lo12 { .. }
            | RelocKind::GotPage21
            | RelocKind::GotLo12
            | RelocKind::Unsupported(_) => None,
        }
    }

    fn apply_relocation(
        &self,
        offset: usize,
        kind: RelocKind,
        p: u64, // Place of storage (P) - The VA where the relocation is written
        s: u64, // Symbol, island or cell VA (S)
        a: i64, // Addend (A)
        data: &mut [u8],
    ) -> Result<(), PatchError> {
        let value: i64 = match kind {
            // R_X86_64_64 / 32 / 32S: S + A
            RelocKind::Abs64 | RelocKind::Abs32 | RelocKind::Abs32S => (s as i64).wrapping_add(a),

            // R_X86_64_PC32 / PLT32 / GOTPCREL(X) / TLSGD: S + A - P
            RelocKind::Rel32 | RelocKind::Branch | RelocKind::GotRel32 | RelocKind::TlsGd => {
                (s as i64).wrapping_add(a).wrapping_sub(p as i64)
            }
            RelocKind::Unsupported(raw) => {
                tracing::trace!("Unsupported relocation type: {}", raw);
                return Err(PatchError::Unsupported);
            }
            RelocKind::Page21 | RelocKind::Lo12 { .. } | RelocKind::GotPage21 | RelocKind::GotLo12 => {
                return Err(PatchError::Unsupported);
            }
        };

        match kind {
            RelocKind::Abs64 => write_at(data, offset, &(value as u64).to_le_bytes()),
            RelocKind::Abs32 => {
                let value = u32::try_from(value).map_err(|_| PatchError::OutOfRange { value })?;
                write_at(data, offset, &value.to_le_bytes())
            }
            _ => {
                // Displacements and 32S values are signed 32-bit integers.
                if !fits_signed(value, 32) {
                    return Err(PatchError::OutOfRange { value });
                }
                write_at(data, offset, &(value as i32).to_le_bytes())
            }
        }
    }
}
