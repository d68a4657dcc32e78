//! AArch64 Architecture backend.
//!
//! `B`/`BL` carry a 26-bit word displacement (±128MiB) and `ADRP` reaches ±4GiB,
//! so everything this linker places must stay within 4GiB of the load anchor.
//! Addresses are formed as an `ADRP` page plus a 12-bit low part in the
//! following `ADD` or load/store; GOT references do the same against a pointer
//! cell in the module's pool.

use super::{read_u32, write_at, Architecture, PatchError, RelocKind};
use crate::trampoline::TrampolineLayout;
use crate::utils::fits_signed;

const ADRP_REACH: u64 = 1 << 32;

/// The AArch64 architecture backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aarch64;

impl Architecture for Aarch64 {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn machine(&self) -> object::Architecture {
        object::Architecture::Aarch64
    }

    fn trampoline(&self) -> TrampolineLayout {
        TrampolineLayout::Aarch64
    }

    fn placement_reach(&self) -> Option<u64> {
        Some(ADRP_REACH)
    }

    fn patch_width(&self, kind: RelocKind) -> Option<usize> {
        match kind {
            RelocKind::Abs64 => Some(8),
            RelocKind::Abs32
            | RelocKind::Abs32S
            | RelocKind::Rel32
            | RelocKind::Branch
            | RelocKind::GotRel32
            | RelocKind::Page21
            | RelocKind::Lo12 { .. }
            | RelocKind::GotPage21
            | RelocKind::GotLo12 => Some(4),
            RelocKind::TlsGd | RelocKind::Unsupported(_) => None,
        }
    }

    fn apply_relocation(
        &self,
        offset: usize,
        kind: RelocKind,
        p: u64,
        s: u64,
        a: i64,
        data: &mut [u8],
    ) -> Result<(), PatchError> {
        match kind {
            // R_AARCH64_ABS64
            RelocKind::Abs64 => {
                let value = (s as i64).wrapping_add(a) as u64;
                write_at(data, offset, &value.to_le_bytes())
            }
            // R_AARCH64_ABS32
            RelocKind::Abs32 => {
                let value = (s as i64).wrapping_add(a);
                let value = u32::try_from(value).map_err(|_| PatchError::OutOfRange { value })?;
                write_at(data, offset, &value.to_le_bytes())
            }
            RelocKind::Abs32S => {
                let value = (s as i64).wrapping_add(a);
                if !fits_signed(value, 32) {
                    return Err(PatchError::OutOfRange { value });
                }
                write_at(data, offset, &(value as i32).to_le_bytes())
            }
            // R_AARCH64_PREL32 / GOTPCREL32
            RelocKind::Rel32 | RelocKind::GotRel32 => {
                let value = (s as i64).wrapping_add(a).wrapping_sub(p as i64);
                if !fits_signed(value, 32) {
                    return Err(PatchError::OutOfRange { value });
                }
                write_at(data, offset, &(value as i32).to_le_bytes())
            }
            // R_AARCH64_CALL26 / JUMP26
            RelocKind::Branch => {
                let value = (s as i64).wrapping_add(a).wrapping_sub(p as i64);
                if value & 0b11 != 0 {
                    return Err(PatchError::Misaligned { value });
                }
                if !fits_signed(value, 28) {
                    return Err(PatchError::OutOfRange { value });
                }
                let insn = read_u32(data, offset)?;
                let imm26 = ((value >> 2) as u32) & 0x03ff_ffff;
                write_at(data, offset, &((insn & 0xfc00_0000) | imm26).to_le_bytes())
            }
            // R_AARCH64_ADR_PREL_PG_HI21 / ADR_GOT_PAGE
            RelocKind::Page21 | RelocKind::GotPage21 => {
                let target = (s as i64).wrapping_add(a);
                let value = (target & !0xfff).wrapping_sub(p as i64 & !0xfff);
                if !fits_signed(value, 33) {
                    return Err(PatchError::OutOfRange { value });
                }
                let imm = (value >> 12) as u32;
                let insn = read_u32(data, offset)?;
                let insn = (insn & 0x9f00_001f) | ((imm & 0b11) << 29) | (((imm >> 2) & 0x7_ffff) << 5);
                write_at(data, offset, &insn.to_le_bytes())
            }
            // R_AARCH64_ADD_ABS_LO12_NC / LDST*_ABS_LO12_NC
            RelocKind::Lo12 { shift } => write_lo12(data, offset, (s as i64).wrapping_add(a), shift),
            // R_AARCH64_LD64_GOT_LO12_NC
            RelocKind::GotLo12 => write_lo12(data, offset, (s as i64).wrapping_add(a), 3),
            RelocKind::TlsGd | RelocKind::Unsupported(_) => Err(PatchError::Unsupported),
        }
    }
}

/// Puts the low 12 bits of `value`, scaled down by the access size, into the
/// `imm12` field of an `ADD` or load/store. No overflow check (`_NC`).
fn write_lo12(data: &mut [u8], offset: usize, value: i64, shift: u8) -> Result<(), PatchError> {
    let low = value & 0xfff;
    if low & ((1 << shift) - 1) != 0 {
        return Err(PatchError::Misaligned { value });
    }
    let insn = read_u32(data, offset)?;
    let imm12 = ((low >> shift) as u32) & 0xfff;
    write_at(data, offset, &((insn & !(0xfff << 10)) | (imm12 << 10)).to_le_bytes())
}
