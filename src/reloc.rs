//! Relocation engine.
//!
//! Patches a module's sites once every target has been resolved. A site that
//! cannot reach its target directly is redirected into the module's pool:
//! branches to code through a jump island, GOT-style loads through a pointer
//! cell. Anything else out of range is fatal.

use crate::arch::{Architecture, PatchError, RelocKind};
use crate::decode::RelocationRecord;
use crate::error::{FatalError, LinkError, Result};
use crate::layout::Segment;
use crate::memory::Region;
use crate::module::Module;
use crate::symbol::SymbolKind;
use crate::trampoline::{PoolError, TrampolinePool};

/// What a relocation resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Address { address: u64, kind: SymbolKind },
    /// A thread-local variable: TLS module id and offset in its block.
    Tls { module: u64, offset: u64 },
}

/// Upper bound on the pool entries a module may need.
pub fn pool_capacity(relocations: &[RelocationRecord]) -> usize {
    relocations.iter().filter(|r| r.kind.may_need_indirection()).count()
}

/// Rejects relocation kinds the architecture cannot encode, before any byte is written.
pub fn check_supported<A: Architecture + ?Sized>(arch: &A, module: &str, relocations: &[RelocationRecord]) -> Result<()> {
    for record in relocations {
        if arch.patch_width(record.kind).is_none() {
            let raw = match record.kind {
                RelocKind::Unsupported(raw) => raw,
                _ => 0,
            };
            return Err(LinkError::UnsupportedRelocation {
                module: module.to_string(),
                raw,
                site: record.offset,
            });
        }
    }
    Ok(())
}

fn corrupt(module: &str, reason: impl Into<String>) -> LinkError {
    FatalError::CorruptRelocation {
        module: module.to_string(),
        reason: reason.into(),
    }
    .into()
}

/// Runs `op` against the module's pool and the region holding it.
fn with_pool(
    pool: &mut Option<TrampolinePool>,
    segments: &mut [Segment],
    module: &str,
    op: impl FnOnce(&mut TrampolinePool, &mut Region) -> Result<u64, PoolError>,
) -> Result<u64> {
    let pool = pool.as_mut().ok_or_else(|| FatalError::PoolExhausted {
        module: module.to_string(),
        capacity: 0,
    })?;
    let region = &mut segments[pool.segment()].region;
    op(pool, region).map_err(|err| match err {
        PoolError::Exhausted => FatalError::PoolExhausted {
            module: module.to_string(),
            capacity: pool.capacity(),
        }
        .into(),
        PoolError::NotWritable => corrupt(module, "trampoline pool is sealed"),
    })
}

fn patch<A: Architecture + ?Sized>(
    arch: &A,
    segment: &mut Segment,
    site: u64,
    kind: RelocKind,
    value: u64,
    addend: i64,
) -> Result<(), PatchError> {
    let offset = (site - segment.base()) as usize;
    let data = segment.region.bytes_mut().ok_or(PatchError::OutOfBounds { offset })?;
    arch.apply_relocation(offset, kind, site, value, addend, data)
}

/// Applies `relocations` to `module`, `targets[i]` being the resolution of `relocations[i]`.
///
/// Every segment must still be writable. Returns the number of sites patched;
/// relocations of sections that were not loaded are skipped.
pub fn apply_relocations<A: Architecture + ?Sized>(
    arch: &A,
    module: &mut Module,
    relocations: &[RelocationRecord],
    targets: &[Target],
    check_proddables: bool,
) -> Result<usize> {
    let name = module.identity.to_string();
    let Module {
        sections,
        segments,
        pool,
        proddables,
        ..
    } = module;
    if relocations.len() != targets.len() {
        return Err(corrupt(&name, "relocation and target counts differ"));
    }

    let mut applied = 0;
    for (record, target) in relocations.iter().zip(targets) {
        let section = sections
            .get(record.section)
            .ok_or_else(|| corrupt(&name, format!("no section {}", record.section)))?;
        let Some(segment) = section.segment else {
            continue;
        };
        let width = arch.patch_width(record.kind).ok_or_else(|| LinkError::UnsupportedRelocation {
            module: name.clone(),
            raw: match record.kind {
                RelocKind::Unsupported(raw) => raw,
                _ => 0,
            },
            site: record.offset,
        })?;
        if record.offset.saturating_add(width as u64) > section.size {
            return Err(corrupt(
                &name,
                format!("site {:#x} runs past {} ({:#x} bytes)", record.offset, section.name, section.size),
            ));
        }
        let site = section.start + record.offset;
        if check_proddables && !proddables.check(site, width) {
            return Err(FatalError::ProddableViolation {
                module: name,
                address: site,
                size: width,
            }
            .into());
        }

        let mut addend = record.addend;
        let value = match (*target, record.kind) {
            (Target::Tls { module: tls_module, offset }, RelocKind::TlsGd) => {
                with_pool(pool, segments, &name, |p, r| p.tls_pair(tls_module, offset, r))?
            }
            (Target::Address { .. }, RelocKind::TlsGd) => {
                return Err(LinkError::Malformed {
                    module: name,
                    reason: format!("TLS reference at {site:#x} names a non-thread-local symbol"),
                });
            }
            (Target::Tls { .. }, _) => {
                return Err(corrupt(&name, format!("TLS mismatch at {site:#x}")));
            }
            (Target::Address { address, .. }, RelocKind::GotRel32) => {
                with_pool(pool, segments, &name, |p, r| p.cell_for(address, r))?
            }
            // The addend belongs to the cell's contents, not its address.
            (Target::Address { address, .. }, RelocKind::GotPage21 | RelocKind::GotLo12) => {
                addend = 0;
                let cell = address.wrapping_add_signed(record.addend);
                with_pool(pool, segments, &name, |p, r| p.cell_for(cell, r))?
            }
            (Target::Address { address, .. }, _) => address,
        };

        match patch(arch, &mut segments[segment], site, record.kind, value, addend) {
            Ok(()) => {}
            Err(PatchError::OutOfRange { .. }) if matches!(record.kind, RelocKind::Branch | RelocKind::Rel32) => {
                let code = matches!(target, Target::Address { kind: SymbolKind::Code, .. });
                if !code {
                    return Err(FatalError::RelocationOverflow {
                        module: name,
                        site,
                        target: value,
                    }
                    .into());
                }
                let island = with_pool(pool, segments, &name, |p, r| p.jump_to(value, r))?;
                tracing::debug!(
                    site = format_args!("{site:#x}"),
                    target = format_args!("{value:#x}"),
                    island = format_args!("{island:#x}"),
                    "redirected through jump island"
                );
                patch(arch, &mut segments[segment], site, record.kind, island, addend).map_err(|_| FatalError::RelocationOverflow {
                    module: name.clone(),
                    site,
                    target: island,
                })?;
            }
            Err(PatchError::OutOfRange { .. }) => {
                return Err(FatalError::RelocationOverflow {
                    module: name,
                    site,
                    target: value,
                }
                .into());
            }
            Err(PatchError::Unsupported) => {
                return Err(LinkError::UnsupportedRelocation {
                    module: name,
                    raw: 0,
                    site: record.offset,
                });
            }
            Err(err) => return Err(corrupt(&name, format!("at {site:#x}: {err}"))),
        }
        tracing::trace!(site = format_args!("{site:#x}"), kind = ?record.kind, value = format_args!("{value:#x}"), "patched");
        applied += 1;
    }
    Ok(applied)
}
