//! Object file decoding.
//!
//! Decoders turn container bytes into normalized records: ordered section
//! descriptors, symbol declarations and relocation records. Indices in these
//! records refer to positions in the decoded vectors, never to raw file
//! indices. The bundled decoder leaves all parsing to the `object` crate.

use anyhow::{anyhow, bail, Context, Result};
use object::read::{Object, ObjectSection, ObjectSymbol, Relocation, RelocationTarget, SectionIndex, SymbolIndex};
use object::{FileKind, ObjectKind, RelocationEncoding, RelocationFlags, RelocationKind, SymbolSection};
use std::any::Any;
use std::collections::HashMap;

use crate::arch::RelocKind;
use crate::symbol::{Strength, SymbolKind};

// ELF x86_64 relocation types not mapped by object crate
const R_X86_64_GOTPCRELX: u32 = 41;
const R_X86_64_REX_GOTPCRELX: u32 = 42;
const R_X86_64_TLSGD: u32 = 19;

const SHT_INIT_ARRAY: u32 = 14;
const SHT_FINI_ARRAY: u32 = 15;

/// What a section holds, as far as loading is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    /// Code or read-only data, e.g. `.text`, `.rodata`.
    CodeOrRodata,
    /// Read/write data, e.g. `.data`, `.bss`.
    RwData,
    /// Static initializers, e.g. `.init_array`, `.ctors`.
    InitArray,
    /// Static finalizers, e.g. `.fini_array`, `.dtors`.
    FiniArray,
    /// Debug information.
    Debug,
    /// Part of an import section group, e.g. `.idata$4`.
    Import,
    /// An import library entry, e.g. `.idata$7`.
    ImportLibrary,
    /// Unknown or irrelevant.
    Other,
}

impl SectionKind {
    /// Whether sections of this kind are placed in memory.
    pub fn is_loadable(self) -> bool {
        matches!(
            self,
            SectionKind::CodeOrRodata | SectionKind::RwData | SectionKind::InitArray | SectionKind::FiniArray
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionContents {
    Bytes(Vec<u8>),
    ZeroFill,
}

#[derive(Debug, Clone)]
pub struct SectionDescriptor {
    pub name: String,
    pub kind: SectionKind,
    pub size: u64,
    pub align: u64,
    pub contents: SectionContents,
    pub executable: bool,
    /// Part of the thread-local initialization image.
    pub tls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolDef {
    /// Defined at `offset` inside decoded section `section`.
    Section { section: usize, offset: u64 },
    Absolute(u64),
    /// Tentative definition to be placed in the bss extension.
    Common { size: u64, align: u64 },
    Undefined,
}

#[derive(Debug, Clone)]
pub struct SymbolDecl {
    pub name: String,
    pub kind: SymbolKind,
    pub strength: Strength,
    /// Visible to other modules.
    pub global: bool,
    pub definition: SymbolDef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    Symbol(usize),
    Section(usize),
    Absolute,
}

#[derive(Debug, Clone, Copy)]
pub struct RelocationRecord {
    /// Decoded section being patched.
    pub section: usize,
    pub offset: u64,
    pub kind: RelocKind,
    pub target: RelocTarget,
    pub addend: i64,
}

/// Everything a decoder extracts from one object.
pub struct DecodedObject {
    pub format: &'static str,
    pub machine: object::Architecture,
    pub sections: Vec<SectionDescriptor>,
    pub symbols: Vec<SymbolDecl>,
    pub relocations: Vec<RelocationRecord>,
    /// Format-specific data the linker carries along but never inspects.
    pub extension: Option<Box<dyn Any + Send>>,
}

/// Container format decoder.
pub trait ObjectDecoder: Send {
    fn name(&self) -> &'static str;

    /// Cheap check on the leading bytes.
    fn recognizes(&self, image: &[u8]) -> bool;

    fn decode(&self, image: &[u8]) -> Result<DecodedObject>;
}

/// ELF, COFF and Mach-O relocatable objects through the `object` crate.
#[derive(Debug, Default)]
pub struct ObjectFileDecoder;

impl ObjectDecoder for ObjectFileDecoder {
    fn name(&self) -> &'static str {
        "object"
    }

    fn recognizes(&self, image: &[u8]) -> bool {
        matches!(
            FileKind::parse(image),
            Ok(FileKind::Elf32 | FileKind::Elf64 | FileKind::Coff | FileKind::CoffBig | FileKind::MachO32 | FileKind::MachO64)
        )
    }

    fn decode(&self, image: &[u8]) -> Result<DecodedObject> {
        // Archive members and caller buffers are not always aligned for the header structs.
        let aligned;
        let data = if image.as_ptr().align_offset(8) != 0 {
            aligned = image.to_vec();
            &aligned[..]
        } else {
            image
        };
        let obj = object::File::parse(data).context("failed to parse object file")?;
        if obj.kind() != ObjectKind::Relocatable {
            bail!("not a relocatable object ({:?})", obj.kind());
        }
        decode_object(&obj)
    }
}

fn format_name(obj: &object::File) -> &'static str {
    match obj.format() {
        object::BinaryFormat::Elf if obj.is_64() => "ELF64",
        object::BinaryFormat::Elf => "ELF32",
        object::BinaryFormat::Coff => "COFF",
        object::BinaryFormat::MachO => "Mach-O",
        _ => "unknown",
    }
}

fn decode_object(obj: &object::File) -> Result<DecodedObject> {
    let mut sections = Vec::new();
    let mut section_map: HashMap<SectionIndex, usize> = HashMap::new();
    let mut section_base: Vec<u64> = Vec::new();

    for section in obj.sections() {
        let name = section.name().unwrap_or("").to_string();
        let (kind, executable, tls, zero_fill) = classify_section(&name, section.kind());
        let contents = if zero_fill {
            SectionContents::ZeroFill
        } else if kind.is_loadable() {
            SectionContents::Bytes(section.data().with_context(|| format!("reading section {name}"))?.to_vec())
        } else {
            SectionContents::ZeroFill
        };
        section_map.insert(section.index(), sections.len());
        section_base.push(section.address());
        sections.push(SectionDescriptor {
            name,
            kind,
            size: section.size(),
            align: section.align().max(1),
            contents,
            executable,
            tls,
        });
    }

    let mut symbols = Vec::new();
    let mut symbol_map: HashMap<SymbolIndex, usize> = HashMap::new();
    for sym in obj.symbols() {
        let definition = match sym.section() {
            SymbolSection::Undefined => SymbolDef::Undefined,
            SymbolSection::Absolute => SymbolDef::Absolute(sym.address()),
            // ELF keeps a common symbol's alignment in its value.
            SymbolSection::Common => SymbolDef::Common {
                size: sym.size(),
                align: sym.address().max(1),
            },
            SymbolSection::Section(index) => {
                let section = *section_map
                    .get(&index)
                    .ok_or_else(|| anyhow!("symbol refers to missing section {}", index.0))?;
                SymbolDef::Section {
                    section,
                    offset: sym.address().wrapping_sub(section_base[section]),
                }
            }
            _ => continue,
        };
        let kind = match sym.kind() {
            object::SymbolKind::Text => SymbolKind::Code,
            object::SymbolKind::Tls => SymbolKind::Tls,
            object::SymbolKind::Section => match definition {
                SymbolDef::Section { section, .. } if sections[section].executable => SymbolKind::Code,
                _ => SymbolKind::Data,
            },
            _ => SymbolKind::Data,
        };
        symbol_map.insert(sym.index(), symbols.len());
        symbols.push(SymbolDecl {
            name: sym.name().unwrap_or("").to_string(),
            kind,
            strength: if sym.is_weak() { Strength::Weak } else { Strength::Normal },
            global: sym.is_global() && sym.kind() != object::SymbolKind::Section,
            definition,
        });
    }

    let mut relocations = Vec::new();
    for section in obj.sections() {
        let Some(&patched) = section_map.get(&section.index()) else {
            continue;
        };
        let data = section.data().unwrap_or(&[]);
        for (offset, reloc) in section.relocations() {
            let target = match reloc.target() {
                RelocationTarget::Symbol(idx) => match symbol_map.get(&idx) {
                    Some(&s) => RelocTarget::Symbol(s),
                    None => bail!("relocation at {offset:#x} refers to unknown symbol {}", idx.0),
                },
                RelocationTarget::Section(idx) => match section_map.get(&idx) {
                    Some(&s) => RelocTarget::Section(s),
                    None => bail!("relocation at {offset:#x} refers to unknown section {}", idx.0),
                },
                RelocationTarget::Absolute => RelocTarget::Absolute,
                _ => {
                    tracing::debug!("Skipping relocation at {:#x} with unknown target", offset);
                    continue;
                }
            };
            let mut addend = reloc.addend();
            if reloc.has_implicit_addend() {
                addend = addend.wrapping_add(implicit_addend(data, offset, reloc.size()));
            }
            relocations.push(RelocationRecord {
                section: patched,
                offset,
                kind: relocation_kind(obj.architecture(), &reloc),
                target,
                addend,
            });
        }
    }

    Ok(DecodedObject {
        format: format_name(obj),
        machine: obj.architecture(),
        sections,
        symbols,
        relocations,
        extension: None,
    })
}

/// Maps a section to (kind, executable, tls, zero-fill).
fn classify_section(name: &str, kind: object::SectionKind) -> (SectionKind, bool, bool, bool) {
    use object::SectionKind as K;

    if name.starts_with(".idata$7") {
        return (SectionKind::ImportLibrary, false, false, false);
    }
    if name.starts_with(".idata$") {
        return (SectionKind::Import, false, false, false);
    }
    if name.starts_with(".init_array") || name.starts_with(".ctors") {
        return (SectionKind::InitArray, false, false, false);
    }
    if name.starts_with(".fini_array") || name.starts_with(".dtors") {
        return (SectionKind::FiniArray, false, false, false);
    }

    match kind {
        K::Text => (SectionKind::CodeOrRodata, true, false, false),
        K::ReadOnlyData | K::ReadOnlyDataWithRel | K::ReadOnlyString => {
            (SectionKind::CodeOrRodata, false, false, false)
        }
        K::Data => (SectionKind::RwData, false, false, false),
        K::UninitializedData | K::Common => (SectionKind::RwData, false, false, true),
        K::Tls => (SectionKind::RwData, false, true, false),
        K::UninitializedTls => (SectionKind::RwData, false, true, true),
        K::Elf(SHT_INIT_ARRAY) => (SectionKind::InitArray, false, false, false),
        K::Elf(SHT_FINI_ARRAY) => (SectionKind::FiniArray, false, false, false),
        K::Debug | K::DebugString => (SectionKind::Debug, false, false, false),
        _ => (SectionKind::Other, false, false, false),
    }
}

fn implicit_addend(data: &[u8], offset: u64, size: u8) -> i64 {
    let at = offset as usize;
    match size {
        32 => data
            .get(at..at + 4)
            .map_or(0, |b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64),
        64 => data.get(at..at + 8).map_or(0, |b| {
            let mut word = [0u8; 8];
            word.copy_from_slice(b);
            i64::from_le_bytes(word)
        }),
        _ => 0,
    }
}

/// Maps a relocation to its kind. GOT, TLS and page/offset types are matched on the raw ELF type.
fn relocation_kind(arch: object::Architecture, reloc: &Relocation) -> RelocKind {
    let raw = match reloc.flags() {
        RelocationFlags::Elf { r_type } => r_type,
        RelocationFlags::Coff { typ } => typ as u32,
        RelocationFlags::MachO { r_type, .. } => r_type as u32,
        _ => 0,
    };
    if arch == object::Architecture::X86_64 && matches!(reloc.flags(), RelocationFlags::Elf { .. }) {
        match raw {
            R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => return RelocKind::GotRel32,
            R_X86_64_TLSGD => return RelocKind::TlsGd,
            _ => {}
        }
    }
    if arch == object::Architecture::Aarch64 && matches!(reloc.flags(), RelocationFlags::Elf { .. }) {
        use object::elf::*;
        match raw {
            R_AARCH64_ADR_PREL_PG_HI21 | R_AARCH64_ADR_PREL_PG_HI21_NC => return RelocKind::Page21,
            R_AARCH64_ADD_ABS_LO12_NC | R_AARCH64_LDST8_ABS_LO12_NC => return RelocKind::Lo12 { shift: 0 },
            R_AARCH64_LDST16_ABS_LO12_NC => return RelocKind::Lo12 { shift: 1 },
            R_AARCH64_LDST32_ABS_LO12_NC => return RelocKind::Lo12 { shift: 2 },
            R_AARCH64_LDST64_ABS_LO12_NC => return RelocKind::Lo12 { shift: 3 },
            R_AARCH64_LDST128_ABS_LO12_NC => return RelocKind::Lo12 { shift: 4 },
            R_AARCH64_ADR_GOT_PAGE => return RelocKind::GotPage21,
            R_AARCH64_LD64_GOT_LO12_NC => return RelocKind::GotLo12,
            _ => {}
        }
    }

    match (reloc.kind(), reloc.encoding(), reloc.size()) {
        (RelocationKind::Absolute, _, 64) => RelocKind::Abs64,
        (RelocationKind::Absolute, RelocationEncoding::X86Signed, 32) => RelocKind::Abs32S,
        (RelocationKind::Absolute, _, 32) => RelocKind::Abs32,
        (RelocationKind::Relative | RelocationKind::PltRelative, RelocationEncoding::AArch64Call, 26) => {
            RelocKind::Branch
        }
        (RelocationKind::Relative, RelocationEncoding::X86Branch, 32) => RelocKind::Branch,
        (RelocationKind::PltRelative, _, 32) => RelocKind::Branch,
        (RelocationKind::Relative, _, 32) => RelocKind::Rel32,
        (RelocationKind::GotRelative, _, 32) => RelocKind::GotRel32,
        _ => RelocKind::Unsupported(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::write;

    fn sample() -> Vec<u8> {
        let mut obj = write::Object::new(
            object::BinaryFormat::Elf,
            object::Architecture::X86_64,
            object::Endianness::Little,
        );
        let text = obj.section_id(write::StandardSection::Text);
        // call ext; ret
        let off = obj.append_section_data(text, &[0xe8, 0, 0, 0, 0, 0xc3], 16);
        obj.add_symbol(write::Symbol {
            name: b"caller".to_vec(),
            value: off,
            size: 6,
            kind: object::SymbolKind::Text,
            scope: object::SymbolScope::Dynamic,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: object::SymbolFlags::None,
        });
        let ext = obj.add_symbol(write::Symbol {
            name: b"ext".to_vec(),
            value: 0,
            size: 0,
            kind: object::SymbolKind::Text,
            scope: object::SymbolScope::Dynamic,
            weak: true,
            section: write::SymbolSection::Undefined,
            flags: object::SymbolFlags::None,
        });
        obj.add_relocation(
            text,
            write::Relocation {
                offset: off + 1,
                symbol: ext,
                addend: -4,
                flags: RelocationFlags::Generic {
                    kind: RelocationKind::PltRelative,
                    encoding: RelocationEncoding::Generic,
                    size: 32,
                },
            },
        )
        .unwrap();
        let bss = obj.section_id(write::StandardSection::UninitializedData);
        obj.append_section_bss(bss, 64, 8);
        obj.write().unwrap()
    }

    #[test]
    fn decodes_sections_symbols_and_relocations() {
        let image = sample();
        assert!(ObjectFileDecoder.recognizes(&image));
        let decoded = ObjectFileDecoder.decode(&image).unwrap();
        assert_eq!(decoded.format, "ELF64");
        assert_eq!(decoded.machine, object::Architecture::X86_64);

        let text = decoded.sections.iter().position(|s| s.name == ".text").unwrap();
        assert_eq!(decoded.sections[text].kind, SectionKind::CodeOrRodata);
        assert!(decoded.sections[text].executable);
        let bss = decoded.sections.iter().find(|s| s.name == ".bss").unwrap();
        assert_eq!(bss.contents, SectionContents::ZeroFill);
        assert_eq!(bss.size, 64);

        let caller = decoded.symbols.iter().find(|s| s.name == "caller").unwrap();
        assert!(caller.global);
        assert_eq!(caller.kind, SymbolKind::Code);
        assert_eq!(caller.definition, SymbolDef::Section { section: text, offset: 0 });

        let ext = decoded.symbols.iter().find(|s| s.name == "ext").unwrap();
        assert_eq!(ext.definition, SymbolDef::Undefined);
        assert_eq!(ext.strength, Strength::Weak);

        assert_eq!(decoded.relocations.len(), 1);
        let reloc = decoded.relocations[0];
        assert_eq!(reloc.section, text);
        assert_eq!(reloc.offset, 1);
        assert_eq!(reloc.kind, RelocKind::Branch);
        assert_eq!(reloc.addend, -4);
    }

    #[test]
    fn aarch64_page_and_offset_types() {
        let mut obj = write::Object::new(
            object::BinaryFormat::Elf,
            object::Architecture::Aarch64,
            object::Endianness::Little,
        );
        let text = obj.section_id(write::StandardSection::Text);
        // adrp x0, .. ; ldr x1, [x0, ..] ; adrp x2, .. ; ldr x2, [x2, ..]
        let off = obj.append_section_data(text, &[0u8; 16], 4);
        let var = obj.add_symbol(write::Symbol {
            name: b"var".to_vec(),
            value: 0,
            size: 0,
            kind: object::SymbolKind::Data,
            scope: object::SymbolScope::Dynamic,
            weak: false,
            section: write::SymbolSection::Undefined,
            flags: object::SymbolFlags::None,
        });
        let types = [
            object::elf::R_AARCH64_ADR_PREL_PG_HI21,
            object::elf::R_AARCH64_LDST64_ABS_LO12_NC,
            object::elf::R_AARCH64_ADR_GOT_PAGE,
            object::elf::R_AARCH64_LD64_GOT_LO12_NC,
        ];
        for (i, r_type) in types.into_iter().enumerate() {
            let relocation = write::Relocation {
                offset: off + 4 * i as u64,
                symbol: var,
                addend: 0,
                flags: RelocationFlags::Elf { r_type },
            };
            obj.add_relocation(text, relocation).unwrap();
        }

        let decoded = ObjectFileDecoder.decode(&obj.write().unwrap()).unwrap();
        let kinds: Vec<_> = decoded.relocations.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            [
                RelocKind::Page21,
                RelocKind::Lo12 { shift: 3 },
                RelocKind::GotPage21,
                RelocKind::GotLo12
            ]
        );
    }

    #[test]
    fn rejects_non_objects() {
        assert!(!ObjectFileDecoder.recognizes(b"!<arch>\n"));
        assert!(!ObjectFileDecoder.recognizes(b"hello"));
        assert!(ObjectFileDecoder.decode(b"\x7fELF garbage").is_err());
    }

    #[test]
    fn section_classification() {
        use object::SectionKind as K;
        assert_eq!(classify_section(".init_array", K::Data).0, SectionKind::InitArray);
        assert_eq!(classify_section(".dtors", K::Data).0, SectionKind::FiniArray);
        assert_eq!(classify_section(".idata$7", K::Data).0, SectionKind::ImportLibrary);
        assert_eq!(classify_section(".idata$4", K::Data).0, SectionKind::Import);
        assert_eq!(classify_section(".debug_info", K::Debug).0, SectionKind::Debug);
        assert_eq!(classify_section(".tbss", K::UninitializedTls), (SectionKind::RwData, false, true, true));
        assert!(!SectionKind::Debug.is_loadable());
    }
}
