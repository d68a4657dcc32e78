//! Shared fixtures for the integration tests.
//!
//! Objects are built in memory with `object::write`. Memory comes from a
//! simulated provider that hands out synthetic addresses and records every
//! reservation, protection change and release, so tests can inspect ordering
//! without ever executing loaded code.

#![allow(dead_code)]

use object::write::{Object, Relocation, SectionId, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind, SymbolFlags,
    SymbolKind as ObjSymbolKind, SymbolScope,
};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rtld::arch::x86_64::X86_64;
use rtld::config::{FatalPolicy, LinkerConfig};
use rtld::decode::{DecodedObject, ObjectDecoder, ObjectFileDecoder};
use rtld::host::{HostHandle, HostLoader, InitInvoker};
use rtld::memory::{MemoryAccess, MemoryProvider, Region};
use rtld::symbol::Strength;
use rtld::Linker;

pub const SIM_BASE: u64 = 0x1000_0000;

/// Something that happened to memory or native code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Reserve { base: u64, len: u64 },
    Protect { base: u64, access: MemoryAccess, bytes: Vec<u8> },
    Release { base: u64 },
    Invoke(u64),
    Open(String),
    Close(u64),
}

#[derive(Debug, Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<Event>>>);

impl Trace {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    /// Regions reserved and not yet released.
    pub fn live_regions(&self) -> usize {
        let events = self.events();
        let reserved = events.iter().filter(|e| matches!(e, Event::Reserve { .. })).count();
        let released = events.iter().filter(|e| matches!(e, Event::Release { .. })).count();
        reserved - released
    }

    pub fn invoked(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Invoke(address) => Some(address),
                _ => None,
            })
            .collect()
    }
}

/// Deterministic address space: bump allocation, hints honored when free.
pub struct SimulatedMemory {
    next: u64,
    honor_hints: bool,
    live: Vec<(u64, u64)>,
    trace: Trace,
}

impl SimulatedMemory {
    pub fn new(base: u64, trace: Trace) -> Self {
        Self {
            next: base,
            honor_hints: true,
            live: Vec::new(),
            trace,
        }
    }

    pub fn ignoring_hints(mut self) -> Self {
        self.honor_hints = false;
        self
    }

    fn is_free(&self, base: u64, len: u64) -> bool {
        self.live.iter().all(|&(b, l)| base + len <= b || b + l <= base)
    }
}

impl MemoryProvider for SimulatedMemory {
    fn reserve(&mut self, size: usize, hint: Option<u64>) -> io::Result<Region> {
        let len = size as u64;
        let base = match hint {
            Some(hint) if self.honor_hints && hint % 0x1000 == 0 && self.is_free(hint, len) => hint,
            _ => {
                while !self.is_free(self.next, len) {
                    self.next += 0x1000;
                }
                self.next
            }
        };
        self.next = self.next.max((base + len + 0xfff) & !0xfff);
        self.live.push((base, len));
        self.trace.push(Event::Reserve { base, len });
        Ok(Region::detached(base, size, MemoryAccess::ReadWrite))
    }

    fn protect(&mut self, region: &mut Region, access: MemoryAccess) -> io::Result<()> {
        region.set_access(access);
        self.trace.push(Event::Protect {
            base: region.base(),
            access,
            bytes: region.bytes().to_vec(),
        });
        Ok(())
    }

    fn release(&mut self, region: Region) {
        self.live.retain(|&(base, _)| base != region.base());
        self.trace.push(Event::Release { base: region.base() });
    }
}

/// Records initializer and finalizer calls instead of making them.
pub struct RecordingInvoker(pub Trace);

impl InitInvoker for RecordingInvoker {
    fn invoke(&mut self, address: u64) -> Result<(), String> {
        self.0.push(Event::Invoke(address));
        Ok(())
    }
}

/// A host loader serving a fixed set of libraries and symbols.
#[derive(Default)]
pub struct FakeHost {
    /// Library path -> exported symbols.
    pub libraries: HashMap<String, HashMap<String, u64>>,
    /// Symbols of the host process itself.
    pub globals: HashMap<String, u64>,
    /// Host thread-locals: name -> (tls module id, offset in its block).
    pub thread_locals: HashMap<String, (u64, u64)>,
    open: HashMap<u64, String>,
    trace: Trace,
}

impl FakeHost {
    pub fn new(trace: Trace) -> Self {
        Self {
            trace,
            ..Self::default()
        }
    }

    pub fn library(mut self, path: &str, symbols: &[(&str, u64)]) -> Self {
        let symbols = symbols.iter().map(|&(n, a)| (n.to_string(), a)).collect();
        self.libraries.insert(path.to_string(), symbols);
        self
    }

    pub fn global(mut self, name: &str, address: u64) -> Self {
        self.globals.insert(name.to_string(), address);
        self
    }

    pub fn thread_local(mut self, name: &str, module: u64, offset: u64) -> Self {
        self.thread_locals.insert(name.to_string(), (module, offset));
        self
    }
}

impl HostLoader for FakeHost {
    fn open(&mut self, path: &Path) -> Result<HostHandle, String> {
        let key = path.display().to_string();
        if !self.libraries.contains_key(&key) {
            return Err(format!("{key}: cannot open shared object file"));
        }
        let handle = self.open.len() as u64 + 1;
        self.open.insert(handle, key.clone());
        self.trace.push(Event::Open(key));
        Ok(HostHandle(handle))
    }

    fn symbol(&mut self, handle: HostHandle, name: &str) -> Option<u64> {
        let path = self.open.get(&handle.0)?;
        self.libraries.get(path)?.get(name).copied()
    }

    fn global_symbol(&mut self, name: &str) -> Option<u64> {
        self.globals.get(name).copied()
    }

    fn tls_symbol(&mut self, handle: Option<HostHandle>, name: &str) -> Option<(u64, u64)> {
        match handle {
            Some(_) => None,
            None => self.thread_locals.get(name).copied(),
        }
    }

    fn close(&mut self, handle: HostHandle) {
        self.trace.push(Event::Close(handle.0));
    }
}

/// The bundled decoder, with chosen names upgraded to strong definitions.
pub struct StrongSymbols(pub &'static [&'static str]);

impl ObjectDecoder for StrongSymbols {
    fn name(&self) -> &'static str {
        "strong-symbols"
    }

    fn recognizes(&self, image: &[u8]) -> bool {
        ObjectFileDecoder.recognizes(image)
    }

    fn decode(&self, image: &[u8]) -> anyhow::Result<DecodedObject> {
        let mut decoded = ObjectFileDecoder.decode(image)?;
        for sym in &mut decoded.symbols {
            if self.0.contains(&sym.name.as_str()) {
                sym.strength = Strength::Strong;
            }
        }
        Ok(decoded)
    }
}

pub fn test_config() -> LinkerConfig {
    LinkerConfig {
        check_proddables: true,
        fatal_policy: FatalPolicy::Report,
        ..LinkerConfig::default()
    }
}

/// A linker over simulated memory, recording into `trace`.
pub fn linker_with(trace: &Trace, host: FakeHost) -> Linker<X86_64> {
    Linker::builder(X86_64)
        .config(test_config())
        .provider(SimulatedMemory::new(SIM_BASE, trace.clone()))
        .host_loader(host)
        .invoker(RecordingInvoker(trace.clone()))
        .decoder(StrongSymbols(&["calc"]))
        .build()
}

pub fn linker(trace: &Trace) -> Linker<X86_64> {
    linker_with(trace, FakeHost::new(trace.clone()))
}

/// `call rel32; ret`
pub const CALL_RET: [u8; 6] = [0xe8, 0, 0, 0, 0, 0xc3];

/// Builds small relocatable ELF objects.
pub struct ObjectBuilder {
    obj: Object<'static>,
    text: SectionId,
}

impl ObjectBuilder {
    pub fn new() -> Self {
        Self::for_arch(Architecture::X86_64)
    }

    pub fn for_arch(arch: Architecture) -> Self {
        let mut obj = Object::new(BinaryFormat::Elf, arch, Endianness::Little);
        let text = obj.section_id(StandardSection::Text);
        Self { obj, text }
    }

    fn define(&mut self, name: &str, section: SectionId, offset: u64, size: u64, kind: ObjSymbolKind, weak: bool) {
        self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size,
            kind,
            scope: SymbolScope::Dynamic,
            weak,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });
    }

    /// Adds a global function. Returns its offset in `.text`.
    pub fn function(&mut self, name: &str, code: &[u8]) -> u64 {
        let offset = self.obj.append_section_data(self.text, code, 16);
        self.define(name, self.text, offset, code.len() as u64, ObjSymbolKind::Text, false);
        offset
    }

    pub fn weak_function(&mut self, name: &str, code: &[u8]) -> u64 {
        let offset = self.obj.append_section_data(self.text, code, 16);
        self.define(name, self.text, offset, code.len() as u64, ObjSymbolKind::Text, true);
        offset
    }

    /// Adds `name: call target; ret`. Returns its offset in `.text`.
    pub fn caller(&mut self, name: &str, target: &str) -> u64 {
        let offset = self.function(name, &CALL_RET);
        let symbol = self.symbol(target);
        self.relocate(self.text, offset + 1, symbol, -4, RelocationKind::PltRelative, 32);
        offset
    }

    /// Adds a global variable in `.data`.
    pub fn data(&mut self, name: &str, bytes: &[u8]) -> u64 {
        let data = self.obj.section_id(StandardSection::Data);
        let offset = self.obj.append_section_data(data, bytes, 8);
        self.define(name, data, offset, bytes.len() as u64, ObjSymbolKind::Data, false);
        offset
    }

    /// Adds a thread-local variable in `.tdata`.
    pub fn tls(&mut self, name: &str, bytes: &[u8]) -> u64 {
        let tdata = self.obj.section_id(StandardSection::Tls);
        let offset = self.obj.append_section_data(tdata, bytes, 8);
        self.define(name, tdata, offset, bytes.len() as u64, ObjSymbolKind::Tls, false);
        offset
    }

    /// Adds a function reading `target` with `mov target(%rip), %eax; ret`.
    pub fn reader(&mut self, name: &str, target: &str) -> u64 {
        let offset = self.function(name, &[0x8b, 0x05, 0, 0, 0, 0, 0xc3]);
        let symbol = self.symbol(target);
        self.relocate(self.text, offset + 2, symbol, -4, RelocationKind::Relative, 32);
        offset
    }

    /// Adds an `.init_array` entry pointing at `function`.
    pub fn init_array(&mut self, function: &str) {
        self.pointer_table(".init_array", &[function]);
    }

    /// Adds a `.fini_array` entry pointing at `function`.
    pub fn fini_array(&mut self, function: &str) {
        self.pointer_table(".fini_array", &[function]);
    }

    /// Adds a section named `section` holding one pointer per function, in order.
    pub fn pointer_table(&mut self, section: &str, functions: &[&str]) {
        let id = self
            .obj
            .add_section(Vec::new(), section.as_bytes().to_vec(), object::SectionKind::Data);
        for function in functions {
            let offset = self.obj.append_section_data(id, &[0; 8], 8);
            let symbol = self.symbol(function);
            self.relocate(id, offset, symbol, 0, RelocationKind::Absolute, 64);
        }
    }

    /// The id of `name`, declaring it undefined if it is not known yet.
    pub fn symbol(&mut self, name: &str) -> SymbolId {
        if let Some(id) = self.obj.symbol_id(name.as_bytes()) {
            return id;
        }
        self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: ObjSymbolKind::Unknown,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        })
    }

    /// Declares `name` as a weak undefined reference.
    pub fn weak_reference(&mut self, name: &str) -> SymbolId {
        self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: ObjSymbolKind::Unknown,
            scope: SymbolScope::Dynamic,
            weak: true,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        })
    }

    /// Adds `name: call target; ret` against an existing symbol id.
    pub fn caller_of(&mut self, name: &str, symbol: SymbolId) -> u64 {
        let offset = self.function(name, &CALL_RET);
        self.relocate(self.text, offset + 1, symbol, -4, RelocationKind::PltRelative, 32);
        offset
    }

    /// Adds `name: mov target@GOTPCREL(%rip), %rax; ret`.
    pub fn got_load(&mut self, name: &str, target: &str) -> u64 {
        let offset = self.function(name, &[0x48, 0x8b, 0x05, 0, 0, 0, 0, 0xc3]);
        let symbol = self.symbol(target);
        self.elf_relocation(self.text, offset + 3, symbol, -4, object::elf::R_X86_64_REX_GOTPCRELX);
        offset
    }

    /// Adds `name: lea target@tlsgd(%rip), %rdi; ret`.
    pub fn tls_address(&mut self, name: &str, target: &str) -> u64 {
        let offset = self.function(name, &[0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, 0xc3]);
        let symbol = self.symbol(target);
        self.elf_relocation(self.text, offset + 4, symbol, -4, object::elf::R_X86_64_TLSGD);
        offset
    }

    pub fn section(&mut self, section: StandardSection) -> SectionId {
        self.obj.section_id(section)
    }

    /// Adds a relocation with a raw ELF type.
    pub fn elf_relocation(&mut self, section: SectionId, offset: u64, symbol: SymbolId, addend: i64, r_type: u32) {
        self.obj
            .add_relocation(
                section,
                Relocation {
                    offset,
                    symbol,
                    addend,
                    flags: RelocationFlags::Elf { r_type },
                },
            )
            .unwrap();
    }

    fn relocate(&mut self, section: SectionId, offset: u64, symbol: SymbolId, addend: i64, kind: RelocationKind, size: u8) {
        self.obj
            .add_relocation(
                section,
                Relocation {
                    offset,
                    symbol,
                    addend,
                    flags: RelocationFlags::Generic {
                        kind,
                        encoding: RelocationEncoding::Generic,
                        size,
                    },
                },
            )
            .unwrap();
    }

    pub fn build(self) -> Vec<u8> {
        self.obj.write().unwrap()
    }
}

/// Where a `call rel32` at `site` lands.
pub fn call_target(linker: &Linker<X86_64>, site: u64) -> u64 {
    let bytes = linker.read_bytes(site, 5).expect("call site is mapped");
    assert_eq!(bytes[0], 0xe8, "expected a call opcode at {site:#x}");
    let disp = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
    (site as i64 + 5 + disp as i64) as u64
}
