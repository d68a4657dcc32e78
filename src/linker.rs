//! Core Linker logic.
//!
//! This module contains the `Linker` struct, the one context object every
//! operation goes through:
//! 1. Loading: decodes an object, places its sections and publishes its symbols.
//! 2. Resolution: resolves every relocation target, then patches and seals.
//! 3. Initialization: runs the module's initializer array.
//! 4. Unloading: mark-sweep over dependency edges, finalizers first.
//!
//! Loads, resolutions and sweeps are serialized by one lock. Calls into the
//! host's dynamic loader take a second, narrower lock, always after the first.

use memmap2::Mmap;
use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::arch::{Architecture, RelocKind};
use crate::config::{FatalPolicy, LinkerConfig};
use crate::decode::{ObjectDecoder, ObjectFileDecoder, RelocTarget, SectionDescriptor, SectionKind, SymbolDef};
use crate::error::{FatalError, LinkError, Result};
use crate::host::{HostLoader, InitInvoker, NativeInvoker};
use crate::layout::{finalize_protections, release_segments, MemoryLayoutManager, Placement, Section, SegmentProt};
use crate::memory::MemoryProvider;
use crate::module::{Identity, Module, ModuleId, ModuleInfo, ModuleOrigin, ModuleStatus, Pending};
use crate::registry::ModuleRegistry;
use crate::reloc::{self, Target};
use crate::symbol::{is_optional_symbol, Insertion, Strength, SymbolInfo, SymbolKind, SymbolTable};
use crate::trampoline::TrampolinePool;
use crate::unload::{prune_edges, DependencyTracker};
use crate::utils::align_up;

const ARCHIVE_MAGIC: &[u8] = b"!<arch>\n";

/// Name of the section holding common symbols.
const COMMON_SECTION: &str = ".bss.common";

struct LinkerState {
    registry: ModuleRegistry,
    provider: Box<dyn MemoryProvider>,
    placement: Placement,
    decoders: Vec<Box<dyn ObjectDecoder>>,
    invoker: Box<dyn InitInvoker>,
    tracker: DependencyTracker,
    /// Modules whose resolution is in progress, to tolerate cycles.
    resolving: HashSet<ModuleId>,
}

/// Where an address lives, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    pub module: ModuleId,
    pub name: String,
    /// Nearest symbol at or below the address, with its address.
    pub symbol: Option<(String, u64)>,
    pub address: u64,
}

impl fmt::Display for AddressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some((symbol, base)) => write!(f, "{}: {}+{:#x}", self.name, symbol, self.address - base),
            None => write!(f, "{}: {:#x}", self.name, self.address),
        }
    }
}

/// Runtime linker context.
pub struct Linker<A: Architecture> {
    arch: A,
    config: LinkerConfig,
    symbols: SymbolTable,
    state: Mutex<LinkerState>,
    host: Mutex<Box<dyn HostLoader>>,
}

/// Assembles a [`Linker`] with non-default collaborators.
pub struct LinkerBuilder<A: Architecture> {
    arch: A,
    config: LinkerConfig,
    provider: Option<Box<dyn MemoryProvider>>,
    host: Option<Box<dyn HostLoader>>,
    invoker: Option<Box<dyn InitInvoker>>,
    decoders: Vec<Box<dyn ObjectDecoder>>,
}

impl<A: Architecture> LinkerBuilder<A> {
    pub fn config(mut self, config: LinkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn provider(mut self, provider: impl MemoryProvider + 'static) -> Self {
        self.provider = Some(Box::new(provider));
        self
    }

    pub fn host_loader(mut self, host: impl HostLoader + 'static) -> Self {
        self.host = Some(Box::new(host));
        self
    }

    pub fn invoker(mut self, invoker: impl InitInvoker + 'static) -> Self {
        self.invoker = Some(Box::new(invoker));
        self
    }

    /// Adds a decoder, consulted before the bundled one.
    pub fn decoder(mut self, decoder: impl ObjectDecoder + 'static) -> Self {
        self.decoders.push(Box::new(decoder));
        self
    }

    pub fn build(self) -> Linker<A> {
        let reach = self.config.near_placement.or(self.arch.placement_reach());
        let mut decoders = self.decoders;
        decoders.push(Box::new(ObjectFileDecoder));
        let state = LinkerState {
            registry: ModuleRegistry::new(),
            provider: self.provider.unwrap_or_else(default_provider),
            placement: Placement::new(self.config.load_base, reach),
            decoders,
            invoker: self.invoker.unwrap_or_else(|| Box::new(NativeInvoker)),
            tracker: DependencyTracker::new(),
            resolving: HashSet::new(),
        };
        tracing::debug!(arch = self.arch.name(), anchor = format_args!("{:#x}", state.placement.anchor()), ?reach, "linker ready");
        Linker {
            arch: self.arch,
            config: self.config,
            symbols: SymbolTable::new(),
            state: Mutex::new(state),
            host: Mutex::new(self.host.unwrap_or_else(default_host_loader)),
        }
    }
}

#[cfg(unix)]
fn default_provider() -> Box<dyn MemoryProvider> {
    Box::new(crate::memory::MmapProvider::new())
}

#[cfg(not(unix))]
fn default_provider() -> Box<dyn MemoryProvider> {
    Box::new(crate::memory::HeapProvider::default())
}

#[cfg(unix)]
fn default_host_loader() -> Box<dyn HostLoader> {
    Box::new(crate::host::DlLoader)
}

#[cfg(not(unix))]
fn default_host_loader() -> Box<dyn HostLoader> {
    Box::new(crate::host::NoHostLoader)
}

fn owner_label(registry: &ModuleRegistry, owner: Option<ModuleId>) -> String {
    match owner.and_then(|id| registry.get(id)) {
        Some(module) => module.identity.to_string(),
        None => "<host>".to_string(),
    }
}

impl<A: Architecture> Linker<A> {
    /// A linker with the default collaborators: anonymous mappings, the
    /// process's own dynamic loader and direct initializer calls.
    pub fn new(arch: A) -> Self {
        Self::builder(arch).build()
    }

    pub fn builder(arch: A) -> LinkerBuilder<A> {
        LinkerBuilder {
            arch,
            config: LinkerConfig::default(),
            provider: None,
            host: None,
            invoker: None,
            decoders: Vec::new(),
        }
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    /// The process-wide symbol table. Lookups through it need no lock.
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    fn lock(&self) -> MutexGuard<'_, LinkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn host_lock(&self) -> MutexGuard<'_, Box<dyn HostLoader>> {
        self.host.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies the fatal policy to a result on its way out.
    fn escalate<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(LinkError::Fatal(err)) = &result {
            tracing::error!("fatal linker error: {err}");
            if self.config.fatal_policy == FatalPolicy::Abort {
                std::process::abort();
            }
        }
        result
    }

    /// Loads an object image. The bytes are copied; the caller may drop them.
    ///
    /// An identity that is already loaded is not loaded again; its existing
    /// handle is returned.
    pub fn load(&self, identity: Identity, image: &[u8]) -> Result<ModuleId> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(id) = state.registry.find(&identity) {
            tracing::info!(module = %identity, %id, "already loaded");
            return Ok(id);
        }
        let result = self.load_locked(state, identity, image);
        self.escalate(result)
    }

    /// Maps and loads an object file.
    pub fn load_file(&self, path: &Path) -> Result<ModuleId> {
        let map = map_file(path)?;
        self.load(Identity::file(path), &map)
    }

    /// Loads every member of a static archive.
    pub fn load_archive(&self, path: &Path) -> Result<Vec<ModuleId>> {
        let map = map_file(path)?;
        let malformed = |e: object::Error| LinkError::Malformed {
            module: path.display().to_string(),
            reason: e.to_string(),
        };
        let archive = object::read::archive::ArchiveFile::parse(&*map).map_err(malformed)?;
        let mut ids = Vec::new();
        for member in archive.members() {
            let member = member.map_err(malformed)?;
            let name = String::from_utf8_lossy(member.name()).to_string();
            let data = member.data(&*map).map_err(malformed)?;
            ids.push(self.load(Identity::member(path, name), data)?);
        }
        tracing::info!(archive = %path.display(), members = ids.len(), "loaded archive");
        Ok(ids)
    }

    /// Loads an object file, or every member if it is an archive.
    pub fn load_path(&self, path: &Path) -> Result<Vec<ModuleId>> {
        let map = map_file(path)?;
        if map.starts_with(ARCHIVE_MAGIC) {
            drop(map);
            self.load_archive(path)
        } else {
            Ok(vec![self.load(Identity::file(path), &map)?])
        }
    }

    /// Opens a shared object with the host's dynamic loader.
    ///
    /// Its symbols are found through the loader during resolution, and
    /// modules that use them depend on it like on any other module.
    pub fn load_dynamic(&self, path: &Path) -> Result<ModuleId> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let identity = Identity::file(path);
        if let Some(id) = state.registry.find(&identity) {
            tracing::info!(module = %identity, %id, "already loaded");
            return Ok(id);
        }
        let handle = self.host_lock().open(path).map_err(LinkError::HostLoader)?;
        let id = state.registry.allocate(identity, ModuleOrigin::HostLoaded, "dynamic");
        state.registry.finish_loading(id);
        if let Some(module) = state.registry.get_mut(id) {
            module.host_handle = Some(handle);
            // The host loader relocates and initializes on open.
            module.advance(ModuleStatus::Resolved);
            module.advance(ModuleStatus::Initialized);
        }
        self.symbols.mark_ready(id);
        tracing::info!(module = %path.display(), %id, "opened with host loader");
        Ok(id)
    }

    fn load_locked(&self, state: &mut LinkerState, identity: Identity, image: &[u8]) -> Result<ModuleId> {
        let name = identity.to_string();
        let decoder = state
            .decoders
            .iter()
            .find(|d| d.recognizes(image))
            .ok_or_else(|| LinkError::UnknownFormat(name.clone()))?;
        let decoded = decoder.decode(image).map_err(|e| LinkError::Malformed {
            module: name.clone(),
            reason: format!("{e:#}"),
        })?;
        if decoded.machine != self.arch.machine() {
            return Err(LinkError::WrongArchitecture {
                module: name,
                found: format!("{:?}", decoded.machine),
                expected: self.arch.name(),
            });
        }

        let id = state.registry.allocate(identity, ModuleOrigin::SelfLoaded, decoded.format);
        let result = self.place(state, id, &name, decoded);
        match result {
            Ok(()) => {
                state.registry.finish_loading(id);
                tracing::info!(module = %name, %id, "loaded");
                Ok(id)
            }
            Err(err) => {
                tracing::warn!(module = %name, "abandoning load: {err}");
                self.discard(state, id);
                Err(err)
            }
        }
    }

    /// Places a freshly allocated module and publishes its symbols.
    fn place(
        &self,
        state: &mut LinkerState,
        id: ModuleId,
        name: &str,
        decoded: crate::decode::DecodedObject,
    ) -> Result<()> {
        // Common symbols go into one zero-filled extension after the image.
        let mut bss = 0u64;
        let mut common_offsets = vec![None; decoded.symbols.len()];
        for (i, sym) in decoded.symbols.iter().enumerate() {
            if let SymbolDef::Common { size, align } = sym.definition {
                let offset = align_up(bss, align.max(1));
                common_offsets[i] = Some(offset);
                bss = offset + size;
            }
        }

        let capacity = reloc::pool_capacity(&decoded.relocations);
        let trampoline = self.arch.trampoline();
        let mut layout = MemoryLayoutManager::new(name, &mut *state.provider, &mut state.placement, &self.config);
        let laid_out = lay_out(&mut layout, &decoded.sections, bss).and_then(|common| {
            if capacity == 0 {
                return Ok((common, None));
            }
            let size = trampoline.pool_size(capacity);
            let segment = layout.allocate_segment(".islands", size, SegmentProt::ReadExecute)?;
            let base = layout.segment_mut(segment).base();
            layout.segment_mut(segment).used = size;
            layout.add_proddable(base, size);
            Ok((common, Some(TrampolinePool::new(trampoline, segment, base, capacity))))
        });
        let (common, pool) = match laid_out {
            Ok(parts) => parts,
            Err(err) => {
                layout.abandon();
                return Err(err);
            }
        };
        let done = layout.finish();

        let addresses: Vec<Option<u64>> = decoded
            .symbols
            .iter()
            .enumerate()
            .map(|(i, sym)| match sym.definition {
                SymbolDef::Section { section, offset } => {
                    let section = done.sections.get(section)?;
                    match section.tls_offset {
                        Some(tls) => Some(tls + offset),
                        None => section.is_loaded().then_some(section.start + offset),
                    }
                }
                SymbolDef::Absolute(value) => Some(value),
                SymbolDef::Common { .. } => Some(done.sections[common?].start + common_offsets[i]?),
                SymbolDef::Undefined => None,
            })
            .collect();

        let module = state.registry.get_mut(id).ok_or(LinkError::StaleHandle)?;
        module.sections = done.sections;
        module.segments = done.segments;
        module.proddables = done.proddables;
        module.pool = pool;
        module.format_info = decoded.extension;

        let registry = &state.registry;
        let mut published = Vec::new();
        for (sym, address) in decoded.symbols.iter().zip(&addresses) {
            let Some(address) = *address else {
                continue;
            };
            if !sym.global || sym.name.is_empty() {
                continue;
            }
            let outcome = self.symbols.insert(&sym.name, address, sym.strength, sym.kind, Some(id), |owner| {
                owner_label(registry, owner)
            })?;
            if outcome != Insertion::Kept {
                published.push(sym.name.clone());
            }
        }
        tracing::debug!(module = %name, symbols = published.len(), pool = capacity, "published symbols");

        let module = state.registry.get_mut(id).ok_or(LinkError::StaleHandle)?;
        module.symbols = published;
        module.pending = Some(Pending {
            symbols: decoded.symbols,
            addresses,
            relocations: decoded.relocations,
        });
        Ok(())
    }

    /// Removes a module and everything it holds. Finalizers are not run.
    fn discard(&self, state: &mut LinkerState, id: ModuleId) {
        let Some(mut module) = state.registry.remove(id) else {
            return;
        };
        let purged = self.symbols.remove_all(id);
        if let Some(handle) = module.host_handle.take() {
            self.host_lock().close(handle);
        }
        release_segments(&mut *state.provider, std::mem::take(&mut module.segments));
        module.proddables.clear();
        module.advance(ModuleStatus::Unloaded);
        tracing::debug!(module = %module.identity, %id, symbols = purged, "discarded");
    }

    /// Resolves and patches every relocation of a loaded module, then seals it.
    ///
    /// On failure the module is abandoned. Unresolved names are all reported
    /// at once, and nothing is patched if any is missing.
    pub fn resolve(&self, id: ModuleId) -> Result<()> {
        let mut guard = self.lock();
        let result = self.resolve_locked(&mut guard, id);
        self.escalate(result)
    }

    /// Resolves every module that is loaded but not yet resolved.
    ///
    /// Keeps going past failures and returns the first one.
    pub fn resolve_all(&self) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let pending: Vec<ModuleId> = state
            .registry
            .iter()
            .filter(|m| m.status == ModuleStatus::Loaded)
            .map(|m| m.id)
            .collect();
        let mut first = None;
        for id in pending {
            if let Err(err) = self.resolve_locked(state, id) {
                if err.is_fatal() {
                    return self.escalate(Err(err));
                }
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn resolve_locked(&self, state: &mut LinkerState, id: ModuleId) -> Result<()> {
        let module = state.registry.get(id).ok_or(LinkError::StaleHandle)?;
        match module.status {
            ModuleStatus::Resolved | ModuleStatus::Initialized => return Ok(()),
            ModuleStatus::Loaded => {}
            status => {
                return Err(LinkError::InvalidState {
                    module: module.identity.to_string(),
                    operation: "resolve",
                    status,
                })
            }
        }
        if !state.resolving.insert(id) {
            return Ok(());
        }
        let result = self.resolve_module(state, id);
        state.resolving.remove(&id);
        if let Err(err) = &result {
            tracing::warn!(%id, "abandoning module: {err}");
            self.discard_with_dependents(state, id);
        }
        result
    }

    /// Discards a module that never finished resolving, along with every
    /// module that bound to it in the meantime.
    ///
    /// Such dependents can only exist in a cycle: they were resolved while
    /// `id` was still on the resolution stack, so their patched sites point
    /// into memory that is about to go.
    fn discard_with_dependents(&self, state: &mut LinkerState, id: ModuleId) {
        let mut doomed = vec![id];
        while let Some(next) = doomed.pop() {
            let dependents: Vec<ModuleId> = state
                .registry
                .iter()
                .filter(|m| m.id != next && m.dependencies.contains(&next))
                .map(|m| m.id)
                .collect();
            self.discard(state, next);
            for dependent in dependents {
                tracing::warn!(module = %dependent, failed = %next, "abandoning module bound to a failed resolution");
                doomed.push(dependent);
            }
        }
    }

    fn resolve_module(&self, state: &mut LinkerState, id: ModuleId) -> Result<()> {
        let module = state.registry.get_mut(id).ok_or(LinkError::StaleHandle)?;
        let name = module.identity.to_string();
        let pending = module.pending.take().ok_or_else(|| FatalError::CorruptRelocation {
            module: name.clone(),
            reason: "relocations already consumed".to_string(),
        })?;
        reloc::check_supported(&self.arch, &name, &pending.relocations)?;

        let mut deps = HashSet::new();
        let mut unresolved = BTreeSet::new();
        let mut resolved: HashMap<usize, Option<Target>> = HashMap::new();
        let mut targets = Vec::with_capacity(pending.relocations.len());
        for record in &pending.relocations {
            let target = match record.target {
                RelocTarget::Absolute => Some(Target::Address {
                    address: 0,
                    kind: SymbolKind::Data,
                }),
                RelocTarget::Section(index) => Some(self.section_target(state, id, index)?),
                RelocTarget::Symbol(index) => {
                    let hint = match record.kind {
                        RelocKind::Branch => SymbolKind::Code,
                        RelocKind::TlsGd => SymbolKind::Tls,
                        _ => SymbolKind::Data,
                    };
                    match resolved.get(&index) {
                        Some(target) => *target,
                        None => {
                            let target = self.symbol_target(state, id, &pending, index, hint, &mut deps)?;
                            resolved.insert(index, target);
                            target
                        }
                    }
                }
            };
            match target {
                Some(target) => targets.push(target),
                None => {
                    if let RelocTarget::Symbol(index) = record.target {
                        unresolved.insert(pending.symbols[index].name.clone());
                    }
                }
            }
        }
        if !unresolved.is_empty() {
            return Err(LinkError::Unresolved {
                module: name,
                symbols: unresolved.into_iter().collect(),
            });
        }

        let module = state.registry.get_mut(id).ok_or(LinkError::StaleHandle)?;
        let applied = reloc::apply_relocations(
            &self.arch,
            module,
            &pending.relocations,
            &targets,
            self.config.check_proddables,
        )?;
        if let Some(pool) = module.pool.as_ref().filter(|pool| pool.used() == 0) {
            if let Some(segment) = module.segments.get_mut(pool.segment()) {
                segment.prot = SegmentProt::NoAccess;
            }
        }
        finalize_protections(&mut *state.provider, &mut module.segments).map_err(|source| LinkError::Memory {
            module: name.clone(),
            source,
        })?;
        deps.remove(&id);
        module.dependencies.extend(deps);
        module.advance(ModuleStatus::Resolved);
        self.symbols.mark_ready(id);
        tracing::info!(module = %name, %id, relocations = applied, dependencies = module.dependencies.len(), "resolved");
        Ok(())
    }

    fn section_target(&self, state: &LinkerState, id: ModuleId, index: usize) -> Result<Target> {
        let module = state.registry.get(id).ok_or(LinkError::StaleHandle)?;
        let target = match module.sections.get(index) {
            Some(section) if section.tls_offset.is_some() => {
                return Err(self_loaded_tls(&module.identity.to_string(), &section.name));
            }
            Some(section) if section.is_loaded() => Target::Address {
                address: section.start,
                kind: if section.kind == SectionKind::CodeOrRodata {
                    SymbolKind::Code
                } else {
                    SymbolKind::Data
                },
            },
            _ => Target::Address {
                address: 0,
                kind: SymbolKind::Data,
            },
        };
        Ok(target)
    }

    /// Resolves symbol `index` of module `id`. `None` means unresolved.
    fn symbol_target(
        &self,
        state: &mut LinkerState,
        id: ModuleId,
        pending: &Pending,
        index: usize,
        hint: SymbolKind,
        deps: &mut HashSet<ModuleId>,
    ) -> Result<Option<Target>> {
        let decl = pending.symbols.get(index).ok_or_else(|| FatalError::CorruptRelocation {
            module: id.to_string(),
            reason: format!("no symbol {index}"),
        })?;

        if let Some(address) = pending.addresses.get(index).copied().flatten() {
            // A stronger definition elsewhere overrides the local one.
            if decl.global {
                if let Some(info) = self.symbols.lookup_dependent(&decl.name, id, deps) {
                    if info.owner != Some(id) {
                        return self.target_of(state, id, &decl.name, info).map(Some);
                    }
                }
            }
            if decl.kind == SymbolKind::Tls {
                return Err(self_loaded_tls(&owner_label(&state.registry, Some(id)), &decl.name));
            }
            return Ok(Some(Target::Address {
                address,
                kind: decl.kind,
            }));
        }

        if decl.name.is_empty() {
            return Ok(Some(Target::Address {
                address: 0,
                kind: SymbolKind::Data,
            }));
        }
        if let Some(target) = self.lookup_for(state, id, &decl.name, hint, deps)? {
            return Ok(Some(target));
        }
        if decl.strength == Strength::Weak || is_optional_symbol(&decl.name) {
            tracing::debug!(symbol = %decl.name, "undefined weak reference resolves to 0");
            return Ok(Some(Target::Address {
                address: 0,
                kind: decl.kind,
            }));
        }
        Ok(None)
    }

    /// Finds `name` for `requester`: the table first, then host-loaded modules,
    /// then the host process. Records the dependency edge.
    fn lookup_for(
        &self,
        state: &mut LinkerState,
        requester: ModuleId,
        name: &str,
        hint: SymbolKind,
        deps: &mut HashSet<ModuleId>,
    ) -> Result<Option<Target>> {
        if let Some(info) = self.symbols.lookup_dependent(name, requester, deps) {
            if let Some(owner) = info.owner {
                let lazy = owner != requester
                    && state.registry.status(owner) == Some(ModuleStatus::Loaded)
                    && !state.resolving.contains(&owner);
                if lazy {
                    tracing::debug!(symbol = name, %owner, "resolving owner first");
                    if let Err(err) = self.resolve_locked(state, owner) {
                        if err.is_fatal() {
                            return Err(err);
                        }
                        // The owner is gone, and its bindings with it.
                        deps.remove(&owner);
                        return self.lookup_for(state, requester, name, hint, deps);
                    }
                }
            }
            return self.target_of(state, requester, name, info).map(Some);
        }

        let dynamic: Vec<_> = state
            .registry
            .iter()
            .filter_map(|m| m.host_handle.map(|handle| (m.id, handle)))
            .collect();
        let mut host = self.host_lock();
        for (owner, handle) in dynamic {
            let found = if hint == SymbolKind::Tls {
                host.tls_symbol(Some(handle), name)
                    .map(|(module, offset)| Target::Tls { module, offset })
            } else {
                host.symbol(handle, name).map(|address| Target::Address { address, kind: hint })
            };
            if found.is_some() {
                deps.insert(owner);
                return Ok(found);
            }
        }
        if hint == SymbolKind::Tls {
            return Ok(host.tls_symbol(None, name).map(|(module, offset)| Target::Tls { module, offset }));
        }
        Ok(host.global_symbol(name).map(|address| Target::Address { address, kind: hint }))
    }

    /// The target a table binding stands for.
    ///
    /// Thread-locals are only reachable when the host loader placed them: a
    /// host-defined one is asked of the loader, a self-loaded one is refused.
    fn target_of(&self, state: &LinkerState, requester: ModuleId, name: &str, info: SymbolInfo) -> Result<Target> {
        if info.kind != SymbolKind::Tls {
            return Ok(Target::Address {
                address: info.address,
                kind: info.kind,
            });
        }
        let requester = owner_label(&state.registry, Some(requester));
        if info.owner.is_some() {
            return Err(self_loaded_tls(&requester, name));
        }
        self.host_lock()
            .tls_symbol(None, name)
            .map(|(module, offset)| Target::Tls { module, offset })
            .ok_or_else(|| LinkError::UnsupportedTls {
                module: requester,
                symbol: name.to_string(),
                reason: "the host loader does not know it",
            })
    }

    /// Runs a module's initializers, resolving it first if needed. Runs once.
    pub fn run_initializers(&self, id: ModuleId) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let result = self.run_initializers_locked(state, id);
        self.escalate(result)
    }

    fn run_initializers_locked(&self, state: &mut LinkerState, id: ModuleId) -> Result<()> {
        let status = state.registry.status(id).ok_or(LinkError::StaleHandle)?;
        match status {
            ModuleStatus::Initialized => return Ok(()),
            ModuleStatus::Loaded => self.resolve_locked(state, id)?,
            ModuleStatus::Resolved => {}
            status => {
                return Err(LinkError::InvalidState {
                    module: owner_label(&state.registry, Some(id)),
                    operation: "initialize",
                    status,
                })
            }
        }

        let module = state.registry.get(id).ok_or(LinkError::StaleHandle)?;
        let name = module.identity.to_string();
        let entries = array_entries(module, SectionKind::InitArray);
        for address in entries {
            if !is_executable(&state.registry, address) {
                return Err(LinkError::Initializer {
                    module: name,
                    address,
                    reason: "not inside executable memory".to_string(),
                });
            }
            tracing::debug!(module = %name, address = format_args!("{address:#x}"), "running initializer");
            state
                .invoker
                .invoke(address)
                .map_err(|reason| LinkError::Initializer {
                    module: name.clone(),
                    address,
                    reason,
                })?;
        }
        if let Some(module) = state.registry.get_mut(id) {
            module.advance(ModuleStatus::Initialized);
        }
        Ok(())
    }

    /// Unloads every module not reachable from `roots`. Returns how many went.
    ///
    /// Finalizers of all doomed modules run before any memory is released.
    pub fn unload(&self, roots: &[ModuleId]) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let doomed = state.tracker.collect(&mut state.registry, roots);

        for &id in &doomed {
            let Some(module) = state.registry.get(id) else {
                continue;
            };
            if module.status != ModuleStatus::Initialized || module.origin != ModuleOrigin::SelfLoaded {
                continue;
            }
            let name = module.identity.to_string();
            for address in array_entries(module, SectionKind::FiniArray) {
                if let Err(reason) = state.invoker.invoke(address) {
                    tracing::warn!(module = %name, address = format_args!("{address:#x}"), "finalizer failed: {reason}");
                }
            }
        }
        for &id in &doomed {
            self.discard(state, id);
        }
        prune_edges(&mut state.registry);
        tracing::info!(unloaded = doomed.len(), remaining = state.registry.len(), "unload pass done");
        doomed.len()
    }

    /// Address of `name`, resolving its owner first if it is only loaded.
    ///
    /// Falls back to host-loaded modules and the host process.
    pub fn lookup_symbol(&self, name: &str) -> Option<u64> {
        if let Some(info) = self.symbols.lookup(name) {
            return Some(info.address);
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(owner) = self.symbols.lookup_any(name).and_then(|info| info.owner) {
            if state.registry.status(owner) == Some(ModuleStatus::Loaded) {
                let result = self.resolve_locked(state, owner);
                if let Err(err) = self.escalate(result) {
                    tracing::warn!(symbol = name, "lookup failed: {err}");
                    return None;
                }
            }
            return self.symbols.lookup(name).map(|info| info.address);
        }

        let dynamic: Vec<_> = state.registry.iter().filter_map(|m| m.host_handle).collect();
        let mut host = self.host_lock();
        dynamic
            .into_iter()
            .find_map(|handle| host.symbol(handle, name))
            .or_else(|| host.global_symbol(name))
    }

    /// `(tls module id, offset)` of a thread-local symbol, as the host
    /// loader's `__tls_get_addr` expects.
    ///
    /// Only thread-locals the host loader placed have one. Names bound to a
    /// self-loaded module give `None`.
    pub fn lookup_tls_symbol(&self, name: &str) -> Option<(u64, u64)> {
        if self.symbols.lookup_any(name).is_some_and(|info| info.owner.is_some()) {
            tracing::debug!(symbol = name, "thread-local of a self-loaded module has no host module id");
            return None;
        }
        let state = self.lock();
        let dynamic: Vec<_> = state.registry.iter().filter_map(|m| m.host_handle).collect();
        let mut host = self.host_lock();
        dynamic
            .into_iter()
            .find_map(|handle| host.tls_symbol(Some(handle), name))
            .or_else(|| host.tls_symbol(None, name))
    }

    /// Publishes a symbol of the host itself.
    pub fn define_host_symbol(&self, name: &str, address: u64, kind: SymbolKind, strength: Strength) -> Result<()> {
        let state = self.lock();
        let result = self
            .symbols
            .insert(name, address, strength, kind, None, |owner| owner_label(&state.registry, owner))
            .map(|_| ());
        self.escalate(result)
    }

    pub fn is_already_loaded(&self, identity: &Identity) -> bool {
        self.lock().registry.find(identity).is_some()
    }

    /// Status of the module loaded from `identity`, `None` if there is none.
    pub fn object_status(&self, identity: &Identity) -> Option<ModuleStatus> {
        let state = self.lock();
        let id = state.registry.find(identity)?;
        state.registry.status(id)
    }

    pub fn module_status(&self, id: ModuleId) -> Option<ModuleStatus> {
        self.lock().registry.status(id)
    }

    /// Diagnostic snapshot of every known module.
    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.lock().registry.iter().map(Module::info).collect()
    }

    /// Which module, and which symbol in it, an address belongs to.
    pub fn resolve_symbol_addr(&self, address: u64) -> Option<AddressInfo> {
        let state = self.lock();
        let module = state.registry.iter().find(|m| m.segment_containing(address).is_some())?;
        Some(AddressInfo {
            module: module.id,
            name: module.identity.to_string(),
            symbol: self.symbols.nearest(Some(module.id), address),
            address,
        })
    }

    /// Hands the module an item to keep alive until it is unloaded.
    pub fn attach_foreign_exports(&self, id: ModuleId, item: Box<dyn Any + Send>) -> Result<()> {
        let mut state = self.lock();
        let module = state.registry.get_mut(id).ok_or(LinkError::StaleHandle)?;
        module.foreign_exports.push(item);
        Ok(())
    }

    /// Copies `len` bytes of placed memory starting at `address`.
    pub fn read_bytes(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.lock();
        let segment = state.registry.iter().find_map(|m| m.segment_containing(address))?;
        let start = (address - segment.base()) as usize;
        segment.region().bytes().get(start..start + len).map(<[u8]>::to_vec)
    }
}

fn map_file(path: &Path) -> Result<Mmap> {
    let io = |source| LinkError::Io {
        path: path.display().to_string(),
        source,
    };
    let file = File::open(path).map_err(io)?;
    // SAFETY: the map is only read, and dropped before this call's caller returns.
    unsafe { Mmap::map(&file) }.map_err(io)
}

/// Places the decoded sections, plus the common block if there is one.
fn lay_out(layout: &mut MemoryLayoutManager<'_>, sections: &[SectionDescriptor], bss: u64) -> Result<Option<usize>> {
    for desc in sections {
        layout.add_section(desc)?;
    }
    if bss == 0 {
        return Ok(None);
    }
    layout.add_bss_extension(COMMON_SECTION, bss).map(Some)
}

/// Non-empty pointer entries of a module's init or fini arrays, in the order
/// they run.
///
/// `.init_array` runs forward and `.ctors` backward; finalizers mirror that,
/// with `.fini_array` backward and `.dtors` forward. Finalizer sections run
/// last to first.
fn array_entries(module: &Module, kind: SectionKind) -> Vec<u64> {
    let mut sections: Vec<&Section> = module.sections.iter().filter(|s| s.kind == kind).collect();
    if kind == SectionKind::FiniArray {
        sections.reverse();
    }
    let mut entries = Vec::new();
    for section in sections {
        let Some(segment) = section.segment.and_then(|i| module.segments.get(i)) else {
            continue;
        };
        let start = (section.start - segment.base()) as usize;
        let Some(bytes) = segment.region().bytes().get(start..start + section.size as usize) else {
            continue;
        };
        let mut words: Vec<u64> = bytes
            .chunks_exact(8)
            .map(|word| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(word);
                u64::from_le_bytes(raw)
            })
            .filter(|&address| address != 0 && address != u64::MAX)
            .collect();
        let legacy = section.name.starts_with(".ctors") || section.name.starts_with(".dtors");
        if legacy == (kind == SectionKind::InitArray) {
            words.reverse();
        }
        entries.extend(words);
    }
    entries
}

/// A thread-local of a self-loaded module: its block is not registered with
/// the host loader, so `__tls_get_addr` cannot find it.
fn self_loaded_tls(module: &str, symbol: &str) -> LinkError {
    LinkError::UnsupportedTls {
        module: module.to_string(),
        symbol: symbol.to_string(),
        reason: "defined by a self-loaded module, whose block the host loader does not know",
    }
}

fn is_executable(registry: &ModuleRegistry, address: u64) -> bool {
    registry
        .iter()
        .filter_map(|m| m.segment_containing(address))
        .any(|s| s.access().is_executable())
}
