//! Loaded module representation.
//!
//! A `Module` owns everything one object file brings into the process: its
//! placed sections and segments, the names it published, the
//! set of modules it depends on, and the jump islands built for it.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::decode::{RelocationRecord, SymbolDecl};
use crate::host::HostHandle;
use crate::layout::{Section, Segment};
use crate::proddable::ProddableBlocks;
use crate::trampoline::TrampolinePool;

/// Stable handle of a module: arena slot plus the generation of its occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId {
    index: u32,
    generation: u32,
}

impl ModuleId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Where a module came from: a file path, optionally qualified by the archive member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub path: PathBuf,
    pub member: Option<String>,
}

impl Identity {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            member: None,
        }
    }

    pub fn member(path: impl Into<PathBuf>, member: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            member: Some(member.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.member {
            Some(member) => write!(f, "{}({})", self.path.display(), member),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

/// Who mapped the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOrigin {
    /// Placed and relocated by this linker.
    SelfLoaded,
    /// Opened through the host's dynamic loader.
    HostLoaded,
}

/// Lifecycle state. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleStatus {
    Allocated,
    Loaded,
    Resolved,
    Initialized,
    Unloaded,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleStatus::Allocated => "allocated",
            ModuleStatus::Loaded => "loaded",
            ModuleStatus::Resolved => "resolved",
            ModuleStatus::Initialized => "initialized",
            ModuleStatus::Unloaded => "unloaded",
        };
        f.write_str(name)
    }
}

/// Decoder output kept between load and resolve.
pub(crate) struct Pending {
    pub symbols: Vec<SymbolDecl>,
    /// Placed address of each defined symbol; TLS symbols hold their block offset.
    pub addresses: Vec<Option<u64>>,
    pub relocations: Vec<RelocationRecord>,
}

/// One loaded object.
pub struct Module {
    pub(crate) id: ModuleId,
    pub(crate) identity: Identity,
    pub(crate) origin: ModuleOrigin,
    pub(crate) status: ModuleStatus,
    pub(crate) format: &'static str,
    pub(crate) sections: Vec<Section>,
    pub(crate) segments: Vec<Segment>,
    /// Names this module published into the symbol table.
    pub(crate) symbols: Vec<String>,
    pub(crate) dependencies: HashSet<ModuleId>,
    /// Collector generation in which this module was last marked.
    pub(crate) mark: u64,
    pub(crate) proddables: ProddableBlocks,
    pub(crate) pool: Option<TrampolinePool>,
    pub(crate) pending: Option<Pending>,
    pub(crate) foreign_exports: Vec<Box<dyn Any + Send>>,
    pub(crate) format_info: Option<Box<dyn Any + Send>>,
    pub(crate) host_handle: Option<HostHandle>,
}

impl Module {
    pub(crate) fn new(id: ModuleId, identity: Identity, origin: ModuleOrigin, format: &'static str) -> Self {
        Self {
            id,
            identity,
            origin,
            status: ModuleStatus::Allocated,
            format,
            sections: Vec::new(),
            segments: Vec::new(),
            symbols: Vec::new(),
            dependencies: HashSet::new(),
            mark: 0,
            proddables: ProddableBlocks::default(),
            pool: None,
            pending: None,
            foreign_exports: Vec::new(),
            format_info: None,
            host_handle: None,
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn status(&self) -> ModuleStatus {
        self.status
    }

    /// Moves the state machine forward. Backward moves are a loader bug.
    pub(crate) fn advance(&mut self, next: ModuleStatus) {
        debug_assert!(next >= self.status, "{} cannot go from {} to {}", self.identity, self.status, next);
        tracing::debug!(module = %self.identity, from = %self.status, to = %next, "status change");
        self.status = next;
    }

    /// Address range of loaded memory containing `address`, if any.
    pub(crate) fn segment_containing(&self, address: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(address))
    }

    /// Snapshot for diagnostics.
    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            id: self.id,
            name: self.identity.to_string(),
            format: self.format,
            origin: self.origin,
            status: self.status,
            image_size: self.segments.iter().map(Segment::size).sum(),
            segments: self.segments.len(),
            sections: self.sections.len(),
            symbols: self.symbols.len(),
            dependencies: self.dependencies.iter().copied().collect(),
        }
    }
}

/// A diagnostic view of a module, as returned by `Linker::modules`.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub name: String,
    pub format: &'static str,
    pub origin: ModuleOrigin,
    pub status: ModuleStatus,
    /// Bytes of placed memory: sections, bss extension and trampoline pool.
    pub image_size: u64,
    pub segments: usize,
    pub sections: usize,
    pub symbols: usize,
    pub dependencies: Vec<ModuleId>,
}

impl fmt::Display for ModuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}, {}] {} segments, {} symbols, {} deps",
            self.id,
            self.name,
            self.format,
            self.status,
            self.segments,
            self.symbols,
            self.dependencies.len()
        )
    }
}
