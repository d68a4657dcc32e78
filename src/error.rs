//! Error types.
//!
//! Failures fall into two classes. Recoverable errors abandon the module that
//! was being loaded or resolved and are handed back to the caller. Fatal errors
//! mean the loader can no longer vouch for memory it has written; what happens
//! to them is decided by [`FatalPolicy`](crate::config::FatalPolicy).

use thiserror::Error;

/// Errors returned by the runtime linker.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}: unknown or unsupported object format")]
    UnknownFormat(String),

    #[error("{module}: object targets {found}, but this linker patches {expected}")]
    WrongArchitecture {
        module: String,
        found: String,
        expected: &'static str,
    },

    #[error("{module}: malformed object: {reason}")]
    Malformed { module: String, reason: String },

    #[error("{module}: unsupported relocation type {raw} at {site:#x}")]
    UnsupportedRelocation { module: String, raw: u32, site: u64 },

    /// Only thread-locals the host loader knows about have a module id.
    #[error("{module}: thread-local `{symbol}`: {reason}")]
    UnsupportedTls {
        module: String,
        symbol: String,
        reason: &'static str,
    },

    #[error("{module}: unresolved symbols: {}", .symbols.join(", "))]
    Unresolved { module: String, symbols: Vec<String> },

    #[error("duplicate definition of `{symbol}` in {new_owner} (already defined by {existing_owner})")]
    DuplicateDefinition {
        symbol: String,
        existing_owner: String,
        new_owner: String,
    },

    #[error("{module}: cannot {operation} a module that is {status}")]
    InvalidState {
        module: String,
        operation: &'static str,
        status: crate::module::ModuleStatus,
    },

    #[error("stale or unknown module handle")]
    StaleHandle,

    #[error("{module}: memory provider failed: {source}")]
    Memory {
        module: String,
        #[source]
        source: std::io::Error,
    },

    #[error("host dynamic loader: {0}")]
    HostLoader(String),

    #[error("{module}: initializer at {address:#x} failed: {reason}")]
    Initializer {
        module: String,
        address: u64,
        reason: String,
    },

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Internal consistency failures. Continuing after one of these risks
/// executing from a half-patched or out-of-bounds image.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("{module}: write of {size} bytes at {address:#x} is outside every proddable block")]
    ProddableViolation {
        module: String,
        address: u64,
        size: usize,
    },

    #[error("duplicate strong symbol `{symbol}`: {existing:#x} vs {new:#x}")]
    DuplicateStrong {
        symbol: String,
        existing: u64,
        new: u64,
    },

    #[error("no placement for {size:#x} bytes within {reach:#x} of {anchor:#x}")]
    Placement { size: u64, anchor: u64, reach: u64 },

    #[error("{module}: corrupt relocation record: {reason}")]
    CorruptRelocation { module: String, reason: String },

    #[error("{module}: relocation at {site:#x} cannot reach data at {target:#x}")]
    RelocationOverflow {
        module: String,
        site: u64,
        target: u64,
    },

    #[error("{module}: trampoline pool exhausted after {capacity} entries")]
    PoolExhausted { module: String, capacity: usize },
}

impl LinkError {
    /// Returns true for internal consistency failures.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Fatal(_))
    }
}

pub type Result<T, E = LinkError> = std::result::Result<T, E>;
