//! Runtime Object Linker Library.
//!
//! This library loads relocatable object files into the running process and
//! links them there. It is organized into several modules:
//! - `config`: CLI configuration and linker settings.
//! - `error`: Error types and the fatal/recoverable split.
//! - `arch`: Architecture-specific relocation encoding.
//! - `decode`: Object file decoding into normalized records.
//! - `memory`: Virtual memory regions and providers.
//! - `layout`: Section placement, segments and protections.
//! - `symbol`: Process-wide symbol table management.
//! - `module` / `registry`: Loaded modules and their arena.
//! - `reloc` / `trampoline`: Relocation patching and jump islands.
//! - `proddable`: Writable-range checks for patches.
//! - `unload`: Dependency tracking and mark-sweep unloading.
//! - `host`: Host dynamic loader and initializer calls.
//! - `linker`: The context object tying it all together.

pub mod arch;
pub mod config;
pub mod decode;
pub mod error;
pub mod host;
pub mod layout;
pub mod linker;
pub mod memory;
pub mod module;
pub mod proddable;
pub mod registry;
pub mod reloc;
pub mod symbol;
pub mod trampoline;
pub mod unload;
pub mod utils;

pub use error::{FatalError, LinkError};
pub use linker::{Linker, LinkerBuilder};
pub use module::{Identity, ModuleId, ModuleStatus};
