//! Configuration module.
//!
//! `Config` is the command-line interface of the `rtld` driver, parsed with `clap`.
//! `LinkerConfig` holds the knobs of the library itself; the driver builds one
//! from its arguments, embedding hosts construct it directly.

use clap::Parser;
use std::path::PathBuf;

/// Load relocatable objects into this process and link them at runtime.
///
/// Each input is mapped, placed in memory, resolved against the symbols of the
/// other inputs, optionally initialized, and finally unloaded again.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Object files or static archives to load
    #[arg(required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,

    /// Anchor address for placing code, in hex
    #[arg(long, value_parser = parse_address, help = "Address near which loaded code is placed")]
    pub load_base: Option<u64>,

    /// Force near placement with the given reach, in hex
    #[arg(long, value_parser = parse_address)]
    pub near_placement: Option<u64>,

    /// Run module initializers after resolution
    #[arg(long)]
    pub run_init: bool,

    /// Symbols to look up and print after loading
    #[arg(short = 's', long = "lookup")]
    pub lookups: Vec<String>,

    /// Keep every module loaded instead of unloading them before exit
    #[arg(long)]
    pub keep: bool,
}

impl Config {
    /// Library configuration derived from the command line.
    pub fn linker_config(&self) -> LinkerConfig {
        LinkerConfig {
            load_base: self.load_base,
            near_placement: self.near_placement,
            ..LinkerConfig::default()
        }
    }
}

fn parse_address(s: &str) -> Result<u64, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid address `{s}`: {e}"))
}

/// What to do when an internal consistency check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Log and terminate the process.
    #[default]
    Abort,
    /// Log and return `LinkError::Fatal` to the caller.
    Report,
}

/// Runtime linker settings.
#[derive(Debug, Clone)]
pub struct LinkerConfig {
    /// Anchor for the placement policy. Defaults to an address inside the host image.
    pub load_base: Option<u64>,
    /// Require all placed memory to stay within this distance of the anchor,
    /// overriding the architecture's own requirement.
    pub near_placement: Option<u64>,
    /// Granule of every segment.
    pub page_size: u64,
    /// Sections up to this size are sub-allocated from shared blocks.
    pub small_section_limit: u64,
    /// Size of each sub-allocation block, in pages.
    pub block_pages: u64,
    /// Check every patch against the module's proddable blocks.
    pub check_proddables: bool,
    pub fatal_policy: FatalPolicy,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            load_base: None,
            near_placement: None,
            page_size: 0x1000,
            small_section_limit: 0x800,
            block_pages: 8,
            check_proddables: cfg!(debug_assertions),
            fatal_policy: FatalPolicy::Abort,
        }
    }
}
