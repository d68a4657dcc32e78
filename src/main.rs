//! Entry point for the rtld driver.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap` and set up `tracing`.
//! 2. Initialize the linker with the host's architecture backend.
//! 3. Load every input (object files and archive members).
//! 4. Resolve, optionally run initializers, and answer symbol queries.
//! 5. Unload everything again unless asked to keep it.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rtld::arch::{Architecture, HostArch};
use rtld::config::Config;
use rtld::linker::Linker;

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let linker = Linker::builder(HostArch::default())
        .config(config.linker_config())
        .build();
    tracing::debug!(arch = linker.arch().name(), "starting");

    // 1. Load every input
    let mut loaded = Vec::new();
    for path in &config.inputs {
        let ids = linker
            .load_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        loaded.extend(ids);
    }

    // 2. Resolve all relocations
    linker.resolve_all().context("resolution failed")?;

    // 3. Run initializers
    if config.run_init {
        for &id in &loaded {
            linker
                .run_initializers(id)
                .with_context(|| format!("initializers of module {id} failed"))?;
        }
    }

    // 4. Answer lookups
    for name in &config.lookups {
        match linker.lookup_symbol(name) {
            Some(address) => {
                let location = linker
                    .resolve_symbol_addr(address)
                    .map_or_else(|| "host".to_string(), |info| info.to_string());
                println!("{name} = {address:#x} ({location})");
            }
            None => println!("{name} not found"),
        }
    }

    for info in linker.modules() {
        println!("{info}");
    }

    // 5. Unload
    if !config.keep {
        let count = linker.unload(&[]);
        println!("Unloaded {count} modules");
    }
    Ok(())
}
