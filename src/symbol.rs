//! Symbol table management.
//!
//! One table serves the whole process: the host's own exports, plus every
//! global definition published by a loaded module. Bindings are kept in a
//! `DashMap` so that plain lookups can run without the linker lock; every
//! mutation happens while the lock is held.
//!
//! A name keeps every live definition, not just the winning one. Definitions
//! that lost are shadowed, and when the winner's owner goes away the
//! strongest survivor takes over again.

use dashmap::{DashMap, DashSet};
use std::collections::HashSet;

use crate::error::{FatalError, LinkError, Result};
use crate::module::ModuleId;

/// What a symbol identifies. Decides how an out-of-range reference is bridged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// A function; reachable through a jump island.
    Code,
    /// Data; only GOT-style references can be redirected.
    Data,
    /// Thread-local; the address is an offset into the owner's TLS block.
    Tls,
}

/// Priority of a definition. Ordered `Weak < Normal < Strong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Strength {
    Weak,
    Normal,
    Strong,
}

/// A binding in the global table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolInfo {
    pub address: u64,
    pub kind: SymbolKind,
    pub strength: Strength,
    /// `None` for symbols exported by the host itself.
    pub owner: Option<ModuleId>,
}

/// What `insert` did with a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Added,
    Replaced,
    /// The existing binding won.
    Kept,
}

/// Toolchain-provided names that may stay undefined and resolve to 0.
pub fn is_optional_symbol(name: &str) -> bool {
    matches!(name, "_DYNAMIC" | "__dso_handle" | "_dl_find_object" | "__TMC_END__")
        || name.starts_with("__TMC_")
        || name.starts_with("__gcc_")
}

/// Every live definition of one name.
#[derive(Debug, Clone)]
struct Definitions {
    active: SymbolInfo,
    /// Losing definitions, in insertion order.
    shadowed: Vec<SymbolInfo>,
}

impl Definitions {
    fn shadow(&mut self, info: SymbolInfo) {
        if !self.shadowed.contains(&info) {
            self.shadowed.push(info);
        }
    }

    /// Drops `owner`'s definitions. Returns how many went and whether any is left.
    fn remove_owner(&mut self, owner: ModuleId) -> (usize, bool) {
        let before = self.shadowed.len();
        self.shadowed.retain(|info| info.owner != Some(owner));
        let mut removed = before - self.shadowed.len();
        if self.active.owner == Some(owner) {
            removed += 1;
            // Strongest survivor; the earliest one among equals.
            let mut best = None;
            for (i, info) in self.shadowed.iter().enumerate() {
                if best.map_or(true, |b: usize| info.strength > self.shadowed[b].strength) {
                    best = Some(i);
                }
            }
            match best {
                Some(i) => self.active = self.shadowed.remove(i),
                None => return (removed, false),
            }
        }
        (removed, true)
    }
}

/// Name → binding map shared by every module.
#[derive(Debug, Default)]
pub struct SymbolTable {
    bindings: DashMap<String, Definitions>,
    /// Owners whose relocations are all applied.
    ready: DashSet<ModuleId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition, applying the strength rules.
    ///
    /// The existing binding wins unless the new one is strictly stronger. Two
    /// strong definitions must agree on the address, otherwise the conflict is
    /// fatal. Two normal definitions with different addresses from different
    /// owners are reported as a duplicate; `owner_name` renders owners for
    /// that message.
    pub fn insert(
        &self,
        name: &str,
        address: u64,
        strength: Strength,
        kind: SymbolKind,
        owner: Option<ModuleId>,
        owner_name: impl Fn(Option<ModuleId>) -> String,
    ) -> Result<Insertion> {
        let new = SymbolInfo {
            address,
            kind,
            strength,
            owner,
        };
        let mut entry = match self.bindings.get_mut(name) {
            Some(entry) => entry,
            None => {
                self.bindings.insert(
                    name.to_string(),
                    Definitions {
                        active: new,
                        shadowed: Vec::new(),
                    },
                );
                return Ok(Insertion::Added);
            }
        };
        let existing = entry.active;

        if existing.address == address && existing.owner == owner {
            if strength > existing.strength {
                entry.active = new;
                return Ok(Insertion::Replaced);
            }
            return Ok(Insertion::Kept);
        }

        match (existing.strength, strength) {
            (Strength::Strong, Strength::Strong) => {
                if existing.address == address {
                    entry.shadow(new);
                    Ok(Insertion::Kept)
                } else {
                    Err(FatalError::DuplicateStrong {
                        symbol: name.to_string(),
                        existing: existing.address,
                        new: address,
                    }
                    .into())
                }
            }
            (old, new_strength) if new_strength > old => {
                tracing::debug!(symbol = name, ?old, new = ?new_strength, "overriding definition");
                entry.shadow(existing);
                entry.active = new;
                Ok(Insertion::Replaced)
            }
            (Strength::Normal, Strength::Normal) if existing.address != address => {
                drop(entry);
                Err(LinkError::DuplicateDefinition {
                    symbol: name.to_string(),
                    existing_owner: owner_name(existing.owner),
                    new_owner: owner_name(owner),
                })
            }
            _ => {
                entry.shadow(new);
                Ok(Insertion::Kept)
            }
        }
    }

    /// Looks up a binding whose owner is resolved (or the host).
    ///
    /// Never mutates and is safe to call without the linker lock.
    pub fn lookup(&self, name: &str) -> Option<SymbolInfo> {
        let info = self.bindings.get(name)?.active;
        match info.owner {
            Some(owner) if !self.ready.contains(&owner) => None,
            _ => Some(info),
        }
    }

    /// Looks up a binding regardless of its owner's state.
    pub(crate) fn lookup_any(&self, name: &str) -> Option<SymbolInfo> {
        self.bindings.get(name).map(|entry| entry.active)
    }

    /// Looks up a binding and records that `requester` depends on its owner.
    ///
    /// The edge goes into a set, so repeated lookups do not grow it. Host
    /// symbols and self references record nothing.
    pub fn lookup_dependent(
        &self,
        name: &str,
        requester: ModuleId,
        dependencies: &mut HashSet<ModuleId>,
    ) -> Option<SymbolInfo> {
        let info = self.lookup_any(name)?;
        if let Some(owner) = info.owner {
            if owner != requester {
                dependencies.insert(owner);
            }
        }
        Some(info)
    }

    /// Drops every definition owned by `owner`, handing each name it won back
    /// to the strongest remaining definition. Returns how many were removed.
    pub fn remove_all(&self, owner: ModuleId) -> usize {
        self.ready.remove(&owner);
        let mut removed = 0;
        self.bindings.retain(|_, defs| {
            let (count, live) = defs.remove_owner(owner);
            removed += count;
            live
        });
        removed
    }

    /// Makes `owner`'s bindings visible to [`lookup`](Self::lookup).
    pub(crate) fn mark_ready(&self, owner: ModuleId) {
        self.ready.insert(owner);
    }

    /// Nearest symbol at or below `address` owned by `owner`.
    pub(crate) fn nearest(&self, owner: Option<ModuleId>, address: u64) -> Option<(String, u64)> {
        self.bindings
            .iter()
            .flat_map(|e| {
                let name = e.key().clone();
                std::iter::once(e.active)
                    .chain(e.shadowed.iter().copied())
                    .map(move |info| (name.clone(), info))
                    .collect::<Vec<_>>()
            })
            .filter(|(_, info)| info.owner == owner && info.kind != SymbolKind::Tls && info.address <= address)
            .max_by_key(|(_, info)| info.address)
            .map(|(name, info)| (name, info.address))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
