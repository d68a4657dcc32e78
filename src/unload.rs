//! Dependency tracking and unloading.
//!
//! A module may only leave memory once nothing that is still wanted can reach
//! it through dependency edges. Collection is a plain mark and sweep over the
//! registry: each pass bumps a generation number, stamps it on every module
//! reachable from the roots, and hands back the ones left unstamped.

use crate::module::ModuleId;
use crate::registry::ModuleRegistry;

/// Mark-sweep collector state.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    epoch: u64,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation of the most recent pass.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Stamps every module reachable from `roots`. Returns the new generation.
    pub fn mark(&mut self, registry: &mut ModuleRegistry, roots: &[ModuleId]) -> u64 {
        self.epoch += 1;
        let epoch = self.epoch;

        let mut stack: Vec<ModuleId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            let Some(module) = registry.get_mut(id) else {
                continue;
            };
            if module.mark == epoch {
                continue;
            }
            module.mark = epoch;
            stack.extend(module.dependencies.iter().copied());
        }
        epoch
    }

    /// Modules left unmarked by the last pass. Modules mid-load are never doomed.
    pub fn unmarked(&self, registry: &ModuleRegistry) -> Vec<ModuleId> {
        registry
            .iter()
            .filter(|m| m.mark != self.epoch && !registry.is_loading(m.id))
            .map(|m| m.id)
            .collect()
    }

    /// Marks from `roots` and returns every module that is no longer reachable.
    pub fn collect(&mut self, registry: &mut ModuleRegistry, roots: &[ModuleId]) -> Vec<ModuleId> {
        let epoch = self.mark(registry, roots);
        let doomed = self.unmarked(registry);
        tracing::debug!(epoch, roots = roots.len(), doomed = doomed.len(), "mark phase done");
        doomed
    }
}

/// Drops edges that point at modules no longer in the registry.
pub fn prune_edges(registry: &mut ModuleRegistry) {
    let live: std::collections::HashSet<ModuleId> = registry.ids().into_iter().collect();
    for module in registry.iter_mut() {
        module.dependencies.retain(|dep| live.contains(dep));
    }
}
