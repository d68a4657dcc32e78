//! Module registry.
//!
//! An arena of modules indexed by `ModuleId`. A slot's generation is bumped
//! whenever its occupant leaves, so ids held across an unload never alias the
//! module that later reuses the slot.

use std::collections::{HashMap, HashSet};

use crate::module::{Identity, Module, ModuleId, ModuleOrigin, ModuleStatus};

struct Slot {
    generation: u32,
    module: Option<Module>,
}

/// Every known module, plus the subset that is mid-load.
#[derive(Default)]
pub struct ModuleRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_identity: HashMap<Identity, ModuleId>,
    loading: HashSet<ModuleId>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a module in the `Allocated` state and records it as mid-load.
    pub fn allocate(&mut self, identity: Identity, origin: ModuleOrigin, format: &'static str) -> ModuleId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                ModuleId::new(index, slot.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    module: None,
                });
                ModuleId::new(self.slots.len() as u32 - 1, 0)
            }
        };
        self.slots[id.index()].module = Some(Module::new(id, identity.clone(), origin, format));
        self.by_identity.insert(identity, id);
        self.loading.insert(id);
        id
    }

    /// Marks a module as fully loaded.
    pub fn finish_loading(&mut self, id: ModuleId) {
        self.loading.remove(&id);
        if let Some(module) = self.get_mut(id) {
            module.advance(ModuleStatus::Loaded);
        }
    }

    pub fn is_loading(&self, id: ModuleId) -> bool {
        self.loading.contains(&id)
    }

    pub fn get(&self, id: ModuleId) -> Option<&Module> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.module.as_ref()
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut Module> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.module.as_mut()
    }

    /// Takes a module out of the arena and retires its id.
    pub fn remove(&mut self, id: ModuleId) -> Option<Module> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        let module = slot.module.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        self.loading.remove(&id);
        if self.by_identity.get(&module.identity) == Some(&id) {
            self.by_identity.remove(&module.identity);
        }
        Some(module)
    }

    pub fn find(&self, identity: &Identity) -> Option<ModuleId> {
        self.by_identity.get(identity).copied()
    }

    pub fn status(&self, id: ModuleId) -> Option<ModuleStatus> {
        self.get(id).map(Module::status)
    }

    pub fn ids(&self) -> Vec<ModuleId> {
        self.iter().map(Module::id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.slots.iter().filter_map(|slot| slot.module.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Module> {
        self.slots.iter_mut().filter_map(|slot| slot.module.as_mut())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
