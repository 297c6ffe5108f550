//! Named module store
//!
//! A thread-safe, insertion-ordered collection of uniquely named modules.
//! The name map has its own lock, separate from the per-module locks, so a
//! caller sitting on one module never blocks lookups of any other name.
//! The map lock is never held across an await point.

use crate::error::{CoreError, CoreResult};
use crate::module::Module;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Shared handle to a stored module. Lock it to use the module.
pub type ModuleHandle<M> = Arc<Mutex<Box<M>>>;

/// A module together with its held lock.
///
/// The lock is released when the guard goes out of scope, on every exit
/// path, or earlier through [`ModuleGuard::release`].
pub struct ModuleGuard<M: ?Sized> {
    guard: OwnedMutexGuard<Box<M>>,
}

impl<M: ?Sized> ModuleGuard<M> {
    /// Release the lock now
    pub fn release(self) {
        drop(self);
    }
}

impl<M: ?Sized> Deref for ModuleGuard<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.guard
    }
}

impl<M: ?Sized> DerefMut for ModuleGuard<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.guard
    }
}

struct Entries<M: ?Sized> {
    order: Vec<String>,
    modules: HashMap<String, ModuleHandle<M>>,
}

/// Keyed store of lifecycle-managed modules
pub struct ModuleStore<M: ?Sized> {
    entries: RwLock<Entries<M>>,
}

impl<M: ?Sized> Default for ModuleStore<M> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Entries {
                order: Vec::new(),
                modules: HashMap::new(),
            }),
        }
    }
}

impl<M: Module + ?Sized> ModuleStore<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a module, failing if its name is taken
    pub fn add(&self, module: Box<M>) -> CoreResult<()> {
        let name = module.name().to_string();
        let mut entries = self.entries.write();
        if entries.modules.contains_key(&name) {
            return Err(CoreError::NameConflict(format!(
                "module name '{}' already exists",
                name
            )));
        }
        entries
            .modules
            .insert(name.clone(), Arc::new(Mutex::new(module)));
        entries.order.push(name.clone());
        debug!(module = %name, "Module added");
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.entries.read().modules.contains_key(name)
    }

    /// Shared handle without taking the module lock
    pub fn get(&self, name: &str) -> CoreResult<ModuleHandle<M>> {
        self.entries
            .read()
            .modules
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    /// Lock a module by name, waiting until the lock is free
    pub async fn get_locked(&self, name: &str) -> CoreResult<ModuleGuard<M>> {
        let handle = self.get(name)?;
        Ok(ModuleGuard {
            guard: handle.lock_owned().await,
        })
    }

    /// Run `f` against a module while holding its lock
    pub async fn with_locked<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut M) -> R,
    ) -> CoreResult<R> {
        let mut guard = self.get_locked(name).await?;
        Ok(f(&mut guard))
    }

    /// Stop the module if it is running, then erase it
    pub async fn remove(&self, name: &str) -> CoreResult<()> {
        let handle = self.get(name)?;
        {
            let mut module = handle.lock().await;
            if module.running() {
                if let Err(e) = module.stop().await {
                    warn!(module = %name, error = %e, "Error stopping module during removal");
                }
            }
        }

        let mut entries = self.entries.write();
        match entries.modules.get(name) {
            Some(current) if Arc::ptr_eq(current, &handle) => {
                entries.modules.remove(name);
                entries.order.retain(|n| n != name);
                debug!(module = %name, "Module removed");
                Ok(())
            }
            _ => Err(not_found(name)),
        }
    }

    /// All modules in insertion order
    pub fn enumerate(&self) -> Vec<ModuleHandle<M>> {
        let entries = self.entries.read();
        entries
            .order
            .iter()
            .filter_map(|name| entries.modules.get(name).cloned())
            .collect()
    }

    /// All module names in insertion order
    pub fn names(&self) -> Vec<String> {
        self.entries.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_found(name: &str) -> CoreError {
    CoreError::NotFound(format!("module name '{}' does not exist", name))
}
