//! Registry of storage modules
//!
//! Modules are looked up by name and shared by every database handle of the process. A module
//! stays loaded while a handle uses it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock, Weak},
};

use crate::{
    backend::KdbModule,
    db2::Db2Module,
    error::{Error, Result},
    klmdb::LmdbModule,
};

/// Constructor of a storage module
pub type ModuleFactory = fn() -> Box<dyn KdbModule>;

/// A storage module in use
pub struct LoadedModule {
    name: String,
    module: Box<dyn KdbModule>,
}

impl LoadedModule {
    /// Name the module was loaded as
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The module
    pub fn module(&self) -> &dyn KdbModule {
        self.module.as_ref()
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        log::debug!("unloading database module {}", self.name);
    }
}

struct Registry {
    factories: HashMap<String, ModuleFactory>,
    loaded: HashMap<String, Weak<LoadedModule>>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut factories: HashMap<String, ModuleFactory> = HashMap::new();
        factories.insert("klmdb".to_owned(), || Box::new(LmdbModule));
        factories.insert("db2".to_owned(), || Box::new(Db2Module));
        Mutex::new(Registry {
            factories,
            loaded: HashMap::new(),
        })
    })
}

/// Make a module available under `name`
///
/// Fails with [`Error::DuplicateEntry`] if the name is taken.
pub fn register(name: &str, factory: ModuleFactory) -> Result<()> {
    let mut registry = registry().lock().map_err(|_| Error::LockError)?;
    if registry.factories.contains_key(name) {
        return Err(Error::DuplicateEntry);
    }
    registry.factories.insert(name.to_owned(), factory);
    Ok(())
}

/// Names of the available modules
pub fn modules() -> Result<Vec<String>> {
    let registry = registry().lock().map_err(|_| Error::LockError)?;
    let mut names: Vec<String> = registry.factories.keys().cloned().collect();
    names.sort();
    Ok(names)
}

/// Load the module `name`, or share it if it is already loaded
pub fn load(name: &str) -> Result<Arc<LoadedModule>> {
    let mut registry = registry().lock().map_err(|_| Error::LockError)?;
    registry.loaded.retain(|_, module| module.strong_count() > 0);
    if let Some(module) = registry.loaded.get(name).and_then(Weak::upgrade) {
        return Ok(module);
    }
    let factory = registry
        .factories
        .get(name)
        .ok_or_else(|| Error::UnknownModule(name.to_owned()))?;
    let module = Arc::new(LoadedModule {
        name: name.to_owned(),
        module: factory(),
    });
    registry
        .loaded
        .insert(name.to_owned(), Arc::downgrade(&module));
    log::debug!("loaded database module {name}");
    Ok(module)
}
