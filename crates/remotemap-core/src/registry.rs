//! Modules mapped during one session, keyed by on-disk path.

use std::collections::HashMap;
use std::path::Path;

use crate::{Error, Result};

/// Path to remote base map shared by a root module and its dependencies.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, u64>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive key for `path`. Existing files are canonicalized.
    pub fn key(path: &Path) -> String {
        std::fs::canonicalize(path)
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .to_lowercase()
    }

    /// Record a mapped module. A path can be registered only once.
    pub fn register(&mut self, path: &Path, base: u64) -> Result<()> {
        let key = Self::key(path);
        if self.modules.contains_key(&key) {
            return Err(Error::ModuleAlreadyRegistered(key));
        }
        log::debug!("Registered {} at 0x{:X}", key, base);
        self.modules.insert(key, base);
        Ok(())
    }

    pub fn lookup(&self, path: &Path) -> Option<u64> {
        self.modules.get(&Self::key(path)).copied()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lookup(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Registered (key, base) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.modules.iter().map(|(k, &v)| (k.as_str(), v))
    }
}
