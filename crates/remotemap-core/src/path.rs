//! Locating module files on disk.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Resolves module names against an ordered list of directories.
#[derive(Debug, Clone)]
pub struct PathResolver {
    search_dirs: Vec<PathBuf>,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PathResolver {
    /// Search order of the Windows loader: the controller's executable
    /// directory, the system directory, the Windows directory, the current
    /// directory, then every `PATH` entry.
    pub fn new() -> Self {
        let mut dirs = Vec::new();

        if let Ok(exe) = std::env::current_exe()
            && let Some(dir) = exe.parent()
        {
            dirs.push(dir.to_path_buf());
        }
        if let Some(root) = std::env::var_os("SystemRoot") {
            let root = PathBuf::from(root);
            dirs.push(root.join("System32"));
            dirs.push(root);
        }
        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd);
        }
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path).filter(|p| !p.as_os_str().is_empty()));
        }

        Self { search_dirs: dirs }
    }

    pub fn with_search_dirs(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// First existing file for `path`. Absolute paths are only checked for
    /// existence.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            return if path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(Error::ModuleNotFound(path.display().to_string()))
            };
        }

        self.search_dirs
            .iter()
            .map(|dir| dir.join(path))
            .find(|candidate| candidate.is_file())
            .inspect(|found| log::debug!("Resolved {} to {}", path.display(), found.display()))
            .ok_or_else(|| Error::ModuleNotFound(path.display().to_string()))
    }
}
