//! The versioned on-disk store.
//!
//! Two regions under `plugins_path`: the active view (one directory per
//! name, holding the currently selected version's files) and `.versions/`
//! (the canonical copy of every installed `(name, version)`). The active view
//! is only ever populated by copying out of `.versions/`.

mod graph;
mod version_manager;

pub use graph::DependencyGraph;
pub use version_manager::VersionManager;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use semver::Version;

use crate::error::PluginError;
use crate::runtime::Runtime;
use crate::version_range::parse_version;

/// Path oracle and disk mover for the two store regions.
pub struct VersionedStore {
    runtime: Arc<dyn Runtime>,
    plugins_path: PathBuf,
    versions_path: PathBuf,
}

impl VersionedStore {
    pub fn new(runtime: Arc<dyn Runtime>, plugins_path: PathBuf, versions_path: PathBuf) -> Self {
        VersionedStore {
            runtime,
            plugins_path,
            versions_path,
        }
    }

    pub fn plugins_path(&self) -> &Path {
        &self.plugins_path
    }

    pub fn versions_path(&self) -> &Path {
        &self.versions_path
    }

    /// Create both store regions if absent.
    pub fn ensure_layout(&self) -> Result<(), PluginError> {
        for dir in [&self.plugins_path, &self.versions_path] {
            self.runtime
                .create_dir_all(dir)
                .map_err(|e| PluginError::io(dir.clone(), std::io::Error::other(e.to_string())))?;
        }
        Ok(())
    }

    /// Directory of the active view for `name`.
    ///
    /// Scoped names expand to nested directories: `@scope/name` lives at
    /// `<plugins_path>/@scope/name`.
    pub fn active_dir(&self, name: &str) -> PathBuf {
        match split_scoped(name) {
            Some((scope, bare)) => self.plugins_path.join(scope).join(bare),
            None => self.plugins_path.join(name),
        }
    }

    /// Canonical directory of one `(name, version)` copy.
    pub fn versioned_dir(&self, name: &str, version: &str) -> PathBuf {
        match split_scoped(name) {
            Some((scope, bare)) => self
                .versions_path
                .join(scope)
                .join(format!("{}@{}", bare, version)),
            None => self.versions_path.join(format!("{}@{}", name, version)),
        }
    }

    /// True when the canonical copy of `(name, version)` exists.
    pub fn has_version(&self, name: &str, version: &str) -> bool {
        self.runtime.is_dir(&self.versioned_dir(name, version))
    }

    /// All versions of `name` present in `.versions/`, ascending.
    pub fn installed_versions(&self, name: &str) -> Vec<Version> {
        let (scan_dir, bare) = match split_scoped(name) {
            Some((scope, bare)) => (self.versions_path.join(scope), bare),
            None => (self.versions_path.clone(), name),
        };

        let Ok(entries) = self.runtime.read_dir(&scan_dir) else {
            return Vec::new();
        };

        let prefix = format!("{}@", bare);
        let mut versions: Vec<Version> = entries
            .iter()
            .filter(|p| self.runtime.is_dir(p))
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .filter_map(|dir_name| dir_name.strip_prefix(&prefix))
            .filter_map(|v| parse_version(v).ok())
            .collect();
        versions.sort();
        versions
    }

    /// Prepare a fresh, empty versioned directory for a download.
    ///
    /// An existing directory is wiped first: it is either a completed copy
    /// being forced or debris from an interrupted download.
    pub fn fresh_version_dir(&self, name: &str, version: &str) -> Result<PathBuf, PluginError> {
        let dir = self.versioned_dir(name, version);
        if self.runtime.exists(&dir) {
            self.runtime
                .remove_dir_all(&dir)
                .map_err(|e| PluginError::io(dir.clone(), std::io::Error::other(e.to_string())))?;
        }
        self.runtime
            .create_dir_all(&dir)
            .map_err(|e| PluginError::io(dir.clone(), std::io::Error::other(e.to_string())))?;
        Ok(dir)
    }

    /// Mirror `(name, version)` from `.versions/` into the active view.
    pub fn write_active(&self, name: &str, version: &str) -> Result<(), PluginError> {
        let source = self.versioned_dir(name, version);
        let dest = self.active_dir(name);

        debug!("Publishing {}@{} to active view", name, version);
        if self.runtime.exists(&dest) {
            self.runtime
                .remove_dir_all(&dest)
                .map_err(|e| PluginError::io(dest.clone(), std::io::Error::other(e.to_string())))?;
        }
        self.runtime
            .copy_dir(&source, &dest)
            .map_err(|e| PluginError::io(dest.clone(), std::io::Error::other(e.to_string())))
    }

    /// Remove `name` from the active view.
    pub fn remove_active(&self, name: &str) -> Result<(), PluginError> {
        let dir = self.active_dir(name);
        if self.runtime.exists(&dir) {
            self.runtime
                .remove_dir_all(&dir)
                .map_err(|e| PluginError::io(dir.clone(), std::io::Error::other(e.to_string())))?;
        }
        Ok(())
    }

    /// Remove the canonical copy of `(name, version)`.
    pub fn remove_version(&self, name: &str, version: &str) -> Result<(), PluginError> {
        let dir = self.versioned_dir(name, version);
        if self.runtime.exists(&dir) {
            debug!("Deleting unreferenced version {}@{}", name, version);
            self.runtime
                .remove_dir_all(&dir)
                .map_err(|e| PluginError::io(dir.clone(), std::io::Error::other(e.to_string())))?;
        }
        Ok(())
    }
}

/// Split `@scope/name` into `(scope, bare_name)`, or `None` for plain names.
fn split_scoped(name: &str) -> Option<(&str, &str)> {
    name.strip_prefix('@')
        .and_then(|rest| rest.split_once('/'))
        .map(|(scope_body, bare)| (&name[..scope_body.len() + 1], bare))
}
