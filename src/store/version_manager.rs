//! Reference counting and lifecycle over the versioned store.
//!
//! The version manager owns the dependency graph, the installed-plugin list,
//! and the disk regions. Install and uninstall mutate it under the store
//! lock; the loader queries it without locking.

use log::{debug, info};
use semver::Version;

use super::graph::{DependencyGraph, NodeKey};
use super::VersionedStore;
use crate::error::PluginError;
use crate::version_range::{max_satisfying, parse_version, VersionRange};

pub struct VersionManager {
    store: VersionedStore,
    graph: DependencyGraph,
    /// Versions deleted since the last [`Self::take_removed`] call; the
    /// loader is told to drop its state for these.
    removed_log: Vec<NodeKey>,
}

impl VersionManager {
    pub fn new(store: VersionedStore) -> Self {
        VersionManager {
            store,
            graph: DependencyGraph::new(),
            removed_log: Vec::new(),
        }
    }

    /// Drain the list of `(name, version)` copies deleted by recent
    /// operations.
    pub fn take_removed(&mut self) -> Vec<NodeKey> {
        std::mem::take(&mut self.removed_log)
    }

    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    /// The version currently published in the active view for `name`.
    pub fn active_version_of(&self, name: &str) -> Option<&str> {
        self.graph.listed_version(name)
    }

    /// Installed plugin names with their active versions.
    pub fn listed(&self) -> Vec<(String, String)> {
        self.graph
            .listed()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    /// All versions of `name` present in `.versions/`, ascending.
    pub fn versions_of(&self, name: &str) -> Vec<Version> {
        self.store.installed_versions(name)
    }

    /// The version bound to `dep_name` for `plugin@version`.
    pub fn resolve_for(&self, plugin: &str, version: &str, dep_name: &str) -> Option<&str> {
        self.graph.resolve_for(plugin, version, dep_name)
    }

    /// Dependency bindings of a node, for loader bookkeeping.
    pub fn bindings_of(
        &self,
        plugin: &str,
        version: &str,
    ) -> Option<&std::collections::BTreeMap<String, String>> {
        self.graph.bindings_of(plugin, version)
    }

    /// Nodes transitively depending on any version of `name`.
    pub fn transitive_dependents(&self, name: &str) -> std::collections::BTreeSet<NodeKey> {
        self.graph.transitive_dependents(name)
    }

    /// Highest cached version of `name` satisfying `range`, if any.
    pub fn find_cached(&self, name: &str, range: &VersionRange) -> Option<Version> {
        let versions = self.store.installed_versions(name);
        let strings: Vec<String> = versions.iter().map(|v| v.to_string()).collect();
        max_satisfying(strings.iter().map(String::as_str), range)
    }

    /// Register `(name, version)` as an installed plugin and refresh the
    /// active view.
    ///
    /// The listed version only moves upward: a dependency landing at a lower
    /// version than an already published one never downgrades the active
    /// view. Returns true when the active view changed (the caller uses this
    /// to drive loader invalidation). `replaced` forces a refresh of the
    /// active copy when the same version was re-downloaded.
    pub fn register_plugin(
        &mut self,
        name: &str,
        version: &str,
        replaced: bool,
    ) -> Result<bool, PluginError> {
        let new = parse_version(version)?;

        match self.graph.listed_version(name).map(str::to_string) {
            None => {
                self.graph.set_listed(name, version);
                self.store.write_active(name, version)?;
                info!("Published {}@{}", name, version);
                Ok(true)
            }
            Some(old) if old == version => {
                if replaced {
                    self.store.write_active(name, version)?;
                }
                Ok(replaced)
            }
            Some(old) => {
                if parse_version(&old)? < new {
                    self.graph.set_listed(name, version);
                    self.store.write_active(name, version)?;
                    info!("Published {}@{} (was {})", name, version, old);
                    self.collect(name, &old)?;
                    Ok(true)
                } else {
                    debug!(
                        "Keeping {}@{} active; {} installed alongside",
                        name, old, version
                    );
                    Ok(false)
                }
            }
        }
    }

    /// Record an already-published plugin without touching the disk. Used
    /// when rebuilding the in-memory view over an existing store.
    pub fn adopt_plugin(&mut self, name: &str, version: &str) {
        self.graph.set_listed(name, version);
    }

    /// Bind `dep_name@dep_version` as a dependency of `plugin@version`.
    ///
    /// Replacing an existing binding releases the previously bound version.
    pub fn link(
        &mut self,
        plugin: &str,
        version: &str,
        dep_name: &str,
        dep_version: &str,
    ) -> Result<(), PluginError> {
        debug!(
            "Linking {}@{} -> {}@{}",
            plugin, version, dep_name, dep_version
        );
        if let Some(old) = self.graph.add_edge(plugin, version, dep_name, dep_version) {
            self.collect(dep_name, &old)?;
        }
        Ok(())
    }

    /// Release every dependency binding originating at `plugin@version` and
    /// garbage-collect versions whose reference count reaches zero.
    pub fn unlink(&mut self, plugin: &str, version: &str) -> Result<(), PluginError> {
        let targets = self.graph.remove_node(plugin, version);
        for (dep_name, dep_version) in targets {
            self.collect(&dep_name, &dep_version)?;
        }
        Ok(())
    }

    /// Remove the top-level binding of `name`.
    ///
    /// Returns the version that was listed, or `None` when `name` was not an
    /// installed plugin. Versioned copies still referenced by dependents
    /// persist in `.versions/`.
    pub fn uninstall(&mut self, name: &str) -> Result<Option<String>, PluginError> {
        let Some(version) = self.graph.remove_listed(name) else {
            return Ok(None);
        };

        info!("Uninstalling {}@{}", name, version);
        self.store.remove_active(name)?;
        self.collect(name, &version)?;
        Ok(Some(version))
    }

    /// Uninstall every installed plugin.
    pub fn uninstall_all(&mut self) -> Result<Vec<String>, PluginError> {
        let names: Vec<String> = self.graph.listed().map(|(n, _)| n.to_string()).collect();
        for name in &names {
            self.uninstall(name)?;
        }
        Ok(names)
    }

    /// Reference count of a `(name, version)` copy; test and debug aid.
    pub fn refcount(&self, name: &str, version: &str) -> usize {
        self.graph.refcount(name, version)
    }

    /// Delete `(name, version)` if nothing references it, cascading through
    /// the versions it had bound.
    fn collect(&mut self, name: &str, version: &str) -> Result<(), PluginError> {
        if self.graph.refcount(name, version) > 0 {
            return Ok(());
        }

        let targets = self.graph.remove_node(name, version);
        self.store.remove_version(name, version)?;
        self.removed_log
            .push((name.to_string(), version.to_string()));

        for (dep_name, dep_version) in targets {
            self.collect(&dep_name, &dep_version)?;
        }
        Ok(())
    }
}
