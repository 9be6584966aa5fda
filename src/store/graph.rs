//! The in-memory dependency graph.
//!
//! Nodes are `(name, version)` pairs present in `.versions/`; each node
//! carries the specific dependency versions it was linked to. The installed
//! plugin list (one listed version per name) contributes the implicit +1
//! reference that keeps top-level plugins alive.

use std::collections::{BTreeMap, BTreeSet};

/// `(package name, version)` node key.
pub type NodeKey = (String, String);

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Outgoing edges: node -> (dep name -> bound dep version).
    edges: BTreeMap<NodeKey, BTreeMap<String, String>>,
    /// Installed plugin list: name -> listed version.
    plugins: BTreeMap<String, String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `plugin@version` binds `dep_name` to `dep_version`.
    ///
    /// Returns the previously bound version when the edge replaces one.
    pub fn add_edge(
        &mut self,
        plugin: &str,
        version: &str,
        dep_name: &str,
        dep_version: &str,
    ) -> Option<String> {
        self.edges
            .entry((plugin.to_string(), version.to_string()))
            .or_default()
            .insert(dep_name.to_string(), dep_version.to_string())
            .filter(|old| old != dep_version)
    }

    /// Drop all outgoing edges of a node, returning the targets they bound.
    pub fn remove_node(&mut self, plugin: &str, version: &str) -> Vec<NodeKey> {
        self.edges
            .remove(&(plugin.to_string(), version.to_string()))
            .map(|deps| deps.into_iter().collect())
            .unwrap_or_default()
    }

    /// The dependency bindings of a node.
    pub fn bindings_of(&self, plugin: &str, version: &str) -> Option<&BTreeMap<String, String>> {
        self.edges.get(&(plugin.to_string(), version.to_string()))
    }

    /// The version bound for `dep_name` by `plugin@version`, if any.
    pub fn resolve_for(&self, plugin: &str, version: &str, dep_name: &str) -> Option<&str> {
        self.bindings_of(plugin, version)
            .and_then(|deps| deps.get(dep_name))
            .map(String::as_str)
    }

    /// Set or replace the listed version of an installed plugin.
    pub fn set_listed(&mut self, name: &str, version: &str) -> Option<String> {
        self.plugins
            .insert(name.to_string(), version.to_string())
            .filter(|old| old != version)
    }

    /// Remove a plugin from the installed list, returning its listed version.
    pub fn remove_listed(&mut self, name: &str) -> Option<String> {
        self.plugins.remove(name)
    }

    /// The listed version of an installed plugin.
    pub fn listed_version(&self, name: &str) -> Option<&str> {
        self.plugins.get(name).map(String::as_str)
    }

    /// Installed plugin names with their listed versions.
    pub fn listed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.plugins.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Reference count of `(name, version)`: incoming edges, plus one when it
    /// is the listed version of an installed plugin.
    pub fn refcount(&self, name: &str, version: &str) -> usize {
        let incoming = self
            .edges
            .values()
            .filter(|deps| deps.get(name).is_some_and(|v| v == version))
            .count();
        let listed = self.plugins.get(name).is_some_and(|v| v == version) as usize;
        incoming + listed
    }

    /// Nodes that depend on any version of `name`, transitively, including
    /// the dependents of those dependents.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<NodeKey> {
        let mut affected: BTreeSet<NodeKey> = BTreeSet::new();
        let mut frontier: Vec<String> = vec![name.to_string()];

        while let Some(target) = frontier.pop() {
            for (node, deps) in &self.edges {
                if deps.contains_key(&target) && affected.insert(node.clone()) {
                    frontier.push(node.0.clone());
                }
            }
        }
        affected
    }

    /// All node keys that currently have outgoing edges.
    #[cfg(test)]
    pub fn node_count(&self) -> usize {
        self.edges.len()
    }
}
