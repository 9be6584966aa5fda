//! The package acquisition pipeline.
//!
//! One `install` drives: name validation, the already-installed short
//! circuit, resolve through the right fetcher, download-or-cache into the
//! versioned store, depth-first recursion into declared dependencies, graph
//! linking, and loader registration/invalidation. The caller holds the store
//! lock for the whole of it.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::PluginError;
use crate::fetcher::{Fetcher, GitHubFetcher, PackageSource, RegistryFetcher, ResolvedPackage};
use crate::manifest::{PackageManifest, PluginInfo, validate_plugin_name};
use crate::options::{IgnoredDependency, InstallMode, ProvidedModule};
use crate::store::VersionManager;
use crate::version_range::VersionRange;
use crate::vm::PluginVm;

/// Dependency-handling policy copied from the manager options.
pub struct DependencyPolicy<'a> {
    pub ignored: &'a [IgnoredDependency],
    pub static_dependencies: &'a BTreeMap<String, ProvidedModule>,
    pub host_modules: &'a BTreeMap<String, ProvidedModule>,
}

impl DependencyPolicy<'_> {
    fn is_ignored(&self, name: &str) -> bool {
        self.ignored.iter().any(|entry| entry.matches(name))
    }

    fn is_static(&self, name: &str) -> bool {
        self.static_dependencies.contains_key(name)
    }

    /// The probe for names the surrounding program already provides.
    fn is_host_provided(&self, name: &str) -> bool {
        self.host_modules.contains_key(name)
    }
}

/// One installation session: borrows the manager's mutable state for the
/// duration of a locked install.
pub struct Installer<'a> {
    pub versions: &'a mut VersionManager,
    pub vm: &'a PluginVm,
    /// Shared with the manager's lock-free read surface; borrowed briefly,
    /// never across a suspension point.
    pub infos: &'a RefCell<BTreeMap<String, PluginInfo>>,
    pub registry: Arc<RegistryFetcher>,
    pub github: Arc<GitHubFetcher>,
    pub install_mode: InstallMode,
    pub policy: DependencyPolicy<'a>,
    /// Packages currently being installed, to break dependency cycles.
    pub in_flight: HashSet<(String, String)>,
}

type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

impl<'a> Installer<'a> {
    /// Install from the registry by name and selector.
    pub async fn install_from_registry(
        &mut self,
        name: &str,
        selector: &str,
        force: bool,
    ) -> Result<(PluginInfo, PackageManifest), PluginError> {
        validate_plugin_name(name)?;

        if !force && let Some(found) = self.already_satisfied(name, selector) {
            debug!("{}@{} already installed, skipping", name, selector);
            return Ok(found);
        }

        // With the cache policy on, a satisfying version already in the
        // versioned store short-circuits the network entirely.
        if self.install_mode == InstallMode::UseCache
            && !force
            && let Ok(range) = VersionRange::parse(selector)
            && let Some(version) = self.versions.find_cached(name, &range)
        {
            let dir = self
                .versions
                .store()
                .versioned_dir(name, &version.to_string());
            let manifest = PackageManifest::load(&dir)?;
            info!("Using cached {}@{} for selector '{}'", name, version, selector);
            let resolved = ResolvedPackage {
                manifest,
                source: PackageSource::Directory { path: dir },
            };
            let fetcher = Arc::clone(&self.registry) as Arc<dyn Fetcher>;
            return self.install_package(fetcher, resolved, false).await;
        }

        let resolved = self.registry.resolve(name, selector).await?;
        let fetcher = Arc::clone(&self.registry) as Arc<dyn Fetcher>;
        self.install_package(fetcher, resolved, force).await
    }

    /// Install from an arbitrary fetcher (git host, local path, inline).
    pub async fn install_from_source(
        &mut self,
        fetcher: Arc<dyn Fetcher>,
        name_hint: &str,
        selector: &str,
        force: bool,
    ) -> Result<(PluginInfo, PackageManifest), PluginError> {
        let resolved = fetcher.resolve(name_hint, selector).await?;

        if !force
            && let Some(found) = self.already_satisfied(&resolved.manifest.name, &resolved.manifest.version)
        {
            debug!(
                "{}@{} already installed, skipping",
                resolved.manifest.name, resolved.manifest.version
            );
            return Ok(found);
        }

        self.install_package(fetcher, resolved, force).await
    }

    /// The existing install satisfying `selector`, if any.
    fn already_satisfied(
        &self,
        name: &str,
        selector: &str,
    ) -> Option<(PluginInfo, PackageManifest)> {
        let listed = self.versions.active_version_of(name)?;
        let range = VersionRange::parse(selector).ok()?;
        let version = crate::version_range::parse_version(listed).ok()?;
        if !range.satisfies(&version) {
            return None;
        }

        let info = self.infos.borrow().get(name)?.clone();
        let manifest = PackageManifest::load(&info.location).ok()?;
        Some((info, manifest))
    }

    /// Install a resolved package and, recursively, its dependencies.
    fn install_package(
        &mut self,
        fetcher: Arc<dyn Fetcher>,
        resolved: ResolvedPackage,
        force: bool,
    ) -> LocalBoxFuture<'_, Result<(PluginInfo, PackageManifest), PluginError>> {
        Box::pin(async move {
            let manifest = resolved.manifest.clone();
            validate_plugin_name(&manifest.name)?;
            let name = manifest.name.clone();
            let version = manifest.version.clone();
            let key = (name.clone(), version.clone());

            // A dependency cycle: the copy is already being materialised
            // further up the stack, so only the binding is reported here.
            if self.in_flight.contains(&key) {
                debug!("Cycle on {}@{}, using in-flight copy", name, version);
                let location = self.versions.store().versioned_dir(&name, &version);
                return Ok((PluginInfo::from_manifest(&manifest, location), manifest));
            }
            self.in_flight.insert(key.clone());
            let outcome = self.install_package_inner(fetcher, resolved, force).await;
            self.in_flight.remove(&key);
            outcome
        })
    }

    async fn install_package_inner(
        &mut self,
        fetcher: Arc<dyn Fetcher>,
        resolved: ResolvedPackage,
        force: bool,
    ) -> Result<(PluginInfo, PackageManifest), PluginError> {
        let manifest = resolved.manifest.clone();
        let name = manifest.name.clone();
        let version = manifest.version.clone();

        // Materialise the files, or reuse the canonical copy.
        let reuse = !force
            && self.install_mode == InstallMode::UseCache
            && self.versions.store().has_version(&name, &version);
        let downloaded = if reuse {
            debug!("Reusing versioned copy of {}@{}", name, version);
            false
        } else {
            let dest = self.versions.store().fresh_version_dir(&name, &version)?;
            info!("Downloading {}@{} to {:?}", name, version, dest);
            fetcher.download(&resolved, &dest).await?;
            true
        };

        // Depth-first dependency installation, optional ones tolerantly.
        let mut bindings: BTreeMap<String, String> = BTreeMap::new();
        let mut details: BTreeMap<String, PackageManifest> = BTreeMap::new();

        let declared = manifest
            .dependencies
            .iter()
            .map(|(n, s)| (n, s, false))
            .chain(
                manifest
                    .optional_dependencies
                    .iter()
                    .map(|(n, s)| (n, s, true)),
            );
        for (dep_name, dep_selector, optional) in declared {
            if self.policy.is_ignored(dep_name) {
                debug!("Skipping ignored dependency {}", dep_name);
                continue;
            }
            if self.policy.is_static(dep_name) {
                debug!("Dependency {} is static, not installing", dep_name);
                continue;
            }
            if self.policy.is_host_provided(dep_name) {
                debug!("Dependency {} is provided by the host", dep_name);
                continue;
            }

            match self.install_dependency(dep_name, dep_selector).await {
                Ok((dep_info, dep_manifest)) => {
                    bindings.insert(dep_name.clone(), dep_info.version.clone());
                    details.insert(dep_name.clone(), dep_manifest);
                }
                Err(e) if optional && e.is_optional_skippable() => {
                    warn!(
                        "Optional dependency {}@{} of {} skipped: {}",
                        dep_name, dep_selector, name, e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        // Graph updates: publish, then (re)link this node's edges.
        let changed = self.versions.register_plugin(&name, &version, downloaded)?;
        if downloaded {
            self.versions.unlink(&name, &version)?;
        }
        for (dep_name, dep_version) in &bindings {
            self.versions.link(&name, &version, dep_name, dep_version)?;
        }

        // Loader bookkeeping: the versioned root always, the active root
        // whenever this name is published.
        let versioned_dir = self.versions.store().versioned_dir(&name, &version);
        self.vm
            .register_package(&name, &version, &versioned_dir, bindings.clone(), false);

        let listed = self.versions.active_version_of(&name).map(str::to_string);
        if let Some(active_version) = &listed {
            let active_bindings = self
                .versions
                .bindings_of(&name, active_version)
                .cloned()
                .unwrap_or_default();
            let active_dir = self.versions.store().active_dir(&name);
            self.vm
                .register_package(&name, active_version, &active_dir, active_bindings, true);
        }

        // Anything garbage-collected above is dead to the loader too.
        for (gone_name, gone_version) in self.versions.take_removed() {
            self.vm.forget_version(&gone_name, &gone_version);
        }

        // Cached exports of this plugin and its transitive dependents do not
        // survive a version change.
        if downloaded || changed {
            let mut affected: BTreeSet<String> = BTreeSet::new();
            affected.insert(name.clone());
            for (dependent, _) in self.versions.transitive_dependents(&name) {
                affected.insert(dependent);
            }
            for plugin in affected {
                self.vm.invalidate_plugin(&plugin);
            }
        }

        // The reported location prefers the active view when this exact
        // version is published there.
        let location = if listed.as_deref() == Some(version.as_str()) {
            self.versions.store().active_dir(&name)
        } else {
            versioned_dir
        };
        let mut info = PluginInfo::from_manifest(&manifest, location);
        info.dependencies = bindings;
        info.dependency_details = details;

        if listed.as_deref() == Some(version.as_str()) {
            self.infos.borrow_mut().insert(name.clone(), info.clone());
        }

        Ok((info, manifest))
    }

    /// Install one declared dependency: git-shaped selectors go to the git
    /// host, everything else to the registry.
    async fn install_dependency(
        &mut self,
        name: &str,
        selector: &str,
    ) -> Result<(PluginInfo, PackageManifest), PluginError> {
        if selector.contains('/')
            && crate::fetcher::GitReference::parse(selector).is_ok()
        {
            let fetcher = Arc::clone(&self.github) as Arc<dyn Fetcher>;
            return self.install_from_source(fetcher, name, selector, false).await;
        }
        self.install_from_registry(name, selector, false).await
    }
}
