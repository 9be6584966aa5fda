//! The public plugin manager.
//!
//! Orders every mutating operation as lock -> acquisition -> version-graph
//! mutation -> loader invalidation, and exposes the synchronous loader
//! surface (`require`, `run_script`, `call_export`) plus read-only queries
//! that take no lock.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use crate::acquire::{DependencyPolicy, Installer};
use crate::error::PluginError;
use crate::fetcher::{
    BitbucketFetcher, Fetcher, GitHubFetcher, InlineFetcher, LocalFetcher, RegistryFetcher,
    SourceKind, detect_source,
};
use crate::http::HttpClient;
use crate::lock::StoreLock;
use crate::manifest::{PackageManifest, PluginInfo};
use crate::options::{
    DEFAULT_PLUGINS_DIR, PluginManagerOptions, SandboxTemplate, VERSIONS_DIR,
};
use crate::runtime::{RealRuntime, Runtime};
use crate::store::{VersionManager, VersionedStore};
use crate::version_range::{VersionRange, parse_version};
use crate::vm::{PluginVm, VmOptions};

/// How `already_installed` matches an installed version against a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SatisfyMode {
    /// Normal semver satisfaction.
    #[default]
    Satisfies,
    /// Also accept any installed version at or above the selector's floor.
    SatisfiesOrGreater,
}

pub struct PluginManager {
    runtime: Arc<dyn Runtime>,
    options: PluginManagerOptions,
    cwd: PathBuf,
    plugins_path: PathBuf,
    lock: StoreLock,
    versions: RefCell<VersionManager>,
    infos: RefCell<BTreeMap<String, PluginInfo>>,
    vm: PluginVm,
    registry: Arc<RegistryFetcher>,
    github: Arc<GitHubFetcher>,
    bitbucket: Arc<BitbucketFetcher>,
    local: Arc<LocalFetcher>,
}

impl PluginManager {
    /// A manager with default options, rooted at `<cwd>/plugin_packages`.
    pub fn new() -> Result<Self, PluginError> {
        Self::with_options(PluginManagerOptions::default())
    }

    pub fn with_options(options: PluginManagerOptions) -> Result<Self, PluginError> {
        let runtime: Arc<dyn Runtime> = Arc::new(RealRuntime);
        Self::build(options, runtime)
    }

    fn build(
        options: PluginManagerOptions,
        runtime: Arc<dyn Runtime>,
    ) -> Result<Self, PluginError> {
        let cwd = match &options.cwd {
            Some(cwd) => cwd.clone(),
            None => runtime.current_dir().map_err(|e| {
                PluginError::io(PathBuf::from("."), std::io::Error::other(e.to_string()))
            })?,
        };
        let plugins_path = options
            .plugins_path
            .clone()
            .unwrap_or_else(|| cwd.join(DEFAULT_PLUGINS_DIR));
        let versions_path = options
            .versions_path
            .clone()
            .unwrap_or_else(|| plugins_path.join(VERSIONS_DIR));

        let store = VersionedStore::new(Arc::clone(&runtime), plugins_path.clone(), versions_path);
        store.ensure_layout()?;

        let lock = StoreLock::new(
            Arc::clone(&runtime),
            &plugins_path,
            options.lock_wait,
            options.lock_stale,
        );

        let http = HttpClient::new(reqwest::Client::new());
        let registry = Arc::new(RegistryFetcher::new(
            http.clone(),
            Arc::clone(&runtime),
            &options.npm_registry_url,
            options.npm_registry_auth.clone(),
        ));
        let github = Arc::new(GitHubFetcher::new(
            http.clone(),
            Arc::clone(&runtime),
            options.github_authentication.clone(),
        ));
        let bitbucket = Arc::new(BitbucketFetcher::new(
            http.clone(),
            Arc::clone(&runtime),
            options.bitbucket_authentication.clone(),
        ));
        let local = Arc::new(LocalFetcher::new(Arc::clone(&runtime), cwd.clone()));

        let vm = PluginVm::new(
            Arc::clone(&runtime),
            VmOptions {
                require_core_modules: options.require_core_modules,
                host_modules: options.host_modules.clone(),
                static_dependencies: options.static_dependencies.clone(),
            },
            options.sandbox.clone(),
            plugins_path.clone(),
            cwd.clone(),
        )?;

        let manager = PluginManager {
            runtime,
            options,
            cwd,
            plugins_path,
            lock,
            versions: RefCell::new(VersionManager::new(store)),
            infos: RefCell::new(BTreeMap::new()),
            vm,
            registry,
            github,
            bitbucket,
            local,
        };
        manager.restore_from_disk();
        Ok(manager)
    }

    /// Rebuild the in-memory view from an existing store: versioned copies,
    /// dependency bindings (best effort, highest satisfying version), and
    /// the installed-plugin list from the active view.
    fn restore_from_disk(&self) {
        let mut versions = self.versions.borrow_mut();
        let mut infos = self.infos.borrow_mut();

        // Versioned copies first, so active plugins can bind against them.
        let mut copies: Vec<(String, String, PathBuf)> = Vec::new();
        for (dir_name, path) in self.scan_dirs(versions.store().versions_path()) {
            if let Some(scope) = dir_name.strip_prefix('@') {
                for (inner, inner_path) in self.scan_dirs(&path) {
                    if let Some((bare, version)) = inner.rsplit_once('@') {
                        copies.push((format!("@{}/{}", scope, bare), version.to_string(), inner_path));
                    }
                }
            } else if let Some((bare, version)) = dir_name.rsplit_once('@') {
                copies.push((bare.to_string(), version.to_string(), path));
            }
        }

        for (name, version, path) in &copies {
            let Ok(manifest) = PackageManifest::load(path) else {
                continue;
            };
            let bindings = self.recover_bindings(&versions, &manifest);
            for (dep, dep_version) in &bindings {
                let _ = versions.link(name, version, dep, dep_version);
            }
            self.vm
                .register_package(name, version, path, bindings, false);
        }

        // The active view defines the installed-plugin list.
        for (dir_name, path) in self.scan_dirs(versions.store().plugins_path()) {
            if dir_name == VERSIONS_DIR {
                continue;
            }
            let entries = if dir_name.starts_with('@') {
                self.scan_dirs(&path)
            } else {
                vec![(dir_name, path)]
            };
            for (_, plugin_dir) in entries {
                let Ok(manifest) = PackageManifest::load(&plugin_dir) else {
                    continue;
                };
                versions.adopt_plugin(&manifest.name, &manifest.version);
                let bindings = versions
                    .bindings_of(&manifest.name, &manifest.version)
                    .cloned()
                    .unwrap_or_else(|| self.recover_bindings(&versions, &manifest));
                self.vm.register_package(
                    &manifest.name,
                    &manifest.version,
                    &plugin_dir,
                    bindings.clone(),
                    true,
                );

                let mut details = BTreeMap::new();
                for (dep, dep_version) in &bindings {
                    let dep_dir = versions.store().versioned_dir(dep, dep_version);
                    if let Ok(dep_manifest) = PackageManifest::load(&dep_dir) {
                        details.insert(dep.clone(), dep_manifest);
                    }
                }
                let mut info = PluginInfo::from_manifest(&manifest, plugin_dir);
                info.dependencies = bindings;
                info.dependency_details = details;
                infos.insert(manifest.name.clone(), info);
            }
        }
    }

    /// Bind each declared dependency to the highest cached version that
    /// satisfies its selector, skipping names the options exclude.
    fn recover_bindings(
        &self,
        versions: &VersionManager,
        manifest: &PackageManifest,
    ) -> BTreeMap<String, String> {
        let mut bindings = BTreeMap::new();
        let declared = manifest
            .dependencies
            .iter()
            .chain(manifest.optional_dependencies.iter());
        for (dep, selector) in declared {
            if self.options.ignored_dependencies.iter().any(|i| i.matches(dep))
                || self.options.static_dependencies.contains_key(dep)
                || self.options.host_modules.contains_key(dep)
            {
                continue;
            }
            if let Ok(range) = VersionRange::parse(selector)
                && let Some(found) = versions.find_cached(dep, &range)
            {
                bindings.insert(dep.clone(), found.to_string());
            }
        }
        bindings
    }

    fn scan_dirs(&self, path: &std::path::Path) -> Vec<(String, PathBuf)> {
        let Ok(entries) = self.runtime.read_dir(path) else {
            return Vec::new();
        };
        entries
            .into_iter()
            .filter(|p| self.runtime.is_dir(p))
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?.to_string();
                Some((name, p))
            })
            .collect()
    }

    /// The plugin store root.
    pub fn plugins_path(&self) -> &std::path::Path {
        &self.plugins_path
    }

    /// Install by shape: filesystem paths, `owner/repo#ref`, or a registry
    /// name with an optional selector.
    pub async fn install(
        &self,
        spec: &str,
        selector: Option<&str>,
    ) -> Result<PluginInfo, PluginError> {
        match detect_source(spec) {
            SourceKind::Local => self.install_from_path(spec, false).await,
            SourceKind::GitHub => self.install_from_github(spec, false).await,
            SourceKind::Registry => {
                self.install_from_npm(spec, selector.unwrap_or("latest"), false)
                    .await
            }
        }
    }

    /// Install `name@selector` from the npm registry.
    #[tracing::instrument(skip(self))]
    pub async fn install_from_npm(
        &self,
        name: &str,
        selector: &str,
        force: bool,
    ) -> Result<PluginInfo, PluginError> {
        let _guard = self.lock.acquire().await?;
        let mut versions = self.versions.borrow_mut();
        let mut installer = self.installer(&mut versions);
        let (plugin, _) = installer.install_from_registry(name, selector, force).await?;
        info!("Installed {}@{}", plugin.name, plugin.version);
        Ok(plugin)
    }

    /// Install from GitHub: `owner/repo[#ref]`.
    pub async fn install_from_github(
        &self,
        repo_spec: &str,
        force: bool,
    ) -> Result<PluginInfo, PluginError> {
        let fetcher = Arc::clone(&self.github) as Arc<dyn Fetcher>;
        self.install_from(fetcher, repo_spec, repo_spec, force).await
    }

    /// Install from Bitbucket: `owner/repo[#ref]`.
    pub async fn install_from_bitbucket(
        &self,
        repo_spec: &str,
        force: bool,
    ) -> Result<PluginInfo, PluginError> {
        let fetcher = Arc::clone(&self.bitbucket) as Arc<dyn Fetcher>;
        self.install_from(fetcher, repo_spec, repo_spec, force).await
    }

    /// Install from a local directory containing a `package.json`.
    pub async fn install_from_path(
        &self,
        path: &str,
        force: bool,
    ) -> Result<PluginInfo, PluginError> {
        let fetcher = Arc::clone(&self.local) as Arc<dyn Fetcher>;
        self.install_from(fetcher, path, path, force).await
    }

    /// Install source code directly under `name`.
    ///
    /// With no pinned version every call replaces the previous code, exactly
    /// as a forced install would.
    pub async fn install_from_code(
        &self,
        name: &str,
        code: &str,
        version: Option<&str>,
    ) -> Result<PluginInfo, PluginError> {
        let fetcher = InlineFetcher::new(Arc::clone(&self.runtime), version);
        let force = fetcher.is_unpinned();
        self.install_from(Arc::new(fetcher), name, code, force).await
    }

    async fn install_from(
        &self,
        fetcher: Arc<dyn Fetcher>,
        name_hint: &str,
        selector: &str,
        force: bool,
    ) -> Result<PluginInfo, PluginError> {
        let _guard = self.lock.acquire().await?;
        let mut versions = self.versions.borrow_mut();
        let mut installer = self.installer(&mut versions);
        let (plugin, _) = installer
            .install_from_source(fetcher, name_hint, selector, force)
            .await?;
        info!("Installed {}@{}", plugin.name, plugin.version);
        Ok(plugin)
    }

    fn installer<'a>(&'a self, versions: &'a mut VersionManager) -> Installer<'a> {
        Installer {
            versions,
            vm: &self.vm,
            infos: &self.infos,
            registry: Arc::clone(&self.registry),
            github: Arc::clone(&self.github),
            install_mode: self.options.npm_install_mode,
            policy: DependencyPolicy {
                ignored: &self.options.ignored_dependencies,
                static_dependencies: &self.options.static_dependencies,
                host_modules: &self.options.host_modules,
            },
            in_flight: Default::default(),
        }
    }

    /// Remove the top-level binding of `name`. Versioned copies still
    /// referenced by dependents persist. Returns false when `name` was not
    /// installed.
    pub async fn uninstall(&self, name: &str) -> Result<bool, PluginError> {
        let _guard = self.lock.acquire().await?;
        let mut versions = self.versions.borrow_mut();

        let Some(version) = versions.uninstall(name)? else {
            return Ok(false);
        };
        self.infos.borrow_mut().remove(name);
        self.vm.remove_active(name);
        for (gone_name, gone_version) in versions.take_removed() {
            self.vm.forget_version(&gone_name, &gone_version);
        }
        info!("Uninstalled {}@{}", name, version);
        Ok(true)
    }

    /// Uninstall every installed plugin.
    pub async fn uninstall_all(&self) -> Result<(), PluginError> {
        let _guard = self.lock.acquire().await?;
        let mut versions = self.versions.borrow_mut();

        for name in versions.uninstall_all()? {
            self.infos.borrow_mut().remove(&name);
            self.vm.remove_active(&name);
        }
        for (gone_name, gone_version) in versions.take_removed() {
            self.vm.forget_version(&gone_name, &gone_version);
        }
        Ok(())
    }

    /// Installed plugins with their active versions. No lock taken.
    pub fn list(&self) -> Vec<PluginInfo> {
        self.infos.borrow().values().cloned().collect()
    }

    /// Metadata of one installed plugin.
    pub fn get_info(&self, name: &str) -> Option<PluginInfo> {
        self.infos.borrow().get(name).cloned()
    }

    /// The installed plugin satisfying `selector`, if any.
    ///
    /// With no selector, any installed version matches. Under
    /// [`SatisfyMode::SatisfiesOrGreater`] an installed version at or above
    /// the selector's minimum also matches.
    pub fn already_installed(
        &self,
        name: &str,
        selector: Option<&str>,
        mode: SatisfyMode,
    ) -> Option<PluginInfo> {
        let infos = self.infos.borrow();
        let plugin = infos.get(name)?;
        let Some(selector) = selector else {
            return Some(plugin.clone());
        };

        let range = VersionRange::parse(selector).ok()?;
        let version = parse_version(&plugin.version).ok()?;
        let matched = match mode {
            SatisfyMode::Satisfies => range.satisfies(&version),
            SatisfyMode::SatisfiesOrGreater => {
                range.satisfies(&version) || version >= range.min_version()
            }
        };
        matched.then(|| plugin.clone())
    }

    /// Resolve a package's manifest without installing it, routing by shape.
    pub async fn query_package(
        &self,
        spec: &str,
        selector: Option<&str>,
    ) -> Result<PackageManifest, PluginError> {
        match detect_source(spec) {
            SourceKind::GitHub => self.query_package_from_github(spec).await,
            SourceKind::Local => {
                let resolved = self.local.resolve(spec, spec).await?;
                Ok(resolved.manifest)
            }
            SourceKind::Registry => {
                self.query_package_from_npm(spec, selector.unwrap_or("latest"))
                    .await
            }
        }
    }

    /// Resolve a registry package's manifest without installing.
    pub async fn query_package_from_npm(
        &self,
        name: &str,
        selector: &str,
    ) -> Result<PackageManifest, PluginError> {
        crate::manifest::validate_plugin_name(name)?;
        let resolved = self.registry.resolve(name, selector).await?;
        Ok(resolved.manifest)
    }

    /// Resolve a GitHub package's manifest without installing.
    pub async fn query_package_from_github(
        &self,
        repo_spec: &str,
    ) -> Result<PackageManifest, PluginError> {
        let resolved = self.github.resolve(repo_spec, repo_spec).await?;
        Ok(resolved.manifest)
    }

    /// Synchronous `require` against the active view; returns a JSON
    /// snapshot of the module's exports. No lock taken.
    pub fn require(&self, name: &str) -> Result<serde_json::Value, PluginError> {
        self.vm.require(name)
    }

    /// Call a function exported by a plugin with JSON arguments.
    pub fn call_export(
        &self,
        name: &str,
        export: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, PluginError> {
        self.vm.call_export(name, export, args)
    }

    /// Run `code` as a nameless module in the shared sandbox; its `require`
    /// resolves against the active view.
    pub fn run_script(&self, code: &str) -> Result<serde_json::Value, PluginError> {
        self.vm.run_script(code)
    }

    /// Install a sandbox template for one plugin. Cached exports of that
    /// plugin are dropped so the next require sees the new sandbox.
    pub fn set_sandbox_template(&self, name: &str, template: Option<SandboxTemplate>) {
        self.vm.set_template(name, template);
    }

    pub fn get_sandbox_template(&self, name: &str) -> Option<SandboxTemplate> {
        self.vm.get_template(name)
    }

    /// The manager's working directory.
    pub fn cwd(&self) -> &std::path::Path {
        &self.cwd
    }
}
