//! Constructor options for the plugin manager.
//!
//! Everything is optional with defaults; paths left unset are derived from
//! the working directory at construction time.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::http::Credentials;

/// Default directory name for the plugin store, under `cwd`.
pub const DEFAULT_PLUGINS_DIR: &str = "plugin_packages";

/// Directory name of the versioned store, under `plugins_path`.
pub const VERSIONS_DIR: &str = ".versions";

/// Public npm registry endpoint.
pub const DEFAULT_NPM_REGISTRY: &str = "https://registry.npmjs.org";

/// Cache policy for registry installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallMode {
    /// Reuse a satisfying version already present in the versioned store.
    #[default]
    UseCache,
    /// Always resolve against the registry; fail when it is unreachable.
    NoCache,
}

/// A module the host provides to plugins without installing anything.
///
/// `Source` is CommonJS source compiled like any plugin file; `Json` is a
/// ready-made export value.
#[derive(Debug, Clone)]
pub enum ProvidedModule {
    Source(String),
    Json(serde_json::Value),
}

/// An entry of the ignored-dependencies set.
#[derive(Debug, Clone)]
pub enum IgnoredDependency {
    /// Compared for string equality.
    Name(String),
    /// Tested against the dependency name.
    Pattern(Regex),
}

impl IgnoredDependency {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            IgnoredDependency::Name(n) => n == name,
            IgnoredDependency::Pattern(re) => re.is_match(name),
        }
    }
}

/// Per-plugin sandbox template: what the plugin sees as its environment and
/// extra globals. Unset fields derive from the host process.
#[derive(Debug, Clone, Default)]
pub struct SandboxTemplate {
    /// `process.env` inside the plugin; `None` copies the host environment.
    pub env: Option<BTreeMap<String, String>>,
    /// Extra globals merged into the plugin's fresh global object.
    pub globals: Option<BTreeMap<String, serde_json::Value>>,
}

/// Options accepted by [`crate::PluginManager::with_options`].
#[derive(Debug, Clone)]
pub struct PluginManagerOptions {
    /// Base directory; defaults to the current working directory.
    pub cwd: Option<PathBuf>,
    /// Plugin store root; defaults to `<cwd>/plugin_packages`.
    pub plugins_path: Option<PathBuf>,
    /// Versioned store; defaults to `<plugins_path>/.versions`.
    pub versions_path: Option<PathBuf>,
    /// Default sandbox template applied to plugins without their own.
    pub sandbox: SandboxTemplate,
    /// npm registry endpoint.
    pub npm_registry_url: String,
    /// Auth for private registries, passed through opaquely.
    pub npm_registry_auth: Option<Credentials>,
    /// Registry cache policy.
    pub npm_install_mode: InstallMode,
    /// Whether core-module names resolve through the host-modules table.
    pub require_core_modules: bool,
    /// Modules the surrounding program provides; the manager neither installs
    /// nor shadows these names.
    pub host_modules: BTreeMap<String, ProvidedModule>,
    /// Dependencies never installed nor resolved.
    pub ignored_dependencies: Vec<IgnoredDependency>,
    /// Dependencies satisfied by a pre-built export value.
    pub static_dependencies: BTreeMap<String, ProvidedModule>,
    /// Authentication for github.com.
    pub github_authentication: Option<Credentials>,
    /// Authentication for bitbucket.org.
    pub bitbucket_authentication: Option<Credentials>,
    /// How long an operation keeps polling for the store lock.
    pub lock_wait: Duration,
    /// Age after which a lock sentinel counts as abandoned.
    pub lock_stale: Duration,
}

impl Default for PluginManagerOptions {
    fn default() -> Self {
        PluginManagerOptions {
            cwd: None,
            plugins_path: None,
            versions_path: None,
            sandbox: SandboxTemplate::default(),
            npm_registry_url: DEFAULT_NPM_REGISTRY.to_string(),
            npm_registry_auth: None,
            npm_install_mode: InstallMode::default(),
            require_core_modules: true,
            host_modules: BTreeMap::new(),
            ignored_dependencies: Vec::new(),
            static_dependencies: BTreeMap::new(),
            github_authentication: None,
            bitbucket_authentication: None,
            lock_wait: Duration::from_secs(5),
            lock_stale: Duration::from_secs(60),
        }
    }
}

impl PluginManagerOptions {
    /// Options rooted at an explicit plugin directory. The common entry point
    /// for tests and embedders that do not want the cwd default.
    pub fn rooted(plugins_path: impl Into<PathBuf>) -> Self {
        PluginManagerOptions {
            plugins_path: Some(plugins_path.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = PluginManagerOptions::default();
        assert_eq!(options.npm_registry_url, DEFAULT_NPM_REGISTRY);
        assert_eq!(options.npm_install_mode, InstallMode::UseCache);
        assert!(options.require_core_modules);
        assert!(options.plugins_path.is_none());
        assert_eq!(options.lock_wait, Duration::from_secs(5));
        assert_eq!(options.lock_stale, Duration::from_secs(60));
    }

    #[test]
    fn test_rooted() {
        let options = PluginManagerOptions::rooted("/tmp/store");
        assert_eq!(options.plugins_path.unwrap(), PathBuf::from("/tmp/store"));
    }

    #[test]
    fn test_ignored_dependency_matching() {
        let by_name = IgnoredDependency::Name("fsevents".into());
        assert!(by_name.matches("fsevents"));
        assert!(!by_name.matches("fsevents2"));

        let by_pattern = IgnoredDependency::Pattern(Regex::new("^@types/").unwrap());
        assert!(by_pattern.matches("@types/node"));
        assert!(!by_pattern.matches("typescript"));
    }
}
