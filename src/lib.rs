//! plugman: a dynamic plugin manager.
//!
//! Installs npm-style JavaScript packages at runtime into a versioned
//! on-disk store and executes them through a from-scratch CommonJS loader
//! hosted on an embedded QuickJS engine. The host controls dependency
//! versions, sandboxing, and lifecycle:
//!
//! - the [`store`] keeps one canonical copy per installed `(name, version)`
//!   plus an active view per name, with reference counting deciding when a
//!   version becomes garbage;
//! - the [`fetcher`]s materialise packages from the npm registry, GitHub,
//!   Bitbucket, local paths, or inline source, under a single-writer file
//!   lock;
//! - the [`vm`] resolves and runs plugin code, giving each plugin exactly
//!   the dependency versions it was installed with and its own sandboxed
//!   global state.
//!
//! ```no_run
//! use plugman::{PluginManager, PluginManagerOptions};
//!
//! # async fn demo() -> Result<(), plugman::PluginError> {
//! let manager = PluginManager::with_options(
//!     PluginManagerOptions::rooted("./plugin_packages"),
//! )?;
//! manager.install_from_npm("cookie", "0.3.1", false).await?;
//! let parsed = manager.call_export(
//!     "cookie",
//!     "parse",
//!     &[serde_json::json!("foo=bar")],
//! )?;
//! assert_eq!(parsed["foo"], "bar");
//! # Ok(())
//! # }
//! ```

pub mod acquire;
pub mod archive;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod lock;
pub mod manager;
pub mod manifest;
pub mod options;
pub mod runtime;
pub mod store;
pub mod version_range;
pub mod vm;

pub use error::PluginError;
pub use http::Credentials;
pub use manager::{PluginManager, SatisfyMode};
pub use manifest::{PackageManifest, PluginInfo};
pub use options::{
    IgnoredDependency, InstallMode, PluginManagerOptions, ProvidedModule, SandboxTemplate,
};
