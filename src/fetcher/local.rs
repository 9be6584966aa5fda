//! Local-path fetcher.
//!
//! The selector is a filesystem path, absolute or relative to the manager's
//! working directory. Download copies the tree, leaving build debris
//! (`node_modules`, VCS metadata) behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::{Fetcher, PackageSource, ResolvedPackage};
use crate::error::PluginError;
use crate::manifest::PackageManifest;
use crate::runtime::Runtime;

/// Directory names never copied out of a local package.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", ".hg", ".svn"];

pub struct LocalFetcher {
    runtime: Arc<dyn Runtime>,
    cwd: PathBuf,
}

impl LocalFetcher {
    pub fn new(runtime: Arc<dyn Runtime>, cwd: PathBuf) -> Self {
        LocalFetcher { runtime, cwd }
    }

    fn resolve_path(&self, selector: &str) -> Result<PathBuf, PluginError> {
        let raw = Path::new(selector);
        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.cwd.join(raw)
        };
        self.runtime.canonicalize(&joined).map_err(|_| {
            PluginError::NotFound {
                name: selector.to_string(),
                selector: selector.to_string(),
                message: format!("path {:?} does not exist", joined),
            }
        })
    }

    fn copy_filtered(&self, from: &Path, to: &Path) -> Result<(), PluginError> {
        let io_err = |p: &Path, e: anyhow::Error| {
            PluginError::io(p.to_path_buf(), std::io::Error::other(e.to_string()))
        };

        self.runtime.create_dir_all(to).map_err(|e| io_err(to, e))?;
        for entry in self.runtime.read_dir(from).map_err(|e| io_err(from, e))? {
            let Some(name) = entry.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let dest = to.join(&name);
            if self.runtime.is_dir(&entry) {
                if SKIPPED_DIRS.contains(&name.as_str()) {
                    debug!("Skipping {:?} during local copy", entry);
                    continue;
                }
                self.copy_filtered(&entry, &dest)?;
            } else {
                self.runtime.copy(&entry, &dest).map_err(|e| io_err(&dest, e))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Fetcher for LocalFetcher {
    async fn resolve(
        &self,
        _name: &str,
        selector: &str,
    ) -> Result<ResolvedPackage, PluginError> {
        let path = self.resolve_path(selector)?;
        debug!("Reading local package at {:?}", path);

        let contents = self
            .runtime
            .read_to_string(&path.join("package.json"))
            .map_err(|_| PluginError::NotFound {
                name: selector.to_string(),
                selector: selector.to_string(),
                message: format!("no package.json under {:?}", path),
            })?;
        let manifest = PackageManifest::parse(selector, &contents)?;

        Ok(ResolvedPackage {
            manifest,
            source: PackageSource::Directory { path },
        })
    }

    async fn download(
        &self,
        package: &ResolvedPackage,
        dest: &Path,
    ) -> Result<(), PluginError> {
        let PackageSource::Directory { path } = &package.source else {
            return Err(PluginError::FetchFailed {
                name: package.manifest.name.clone(),
                source: anyhow::anyhow!("local package without a directory source"),
            });
        };
        self.copy_filtered(path, dest)
    }
}
