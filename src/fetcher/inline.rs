//! Inline-source fetcher.
//!
//! `install_from_code` hands source text straight to the manager. The
//! fabricated manifest carries the caller-supplied version (default
//! `0.0.0`); the written package is a `package.json` plus the source as
//! `index.js`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Fetcher, PackageSource, ResolvedPackage};
use crate::error::PluginError;
use crate::manifest::PackageManifest;
use crate::runtime::Runtime;

/// Version used when the caller does not pin one.
pub const DEFAULT_INLINE_VERSION: &str = "0.0.0";

pub struct InlineFetcher {
    runtime: Arc<dyn Runtime>,
    version: String,
}

impl InlineFetcher {
    pub fn new(runtime: Arc<dyn Runtime>, version: Option<&str>) -> Self {
        InlineFetcher {
            runtime,
            version: version.unwrap_or(DEFAULT_INLINE_VERSION).to_string(),
        }
    }

    /// True when this install must bypass the already-installed check:
    /// an unpinned version gives no way to tell old code from new.
    pub fn is_unpinned(&self) -> bool {
        self.version == DEFAULT_INLINE_VERSION
    }
}

#[async_trait]
impl Fetcher for InlineFetcher {
    async fn resolve(
        &self,
        name: &str,
        selector: &str,
    ) -> Result<ResolvedPackage, PluginError> {
        Ok(ResolvedPackage {
            manifest: PackageManifest::synthetic(name, &self.version),
            source: PackageSource::Inline {
                code: selector.to_string(),
            },
        })
    }

    async fn download(
        &self,
        package: &ResolvedPackage,
        dest: &Path,
    ) -> Result<(), PluginError> {
        let PackageSource::Inline { code } = &package.source else {
            return Err(PluginError::FetchFailed {
                name: package.manifest.name.clone(),
                source: anyhow::anyhow!("inline package without source code"),
            });
        };

        let io_err = |p: &Path, e: anyhow::Error| {
            PluginError::io(p.to_path_buf(), std::io::Error::other(e.to_string()))
        };

        self.runtime
            .create_dir_all(dest)
            .map_err(|e| io_err(dest, e))?;

        let manifest_path = dest.join("package.json");
        let manifest_body =
            serde_json::to_string_pretty(&package.manifest).map_err(|e| PluginError::Manifest {
                name: package.manifest.name.clone(),
                message: e.to_string(),
            })?;
        self.runtime
            .write(&manifest_path, manifest_body.as_bytes())
            .map_err(|e| io_err(&manifest_path, e))?;

        let main_path = dest.join(&package.manifest.main);
        self.runtime
            .write(&main_path, code.as_bytes())
            .map_err(|e| io_err(&main_path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RealRuntime;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_inline_writes_manifest_and_main() {
        let dir = tempdir().unwrap();
        let fetcher = InlineFetcher::new(Arc::new(RealRuntime), None);
        assert!(fetcher.is_unpinned());

        let resolved = fetcher
            .resolve("snippet", "module.exports = 41 + 1;")
            .await
            .unwrap();
        assert_eq!(resolved.manifest.version, DEFAULT_INLINE_VERSION);

        let dest = dir.path().join("snippet@0.0.0");
        fetcher.download(&resolved, &dest).await.unwrap();

        let manifest = PackageManifest::load(&dest).unwrap();
        assert_eq!(manifest.name, "snippet");
        let code = std::fs::read_to_string(dest.join("index.js")).unwrap();
        assert!(code.contains("41 + 1"));
    }

    #[tokio::test]
    async fn test_inline_pinned_version() {
        let fetcher = InlineFetcher::new(Arc::new(RealRuntime), Some("1.2.0"));
        assert!(!fetcher.is_unpinned());

        let resolved = fetcher.resolve("snippet", "exports.x = 1;").await.unwrap();
        assert_eq!(resolved.manifest.version, "1.2.0");
    }
}
