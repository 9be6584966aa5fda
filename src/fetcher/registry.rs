//! npm registry fetcher.
//!
//! Resolution reads the registry's package document (one JSON blob per name,
//! with `dist-tags` and a `versions` map); the pick is the highest version
//! satisfying the selector, or a dist-tag hit. Download streams the
//! `dist.tarball` archive.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::{
    Fetcher, PackageSource, ResolvedPackage, download_archive, fetch_error,
};
use crate::error::PluginError;
use crate::http::{Credentials, HttpClient};
use crate::manifest::{DEFAULT_MAIN, PackageManifest};
use crate::runtime::Runtime;
use crate::version_range::{VersionRange, max_satisfying};

/// Registry API response types (internal).
mod api {
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Deserialize, Debug)]
    pub struct PackageDocument {
        #[serde(default, rename = "dist-tags")]
        pub dist_tags: BTreeMap<String, String>,
        #[serde(default)]
        pub versions: BTreeMap<String, VersionDocument>,
    }

    #[derive(Deserialize, Debug)]
    pub struct VersionDocument {
        pub name: String,
        pub version: String,
        pub main: Option<String>,
        #[serde(default)]
        pub dependencies: BTreeMap<String, String>,
        #[serde(default, rename = "optionalDependencies")]
        pub optional_dependencies: BTreeMap<String, String>,
        pub dist: Dist,
    }

    #[derive(Deserialize, Debug)]
    pub struct Dist {
        pub tarball: String,
    }
}

pub struct RegistryFetcher {
    http: HttpClient,
    runtime: Arc<dyn Runtime>,
    registry_url: String,
    auth: Option<Credentials>,
}

impl RegistryFetcher {
    pub fn new(
        http: HttpClient,
        runtime: Arc<dyn Runtime>,
        registry_url: &str,
        auth: Option<Credentials>,
    ) -> Self {
        RegistryFetcher {
            http,
            runtime,
            registry_url: registry_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    /// Registry URL for a package document. Scoped names keep their `@` but
    /// escape the separating slash.
    fn package_url(&self, name: &str) -> String {
        format!("{}/{}", self.registry_url, name.replace('/', "%2F"))
    }

    fn pick_version<'doc>(
        document: &'doc api::PackageDocument,
        name: &str,
        selector: &str,
    ) -> Result<&'doc api::VersionDocument, PluginError> {
        // Tag hit first: "latest", "beta", etc.
        let tagged = document.dist_tags.get(selector.trim());
        let chosen = if let Some(version) = tagged {
            document.versions.get(version)
        } else {
            let range = VersionRange::parse(selector)?;
            max_satisfying(document.versions.keys().map(String::as_str), &range)
                .and_then(|best| document.versions.get(&best.to_string()))
        };

        // The package exists but nothing published satisfies the selector.
        chosen.ok_or_else(|| {
            let newest = document
                .versions
                .keys()
                .next_back()
                .map(String::as_str)
                .unwrap_or("none");
            PluginError::VersionConflict {
                name: name.to_string(),
                required: selector.to_string(),
                available: format!("{} published, newest {}", document.versions.len(), newest),
            }
        })
    }
}

#[async_trait]
impl Fetcher for RegistryFetcher {
    #[tracing::instrument(skip(self))]
    async fn resolve(
        &self,
        name: &str,
        selector: &str,
    ) -> Result<ResolvedPackage, PluginError> {
        let url = self.package_url(name);
        debug!("Resolving {}@{} against {}", name, selector, url);

        let document: api::PackageDocument = self
            .http
            .get_json(&url, self.auth.as_ref())
            .await
            .map_err(|e| fetch_error(name, selector, e))?;

        let version = Self::pick_version(&document, name, selector)?;
        debug!("Resolved {}@{} -> {}", name, selector, version.version);

        Ok(ResolvedPackage {
            manifest: PackageManifest {
                name: version.name.clone(),
                version: version.version.clone(),
                main: version.main.clone().unwrap_or_else(|| DEFAULT_MAIN.to_string()),
                dependencies: version.dependencies.clone(),
                optional_dependencies: version.optional_dependencies.clone(),
            },
            source: PackageSource::Archive {
                url: version.dist.tarball.clone(),
            },
        })
    }

    async fn download(
        &self,
        package: &ResolvedPackage,
        dest: &Path,
    ) -> Result<(), PluginError> {
        let PackageSource::Archive { url } = &package.source else {
            return Err(PluginError::FetchFailed {
                name: package.manifest.name.clone(),
                source: anyhow::anyhow!("registry package without a tarball source"),
            });
        };
        download_archive(
            &self.http,
            &self.runtime,
            url,
            self.auth.as_ref(),
            dest,
            &package.manifest.name,
        )
        .await
    }
}

/// Build a registry package document body for tests.
#[cfg(test)]
pub(crate) fn document_body(
    name: &str,
    versions: &[(&str, &str, &[(&str, &str)])],
    latest: &str,
) -> String {
    use std::collections::BTreeMap;

    let mut version_map = BTreeMap::new();
    for (version, tarball, deps) in versions {
        let deps: BTreeMap<&str, &str> = deps.iter().copied().collect();
        version_map.insert(
            version.to_string(),
            serde_json::json!({
                "name": name,
                "version": version,
                "dist": {"tarball": tarball},
                "dependencies": deps,
            }),
        );
    }
    serde_json::json!({
        "name": name,
        "dist-tags": {"latest": latest},
        "versions": version_map,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_archives::tar_gz;
    use crate::runtime::RealRuntime;
    use tempfile::tempdir;

    fn fetcher(url: &str) -> RegistryFetcher {
        RegistryFetcher::new(HttpClient::default(), Arc::new(RealRuntime), url, None)
    }

    #[tokio::test]
    async fn test_resolve_picks_highest_satisfying() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/debug")
            .with_status(200)
            .with_body(document_body(
                "debug",
                &[
                    ("2.6.9", "http://x/debug-2.6.9.tgz", &[]),
                    ("2.2.0", "http://x/debug-2.2.0.tgz", &[]),
                    ("4.3.1", "http://x/debug-4.3.1.tgz", &[]),
                ],
                "4.3.1",
            ))
            .create_async()
            .await;

        let resolved = fetcher(&server.url()).resolve("debug", "^2.0.0").await.unwrap();
        assert_eq!(resolved.manifest.version, "2.6.9");
        assert!(
            matches!(resolved.source, PackageSource::Archive { ref url } if url.ends_with("2.6.9.tgz"))
        );
    }

    #[tokio::test]
    async fn test_resolve_dist_tag() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/cookie")
            .with_status(200)
            .with_body(document_body(
                "cookie",
                &[("0.3.1", "http://x/cookie-0.3.1.tgz", &[])],
                "0.3.1",
            ))
            .create_async()
            .await;

        let resolved = fetcher(&server.url()).resolve("cookie", "latest").await.unwrap();
        assert_eq!(resolved.manifest.version, "0.3.1");
    }

    #[tokio::test]
    async fn test_resolve_no_satisfying_version() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/cookie")
            .with_status(200)
            .with_body(document_body(
                "cookie",
                &[("0.3.1", "http://x/c.tgz", &[])],
                "0.3.1",
            ))
            .create_async()
            .await;

        let err = fetcher(&server.url())
            .resolve("cookie", "^9.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_resolve_unknown_package_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/ghost")
            .with_status(404)
            .create_async()
            .await;

        let err = fetcher(&server.url()).resolve("ghost", "*").await.unwrap_err();
        assert!(matches!(err, PluginError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_scoped_name_is_escaped() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/@acme%2Fwidget")
            .with_status(200)
            .with_body(document_body(
                "@acme/widget",
                &[("1.0.0", "http://x/w.tgz", &[])],
                "1.0.0",
            ))
            .create_async()
            .await;

        let resolved = fetcher(&server.url())
            .resolve("@acme/widget", "^1.0.0")
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(resolved.manifest.name, "@acme/widget");
    }

    #[tokio::test]
    async fn test_download_extracts_tarball() {
        let mut server = mockito::Server::new_async().await;
        let tarball = tar_gz(&[
            ("package/package.json", r#"{"name":"tiny","version":"1.0.0"}"#),
            ("package/index.js", "module.exports = 'tiny';"),
        ]);
        let _m = server
            .mock("GET", "/tiny-1.0.0.tgz")
            .with_status(200)
            .with_body(tarball)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("tiny@1.0.0");
        std::fs::create_dir_all(&dest).unwrap();

        let package = ResolvedPackage {
            manifest: PackageManifest::synthetic("tiny", "1.0.0"),
            source: PackageSource::Archive {
                url: format!("{}/tiny-1.0.0.tgz", server.url()),
            },
        };

        fetcher(&server.url()).download(&package, &dest).await.unwrap();
        assert!(dest.join("package.json").exists());
        assert!(dest.join("index.js").exists());
        // Scratch archive cleaned up.
        assert!(!dir.path().join("tiny@1.0.0.download.tgz").exists());
    }
}
