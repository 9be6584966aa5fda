//! GitHub fetcher.
//!
//! The selector is `owner/repo[#ref]`: `ref` defaults to `HEAD` and may be a
//! branch, a tag, or a commit of at least seven hex digits. Resolution reads
//! the repository's `package.json` through the raw endpoint; download pulls
//! the codeload tarball for the same ref.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::{Fetcher, PackageSource, ResolvedPackage, download_archive, fetch_error};
use crate::error::PluginError;
use crate::http::{Credentials, HttpClient};
use crate::manifest::PackageManifest;
use crate::runtime::Runtime;

/// Default raw-content endpoint.
pub const RAW_BASE: &str = "https://raw.githubusercontent.com";

/// Default archive endpoint.
pub const CODELOAD_BASE: &str = "https://codeload.github.com";

/// A parsed `owner/repo[#ref]` selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitReference {
    pub owner: String,
    pub repo: String,
    pub reference: String,
}

impl GitReference {
    /// Parse the `owner/repo[#ref]` grammar. The ref is `HEAD` when omitted.
    pub fn parse(spec: &str) -> Result<Self, PluginError> {
        let invalid = |reason: &str| PluginError::InvalidPluginName {
            name: spec.to_string(),
            reason: reason.to_string(),
        };

        let (repo_part, reference) = match spec.split_once('#') {
            Some((repo, reference)) if !reference.is_empty() => (repo, reference.to_string()),
            Some(_) => return Err(invalid("empty ref after '#'")),
            None => (spec, "HEAD".to_string()),
        };

        let Some((owner, repo)) = repo_part.split_once('/') else {
            return Err(invalid("expected 'owner/repo[#ref]'"));
        };
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(invalid("expected exactly one '/' between owner and repo"));
        }
        let segment_ok = |s: &str| {
            s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !segment_ok(owner) || !segment_ok(repo) {
            return Err(invalid("owner and repo must be alphanumeric with -_."));
        }

        Ok(GitReference {
            owner: owner.to_string(),
            repo: repo.to_string(),
            reference,
        })
    }

    /// True when the ref looks like a commit hash (seven or more hex digits).
    pub fn is_commit(&self) -> bool {
        self.reference.len() >= 7 && self.reference.chars().all(|c| c.is_ascii_hexdigit())
    }
}

impl fmt::Display for GitReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.reference)
    }
}

impl FromStr for GitReference {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub struct GitHubFetcher {
    http: HttpClient,
    runtime: Arc<dyn Runtime>,
    raw_base: String,
    codeload_base: String,
    auth: Option<Credentials>,
}

impl GitHubFetcher {
    pub fn new(http: HttpClient, runtime: Arc<dyn Runtime>, auth: Option<Credentials>) -> Self {
        Self::with_endpoints(http, runtime, RAW_BASE, CODELOAD_BASE, auth)
    }

    /// Custom endpoints; used by tests and GitHub Enterprise setups.
    pub fn with_endpoints(
        http: HttpClient,
        runtime: Arc<dyn Runtime>,
        raw_base: &str,
        codeload_base: &str,
        auth: Option<Credentials>,
    ) -> Self {
        GitHubFetcher {
            http,
            runtime,
            raw_base: raw_base.trim_end_matches('/').to_string(),
            codeload_base: codeload_base.trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn manifest_url(&self, git_ref: &GitReference) -> String {
        format!(
            "{}/{}/{}/{}/package.json",
            self.raw_base, git_ref.owner, git_ref.repo, git_ref.reference
        )
    }

    fn archive_url(&self, git_ref: &GitReference) -> String {
        format!(
            "{}/{}/{}/tar.gz/{}",
            self.codeload_base, git_ref.owner, git_ref.repo, git_ref.reference
        )
    }
}

#[async_trait]
impl Fetcher for GitHubFetcher {
    #[tracing::instrument(skip(self))]
    async fn resolve(
        &self,
        name: &str,
        selector: &str,
    ) -> Result<ResolvedPackage, PluginError> {
        let git_ref = GitReference::parse(selector)?;
        let url = self.manifest_url(&git_ref);
        debug!("Reading manifest for {} from {}", git_ref, url);

        let body = self
            .http
            .get_text(&url, self.auth.as_ref())
            .await
            .map_err(|e| fetch_error(name, selector, e))?;
        let manifest = PackageManifest::parse(name, &body)?;

        Ok(ResolvedPackage {
            manifest,
            source: PackageSource::Archive {
                url: self.archive_url(&git_ref),
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
                source: anyhow::anyhow!("github package without an archive source"),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_archives::tar_gz;
    use crate::runtime::RealRuntime;
    use tempfile::tempdir;

    #[test]
    fn test_parse_defaults_to_head() {
        let git_ref = GitReference::parse("alexjoverm/true-case-path").unwrap();
        assert_eq!(git_ref.owner, "alexjoverm");
        assert_eq!(git_ref.repo, "true-case-path");
        assert_eq!(git_ref.reference, "HEAD");
        assert!(!git_ref.is_commit());
    }

    #[test]
    fn test_parse_branch_tag_and_commit() {
        let branch = GitReference::parse("o/r#develop").unwrap();
        assert_eq!(branch.reference, "develop");
        assert!(!branch.is_commit());

        let tag = GitReference::parse("o/r#v1.2.0").unwrap();
        assert_eq!(tag.reference, "v1.2.0");

        let commit = GitReference::parse("o/r#a81cbbc4").unwrap();
        assert!(commit.is_commit());
    }

    #[test]
    fn test_parse_rejects_bad_specs() {
        assert!(GitReference::parse("norepo").is_err());
        assert!(GitReference::parse("a/b/c").is_err());
        assert!(GitReference::parse("/repo").is_err());
        assert!(GitReference::parse("owner/").is_err());
        assert!(GitReference::parse("o/r#").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let git_ref: GitReference = "owner/repo#main".parse().unwrap();
        assert_eq!(git_ref.to_string(), "owner/repo#main");
    }

    fn fetcher(base: &str) -> GitHubFetcher {
        GitHubFetcher::with_endpoints(
            HttpClient::default(),
            Arc::new(RealRuntime),
            base,
            base,
            None,
        )
    }

    #[tokio::test]
    async fn test_resolve_reads_raw_manifest() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/owner/repo/main/package.json")
            .with_status(200)
            .with_body(r#"{"name": "repo", "version": "1.2.0"}"#)
            .create_async()
            .await;

        let resolved = fetcher(&server.url())
            .resolve("repo", "owner/repo#main")
            .await
            .unwrap();
        assert_eq!(resolved.manifest.version, "1.2.0");
        assert!(
            matches!(resolved.source, PackageSource::Archive { ref url }
                if url.ends_with("/owner/repo/tar.gz/main"))
        );
    }

    #[tokio::test]
    async fn test_resolve_missing_repo_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/owner/ghost/HEAD/package.json")
            .with_status(404)
            .create_async()
            .await;

        let err = fetcher(&server.url())
            .resolve("ghost", "owner/ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_download_pulls_codeload_archive() {
        let mut server = mockito::Server::new_async().await;
        let tarball = tar_gz(&[
            ("repo-abc/package.json", r#"{"name":"repo","version":"1.0.0"}"#),
            ("repo-abc/index.js", "module.exports = 'gh';"),
        ]);
        let _m = server
            .mock("GET", "/owner/repo/tar.gz/HEAD")
            .with_status(200)
            .with_body(tarball)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("repo@1.0.0");
        std::fs::create_dir_all(&dest).unwrap();

        let package = ResolvedPackage {
            manifest: PackageManifest::synthetic("repo", "1.0.0"),
            source: PackageSource::Archive {
                url: format!("{}/owner/repo/tar.gz/HEAD", server.url()),
            },
        };

        fetcher(&server.url()).download(&package, &dest).await.unwrap();
        assert!(dest.join("index.js").exists());
    }
}
