//! Bitbucket fetcher.
//!
//! Same `owner/repo[#ref]` grammar as the GitHub fetcher, against
//! bitbucket.org's raw and `get/<ref>.tar.gz` endpoints.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::github::GitReference;
use super::{Fetcher, PackageSource, ResolvedPackage, download_archive, fetch_error};
use crate::error::PluginError;
use crate::http::{Credentials, HttpClient};
use crate::manifest::PackageManifest;
use crate::runtime::Runtime;

/// Default Bitbucket web endpoint.
pub const BITBUCKET_BASE: &str = "https://bitbucket.org";

pub struct BitbucketFetcher {
    http: HttpClient,
    runtime: Arc<dyn Runtime>,
    base: String,
    auth: Option<Credentials>,
}

impl BitbucketFetcher {
    pub fn new(http: HttpClient, runtime: Arc<dyn Runtime>, auth: Option<Credentials>) -> Self {
        Self::with_endpoint(http, runtime, BITBUCKET_BASE, auth)
    }

    pub fn with_endpoint(
        http: HttpClient,
        runtime: Arc<dyn Runtime>,
        base: &str,
        auth: Option<Credentials>,
    ) -> Self {
        BitbucketFetcher {
            http,
            runtime,
            base: base.trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn manifest_url(&self, git_ref: &GitReference) -> String {
        format!(
            "{}/{}/{}/raw/{}/package.json",
            self.base, git_ref.owner, git_ref.repo, git_ref.reference
        )
    }

    fn archive_url(&self, git_ref: &GitReference) -> String {
        format!(
            "{}/{}/{}/get/{}.tar.gz",
            self.base, git_ref.owner, git_ref.repo, git_ref.reference
        )
    }
}

#[async_trait]
impl Fetcher for BitbucketFetcher {
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
                source: anyhow::anyhow!("bitbucket package without an archive source"),
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
