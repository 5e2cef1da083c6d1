//! ---
//! ems_section: "14-versioning-licensing-system"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Remote version checks gating state application."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use salt_updater_common::{ManifestFormat, VersioningConfig};
use tracing::{debug, info};
use url::Url;

use crate::manifest::{branch_published_at, newest_commit_at};
use crate::{NodeGroupBranchMap, Result, VersionError};

const GITHUB_API_VERSION: &str = "2022-11-28";

/// Outcome of a successful check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheck {
    /// A publish newer than the watermark exists.
    pub available: bool,
    /// Publish time seen remotely; recorded as the new watermark after a
    /// successful update. `None` only when the endpoint lists nothing.
    pub published_at: Option<DateTime<Utc>>,
    /// Branch the node group mapped to.
    pub branch: String,
}

/// Decides whether an update is available for a node group.
#[async_trait]
pub trait UpdateChecker: Send + Sync {
    /// Compare the remote publish time for `node_group` against `watermark`.
    async fn check_update_available(
        &self,
        node_group: &str,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<UpdateCheck>;
}

/// Settings used to construct a [`RemoteVersionChecker`].
#[derive(Debug, Clone)]
pub struct CheckerSettings {
    /// Endpoint serving the manifest or commit listing.
    pub url: String,
    /// Document shape served by `url`.
    pub format: ManifestFormat,
    /// Node group to branch mapping.
    pub branches: NodeGroupBranchMap,
    /// Fixed device class; derived from the node group when unset.
    pub device_class: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl From<&VersioningConfig> for CheckerSettings {
    fn from(config: &VersioningConfig) -> Self {
        Self {
            url: config.manifest_url.clone(),
            format: config.format,
            branches: NodeGroupBranchMap::new(config.branches.clone()),
            device_class: config.device_class.clone(),
            request_timeout: config.request_timeout,
        }
    }
}

/// HTTP-backed [`UpdateChecker`].
#[derive(Debug, Clone)]
pub struct RemoteVersionChecker {
    settings: CheckerSettings,
    client: reqwest::Client,
}

impl RemoteVersionChecker {
    /// Construct a checker with its own HTTP client.
    pub fn new(settings: CheckerSettings) -> Result<Self> {
        let url = Url::parse(&settings.url).map_err(|err| VersionError::InvalidUrl {
            url: settings.url.clone(),
            reason: err.to_string(),
        })?;
        let mut builder = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(concat!("salt-updater/", env!("CARGO_PKG_VERSION")));
        if is_loopback(&url) {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;
        Ok(Self { settings, client })
    }

    /// Access the resolved settings.
    pub fn settings(&self) -> &CheckerSettings {
        &self.settings
    }

    fn device_class<'a>(&'a self, node_group: &str) -> &'a str {
        self.settings
            .device_class
            .as_deref()
            .unwrap_or_else(|| NodeGroupBranchMap::device_class(node_group))
    }

    fn request_url(&self, branch: &str) -> Result<Url> {
        let mut url = Url::parse(&self.settings.url).map_err(|err| VersionError::InvalidUrl {
            url: self.settings.url.clone(),
            reason: err.to_string(),
        })?;
        if self.settings.format == ManifestFormat::GithubCommits {
            url.query_pairs_mut()
                .append_pair("sha", branch)
                .append_pair("per_page", "1");
        }
        Ok(url)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match self.settings.format {
            ManifestFormat::BranchManifest => {
                headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
            }
            ManifestFormat::GithubCommits => {
                headers.insert(
                    ACCEPT,
                    HeaderValue::from_static("application/vnd.github+json"),
                );
                headers.insert(
                    "X-GitHub-Api-Version",
                    HeaderValue::from_static(GITHUB_API_VERSION),
                );
            }
        }
        headers
    }

    async fn fetch(&self, url: Url) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url.clone())
            .headers(self.headers())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(VersionError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        Some(url::Host::Domain(name)) => name == "localhost",
        None => false,
    }
}

#[async_trait]
impl UpdateChecker for RemoteVersionChecker {
    async fn check_update_available(
        &self,
        node_group: &str,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<UpdateCheck> {
        let branch = self
            .settings
            .branches
            .branch_for(node_group)
            .ok_or_else(|| VersionError::UnknownNodeGroup(node_group.to_owned()))?
            .to_owned();
        info!(branch = %branch, last_update = ?watermark, "checking for salt updates");

        let url = self.request_url(&branch)?;
        let body = self.fetch(url).await?;

        let published_at = match self.settings.format {
            ManifestFormat::BranchManifest => Some(branch_published_at(
                &body,
                &branch,
                self.device_class(node_group),
            )?),
            ManifestFormat::GithubCommits => newest_commit_at(&body)?,
        };

        let available = match (published_at, watermark) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(published), Some(last)) => published > last,
        };
        debug!(branch = %branch, ?published_at, available, "update check complete");
        Ok(UpdateCheck {
            available,
            published_at,
            branch,
        })
    }
}
