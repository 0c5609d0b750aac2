//! Release metadata from a GitHub-compatible releases API.

use crate::download::Downloader;
use crate::error::{Error, Result};
use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::path::Path;

/// Release metadata from the API.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub name: String,
    #[serde(rename = "browser_download_url", alias = "download_url")]
    pub download_url: String,
    /// API URL of the asset; serves the bytes to authenticated clients when
    /// requested with `Accept: application/octet-stream`.
    #[serde(default)]
    pub url: Option<String>,
}

impl Release {
    pub fn asset_names(&self) -> Vec<&str> {
        self.assets.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn asset(&self, name: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.name == name)
    }
}

/// Thin client over the releases endpoints.
#[derive(Clone)]
pub struct Releases {
    http: Downloader,
    api_base: String,
}

impl Releases {
    pub fn new(http: Downloader, api_base: &str) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Fetches the release for `version`, or the latest release for "latest".
    #[tracing::instrument(skip(self))]
    pub async fn fetch(&self, repo: &str, version: &str) -> Result<Release> {
        let url = if version == crate::config::LATEST {
            format!("{}/repos/{}/releases/latest", self.api_base, repo)
        } else {
            format!("{}/repos/{}/releases/tags/{}", self.api_base, repo, version)
        };
        tracing::debug!(url = %url, "Fetching release metadata");
        let release: Release = self.http.get_json(&url).await?;
        tracing::debug!(tag = %release.tag_name, asset_count = release.assets.len(), "Found release");
        Ok(release)
    }

    /// Like [`Releases::fetch`], but a missing release is `None` instead of an error.
    pub async fn find(&self, repo: &str, tag: &str) -> Result<Option<Release>> {
        match self.fetch(repo, tag).await {
            Ok(release) => Ok(Some(release)),
            Err(Error::DownloadFailed {
                status: Some(404), ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Creates a release for `tag`; requires a token with write access.
    #[tracing::instrument(skip(self))]
    pub async fn create(&self, repo: &str, tag: &str) -> Result<Release> {
        let url = format!("{}/repos/{}/releases", self.api_base, repo);
        let body = serde_json::json!({
            "tag_name": tag,
            "name": tag,
            "body": format!("Build cache for {tag}"),
        });
        let response = self
            .http
            .request(Method::POST, &url)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::DownloadFailed {
                url,
                status: Some(status.as_u16()),
            });
        }
        Ok(response.json().await?)
    }

    /// Uploads `file` as an asset named `asset_name` to `release`.
    #[tracing::instrument(skip(self, release, file), fields(tag = %release.tag_name))]
    pub async fn upload(&self, release: &Release, asset_name: &str, file: &Path) -> Result<()> {
        let template = release.upload_url.as_deref().ok_or_else(|| {
            Error::InvalidInput(format!("release {} has no upload URL", release.tag_name))
        })?;
        // upload_url is an RFC 6570 template like ".../assets{?name,label}".
        let base = template.split('{').next().unwrap_or(template);
        let bytes = tokio::fs::read(file).await?;

        let response = self
            .http
            .request(Method::POST, base)
            .query(&[("name", asset_name)])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::DownloadFailed {
                url: base.to_string(),
                status: Some(status.as_u16()),
            });
        }
        tracing::info!(asset = asset_name, "Uploaded release asset");
        Ok(())
    }
}
