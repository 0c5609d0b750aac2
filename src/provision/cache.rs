//! Remote build cache backed by releases on a private repository.
//!
//! Each built binary is stored under the release tag `<name>-<version>` as
//! an asset named `<name>-<version>-<os>-<arch>[.exe]`.

use crate::config::BinaryEntry;
use crate::download::Downloader;
use crate::error::Result;
use crate::github::Releases;
use crate::platform::Platform;
use indicatif::ProgressBar;
use std::path::{Path, PathBuf};

pub fn cache_tag(name: &str, version: &str) -> String {
    format!("{name}-{version}")
}

pub fn cache_asset_name(name: &str, version: &str, platform: &Platform) -> String {
    format!(
        "{name}-{version}-{}-{}{}",
        platform.os,
        platform.arch,
        platform.exe_suffix()
    )
}

pub struct BuildCache<'a> {
    releases: &'a Releases,
    http: &'a Downloader,
    repo: &'a str,
}

impl<'a> BuildCache<'a> {
    pub fn new(releases: &'a Releases, http: &'a Downloader, repo: &'a str) -> Self {
        Self {
            releases,
            http,
            repo,
        }
    }

    /// Downloads the cached artifact for `entry` into `dest_dir`, if one exists.
    #[tracing::instrument(skip_all, fields(name = %entry.name, version = %entry.version, repo = self.repo))]
    pub async fn fetch(
        &self,
        entry: &BinaryEntry,
        platform: &Platform,
        dest_dir: &Path,
        pb: &ProgressBar,
    ) -> Result<Option<PathBuf>> {
        let tag = cache_tag(&entry.name, &entry.version);
        let asset_name = cache_asset_name(&entry.name, &entry.version, platform);

        let Some(release) = self.releases.find(self.repo, &tag).await? else {
            tracing::debug!(%tag, "No cache release");
            return Ok(None);
        };
        let Some(asset) = release.asset(&asset_name) else {
            tracing::debug!(asset = %asset_name, "Cache release has no artifact for this platform");
            return Ok(None);
        };

        let dest = dest_dir.join(&asset_name);
        // Private cache repositories only serve assets through the API URL.
        match (&asset.url, self.http.has_token()) {
            (Some(api_url), true) => {
                self.http
                    .download_with_accept(api_url, &dest, Some("application/octet-stream"), pb)
                    .await?;
            }
            _ => {
                self.http.download(&asset.download_url, &dest, pb).await?;
            }
        }
        tracing::info!(asset = %asset_name, "Build cache hit");
        Ok(Some(dest))
    }

    /// Uploads `binary` for future runs. Without a token the cache is read-only.
    #[tracing::instrument(skip_all, fields(name = %entry.name, version = %entry.version, repo = self.repo))]
    pub async fn store(&self, entry: &BinaryEntry, platform: &Platform, binary: &Path) -> Result<()> {
        if !self.http.has_token() {
            tracing::debug!("No token configured, skipping cache upload");
            return Ok(());
        }
        let tag = cache_tag(&entry.name, &entry.version);
        let asset_name = cache_asset_name(&entry.name, &entry.version, platform);

        let release = match self.releases.find(self.repo, &tag).await? {
            Some(release) => release,
            None => self.releases.create(self.repo, &tag).await?,
        };
        if release.asset(&asset_name).is_some() {
            tracing::debug!(asset = %asset_name, "Artifact already cached");
            return Ok(());
        }
        self.releases.upload(&release, &asset_name, binary).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn lazygit() -> BinaryEntry {
        serde_json::from_value(serde_json::json!({
            "name": "lazygit",
            "repo": "jesseduffield/lazygit",
            "version": "v0.52.0",
            "source": "build-from-source",
            "package": "github.com/jesseduffield/lazygit"
        }))
        .unwrap()
    }

    fn clients(server: &MockServer, token: Option<&str>) -> (Releases, Downloader) {
        let http = Downloader::new(0, CancellationToken::new())
            .unwrap()
            .with_token(token.map(String::from), &server.uri())
            .unwrap();
        (Releases::new(http.clone(), &server.uri()), http)
    }

    #[test]
    fn names_encode_name_version_and_platform() {
        assert_eq!(cache_tag("lazygit", "v0.52.0"), "lazygit-v0.52.0");
        assert_eq!(
            cache_asset_name("lazygit", "v0.52.0", &Platform::new("linux", "arm64")),
            "lazygit-v0.52.0-linux-arm64"
        );
        assert_eq!(
            cache_asset_name("lazygit", "v0.52.0", &Platform::new("windows", "amd64")),
            "lazygit-v0.52.0-windows-amd64.exe"
        );
    }

    #[tokio::test]
    async fn fetch_downloads_a_cached_artifact() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/build-cache/releases/tags/lazygit-v0.52.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tag_name": "lazygit-v0.52.0",
                "assets": [{
                    "name": "lazygit-v0.52.0-linux-amd64",
                    "browser_download_url": format!("{}/dl/lazygit-v0.52.0-linux-amd64", server.uri())
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dl/lazygit-v0.52.0-linux-amd64"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"cached".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let (releases, http) = clients(&server, None);
        let cache = BuildCache::new(&releases, &http, "acme/build-cache");
        let dir = tempfile::tempdir()?;
        let hit = cache
            .fetch(&lazygit(), &Platform::new("linux", "amd64"), dir.path(), &ProgressBar::hidden())
            .await?
            .expect("cache hit");
        assert_eq!(std::fs::read(hit)?, b"cached");
        Ok(())
    }

    #[tokio::test]
    async fn fetch_misses_when_the_platform_is_absent() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/build-cache/releases/tags/lazygit-v0.52.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tag_name": "lazygit-v0.52.0",
                "assets": [{ "name": "lazygit-v0.52.0-darwin-arm64", "browser_download_url": "x" }]
            })))
            .mount(&server)
            .await;

        let (releases, http) = clients(&server, None);
        let cache = BuildCache::new(&releases, &http, "acme/build-cache");
        let dir = tempfile::tempdir()?;
        let miss = cache
            .fetch(&lazygit(), &Platform::new("linux", "amd64"), dir.path(), &ProgressBar::hidden())
            .await?;
        assert!(miss.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn store_creates_the_release_and_uploads() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/build-cache/releases/tags/lazygit-v0.52.0"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/build-cache/releases"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "tag_name": "lazygit-v0.52.0",
                "upload_url": format!("{}/upload/1/assets{{?name,label}}", server.uri()),
                "assets": []
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/1/assets"))
            .and(query_param("name", "lazygit-v0.52.0-linux-amd64"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (releases, http) = clients(&server, Some("t0ken"));
        let cache = BuildCache::new(&releases, &http, "acme/build-cache");
        let dir = tempfile::tempdir()?;
        let binary = dir.path().join("lazygit");
        std::fs::write(&binary, b"ELF")?;
        cache
            .store(&lazygit(), &Platform::new("linux", "amd64"), &binary)
            .await
    }

    #[tokio::test]
    async fn store_without_token_is_a_no_op() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let (releases, http) = clients(&server, None);
        let cache = BuildCache::new(&releases, &http, "acme/build-cache");
        cache
            .store(&lazygit(), &Platform::new("linux", "amd64"), Path::new("/nonexistent"))
            .await
    }
}
