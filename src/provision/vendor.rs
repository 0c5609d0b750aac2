//! Vendor-hosted distributions.
//!
//! The vendor serves a plain-text `latest` pointer, a per-version
//! `manifest.json` with a SHA-256 checksum for each platform, and the
//! binaries themselves:
//!
//! ```text
//! {release_url}/latest
//! {release_url}/{version}/manifest.json
//! {release_url}/{version}/{platform}/{name}[.exe]
//! ```

use super::{Installed, Job, ProvisionContext, Strategy, place_binary};
use crate::error::{Error, Phase, PhaseExt, Result};
use crate::platform::Platform;
use console::style;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

pub struct VendorApi;

#[derive(Debug, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub version: Option<String>,
    pub platforms: HashMap<String, PlatformBuild>,
}

#[derive(Debug, Deserialize)]
pub struct PlatformBuild {
    pub checksum: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl Manifest {
    /// The manifest key and build for `platform`, trying each naming style.
    pub fn build_for(&self, platform: &Platform) -> Option<(String, &PlatformBuild)> {
        platform
            .vendor_keys()
            .into_iter()
            .find_map(|key| self.platforms.get(&key).map(|build| (key, build)))
    }
}

impl Strategy for VendorApi {
    #[tracing::instrument(skip_all, fields(name = %job.entry.name, version = %job.entry.version))]
    async fn install(&self, context: &ProvisionContext, job: &Job<'_>) -> Result<Installed> {
        let entry = job.entry;
        let name = entry.name.as_str();
        let platform = &context.platform;
        let base = entry
            .release_url
            .as_deref()
            .ok_or_else(|| Error::Config(format!("binary '{name}' has no release_url")))?
            .trim_end_matches('/');

        let version = if entry.is_latest() {
            let latest = context
                .http
                .get_text(&format!("{base}/latest"))
                .await
                .during(name, Phase::MetadataFetch)?;
            latest.trim().to_string()
        } else {
            entry.version.clone()
        };
        if version.is_empty() {
            return Err(Error::InvalidInput("vendor reported an empty latest version".into()))
                .during(name, Phase::MetadataFetch);
        }

        context
            .progress
            .set_message(format!("Resolving {} {}...", style(name).bold(), version));
        let manifest: Manifest = context
            .http
            .get_json(&format!("{base}/{version}/manifest.json"))
            .await
            .during(name, Phase::MetadataFetch)?;
        if let Some(listed) = manifest.version.as_deref().filter(|listed| *listed != version) {
            tracing::warn!(%listed, "Manifest lists a different version");
        }

        let (key, build) = manifest
            .build_for(platform)
            .ok_or_else(|| Error::UnsupportedPlatform {
                os: platform.os.clone(),
                arch: platform.arch.clone(),
            })
            .during(name, Phase::AssetSelection)?;

        let file_name = platform.executable_name(entry.binary_name());
        let url = format!("{base}/{version}/{key}/{file_name}");
        let download_path = job.scratch.join(&file_name);
        let written = context
            .http
            .download(&url, &download_path, &context.progress)
            .await
            .during(name, Phase::Download)?;
        if let Some(size) = build.size.filter(|size| *size != written) {
            tracing::warn!(expected = size, actual = written, "Downloaded size differs from manifest");
        }

        let actual = sha256_file(download_path.clone()).await.during(name, Phase::Checksum)?;
        if !actual.eq_ignore_ascii_case(build.checksum.trim()) {
            return Err(Error::ChecksumMismatch {
                expected: build.checksum.clone(),
                actual,
            })
            .during(name, Phase::Checksum);
        }
        tracing::debug!(checksum = %actual, "Checksum verified");

        place_binary(name, &download_path, job.install_path)?;
        tracing::info!(%version, platform = %key, "Installed vendor build");
        Ok(Installed { version })
    }
}

/// Hex-encoded SHA-256 of the file at `path`, hashed on the blocking pool.
pub async fn sha256_file(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
