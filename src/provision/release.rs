use super::{Installed, Job, ProvisionContext, Strategy, locate_binary, place_binary};
use crate::archive::{ArchiveFormat, extract_blocking};
use crate::config::BinaryEntry;
use crate::error::{Error, Phase, PhaseExt, Result};
use crate::platform::Platform;
use crate::select::select_asset;
use console::style;
use std::path::Path;

/// Prebuilt binaries attached to a tagged release.
pub struct ReleaseArchive;

/// Fails unless some asset rule applies to `platform`.
pub fn check_platform(entry: &BinaryEntry, platform: &Platform) -> Result<()> {
    if entry.assets.iter().any(|rule| rule.applies_to(platform)) {
        return Ok(());
    }
    Err(Error::UnsupportedPlatform {
        os: platform.os.clone(),
        arch: platform.arch.clone(),
    })
    .during(&entry.name, Phase::AssetSelection)
}

impl Strategy for ReleaseArchive {
    #[tracing::instrument(skip_all, fields(name = %job.entry.name, version = %job.entry.version))]
    async fn install(&self, context: &ProvisionContext, job: &Job<'_>) -> Result<Installed> {
        let entry = job.entry;
        let name = entry.name.as_str();
        let platform = &context.platform;

        // Fail on unsupported platforms before touching the network.
        check_platform(entry, platform)?;

        context
            .progress
            .set_message(format!("Resolving {} {}...", style(name).bold(), entry.version));
        let release = context
            .releases
            .fetch(&entry.repo, &entry.version)
            .await
            .during(name, Phase::MetadataFetch)?;

        let asset_name = select_asset(&release.asset_names(), &entry.assets, platform)
            .during(name, Phase::AssetSelection)?;
        let asset = release
            .asset(&asset_name)
            .ok_or_else(|| Error::InvalidInput(format!("asset '{asset_name}' vanished from the release")))
            .during(name, Phase::AssetSelection)?;

        let download_path = job.scratch.join(&asset_name);
        context
            .http
            .download(&asset.download_url, &download_path, &context.progress)
            .await
            .during(name, Phase::Download)?;

        let binary = if ArchiveFormat::detect(&download_path).is_some() {
            context
                .progress
                .set_message(format!("Extracting {}...", style(&asset_name).bold()));
            let unpacked = job.scratch.join("unpacked");
            extract_blocking(download_path.clone(), unpacked.clone(), context.cancel.clone())
                .await
                .during(name, Phase::Extraction)?;
            locate_binary(&unpacked, entry.binary_name(), platform).during(name, Phase::LocateBinary)?
        } else if is_raw_binary(&asset_name) {
            tracing::debug!(asset = %asset_name, "Asset is a bare executable");
            download_path
        } else {
            return Err(Error::UnsupportedArchiveFormat(download_path)).during(name, Phase::Extraction);
        };

        place_binary(name, &binary, job.install_path)?;
        tracing::info!(tag = %release.tag_name, asset = %asset_name, "Installed from release");
        Ok(Installed {
            version: release.tag_name,
        })
    }
}

/// Assets with no extension, `.exe`, or a version-like "extension" such as
/// `jq-1.7.1-linux` are executables rather than archives.
fn is_raw_binary(asset_name: &str) -> bool {
    match Path::new(asset_name).extension().and_then(|e| e.to_str()) {
        None => true,
        Some(ext) => ext.eq_ignore_ascii_case("exe") || !ext.chars().all(|c| c.is_ascii_alphabetic()),
    }
}
