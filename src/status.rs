//! Status reporting and best-effort upgrades.

use crate::config::{AcquisitionType, BinaryEntry, validate_name};
use crate::error::{Error, Result};
use crate::installer::Installer;
use crate::meta::{InstalledMeta, meta_path, read_meta, scan_installed};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Whether `meta` satisfies `entry`'s pin. A "latest" pin is satisfied by any
/// recorded install.
pub fn up_to_date(entry: &BinaryEntry, meta: Option<&InstalledMeta>) -> bool {
    match meta {
        Some(_) if entry.is_latest() => true,
        Some(meta) => meta.version == entry.version,
        None => false,
    }
}

/// A joined view of the registry, the filesystem, and the metadata sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryStatus {
    pub name: String,
    /// Present in the registry. Orphaned installs report `false`.
    pub configured: bool,
    pub installed: bool,
    pub configured_version: Option<String>,
    pub installed_version: Option<String>,
    pub up_to_date: bool,
    pub path: PathBuf,
    pub size: Option<u64>,
    pub modified: Option<SystemTime>,
    pub source: Option<AcquisitionType>,
}

impl BinaryStatus {
    fn inspect(name: &str, entry: Option<&BinaryEntry>, path: PathBuf) -> Self {
        let meta = read_meta(&path);
        let stat = fs::metadata(&path).ok().filter(|m| m.is_file());
        let installed = stat.is_some();
        Self {
            name: name.to_string(),
            configured: entry.is_some(),
            installed,
            configured_version: entry.map(|e| e.version.clone()),
            installed_version: meta.as_ref().map(|m| m.version.clone()),
            up_to_date: installed && entry.is_some_and(|e| up_to_date(e, meta.as_ref())),
            size: stat.as_ref().map(|m| m.len()),
            modified: stat.as_ref().and_then(|m| m.modified().ok()),
            source: entry.map(|e| e.source),
            path,
        }
    }
}

/// Tally of an [`Installer::upgrade_all`] run.
#[derive(Debug, Default)]
pub struct UpgradeSummary {
    pub upgraded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl UpgradeSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Installer {
    /// Status of one binary, configured or orphaned.
    #[tracing::instrument(skip(self))]
    pub fn status(&self, name: &str) -> Result<BinaryStatus> {
        let name = validate_name(name)?;
        let path = self.context.install_path(name);
        match self.registry.get(name) {
            Some(entry) => Ok(BinaryStatus::inspect(name, Some(entry), path)),
            None if meta_path(&path).exists() => Ok(BinaryStatus::inspect(name, None, path)),
            None => Err(Error::BinaryNotFound(name.to_string())),
        }
    }

    /// Status of every configured binary in declaration order, followed by
    /// any installs the registry no longer mentions.
    pub fn status_all(&self) -> Result<Vec<BinaryStatus>> {
        let mut statuses: Vec<_> = self
            .registry
            .entries()
            .iter()
            .map(|entry| BinaryStatus::inspect(&entry.name, Some(entry), self.context.install_path(&entry.name)))
            .collect();

        for path in scan_installed(&self.context.settings.install_dir)? {
            let Some(name) = orphan_name(&path, self.context.platform.exe_suffix()) else {
                continue;
            };
            if self.registry.get(&name).is_none() {
                tracing::debug!(%name, "Found orphaned install");
                statuses.push(BinaryStatus::inspect(&name, None, path));
            }
        }
        Ok(statuses)
    }

    /// Reinstalls `name` if it is missing or stale. Returns whether it was upgraded.
    pub async fn upgrade(&self, name: &str, verbose: bool) -> Result<bool> {
        let entry = self.entry(name)?;
        if Self::is_current(entry, &self.context.install_path(&entry.name)) {
            tracing::debug!(name, "Already up to date");
            return Ok(false);
        }
        self.install(name, verbose).await?;
        Ok(true)
    }

    /// Upgrades every stale or missing binary, carrying on past failures.
    ///
    /// Cancellation stops the run early; the cancelled entry is reported as failed.
    #[tracing::instrument(skip(self))]
    pub async fn upgrade_all(&self, verbose: bool) -> UpgradeSummary {
        let mut summary = UpgradeSummary::default();
        for entry in self.registry.entries() {
            match self.upgrade(&entry.name, verbose).await {
                Ok(true) => summary.upgraded.push(entry.name.clone()),
                Ok(false) => summary.skipped.push(entry.name.clone()),
                Err(e) => {
                    tracing::warn!(name = %entry.name, error = %e, "Upgrade failed");
                    let cancelled = matches!(e.root(), Error::Cancelled);
                    summary.failed.push((entry.name.clone(), e));
                    if cancelled {
                        break;
                    }
                }
            }
        }
        tracing::info!(
            upgraded = summary.upgraded.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "Upgrade finished"
        );
        summary
    }
}

/// The registry name an install path belongs to.
fn orphan_name(path: &Path, exe_suffix: &str) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let name = file_name.strip_suffix(exe_suffix).unwrap_or(file_name);
    validate_name(name).ok().map(String::from)
}
