//! Registry configuration.
//!
//! The registry is a JSON document listing every binary this installer
//! manages, plus a handful of optional settings. It is loaded once per
//! process and treated as immutable afterwards.

use crate::error::{Error, Result};
use crate::platform::{Platform, VALIDATION_MATRIX};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// The registry shipped with the binary, used when no `--config` is given.
pub const DEFAULT_REGISTRY: &str = include_str!("../registry/binaries.json");

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_GIT_BASE: &str = "https://github.com";
pub const LATEST: &str = "latest";

/// How a binary is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcquisitionType {
    ReleaseArchive,
    BuildFromSource,
    PackageManager,
    VendorApi,
}

impl AcquisitionType {
    fn needs_package(self) -> bool {
        matches!(self, Self::BuildFromSource | Self::PackageManager)
    }
}

impl fmt::Display for AcquisitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReleaseArchive => "release-archive",
            Self::BuildFromSource => "build-from-source",
            Self::PackageManager => "package-manager",
            Self::VendorApi => "vendor-api",
        })
    }
}

/// Package managers the package-manager strategy can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerKind {
    #[default]
    Go,
    Cargo,
}

impl ManagerKind {
    /// The executable that has to be present to use this manager.
    pub fn tool(self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::Cargo => "cargo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRule {
    pub os: String,
    pub arch: String,
    #[serde(rename = "match")]
    pub pattern: String,
}

impl AssetRule {
    pub fn applies_to(&self, platform: &Platform) -> bool {
        Platform::new(&self.os, &self.arch) == *platform
    }
}

/// A configured dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryEntry {
    pub name: String,
    #[serde(default)]
    pub repo: String,
    pub version: String,
    pub source: AcquisitionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<AssetRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_url: Option<String>,
    /// File to look for when it differs from `name` (e.g. ripgrep ships `rg`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<ManagerKind>,
    /// The build links native code and cannot target another platform.
    #[serde(default)]
    pub cgo: bool,
}

impl BinaryEntry {
    pub fn binary_name(&self) -> &str {
        self.binary.as_deref().unwrap_or(&self.name)
    }

    pub fn is_latest(&self) -> bool {
        self.version == LATEST
    }

    pub fn package_path(&self) -> &str {
        self.package.as_deref().unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::Config(format!("binary '{}': {msg}", self.name)));

        if self.version.trim().is_empty() {
            return bad("version must not be empty".into());
        }

        let has_package = self.package.as_deref().is_some_and(|p| !p.trim().is_empty());
        if self.source.needs_package() && !has_package {
            return bad(format!("'package' is required for {} entries", self.source));
        }
        if !self.source.needs_package() && self.package.is_some() {
            return bad(format!("'package' must be empty for {} entries", self.source));
        }

        if self.source == AcquisitionType::ReleaseArchive {
            if self.assets.is_empty() {
                return bad("release-archive entries need at least one asset rule".into());
            }
            let covers_matrix = self.assets.iter().any(|rule| {
                VALIDATION_MATRIX
                    .iter()
                    .any(|(os, arch)| rule.applies_to(&Platform::new(os, arch)))
            });
            if !covers_matrix {
                return bad("no asset rule targets a supported platform".into());
            }
        } else if !self.assets.is_empty() {
            return bad(format!("'assets' must be empty for {} entries", self.source));
        }

        for rule in &self.assets {
            if let Err(e) = Regex::new(&rule.pattern) {
                return bad(format!("invalid asset pattern '{}': {e}", rule.pattern));
            }
        }

        if matches!(
            self.source,
            AcquisitionType::ReleaseArchive | AcquisitionType::BuildFromSource
        ) && !self.repo.contains('/')
        {
            return bad(format!("'repo' must be in owner/project form, got '{}'", self.repo));
        }

        if self.source == AcquisitionType::VendorApi && self.release_url.is_none() {
            return bad("'release_url' is required for vendor-api entries".into());
        }
        if self.manager.is_some() && self.source != AcquisitionType::PackageManager {
            return bad("'manager' only applies to package-manager entries".into());
        }

        Ok(())
    }
}

/// Checks that `name` is usable as a registry key and file name.
pub fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("binary name must not be empty".into()));
    }
    if trimmed != name
        || name.contains(['/', '\\'])
        || name == "."
        || name == ".."
        || name.starts_with('.')
    {
        return Err(Error::InvalidInput(format!("'{name}' is not a valid binary name")));
    }
    Ok(name)
}

/// The validated, immutable list of configured binaries.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<BinaryEntry>,
}

impl Registry {
    pub fn new(entries: Vec<BinaryEntry>) -> Result<Self> {
        let mut seen = HashSet::new();
        for entry in &entries {
            validate_name(&entry.name).map_err(|e| Error::Config(e.to_string()))?;
            if !seen.insert(entry.name.as_str()) {
                return Err(Error::Config(format!("duplicate binary name '{}'", entry.name)));
            }
            entry.validate()?;
            tracing::debug!(name = %entry.name, source = %entry.source, version = %entry.version, "Registered binary");
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[BinaryEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&BinaryEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The on-disk registry document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub install_dir: Option<String>,
    pub cache_repo: Option<String>,
    pub api_base: Option<String>,
    pub git_base: Option<String>,
    pub retries: Option<usize>,
    #[serde(default)]
    pub binaries: Vec<BinaryEntry>,
}

impl ConfigFile {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    #[tracing::instrument(skip(path), fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        tracing::trace!(bytes = raw.len(), "Read configuration file");
        Self::parse(&raw)
    }

    pub fn builtin() -> Result<Self> {
        Self::parse(DEFAULT_REGISTRY)
    }
}

/// Runtime settings shared by every install.
#[derive(Debug, Clone)]
pub struct Settings {
    pub install_dir: PathBuf,
    /// Base URL of the releases API (GitHub-compatible).
    pub api_base: String,
    /// Base URL repositories are cloned from.
    pub git_base: String,
    /// `owner/repo` used as the remote build cache, if any.
    pub cache_repo: Option<String>,
    pub token: Option<String>,
    /// Extra attempts for transient network failures.
    pub retries: usize,
}

impl Settings {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            git_base: DEFAULT_GIT_BASE.to_string(),
            cache_repo: None,
            token: None,
            retries: 3,
        }
    }

    /// Default install directory: `~/.toolpin/bin`.
    pub fn default_install_dir() -> PathBuf {
        PathBuf::from(shellexpand::tilde("~/.toolpin/bin").to_string())
    }

    /// Layers the document's settings over `self`.
    pub fn apply(mut self, file: &ConfigFile) -> Self {
        if let Some(dir) = &file.install_dir {
            self.install_dir = PathBuf::from(shellexpand::tilde(dir).to_string());
        }
        if let Some(api) = &file.api_base {
            self.api_base = api.trim_end_matches('/').to_string();
        }
        if let Some(git) = &file.git_base {
            self.git_base = git.trim_end_matches('/').to_string();
        }
        if file.cache_repo.is_some() {
            self.cache_repo = file.cache_repo.clone();
        }
        if let Some(retries) = file.retries {
            self.retries = retries;
        }
        self
    }

    /// Picks up a token from `GITHUB_TOKEN` or `GH_TOKEN`.
    pub fn with_env_token(mut self) -> Self {
        self.token = std::env::var("GITHUB_TOKEN")
            .or_else(|_| std::env::var("GH_TOKEN"))
            .ok()
            .filter(|t| !t.is_empty());
        self
    }
}
