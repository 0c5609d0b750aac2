use crate::config::{BinaryEntry, Registry, Settings, validate_name};
use crate::error::{Error, Result};
use crate::lock::NameLock;
use crate::meta::{InstalledMeta, read_meta, remove_meta, write_meta};
use crate::platform::Platform;
use crate::provision::{Job, ProvisionContext, Toolchain, precheck, provision, required_tools};
use indicatif::ProgressBar;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// What happened to one entry during an ensure or install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The installed version already satisfied the pin.
    Current,
    Installed(InstalledMeta),
}

/// Keeps the install directory in line with the registry.
pub struct Installer {
    pub(crate) registry: Registry,
    pub(crate) context: ProvisionContext,
}

impl Installer {
    /// An installer targeting the host platform.
    pub fn new(registry: Registry, settings: Settings) -> Result<Self> {
        let context = ProvisionContext::new(settings, Platform::host(), CancellationToken::new())?;
        Ok(Self { registry, context })
    }

    /// Targets `platform` instead of the host.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.context.platform = platform;
        self
    }

    /// Aborts in-flight work once `cancel` fires.
    pub fn with_cancellation(self, cancel: CancellationToken) -> Result<Self> {
        let progress = self.context.progress.clone();
        let mut context = ProvisionContext::new(self.context.settings, self.context.platform, cancel)?;
        context.progress = progress;
        Ok(Self {
            registry: self.registry,
            context,
        })
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.context.progress = progress;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.context.settings
    }

    pub fn platform(&self) -> &Platform {
        &self.context.platform
    }

    /// Configured entries in declaration order.
    pub fn list(&self) -> &[BinaryEntry] {
        self.registry.entries()
    }

    /// Looks up a configured entry by name.
    pub fn entry(&self, name: &str) -> Result<&BinaryEntry> {
        let name = validate_name(name)?;
        self.registry
            .get(name)
            .ok_or_else(|| Error::BinaryNotFound(name.to_string()))
    }

    /// The install path for `name`. Never touches the filesystem or network.
    pub fn get(&self, name: &str) -> Result<PathBuf> {
        let entry = self.entry(name)?;
        Ok(self.context.install_path(&entry.name))
    }

    /// Installs every entry whose installed version does not match its pin,
    /// in declaration order. Stops at the first failure.
    ///
    /// Returns the names that were installed.
    #[tracing::instrument(skip(self))]
    pub async fn ensure(&self, verbose: bool) -> Result<Vec<String>> {
        let mut installed = Vec::new();
        for entry in self.registry.entries() {
            if let Outcome::Installed(_) = self.ensure_entry(entry, verbose, false, &[]).await? {
                installed.push(entry.name.clone());
            }
        }
        tracing::info!(installed = installed.len(), total = self.registry.len(), "Ensure finished");
        Ok(installed)
    }

    /// Installs `name` only if it is missing or stale.
    pub async fn ensure_one(&self, name: &str, verbose: bool) -> Result<Outcome> {
        let entry = self.entry(name)?;
        self.ensure_entry(entry, verbose, false, &[]).await
    }

    /// Installs `name` unconditionally, replacing any existing binary.
    pub async fn install(&self, name: &str, verbose: bool) -> Result<InstalledMeta> {
        let entry = self.entry(name)?;
        match self.ensure_entry(entry, verbose, true, &[]).await? {
            Outcome::Installed(meta) => Ok(meta),
            Outcome::Current => Err(Error::InvalidInput(format!("'{name}' was not reinstalled"))),
        }
    }

    /// Deletes the binary and its metadata. Returns whether anything was removed.
    ///
    /// Names no longer in the registry can be removed too, so orphaned
    /// installs can be cleaned up.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let name = validate_name(name)?;
        let install_path = self.context.install_path(name);
        let _lock = NameLock::acquire(&self.context.settings.install_dir, name).await?;

        let had_meta = read_meta(&install_path).is_some();
        let removed_binary = match fs::remove_file(&install_path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(Error::installation("cannot remove the binary", e)),
        };
        remove_meta(&install_path)?;

        let removed = removed_binary || had_meta;
        if removed {
            tracing::info!(path = %install_path.display(), "Removed binary");
        } else {
            tracing::debug!("Nothing to remove");
        }
        Ok(removed)
    }

    /// Whether the binary at `install_path` satisfies `entry`'s pin.
    pub(crate) fn is_current(entry: &BinaryEntry, install_path: &Path) -> bool {
        install_path.is_file() && crate::status::up_to_date(entry, read_meta(install_path).as_ref())
    }

    #[tracing::instrument(skip_all, fields(name = %entry.name, version = %entry.version, force = force))]
    async fn ensure_entry(
        &self,
        entry: &BinaryEntry,
        verbose: bool,
        force: bool,
        chain: &[String],
    ) -> Result<Outcome> {
        let install_path = self.context.install_path(&entry.name);
        if !force && Self::is_current(entry, &install_path) {
            tracing::debug!("Already up to date");
            return Ok(Outcome::Current);
        }

        precheck(entry, &self.context.platform)?;
        let tools = self.resolve_tools(entry, verbose, chain).await?;

        let install_dir = &self.context.settings.install_dir;
        let _lock = NameLock::acquire(install_dir, &entry.name).await?;
        // Another process may have finished the same install while we waited.
        if !force && Self::is_current(entry, &install_path) {
            tracing::debug!("Installed concurrently, skipping");
            return Ok(Outcome::Current);
        }

        // Scratch lives next to the install path so the final rename stays on
        // one filesystem. Dropping it removes it on every exit path.
        let scratch = tempfile::Builder::new()
            .prefix(&format!(".{}-", entry.name))
            .tempdir_in(install_dir)
            .map_err(|e| Error::installation("cannot create a scratch directory", e))?;

        let installed = provision(
            &self.context,
            &Job {
                entry,
                install_path: &install_path,
                scratch: scratch.path(),
                tools: &tools,
                verbose,
            },
        )
        .await?;

        let version = if entry.is_latest() {
            installed.version
        } else {
            entry.version.clone()
        };
        let meta = InstalledMeta {
            name: entry.name.clone(),
            version,
        };
        write_meta(&install_path, &meta)?;
        tracing::info!(version = %meta.version, path = %install_path.display(), "Installed binary");
        Ok(Outcome::Installed(meta))
    }

    /// Finds the host tools `entry` needs: registry entries are ensured first,
    /// anything else comes from `PATH`. Missing tools are left out; the
    /// strategy reports them when it actually needs them.
    async fn resolve_tools(&self, entry: &BinaryEntry, verbose: bool, chain: &[String]) -> Result<Toolchain> {
        let mut tools = Toolchain::default();
        for tool in required_tools(entry) {
            // Registry installs target `platform`, which only runs here when it is the host.
            let bootstrap = self
                .registry
                .get(tool)
                .filter(|dep| dep.name != entry.name && self.context.platform.is_host());
            if let Some(dep) = bootstrap {
                if chain.iter().any(|seen| *seen == dep.name) {
                    return Err(Error::Config(format!(
                        "toolchain cycle: {} -> {}",
                        chain.join(" -> "),
                        dep.name
                    )));
                }
                let mut next = chain.to_vec();
                next.push(entry.name.clone());
                tracing::debug!(tool, "Bootstrapping tool from the registry");
                Box::pin(self.ensure_entry(dep, verbose, false, &next)).await?;
                tools.insert(tool, self.context.install_path(&dep.name));
                continue;
            }
            match which::which(tool) {
                Ok(path) => {
                    tracing::debug!(tool, path = %path.display(), "Found tool on PATH");
                    tools.insert(tool, path);
                }
                Err(_) => tracing::debug!(tool, "Tool not found"),
            }
        }
        Ok(tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use tempfile::tempdir;
    use wiremock::matchers::any;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registry() -> Registry {
        let file = ConfigFile::parse(
            r#"{"binaries": [{
                "name": "task",
                "repo": "go-task/task",
                "version": "v3.44.1",
                "source": "release-archive",
                "assets": [{"os": "linux", "arch": "amd64", "match": "task_linux_amd64\\.tar\\.gz$"}]
            }]}"#,
        )
        .unwrap();
        Registry::new(file.binaries).unwrap()
    }

    fn installer(dir: &Path, platform: Platform) -> Installer {
        Installer::new(registry(), Settings::new(dir))
            .unwrap()
            .with_platform(platform)
    }

    #[test]
    fn get_is_pure_and_platform_suffixed() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("bin");
        let linux = installer(&bin, Platform::new("linux", "amd64"));
        let windows = installer(&bin, Platform::new("windows", "amd64"));

        assert_eq!(linux.get("task").unwrap(), bin.join("task"));
        assert_eq!(linux.get("task").unwrap(), linux.get("task").unwrap());
        assert_eq!(windows.get("task").unwrap(), bin.join("task.exe"));
        assert!(!bin.exists());
    }

    #[test]
    fn get_validates_the_name() {
        let dir = tempdir().unwrap();
        let installer = installer(dir.path(), Platform::new("linux", "amd64"));
        assert!(matches!(installer.get(""), Err(Error::InvalidInput(_))));
        assert!(matches!(installer.get("   "), Err(Error::InvalidInput(_))));
        assert!(matches!(installer.get("nonexistent-xyz"), Err(Error::BinaryNotFound(_))));
    }

    #[tokio::test]
    async fn current_installs_are_skipped_without_network() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir()?;
        let mut settings = Settings::new(dir.path());
        settings.api_base = server.uri();
        let installer = Installer::new(registry(), settings)?.with_platform(Platform::new("linux", "amd64"));

        let path = installer.get("task")?;
        fs::write(&path, "task")?;
        write_meta(&path, &InstalledMeta {
            name: "task".into(),
            version: "v3.44.1".into(),
        })?;

        assert!(installer.ensure(false).await?.is_empty());
        assert_eq!(installer.ensure_one("task", false).await?, Outcome::Current);
        Ok(())
    }

    #[tokio::test]
    async fn remove_deletes_binary_and_metadata() -> Result<()> {
        let dir = tempdir()?;
        let installer = installer(dir.path(), Platform::new("linux", "amd64"));
        let path = installer.get("task")?;
        fs::write(&path, "task")?;
        write_meta(&path, &InstalledMeta {
            name: "task".into(),
            version: "v3.44.1".into(),
        })?;

        assert!(installer.remove("task").await?);
        assert!(!path.exists());
        assert!(read_meta(&path).is_none());
        // Removing again is a no-op.
        assert!(!installer.remove("task").await?);
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_platform_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("bin");
        let installer = installer(&bin, Platform::new("darwin", "arm64"));
        let err = installer.ensure(false).await.unwrap_err();
        assert!(matches!(err.root(), Error::UnsupportedPlatform { .. }));
        assert!(err.to_string().starts_with("task: asset selection failed"));

        // Rejected before any lock, scratch directory or install directory exists.
        assert!(!bin.exists());
    }
}
