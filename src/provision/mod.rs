use crate::config::{AcquisitionType, BinaryEntry, Settings};
use crate::download::Downloader;
use crate::error::{Error, Phase, PhaseExt, Result};
use crate::github::Releases;
use crate::platform::Platform;
use indicatif::ProgressBar;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

// --- Module Declarations ---
pub mod build;
pub mod cache;
pub mod package;
pub mod release;
pub mod vendor;

use build::BuildFromSource;
use cache::BuildCache;
use package::PackageManager;
use release::ReleaseArchive;
use vendor::VendorApi;

// --- Strategy Trait ---
/// One way of acquiring a binary.
///
/// Implementations work only inside `job.scratch`, and move the finished
/// binary to `job.install_path` as their very last step.
pub trait Strategy: Send + Sync {
    async fn install(&self, context: &ProvisionContext, job: &Job<'_>) -> Result<Installed>;
}

/// Shared, read-only state for every install.
#[derive(Clone)]
pub struct ProvisionContext {
    pub settings: Settings,
    pub platform: Platform,
    pub http: Downloader,
    pub releases: Releases,
    pub cancel: CancellationToken,
    pub progress: ProgressBar,
}

impl ProvisionContext {
    pub fn new(settings: Settings, platform: Platform, cancel: CancellationToken) -> Result<Self> {
        let http = Downloader::new(settings.retries, cancel.clone())?
            .with_token(settings.token.clone(), &settings.api_base)?;
        let releases = Releases::new(http.clone(), &settings.api_base);
        Ok(Self {
            settings,
            platform,
            http,
            releases,
            cancel,
            progress: ProgressBar::hidden(),
        })
    }

    /// The remote build cache, when one is configured.
    pub fn cache(&self) -> Option<BuildCache<'_>> {
        self.settings
            .cache_repo
            .as_deref()
            .map(|repo| BuildCache::new(&self.releases, &self.http, repo))
    }

    /// `<install_dir>/<name>[.exe]`
    pub fn install_path(&self, name: &str) -> PathBuf {
        self.settings
            .install_dir
            .join(self.platform.executable_name(name))
    }
}

/// Host tools a strategy may shell out to, resolved before it runs.
#[derive(Debug, Clone, Default)]
pub struct Toolchain {
    paths: HashMap<String, PathBuf>,
}

impl Toolchain {
    pub fn insert(&mut self, tool: &str, path: PathBuf) {
        self.paths.insert(tool.to_string(), path);
    }

    pub fn require(&self, tool: &str) -> Result<&Path> {
        self.paths
            .get(tool)
            .map(PathBuf::as_path)
            .ok_or_else(|| Error::ToolUnavailable(tool.to_string()))
    }
}

/// Everything a strategy needs for a single install attempt.
pub struct Job<'a> {
    pub entry: &'a BinaryEntry,
    pub install_path: &'a Path,
    pub scratch: &'a Path,
    pub tools: &'a Toolchain,
    pub verbose: bool,
}

/// What a successful strategy reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    /// The version actually installed; differs from the pin only for "latest".
    pub version: String,
}

/// Host tools `entry`'s strategy shells out to.
pub fn required_tools(entry: &BinaryEntry) -> Vec<&'static str> {
    match entry.source {
        AcquisitionType::BuildFromSource => vec!["git", "go"],
        AcquisitionType::PackageManager => vec![entry.manager.unwrap_or_default().tool()],
        AcquisitionType::ReleaseArchive | AcquisitionType::VendorApi => vec![],
    }
}

/// Checks that need neither the network nor the install directory.
pub fn precheck(entry: &BinaryEntry, platform: &Platform) -> Result<()> {
    match entry.source {
        AcquisitionType::ReleaseArchive => release::check_platform(entry, platform),
        _ => Ok(()),
    }
}

// --- Dispatch ---
#[tracing::instrument(skip_all, fields(name = %job.entry.name, source = %job.entry.source))]
pub async fn provision(context: &ProvisionContext, job: &Job<'_>) -> Result<Installed> {
    match job.entry.source {
        AcquisitionType::ReleaseArchive => ReleaseArchive.install(context, job).await,
        AcquisitionType::BuildFromSource => BuildFromSource.install(context, job).await,
        AcquisitionType::PackageManager => PackageManager.install(context, job).await,
        AcquisitionType::VendorApi => VendorApi.install(context, job).await,
    }
}

// --- Helper Functions ---

/// Finds `binary` (or `binary` plus the executable suffix) under `dir`,
/// preferring the shallowest match.
#[tracing::instrument(skip(dir, platform), fields(dir = %dir.display()))]
pub fn locate_binary(dir: &Path, binary: &str, platform: &Platform) -> Result<PathBuf> {
    let wanted = [platform.executable_name(binary), binary.to_string()];
    let mut pending = vec![dir.to_path_buf()];

    // Breadth-first so a top-level binary wins over a nested copy.
    while !pending.is_empty() {
        let mut next = Vec::new();
        let mut found: Option<PathBuf> = None;
        for current in pending {
            let mut children: Vec<_> = fs::read_dir(&current)?.collect::<std::io::Result<_>>()?;
            children.sort_by_key(|e| e.file_name());
            for child in children {
                let path = child.path();
                let file_type = child.file_type()?;
                if file_type.is_dir() {
                    next.push(path);
                    continue;
                }
                let Some(file_name) = path.file_name().and_then(OsStr::to_str) else {
                    continue;
                };
                if wanted[0] == file_name {
                    tracing::debug!(path = %path.display(), "Located binary");
                    return Ok(path);
                }
                if found.is_none() && wanted[1] == file_name {
                    found = Some(path);
                }
            }
        }
        if let Some(path) = found {
            tracing::debug!(path = %path.display(), "Located binary");
            return Ok(path);
        }
        pending = next;
    }

    Err(Error::BinaryNotLocated {
        binary: binary.to_string(),
        searched: dir.to_path_buf(),
    })
}

/// Makes `src` executable and moves it over `dest`.
///
/// The rename is the last step, so `dest` is either the old binary or the
/// complete new one. Across filesystems the file is first copied next to
/// `dest` and then renamed.
#[tracing::instrument(skip_all, fields(src = %src.display(), dest = %dest.display()))]
pub fn place_binary(name: &str, src: &Path, dest: &Path) -> Result<()> {
    #[cfg(unix)]
    fs::set_permissions(src, fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::installation("cannot mark the binary executable", e))
        .during(name, Phase::Permission)?;

    let dest_dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dest_dir)
        .map_err(|e| Error::installation("cannot create the install directory", e))
        .during(name, Phase::Move)?;

    if fs::rename(src, dest).is_ok() {
        tracing::debug!("Moved binary into place");
        return Ok(());
    }

    let staged = dest_dir.join(format!(".{name}.partial"));
    let result = fs::copy(src, &staged).and_then(|_| {
        #[cfg(unix)]
        fs::set_permissions(&staged, fs::Permissions::from_mode(0o755))?;
        fs::rename(&staged, dest)
    });
    if let Err(e) = result {
        let _ = fs::remove_file(&staged);
        return Err(Error::installation("cannot move the binary into place", e))
            .during(name, Phase::Move);
    }
    tracing::debug!("Copied binary into place");
    Ok(())
}

/// Runs `command`, killing it if the operation is cancelled.
///
/// Output is captured unless `verbose`, in which case it streams to the
/// terminal. A non-zero exit becomes [`Error::BuildFailed`].
pub async fn run_command(
    mut command: Command,
    cancel: &CancellationToken,
    verbose: bool,
) -> Result<Output> {
    let shown = describe(&command);
    tracing::debug!(command = %shown, "Running command");

    command.kill_on_drop(true).stdin(Stdio::null());
    if verbose {
        command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    } else {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    }

    let child = command.spawn().map_err(|e| Error::BuildFailed {
        command: shown.clone(),
        status: "failed to start".to_string(),
        stderr: e.to_string(),
    })?;

    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        output = child.wait_with_output() => output?,
    };

    if !output.status.success() {
        return Err(Error::BuildFailed {
            command: shown,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

fn describe(command: &Command) -> String {
    let std = command.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn locates_the_shallowest_binary() -> Result<()> {
        let dir = tempdir()?;
        fs::create_dir_all(dir.path().join("gh_2.74.0_linux_amd64/bin"))?;
        fs::create_dir_all(dir.path().join("deep/er/bin"))?;
        fs::write(dir.path().join("gh_2.74.0_linux_amd64/bin/gh"), "gh")?;
        fs::write(dir.path().join("deep/er/bin/gh"), "decoy")?;
        fs::write(dir.path().join("gh.1"), "manpage")?;

        let found = locate_binary(dir.path(), "gh", &Platform::new("linux", "amd64"))?;
        assert_eq!(found, dir.path().join("gh_2.74.0_linux_amd64/bin/gh"));
        Ok(())
    }

    #[test]
    fn prefers_the_windows_executable_name() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("task"), "shell wrapper")?;
        fs::write(dir.path().join("task.exe"), "MZ")?;

        let found = locate_binary(dir.path(), "task", &Platform::new("windows", "amd64"))?;
        assert_eq!(found, dir.path().join("task.exe"));
        Ok(())
    }

    #[test]
    fn missing_binary_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("README.md"), "").unwrap();
        let err = locate_binary(dir.path(), "task", &Platform::new("linux", "amd64")).unwrap_err();
        assert!(matches!(err, Error::BinaryNotLocated { .. }));
    }

    #[test]
    fn place_binary_replaces_the_destination() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("scratch-task");
        let dest = dir.path().join("bin").join("task");
        fs::create_dir_all(dest.parent().unwrap())?;
        fs::write(&dest, "old")?;
        fs::write(&src, "new")?;

        place_binary("task", &src, &dest)?;
        assert_eq!(fs::read_to_string(&dest)?, "new");
        assert!(!src.exists());

        #[cfg(unix)]
        assert_eq!(fs::metadata(&dest)?.permissions().mode() & 0o777, 0o755);
        Ok(())
    }

    #[test]
    fn required_tools_follow_the_source() {
        let entry: BinaryEntry = serde_json::from_value(serde_json::json!({
            "name": "cargo-nextest",
            "version": "0.9.99",
            "source": "package-manager",
            "manager": "cargo",
            "package": "cargo-nextest"
        }))
        .unwrap();
        assert_eq!(required_tools(&entry), vec!["cargo"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_commands_report_stderr() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo boom >&2; exit 3"]);
        let err = run_command(command, &CancellationToken::new(), false)
            .await
            .unwrap_err();
        match err {
            Error::BuildFailed { stderr, command, .. } => {
                assert_eq!(stderr, "boom");
                assert!(command.starts_with("sh -c"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
