use super::{Installed, Job, ProvisionContext, Strategy, locate_binary, place_binary, run_command};
use crate::config::{BinaryEntry, ManagerKind};
use crate::error::{Error, Phase, PhaseExt, Result};
use crate::platform::Platform;
use console::style;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Installs through a language package manager (`go install`, `cargo install`).
pub struct PackageManager;

/// A package manager invocation and where its output lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageCommand {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
    /// Directories searched for the binary, in order.
    pub bin_dirs: Vec<PathBuf>,
}

impl PackageCommand {
    pub fn new(entry: &BinaryEntry, platform: &Platform, scratch: &Path) -> Result<Self> {
        match entry.manager.unwrap_or_default() {
            ManagerKind::Go => Ok(Self::go(entry, platform, scratch)),
            ManagerKind::Cargo => Self::cargo(entry, platform, scratch),
        }
    }

    fn go(entry: &BinaryEntry, platform: &Platform, scratch: &Path) -> Self {
        let gopath = scratch.join("gopath");
        let bin = gopath.join("bin");
        Self {
            args: vec!["install".into(), format!("{}@{}", entry.package_path(), entry.version)],
            env: vec![
                ("GOPATH".into(), gopath.to_string_lossy().into_owned()),
                ("GOFLAGS".into(), "-modcacherw".into()),
                ("GOOS".into(), platform.os.clone()),
                ("GOARCH".into(), platform.arch.clone()),
                ("CGO_ENABLED".into(), "0".into()),
            ],
            // A GOBIN from the environment would redirect cross builds away from GOPATH.
            env_remove: vec!["GOBIN".into()],
            // Cross-compiled installs land in bin/<os>_<arch>.
            bin_dirs: vec![bin.join(format!("{}_{}", platform.os, platform.arch)), bin],
        }
    }

    fn cargo(entry: &BinaryEntry, platform: &Platform, scratch: &Path) -> Result<Self> {
        if !platform.is_host() {
            return Err(Error::CrossCompileUnsupported {
                target: platform.to_string(),
                reason: "cargo install only builds for the host".into(),
            });
        }
        let root = scratch.join("root");
        let mut args = vec![
            "install".to_string(),
            "--root".into(),
            root.to_string_lossy().into_owned(),
            "--locked".into(),
        ];
        if !entry.is_latest() {
            args.push("--version".into());
            args.push(entry.version.trim_start_matches('v').to_string());
        }
        args.push(entry.package_path().to_string());
        Ok(Self {
            args,
            env: vec![],
            env_remove: vec![],
            bin_dirs: vec![root.join("bin")],
        })
    }
}

impl Strategy for PackageManager {
    #[tracing::instrument(skip_all, fields(name = %job.entry.name, version = %job.entry.version))]
    async fn install(&self, context: &ProvisionContext, job: &Job<'_>) -> Result<Installed> {
        let entry = job.entry;
        let name = entry.name.as_str();
        let platform = &context.platform;
        let manager = entry.manager.unwrap_or_default();

        let plan = PackageCommand::new(entry, platform, job.scratch).during(name, Phase::PackageInstall)?;
        let tool = job.tools.require(manager.tool()).during(name, Phase::PackageInstall)?;

        context.progress.set_message(format!(
            "Installing {} with {}...",
            style(entry.package_path()).bold(),
            manager.tool()
        ));
        let mut command = Command::new(tool);
        command.args(&plan.args).current_dir(job.scratch).envs(plan.env.iter().cloned());
        for key in &plan.env_remove {
            command.env_remove(key);
        }
        run_command(command, &context.cancel, job.verbose)
            .await
            .during(name, Phase::PackageInstall)?;

        let binary = plan
            .bin_dirs
            .iter()
            .filter(|dir| dir.is_dir())
            .find_map(|dir| locate_binary(dir, entry.binary_name(), platform).ok())
            .ok_or_else(|| Error::BinaryNotLocated {
                binary: entry.binary_name().to_string(),
                searched: job.scratch.to_path_buf(),
            })
            .during(name, Phase::LocateBinary)?;

        place_binary(name, &binary, job.install_path)?;
        tracing::info!(manager = manager.tool(), package = entry.package_path(), "Installed package");
        Ok(Installed {
            version: entry.version.clone(),
        })
    }
}
