use super::{Installed, Job, ProvisionContext, Strategy, locate_binary, place_binary, run_command};
use crate::config::BinaryEntry;
use crate::error::{Error, Phase, PhaseExt, Result};
use crate::platform::Platform;
use console::style;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Clones the repository and compiles it with the Go toolchain.
pub struct BuildFromSource;

/// The commands a source build runs, computed up front so they can be
/// inspected without executing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub clone_args: Vec<String>,
    pub build_args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub checkout: PathBuf,
    pub output: PathBuf,
}

impl BuildPlan {
    pub fn new(entry: &BinaryEntry, platform: &Platform, git_base: &str, scratch: &Path) -> Self {
        let checkout = scratch.join("src");
        let output = scratch.join("out").join(platform.executable_name(&entry.name));

        let mut clone_args = vec!["clone".to_string(), "--depth".into(), "1".into()];
        if !entry.is_latest() {
            clone_args.push("--branch".into());
            clone_args.push(entry.version.clone());
        }
        clone_args.push(format!("{}/{}.git", git_base.trim_end_matches('/'), entry.repo));
        clone_args.push(checkout.to_string_lossy().into_owned());

        let build_args = vec![
            "build".to_string(),
            "-trimpath".into(),
            "-ldflags=-s -w".into(),
            "-o".into(),
            output.to_string_lossy().into_owned(),
            entry.package_path().to_string(),
        ];

        let env = vec![
            ("GOOS".to_string(), platform.os.clone()),
            ("GOARCH".to_string(), platform.arch.clone()),
            ("CGO_ENABLED".to_string(), if entry.cgo { "1" } else { "0" }.to_string()),
        ];

        Self {
            clone_args,
            build_args,
            env,
            checkout,
            output,
        }
    }
}

impl Strategy for BuildFromSource {
    #[tracing::instrument(skip_all, fields(name = %job.entry.name, version = %job.entry.version))]
    async fn install(&self, context: &ProvisionContext, job: &Job<'_>) -> Result<Installed> {
        let entry = job.entry;
        let name = entry.name.as_str();
        let platform = &context.platform;
        let installed = Installed {
            version: entry.version.clone(),
        };

        if entry.cgo && !platform.is_host() {
            return Err(Error::CrossCompileUnsupported {
                target: platform.to_string(),
                reason: "the build links native code".into(),
            })
            .during(name, Phase::Build);
        }

        // A "latest" build has no stable cache key.
        let cache = context.cache().filter(|_| !entry.is_latest());
        if let Some(cache) = &cache {
            let hit = cache
                .fetch(entry, platform, job.scratch, &context.progress)
                .await
                .during(name, Phase::Cache)?;
            if let Some(cached) = hit {
                place_binary(name, &cached, job.install_path)?;
                return Ok(installed);
            }
        }

        let git = job.tools.require("git").during(name, Phase::Build)?;
        let go = job.tools.require("go").during(name, Phase::Build)?;
        let plan = BuildPlan::new(entry, platform, &context.settings.git_base, job.scratch);

        context
            .progress
            .set_message(format!("Cloning {}...", style(&entry.repo).bold()));
        let mut clone = Command::new(git);
        clone.args(&plan.clone_args).current_dir(job.scratch);
        run_command(clone, &context.cancel, job.verbose)
            .await
            .during(name, Phase::Build)?;

        context
            .progress
            .set_message(format!("Building {} for {}...", style(name).bold(), platform));
        let mut build = Command::new(go);
        build
            .args(&plan.build_args)
            .current_dir(&plan.checkout)
            .envs(plan.env.iter().cloned());
        run_command(build, &context.cancel, job.verbose)
            .await
            .during(name, Phase::Build)?;

        let out_dir = plan.output.parent().unwrap_or(job.scratch);
        let binary = locate_binary(out_dir, name, platform).during(name, Phase::LocateBinary)?;

        if let Some(cache) = &cache {
            if let Err(e) = cache.store(entry, platform, &binary).await {
                tracing::warn!(error = %e, "Failed to upload build to cache");
            }
        }

        place_binary(name, &binary, job.install_path)?;
        tracing::info!(package = entry.package_path(), "Built from source");
        Ok(installed)
    }
}
