mod cli;

use crate::cli::{Cli, Command};
use anyhow::{Context, bail};
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolpin::error::AppResult;
use toolpin::{BinaryStatus, ConfigFile, Installer, Registry, Settings};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Using eprintln to ensure the error message is visible even if the spinner is active.
        eprintln!("\n{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let cli = Cli::parse();

    // Conditionally initialize the tracing subscriber based on the verbose flag.
    if cli.verbose > 0 {
        let filter = match cli.verbose {
            1 => "info",
            2 => "info,toolpin=debug",
            3 => "debug,toolpin=trace",
            _ => "trace",
        };
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
            .with_ansi(console::user_attended())
            .with_writer(std::io::stderr)
            .init();
    }

    let file = match &cli.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::builtin().context("The built-in registry is invalid")?,
    };

    let mut settings = Settings::new(Settings::default_install_dir())
        .apply(&file)
        .with_env_token();
    if let Some(dir) = &cli.install_dir {
        settings.install_dir = PathBuf::from(shellexpand::tilde(dir).to_string());
    }

    let registry = Registry::new(file.binaries)?;
    tracing::info!(
        binaries = registry.len(),
        install_dir = %settings.install_dir.display(),
        "Loaded binary registry"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        }
    });

    let draw_target = if console::user_attended_stderr() {
        ProgressDrawTarget::stderr()
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(None, draw_target);
    let spinner_style = ProgressStyle::with_template("{spinner:.green} {msg}")?
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏-");

    let installer = Installer::new(registry, settings)?
        .with_cancellation(cancel)?
        .with_progress(pb.clone());
    let verbose = cli.verbose > 0;

    // Spinner only for commands that may hit the network.
    let start_spinner = || {
        pb.set_style(spinner_style.clone());
        pb.enable_steady_tick(Duration::from_millis(120));
    };

    match cli.command {
        Command::Ensure => {
            start_spinner();
            let result = installer.ensure(verbose).await;
            pb.finish_and_clear();
            let installed = result?;
            if installed.is_empty() {
                println!("{} All binaries are up to date", style("✓").green());
            } else {
                for name in &installed {
                    println!("{} Installed {}", style("✓").green(), style(name).bold());
                }
            }
        }
        Command::Path { name } => {
            println!("{}", installer.get(&name)?.display());
        }
        Command::Install { name } => {
            start_spinner();
            let result = installer.install(&name, verbose).await;
            pb.finish_and_clear();
            let meta = result?;
            println!(
                "{} Installed {} {}",
                style("✓").green(),
                style(&meta.name).bold(),
                style(&meta.version).dim()
            );
        }
        Command::Remove { name } => {
            if installer.remove(&name).await? {
                println!("{} Removed {}", style("✓").green(), style(&name).bold());
            } else {
                println!("{} is not installed", style(&name).bold());
            }
        }
        Command::Status { name } => {
            let statuses = match name {
                Some(name) => vec![installer.status(&name)?],
                None => installer.status_all()?,
            };
            for status in &statuses {
                print_status(status);
            }
        }
        Command::Upgrade { name: Some(name) } => {
            start_spinner();
            let result = installer.upgrade(&name, verbose).await;
            pb.finish_and_clear();
            if result? {
                println!("{} Upgraded {}", style("✓").green(), style(&name).bold());
            } else {
                println!("{} {} is up to date", style("✓").green(), style(&name).bold());
            }
        }
        Command::Upgrade { name: None } => {
            start_spinner();
            let summary = installer.upgrade_all(verbose).await;
            pb.finish_and_clear();
            for name in &summary.upgraded {
                println!("{} Upgraded {}", style("✓").green(), style(name).bold());
            }
            for (name, e) in &summary.failed {
                eprintln!("{} {}: {}", style("✗").red(), style(name).bold(), e.root());
            }
            println!(
                "{} upgraded, {} up to date, {} failed",
                summary.upgraded.len(),
                summary.skipped.len(),
                summary.failed.len()
            );
            if !summary.is_success() {
                bail!("{} binaries failed to upgrade", summary.failed.len());
            }
        }
        Command::List => {
            for entry in installer.list() {
                println!(
                    "{:<20} {:<16} {}",
                    style(&entry.name).bold(),
                    entry.version,
                    style(entry.source).dim()
                );
            }
        }
    }

    Ok(())
}

fn print_status(status: &BinaryStatus) {
    let state = match (status.configured, status.installed, status.up_to_date) {
        (false, _, _) => style("orphaned").yellow(),
        (true, false, _) => style("missing").red(),
        (true, true, false) => style("stale").yellow(),
        (true, true, true) => style("current").green(),
    };
    println!(
        "{:<20} {:<10} pinned {:<14} installed {:<14} {}",
        style(&status.name).bold(),
        state,
        status.configured_version.as_deref().unwrap_or("-"),
        status.installed_version.as_deref().unwrap_or("-"),
        style(status.path.display()).dim()
    );
}

