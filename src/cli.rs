use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Installs pinned versions of third-party command-line tools.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Registry file to use instead of the built-in one.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory binaries are installed into.
    #[arg(long, global = true, env = "TOOLPIN_INSTALL_DIR")]
    pub install_dir: Option<String>,

    /// Enable verbose logging. Use -v for info, -vv for debug.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install every binary that is missing or out of date.
    Ensure,
    /// Print the install path of a binary.
    Path { name: String },
    /// Install a binary, replacing whatever is there.
    Install { name: String },
    /// Remove a binary and its metadata.
    Remove { name: String },
    /// Show installed and pinned versions.
    Status { name: Option<String> },
    /// Reinstall stale or missing binaries, continuing past failures.
    Upgrade { name: Option<String> },
    /// List configured binaries.
    List,
}
