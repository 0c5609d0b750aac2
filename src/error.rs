// /src/error.rs

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A type alias for `Result<T, anyhow::Error>` used by the command-line front end.
pub type AppResult<T> = anyhow::Result<T>;

/// Result type for the installer core.
pub type Result<T> = std::result::Result<T, Error>;

/// The step of an install attempt that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    MetadataFetch,
    AssetSelection,
    Download,
    Extraction,
    Build,
    PackageInstall,
    Checksum,
    LocateBinary,
    Move,
    Permission,
    Cache,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::MetadataFetch => "metadata fetch",
            Phase::AssetSelection => "asset selection",
            Phase::Download => "download",
            Phase::Extraction => "extraction",
            Phase::Build => "build",
            Phase::PackageInstall => "package install",
            Phase::Checksum => "checksum verification",
            Phase::LocateBinary => "locate binary",
            Phase::Move => "move",
            Phase::Permission => "permission",
            Phase::Cache => "build cache",
        };
        f.write_str(s)
    }
}

/// Errors produced while resolving, fetching, and installing binaries.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Binary '{0}' is not configured in the registry.")]
    BinaryNotFound(String),

    #[error("Your platform ({os} {arch}) is not supported.")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("Could not find a release asset for {os}/{arch} among {candidates} candidate(s).")]
    NoMatchingAsset {
        os: String,
        arch: String,
        candidates: usize,
    },

    #[error("Pattern '{pattern}' matches more than one asset: {}", .matches.join(", "))]
    AmbiguousAsset {
        pattern: String,
        matches: Vec<String>,
    },

    #[error("Unsupported archive format: {}", .0.display())]
    UnsupportedArchiveFormat(PathBuf),

    #[error("Failed to download from '{url}'{}.", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    DownloadFailed { url: String, status: Option<u16> },

    #[error("Checksum mismatch: expected {expected}, got {actual}.")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Cannot cross-compile for {target}: {reason}")]
    CrossCompileUnsupported { target: String, reason: String },

    #[error("The command '{command}' failed ({status}).\n  Stderr: {stderr}")]
    BuildFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Could not find the binary '{binary}' in {}.", .searched.display())]
    BinaryNotLocated { binary: String, searched: PathBuf },

    #[error("Installation failed: {message}")]
    InstallationFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Required tool '{0}' is neither in the registry nor on PATH.")]
    ToolUnavailable(String),

    #[error("Operation was cancelled.")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{name}: {phase} failed: {source}")]
    Failed {
        name: String,
        phase: Phase,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns the innermost error, looking through name/phase wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Failed { source, .. } => source.root(),
            other => other,
        }
    }

    /// The phase recorded by the outermost wrapper, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::Failed { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn installation(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::InstallationFailed {
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Attaches the binary name and phase to an error, once.
pub trait PhaseExt<T> {
    fn during(self, name: &str, phase: Phase) -> Result<T>;
}

impl<T, E: Into<Error>> PhaseExt<T> for std::result::Result<T, E> {
    fn during(self, name: &str, phase: Phase) -> Result<T> {
        self.map_err(|e| match e.into() {
            wrapped @ Error::Failed { .. } => wrapped,
            Error::Cancelled => Error::Cancelled,
            other => Error::Failed {
                name: name.to_string(),
                phase,
                source: Box::new(other),
            },
        })
    }
}
