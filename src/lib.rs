//! Pinned, platform-aware installs of third-party command-line tools.
//!
//! A [`Registry`] lists every binary with its pinned version and how to get
//! it; an [`Installer`] brings a single install directory in line with it.

pub mod archive;
pub mod config;
pub mod download;
pub mod error;
pub mod github;
pub mod installer;
pub mod lock;
pub mod meta;
pub mod platform;
pub mod provision;
pub mod select;
pub mod status;

pub use config::{AcquisitionType, AssetRule, BinaryEntry, ConfigFile, Registry, Settings};
pub use error::{Error, Phase, Result};
pub use installer::{Installer, Outcome};
pub use meta::InstalledMeta;
pub use platform::Platform;
pub use status::{BinaryStatus, UpgradeSummary};
