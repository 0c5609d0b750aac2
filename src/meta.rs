//! The idempotency ledger: a `<binary>_meta.json` sidecar per installed binary.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const META_SUFFIX: &str = "_meta.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledMeta {
    pub name: String,
    pub version: String,
}

/// `<install-path>_meta.json`
pub fn meta_path(install_path: &Path) -> PathBuf {
    let mut raw = install_path.as_os_str().to_owned();
    raw.push(META_SUFFIX);
    PathBuf::from(raw)
}

/// Reads the sidecar for `install_path`. A missing or unreadable sidecar is
/// treated as "not installed".
pub fn read_meta(install_path: &Path) -> Option<InstalledMeta> {
    let path = meta_path(install_path);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not read metadata sidecar");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(meta) => Some(meta),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt metadata sidecar");
            None
        }
    }
}

/// Writes the sidecar atomically. This is the commit point of an install, so
/// it must only run after the binary is in place.
pub fn write_meta(install_path: &Path, meta: &InstalledMeta) -> Result<()> {
    let path = meta_path(install_path);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, meta).map_err(io::Error::other)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| e.error)?;
    tracing::trace!(path = %path.display(), version = %meta.version, "Wrote metadata sidecar");
    Ok(())
}

/// Removes the sidecar. Missing sidecars are fine.
pub fn remove_meta(install_path: &Path) -> Result<()> {
    match fs::remove_file(meta_path(install_path)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Finds every sidecar in `dir` and returns the install path it describes.
pub fn scan_installed(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        if let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(META_SUFFIX)) {
            found.push(dir.join(stem));
        }
    }
    found.sort();
    Ok(found)
}
