//! Archive extraction, dispatched on the file name suffix.

use crate::error::{Error, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tar::Archive;
use tokio_util::sync::CancellationToken;
use zip::ZipArchive;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarBz2,
    #[cfg(feature = "xz")]
    TarXz,
}

impl ArchiveFormat {
    /// Detects the format from the file name alone; the bytes are never sniffed.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Some(Self::TarBz2)
        } else {
            Self::detect_optional(&name)
        }
    }

    #[cfg(feature = "xz")]
    fn detect_optional(name: &str) -> Option<Self> {
        (name.ends_with(".tar.xz") || name.ends_with(".txz")).then_some(Self::TarXz)
    }

    #[cfg(not(feature = "xz"))]
    fn detect_optional(_name: &str) -> Option<Self> {
        None
    }
}

/// Extracts `archive_path` into `dest_dir`, keeping relative paths and the
/// mode bits recorded for regular files.
///
/// Extraction is not transactional. Callers extract into a scratch directory
/// and throw it away on failure.
#[tracing::instrument(skip(archive_path, dest_dir, cancel), fields(archive = %archive_path.display(), dest = %dest_dir.display()))]
pub fn extract(archive_path: &Path, dest_dir: &Path, cancel: &CancellationToken) -> Result<()> {
    let format = ArchiveFormat::detect(archive_path)
        .ok_or_else(|| Error::UnsupportedArchiveFormat(archive_path.to_path_buf()))?;
    fs::create_dir_all(dest_dir)?;
    let file = File::open(archive_path)?;

    tracing::debug!(?format, "Extracting archive");
    match format {
        ArchiveFormat::Zip => extract_zip(file, dest_dir, cancel),
        ArchiveFormat::TarGz => extract_tar(GzDecoder::new(BufReader::new(file)), dest_dir, cancel),
        ArchiveFormat::TarBz2 => extract_tar(BzDecoder::new(BufReader::new(file)), dest_dir, cancel),
        #[cfg(feature = "xz")]
        ArchiveFormat::TarXz => extract_tar(xz2::read::XzDecoder::new(BufReader::new(file)), dest_dir, cancel),
    }
}

/// Runs [`extract`] on the blocking pool.
pub async fn extract_blocking(
    archive_path: PathBuf,
    dest_dir: PathBuf,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::task::spawn_blocking(move || extract(&archive_path, &dest_dir, &cancel))
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?
}

fn extract_tar<R: Read>(reader: R, dest_dir: &Path, cancel: &CancellationToken) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    for entry in archive.entries().map_err(corrupt)? {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut entry = entry.map_err(corrupt)?;
        tracing::trace!(entry_path = ?entry.path().ok(), "Unpacking archive entry");
        // unpack_in creates parent directories and refuses paths escaping dest_dir.
        if !entry.unpack_in(dest_dir).map_err(corrupt)? {
            tracing::warn!(entry_path = ?entry.path().ok(), "Skipped archive entry outside the destination");
        }
    }
    Ok(())
}

fn extract_zip(file: File, dest_dir: &Path, cancel: &CancellationToken) -> Result<()> {
    let mut archive = ZipArchive::new(file).map_err(|e| corrupt(io::Error::other(e)))?;
    for i in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut file = archive
            .by_index(i)
            .map_err(|e| corrupt(io::Error::other(e)))?;
        let Some(enclosed_name) = file.enclosed_name() else {
            tracing::warn!(entry = file.name(), "Skipped zip entry with an unsafe path");
            continue;
        };
        tracing::trace!(entry_path = ?enclosed_name, "Unpacking archive entry");
        let outpath = dest_dir.join(enclosed_name);

        if file.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&outpath)?;
        io::copy(&mut file, &mut outfile).map_err(corrupt)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            fs::set_permissions(&outpath, fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }
    Ok(())
}

fn corrupt(source: io::Error) -> Error {
    Error::InstallationFailed {
        message: "the archive is corrupted or in an unexpected format".to_string(),
        source: Some(source),
    }
}
