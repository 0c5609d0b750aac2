use crate::error::{Error, Result};
use fs4::fs_std::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// An exclusive advisory lock on one binary name, held until dropped.
///
/// Serializes the read-metadata, install, write-metadata sequence for a
/// single binary across threads and processes sharing an install directory.
#[derive(Debug)]
pub struct NameLock {
    file: File,
    path: PathBuf,
}

impl NameLock {
    pub fn lock_path(install_dir: &Path, name: &str) -> PathBuf {
        install_dir.join(".locks").join(format!("{name}.lock"))
    }

    /// Blocks the calling thread until the lock is held.
    pub fn acquire_blocking(install_dir: &Path, name: &str) -> Result<Self> {
        let path = Self::lock_path(install_dir, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        tracing::trace!(path = %path.display(), "Acquired install lock");
        Ok(Self { file, path })
    }

    /// Acquires the lock on the blocking pool so async callers do not stall.
    pub async fn acquire(install_dir: &Path, name: &str) -> Result<Self> {
        let install_dir = install_dir.to_path_buf();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(&install_dir, &name))
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))?
    }
}

impl Drop for NameLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        tracing::trace!(path = %self.path.display(), "Released install lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn lock_file_lives_under_the_install_dir() {
        assert_eq!(
            NameLock::lock_path(Path::new("/opt/bin"), "task"),
            PathBuf::from("/opt/bin/.locks/task.lock")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn same_name_is_serialized() -> Result<()> {
        let dir = tempdir()?;
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let dir = dir.path().to_path_buf();
            let inside = inside.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _lock = NameLock::acquire(&dir, "task").await?;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), Error>(())
            }));
        }
        for task in tasks {
            task.await.unwrap()?;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn different_names_do_not_contend() -> Result<()> {
        let dir = tempdir()?;
        let _task = NameLock::acquire(dir.path(), "task").await?;
        let _gh = NameLock::acquire(dir.path(), "gh").await?;
        Ok(())
    }
}
