//! Local filesystem operations used by promotion, reaping and bootstrap.
//!
//! Everything here is blocking std I/O executed on tokio's blocking pool
//! under a timeout, so a stalled disk never wedges the async loops.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Suffix of a copy that has not been renamed into place yet
pub const PARTIAL_SUFFIX: &str = "partial";

/// Errors from local file operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Operation on {path} timed out after {after:?}")]
    Timeout { path: PathBuf, after: Duration },

    #[error("Blocking file task failed: {0}")]
    TaskFailed(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Run a blocking file operation off the executor, bounded by `timeout`.
///
/// On timeout the blocking task keeps running to completion in the
/// background; callers treat the operation as failed and retry later.
pub async fn run_blocking<T, F>(path: &Path, timeout: Duration, op: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(op);

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(StorageError::TaskFailed(join_error.to_string())),
        Err(_) => Err(StorageError::Timeout {
            path: path.to_path_buf(),
            after: timeout,
        }),
    }
}

/// Path of the in-progress copy for `destination`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    destination.with_file_name(name)
}

/// Copy `source` to `destination`, preserving permissions and mtime.
///
/// The bytes land in a `.partial` sibling first and are renamed into place
/// once complete, so an interrupted copy never occupies the final path.
pub fn copy_preserving(source: &Path, destination: &Path) -> Result<(), StorageError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }

    let partial = partial_path(destination);
    let modified = fs::metadata(source)
        .and_then(|meta| meta.modified())
        .map_err(|e| StorageError::io(source, e))?;

    // fs::copy carries permission bits over
    fs::copy(source, &partial).map_err(|e| StorageError::io(source, e))?;

    // Read-only sources yield a read-only copy; the mtime is then left as is
    if let Err(e) = File::options()
        .write(true)
        .open(&partial)
        .and_then(|file| file.set_modified(modified))
    {
        debug!(path = %partial.display(), error = %e, "Could not preserve modification time");
    }

    fs::rename(&partial, destination).map_err(|e| StorageError::io(destination, e))?;

    Ok(())
}

/// Delete a file, treating an already missing file as success.
///
/// Returns whether a file was actually removed.
pub fn remove_file_if_exists(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "File already gone");
            Ok(false)
        }
        Err(e) => Err(StorageError::io(path, e)),
    }
}

/// Remove every empty immediate subdirectory of `root`.
///
/// `root` itself is kept. Returns the number of directories removed.
pub fn remove_empty_subdirs(root: &Path) -> Result<usize, StorageError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StorageError::io(root, e)),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io(root, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let is_empty = fs::read_dir(&path)
            .map(|mut children| children.next().is_none())
            .unwrap_or(false);

        // A file may appear between the check and the removal; remove_dir
        // refuses non-empty directories, so that case is simply skipped.
        if is_empty && fs::remove_dir(&path).is_ok() {
            debug!(path = %path.display(), "Removed empty directory");
            removed += 1;
        }
    }

    Ok(removed)
}

/// Size of the file at `path`, or 0 if it cannot be read
pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::TempDir;

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/perm/cam1/20240115_143045/clip.mp4")),
            PathBuf::from("/perm/cam1/20240115_143045/clip.mp4.partial")
        );
    }

    #[test]
    fn test_copy_preserves_mtime_and_leaves_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("clip.mp4");
        fs::write(&source, b"video bytes").unwrap();

        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let destination = dir.path().join("perm").join("event").join("clip.mp4");
        copy_preserving(&source, &destination).unwrap();

        assert!(source.exists());
        assert_eq!(fs::read(&destination).unwrap(), b"video bytes");
        assert!(!partial_path(&destination).exists());
        assert_eq!(fs::metadata(&destination).unwrap().modified().unwrap(), mtime);
    }

    #[test]
    fn test_copy_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let result = copy_preserving(&dir.path().join("gone.mp4"), &dir.path().join("out.mp4"));
        assert!(matches!(result, Err(StorageError::Io { .. })));
        assert!(!dir.path().join("out.mp4").exists());
    }

    #[test]
    fn test_remove_missing_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        fs::write(&path, b"x").unwrap();

        assert!(remove_file_if_exists(&path).unwrap());
        assert!(!remove_file_if_exists(&path).unwrap());
    }

    #[test]
    fn test_remove_empty_subdirs_keeps_populated() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        fs::create_dir(dir.path().join("full")).unwrap();
        fs::write(dir.path().join("full").join("clip.mp4"), b"x").unwrap();

        assert_eq!(remove_empty_subdirs(dir.path()).unwrap(), 1);
        assert!(!dir.path().join("empty").exists());
        assert!(dir.path().join("full").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_run_blocking_returns_result() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        fs::write(&path, b"abc").unwrap();

        let p = path.clone();
        let size = run_blocking(&path, Duration::from_secs(5), move || Ok(file_size(&p)))
            .await
            .unwrap();
        assert_eq!(size, 3);
    }

    #[tokio::test]
    async fn test_run_blocking_times_out() {
        let path = PathBuf::from("/stuck/share/clip.mp4");

        let result = run_blocking(&path, Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .await;

        match result {
            Err(StorageError::Timeout { path: timed_out, after }) => {
                assert_eq!(timed_out, path);
                assert_eq!(after, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
