//! Exit-file watch for coordinated restarts
//!
//! Deployments touch a shared file to make every instance exit with a
//! distinguished code, letting the service manager restart them with a new
//! config or binary. The file only counts if it is owned by the daemon's
//! group, so ordinary users cannot bounce the daemon.

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::error;

use crate::sysinfo;

/// The exit code signaled through the exit file. 128 + 15, as if the
/// process had received SIGTERM.
pub const EXIT_FILE_CODE: i32 = 143;

pub struct ExitFileWatcher {
    path: PathBuf,
    group_gid: Option<u32>,
    last_mtime: Option<SystemTime>,
}

impl ExitFileWatcher {
    /// Start watching. The file's current mtime (if it exists) is the
    /// baseline; only later updates trigger an exit.
    pub async fn new(path: impl Into<PathBuf>, groupname: &str) -> Self {
        let path = path.into();
        let last_mtime = mtime(&path).await;
        Self {
            path,
            group_gid: sysinfo::gid_of_group(groupname),
            last_mtime,
        }
    }

    /// Whether the file was touched since startup by the right group. A
    /// missing file is simply "not yet".
    pub async fn triggered(&mut self) -> bool {
        let Ok(meta) = tokio::fs::metadata(&self.path).await else {
            return false;
        };
        if Some(meta.gid()) != self.group_gid {
            return false;
        }
        let Ok(modified) = meta.modified() else {
            return false;
        };

        match self.last_mtime {
            Some(baseline) if modified > baseline => {
                error!(path = %self.path.display(), "Exit file was updated; shutting down");
                true
            }
            Some(_) => false,
            None => {
                // Created after startup counts as an update
                self.last_mtime = Some(modified);
                error!(path = %self.path.display(), "Exit file appeared; shutting down");
                true
            }
        }
    }
}

async fn mtime(path: &PathBuf) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt as _;
    use tempfile::TempDir;

    /// The watcher can only be exercised against files owned by a group we
    /// belong to, so tests pin the watcher's gid to the file's actual gid.
    async fn watcher_for(path: &std::path::Path) -> ExitFileWatcher {
        let gid = std::fs::metadata(path).map(|m| m.gid()).ok();
        let mut watcher = ExitFileWatcher::new(path, "nosuchgroup").await;
        watcher.group_gid = gid;
        watcher
    }

    #[tokio::test]
    async fn test_untouched_file_does_not_trigger() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("exit");
        std::fs::write(&file, "").unwrap();

        let mut watcher = watcher_for(&file).await;
        assert!(!watcher.triggered().await);
    }

    #[tokio::test]
    async fn test_touch_triggers() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("exit");
        std::fs::write(&file, "").unwrap();

        let mut watcher = watcher_for(&file).await;

        // mtime granularity can be coarse; push it well forward
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        let times = std::fs::FileTimes::new().set_modified(later);
        let handle = std::fs::File::options().write(true).open(&file).unwrap();
        handle.set_times(times).unwrap();

        assert!(watcher.triggered().await);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let mut watcher = ExitFileWatcher::new(dir.path().join("exit"), "nosuchgroup").await;
        assert!(!watcher.triggered().await);
    }

    #[tokio::test]
    async fn test_wrong_group_ignored() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("exit");
        std::fs::write(&file, "").unwrap();

        // group gid that matches nothing
        let mut watcher = ExitFileWatcher::new(&file, "nosuchgroup").await;
        watcher.group_gid = Some(u32::MAX);

        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        let times = std::fs::FileTimes::new().set_modified(later);
        let handle = std::fs::File::options().write(true).open(&file).unwrap();
        handle.set_times(times).unwrap();

        assert!(!watcher.triggered().await);
    }
}
