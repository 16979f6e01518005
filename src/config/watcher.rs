//! Configuration file change detection for hot reload.
//!
//! # Responsibilities
//! - Track the config file modification time
//! - Report a freshly loaded configuration when the file changed
//!
//! # Design Decisions
//! - Plain mtime polling from the supervisor tick, no inotify machinery;
//!   the supervisor already wakes several times a second
//! - A failed re-read keeps the previous snapshot running
//! - The mtime is recorded per attempt so a broken file is not re-parsed
//!   every tick

use std::path::PathBuf;
use std::time::SystemTime;

use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::ServerConfig;

/// Watches the configuration file for modification-time changes.
pub struct ConfigWatcher {
    path: Option<PathBuf>,
    last_mtime: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Create a watcher primed with the file's current modification time,
    /// so only later edits trigger a reload.
    pub fn new(path: Option<PathBuf>) -> Self {
        let last_mtime = path.as_deref().and_then(mtime_of);
        Self { path, last_mtime }
    }

    /// Check the file; if its mtime advanced, attempt a reload.
    ///
    /// Returns `None` when nothing changed, `Some(Ok(config))` on a
    /// successful re-read and `Some(Err(..))` when the changed file fails
    /// to load.
    pub fn poll(&mut self) -> Option<Result<ServerConfig, ConfigError>> {
        let path = self.path.as_deref()?;
        let mtime = mtime_of(path)?;

        match self.last_mtime {
            Some(last) if mtime <= last => return None,
            _ => {}
        }
        self.last_mtime = Some(mtime);

        Some(load_config(Some(path)))
    }
}

fn mtime_of(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_unchanged_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "[ring]\nvolatile = true\n").unwrap();

        let mut watcher = ConfigWatcher::new(Some(path));
        assert!(watcher.poll().is_none());
        assert!(watcher.poll().is_none());
    }

    #[test]
    fn test_reload_yields_equal_snapshot_for_same_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "[ring]\nvolatile = true\n").unwrap();

        let first = load_config(Some(&path)).unwrap();

        let mut watcher = ConfigWatcher::new(Some(path.clone()));

        // Rewrite identical content with a bumped mtime
        let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.write_all(b"[ring]\nvolatile = true\n").unwrap();
        drop(f);
        let later = SystemTime::now() + std::time::Duration::from_secs(2);
        let times = std::fs::FileTimes::new().set_modified(later);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_times(times)
            .unwrap();

        let second = watcher.poll().expect("mtime advanced").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_broken_reload_reports_error_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "[ring]\nvolatile = true\n").unwrap();

        let mut watcher = ConfigWatcher::new(Some(path.clone()));

        std::fs::write(&path, "not valid toml [[[").unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(2);
        let times = std::fs::FileTimes::new().set_modified(later);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_times(times)
            .unwrap();

        assert!(matches!(watcher.poll(), Some(Err(_))));
        // Same mtime, no re-parse storm
        assert!(watcher.poll().is_none());
    }
}
