//! Lock file provider for file-backed databases.

use super::{new_holder_id, poll_until, LockConfig, LockProvider, LockRecord};
use crate::migration::MigrationError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Contents of a lock file.
#[derive(Debug)]
enum LockFile {
    Missing,
    Held(LockRecord),
    /// Empty or torn, e.g. the creator died before writing its record.
    /// The age comes from the file's modification time.
    Unreadable { age: Duration },
}

/// Lock held as `<dir>/<key>.lock`, created atomically with `create_new`.
#[derive(Debug)]
pub struct FileLock {
    dir: PathBuf,
    holder_id: String,
    config: LockConfig,
    /// Keys this provider acquired and has not released.
    held: Mutex<HashSet<String>>,
}

impl FileLock {
    /// Create a provider storing lock files in `dir`.
    pub fn new(dir: impl Into<PathBuf>, config: LockConfig) -> Self {
        Self {
            dir: dir.into(),
            holder_id: new_holder_id(),
            config,
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Path of the lock file for `key`.
    pub fn lock_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.lock"))
    }

    fn try_acquire(&self, key: &str) -> Result<bool, MigrationError> {
        let path = self.lock_path(key);
        if self.create(&path)? {
            return Ok(true);
        }

        let threshold = self.config.stale_threshold();
        match read_lock_file(&path)? {
            LockFile::Held(record) if record.holder_id == self.holder_id => Ok(true),
            LockFile::Held(record) if record.is_stale(threshold) => {
                self.reclaim_and_create(&path, Some(&record))
            }
            LockFile::Unreadable { age } if age > threshold => {
                self.reclaim_and_create(&path, None)
            }
            _ => Ok(false),
        }
    }

    /// Create the lock file; `Ok(false)` if it already exists.
    fn create(&self, path: &Path) -> Result<bool, MigrationError> {
        fs::create_dir_all(&self.dir)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let record = LockRecord::new(&self.holder_id);
        let body = serde_json::to_vec(&record).map_err(MigrationError::lock)?;
        file.write_all(&body)?;
        file.sync_all()?;
        debug!(path = %path.display(), holder = %self.holder_id, "Lock file created");
        Ok(true)
    }

    fn reclaim_and_create(
        &self,
        path: &Path,
        stale: Option<&LockRecord>,
    ) -> Result<bool, MigrationError> {
        if self.reclaim(path, stale)? {
            self.create(path)
        } else {
            Ok(false)
        }
    }

    /// Move a stale lock aside and verify it is the one we judged stale.
    ///
    /// `stale` is `None` for an unreadable lock file, which must still be
    /// unreadable and older than the stale threshold once moved.
    fn reclaim(&self, path: &Path, stale: Option<&LockRecord>) -> Result<bool, MigrationError> {
        let aside = path.with_extension(format!("lock.reclaim-{}", self.holder_id));
        match fs::rename(path, &aside) {
            Ok(()) => {}
            // Someone else reclaimed or released it first.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let threshold = self.config.stale_threshold();
        let confirmed = match (read_lock_file(&aside)?, stale) {
            (LockFile::Held(record), Some(expected)) => &record == expected,
            (LockFile::Unreadable { age }, None) => age > threshold,
            _ => false,
        };

        if confirmed {
            fs::remove_file(&aside)?;
            match stale {
                Some(record) => warn!(
                    path = %path.display(),
                    stale_holder = %record.holder_id,
                    age_ms = record.age().as_millis() as u64,
                    "Reclaimed stale migration lock"
                ),
                None => warn!(path = %path.display(), "Reclaimed unreadable stale migration lock"),
            }
            return Ok(true);
        }

        // A fresh lock was moved; put it back unless the slot was taken.
        if let Err(e) = fs::hard_link(&aside, path) {
            warn!(
                path = %path.display(),
                error = %e,
                "Could not restore a live lock moved during reclaim; its holder has lost it"
            );
        }
        fs::remove_file(&aside)?;
        Ok(false)
    }
}

fn read_lock_file(path: &Path) -> Result<LockFile, MigrationError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockFile::Missing),
        Err(e) => return Err(e.into()),
    };
    if let Ok(record) = serde_json::from_slice(&bytes) {
        return Ok(LockFile::Held(record));
    }

    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockFile::Missing),
        Err(e) => return Err(e.into()),
    };
    // A modification time in the future counts as fresh.
    let age = modified.elapsed().unwrap_or_default();
    Ok(LockFile::Unreadable { age })
}

impl LockProvider for FileLock {
    fn acquire(&self, key: &str, timeout: Duration) -> Result<bool, MigrationError> {
        let acquired = poll_until(timeout, self.config.poll_interval, || self.try_acquire(key))?;
        if acquired {
            self.held.lock().insert(key.to_string());
        }
        Ok(acquired)
    }

    /// Returns `Ok(false)` if this provider does not hold the lock, including
    /// when another process took it over after it was acquired.
    fn release(&self, key: &str) -> Result<bool, MigrationError> {
        let acquired = self.held.lock().remove(key);
        let path = self.lock_path(key);
        match read_lock_file(&path)? {
            LockFile::Held(record) if record.holder_id == self.holder_id => {
                match fs::remove_file(&path) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            state => {
                if acquired {
                    warn!(
                        path = %path.display(),
                        holder = %self.holder_id,
                        state = ?state,
                        "Migration lock was lost while held"
                    );
                }
                Ok(false)
            }
        }
    }

    fn holder_id(&self) -> &str {
        &self.holder_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path(), LockConfig::default());

        assert!(lock.acquire("schema_migration", Duration::ZERO).unwrap());
        assert!(lock.lock_path("schema_migration").exists());
        assert!(lock.release("schema_migration").unwrap());
        assert!(!lock.lock_path("schema_migration").exists());
        // Idempotent.
        assert!(!lock.release("schema_migration").unwrap());
    }

    #[test]
    fn test_second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = LockConfig::default().with_poll_interval(Duration::from_millis(10));
        let first = FileLock::new(dir.path(), config.clone());
        let second = FileLock::new(dir.path(), config);

        assert!(first.acquire("k", Duration::ZERO).unwrap());
        assert!(!second.acquire("k", Duration::from_millis(50)).unwrap());
        assert!(!second.release("k").unwrap());
        assert!(first.lock_path("k").exists());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let config = LockConfig::default().with_stale_after(Duration::from_millis(100));
        let crashed = FileLock::new(dir.path(), config.clone());
        let survivor = FileLock::new(dir.path(), config);

        let stale = LockRecord {
            holder_id: crashed.holder_id().to_string(),
            acquired_at: super::super::now_millis() - 60_000,
            pid: 1,
        };
        fs::write(crashed.lock_path("k"), serde_json::to_vec(&stale).unwrap()).unwrap();

        assert!(survivor.acquire("k", Duration::ZERO).unwrap());
        match read_lock_file(&survivor.lock_path("k")).unwrap() {
            LockFile::Held(record) => assert_eq!(record.holder_id, survivor.holder_id()),
            other => panic!("unexpected lock file: {other:?}"),
        }
    }

    #[test]
    fn test_key_is_sanitized() {
        let lock = FileLock::new("/tmp/locks", LockConfig::default());
        assert_eq!(lock.lock_path("a/b c"), PathBuf::from("/tmp/locks/a_b_c.lock"));
    }

    #[test]
    fn test_torn_lock_file_is_reclaimed_once_stale() {
        let dir = tempfile::tempdir().unwrap();
        let config = LockConfig::default()
            .with_stale_after(Duration::from_millis(10))
            .with_poll_interval(Duration::from_millis(5));
        let lock = FileLock::new(dir.path(), config);
        // Creator died between create_new and writing its record.
        fs::write(lock.lock_path("k"), b"").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert!(lock.acquire("k", Duration::from_millis(200)).unwrap());
        assert!(lock.release("k").unwrap());
    }

    #[test]
    fn test_fresh_torn_lock_file_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let config = LockConfig::default().with_poll_interval(Duration::from_millis(5));
        let lock = FileLock::new(dir.path(), config);
        fs::write(lock.lock_path("k"), b"{\"holder_id\":").unwrap();

        assert!(!lock.acquire("k", Duration::from_millis(30)).unwrap());
        assert!(lock.lock_path("k").exists());
    }

    #[test]
    fn test_release_reports_lost_lock() {
        let dir = tempfile::tempdir().unwrap();
        let config = LockConfig::default();
        let holder = FileLock::new(dir.path(), config.clone());
        let intruder = FileLock::new(dir.path(), config);
        assert!(holder.acquire("k", Duration::ZERO).unwrap());

        // Another holder's record replaced ours.
        let foreign = LockRecord::new(intruder.holder_id());
        fs::write(holder.lock_path("k"), serde_json::to_vec(&foreign).unwrap()).unwrap();

        assert!(!holder.release("k").unwrap());
        assert!(holder.lock_path("k").exists());
    }
}
