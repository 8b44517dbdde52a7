//! Disk space pre-flight for table rebuilds.
//!
//! A Copy-Swap-Drop rebuild holds the old and the new table at once, so a
//! file-backed database needs roughly its own size in free space (plus the
//! journal). Server databases manage their own storage and always pass.

use crate::migration::MigrationError;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default reserve kept free after a migration: 64 MiB.
pub const DEFAULT_MIN_RESERVE_BYTES: u64 = 64 * 1024 * 1024;

/// Multiplier applied to the database size when no size is given.
pub const REQUIRED_SIZE_MULTIPLIER: u64 = 2;

/// Where the database keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// A local database file.
    File {
        /// Path of the main database file.
        path: PathBuf,
    },
    /// A database server.
    Server,
}

/// Reports free space of a filesystem.
pub trait SpaceProbe: Send + Sync {
    /// Bytes available to unprivileged users on the filesystem holding `path`.
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Probe using `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    #[cfg(unix)]
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is a valid NUL-terminated string and stat is a valid
        // out-pointer for the duration of the call.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(clippy::unnecessary_cast)]
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    #[cfg(not(unix))]
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "free space probing is not supported on this platform",
        ))
    }
}

/// Checks that a rebuild fits on disk.
pub struct DiskSpaceChecker {
    backend: StorageBackend,
    min_reserve_bytes: u64,
    probe: Box<dyn SpaceProbe>,
}

impl DiskSpaceChecker {
    /// Create a checker with a custom probe.
    pub fn new(backend: StorageBackend, min_reserve_bytes: u64, probe: Box<dyn SpaceProbe>) -> Self {
        Self {
            backend,
            min_reserve_bytes,
            probe,
        }
    }

    /// Checker for a database file using `statvfs`.
    pub fn for_file(path: impl Into<PathBuf>, min_reserve_bytes: u64) -> Self {
        Self::new(
            StorageBackend::File { path: path.into() },
            min_reserve_bytes,
            Box::new(StatvfsProbe),
        )
    }

    /// Checker for a server database.
    pub fn for_server() -> Self {
        Self::new(StorageBackend::Server, 0, Box::new(StatvfsProbe))
    }

    /// Storage backend being checked.
    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Current size of the database including its WAL journal.
    pub fn database_size(&self) -> io::Result<u64> {
        match &self.backend {
            StorageBackend::File { path } => {
                let main = file_size(path)?.unwrap_or(0);
                let wal = file_size(&journal_path(path, "-wal"))?.unwrap_or(0);
                Ok(main + wal)
            }
            StorageBackend::Server => Ok(0),
        }
    }

    /// Whether `required` bytes (default: twice the database size) fit in
    /// free space minus the reserve.
    pub fn check_space_available(&self, required: Option<u64>) -> Result<bool, MigrationError> {
        let (required, available) = self.measure(required)?;
        Ok(required <= available)
    }

    /// Like [`check_space_available`](Self::check_space_available) but
    /// returns [`MigrationError::InsufficientSpace`] when it does not fit.
    pub fn ensure_space_available(&self, required: Option<u64>) -> Result<(), MigrationError> {
        let (required, available) = self.measure(required)?;
        if required <= available {
            Ok(())
        } else {
            Err(MigrationError::InsufficientSpace {
                required,
                available,
            })
        }
    }

    fn measure(&self, required: Option<u64>) -> Result<(u64, u64), MigrationError> {
        let path = match &self.backend {
            StorageBackend::Server => {
                debug!("Server storage backend, skipping disk space check");
                return Ok((0, u64::MAX));
            }
            StorageBackend::File { path } => path,
        };

        let required = match required {
            Some(bytes) => bytes,
            None => self.database_size()?.saturating_mul(REQUIRED_SIZE_MULTIPLIER),
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let free = self.probe.available_bytes(dir)?;
        let available = free.saturating_sub(self.min_reserve_bytes);

        if required > available {
            warn!(required, available, free, "Insufficient disk space for migration");
        } else {
            debug!(required, available, "Disk space check passed");
        }
        Ok((required, available))
    }
}

fn journal_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn file_size(path: &Path) -> io::Result<Option<u64>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(u64);

    impl SpaceProbe for FixedProbe {
        fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    fn db_file(size: usize) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        std::fs::write(&path, vec![0u8; size]).unwrap();
        (dir, path)
    }

    #[test]
    fn test_server_always_passes() {
        let checker = DiskSpaceChecker::for_server();
        assert_eq!(checker.backend(), &StorageBackend::Server);
        assert!(checker.check_space_available(Some(u64::MAX)).unwrap());
    }

    #[test]
    fn test_default_requirement_is_twice_database_size() {
        let (_dir, path) = db_file(1000);
        let backend = StorageBackend::File { path };

        let enough = DiskSpaceChecker::new(backend.clone(), 0, Box::new(FixedProbe(2000)));
        assert!(enough.check_space_available(None).unwrap());

        let short = DiskSpaceChecker::new(backend, 0, Box::new(FixedProbe(1999)));
        assert!(!short.check_space_available(None).unwrap());
    }

    #[test]
    fn test_wal_counts_towards_size() {
        let (_dir, path) = db_file(1000);
        std::fs::write(journal_path(&path, "-wal"), vec![0u8; 500]).unwrap();
        let checker = DiskSpaceChecker::new(
            StorageBackend::File { path },
            0,
            Box::new(FixedProbe(0)),
        );
        assert_eq!(checker.database_size().unwrap(), 1500);
    }

    #[test]
    fn test_reserve_is_subtracted() {
        let (_dir, path) = db_file(10);
        let checker = DiskSpaceChecker::new(
            StorageBackend::File { path },
            100,
            Box::new(FixedProbe(150)),
        );
        assert!(checker.check_space_available(Some(50)).unwrap());
        assert!(!checker.check_space_available(Some(51)).unwrap());
        assert!(matches!(
            checker.ensure_space_available(Some(51)),
            Err(MigrationError::InsufficientSpace {
                required: 51,
                available: 50
            })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_statvfs_probe_reports_space() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StatvfsProbe.available_bytes(dir.path()).unwrap() > 0);
    }
}
