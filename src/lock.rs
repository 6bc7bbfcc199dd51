/// Singleton lock: only one supervisor may run against a data directory,
/// otherwise two of them would launch every bot twice.
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Held for the lifetime of the supervisor. The OS releases the lock when
/// the file handle is dropped or the process dies.
#[derive(Debug)]
pub struct SingletonLock {
    file: File,
    path: PathBuf,
}

#[derive(Debug)]
pub enum LockError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Held {
        path: PathBuf,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {source}", path.display())
            }
            LockError::Held { path } => write!(
                f,
                "another supervisor is already running (lock {} is held)",
                path.display()
            ),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } => Some(source),
            LockError::Held { .. } => None,
        }
    }
}

impl SingletonLock {
    /// Try to take the exclusive lock without blocking.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| LockError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;
        file.try_lock_exclusive().map_err(|_| LockError::Held {
            path: path.to_path_buf(),
        })?;
        tracing::debug!(path = %path.display(), "acquired singleton lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
