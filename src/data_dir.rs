use std::path::{Path, PathBuf};

/// Manages the `.botcommander/` directory layout.
///
/// Everything the supervisor persists lives under a single data directory.
/// This struct provides accessors for each well-known path.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `.botcommander/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the persisted disabled-bot record.
    pub fn disabled(&self) -> PathBuf {
        self.root.join("disabled.json")
    }

    /// Path to the singleton lock file.
    pub fn lock(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// Create the directory if missing.
    /// Returns Ok(true) if it was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        Ok(created)
    }
}
