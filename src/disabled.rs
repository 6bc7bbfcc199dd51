/// Disabled-set persistence: the names of administratively disabled bots,
/// stored as `{"disabled": [...]}` and rewritten atomically on every change.
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// On-disk layout of the disabled record.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DisabledRecord {
    #[serde(default)]
    disabled: Vec<String>,
}

/// Errors from reading or writing the disabled record.
#[derive(Debug)]
pub enum StoreError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            StoreError::Parse { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
            StoreError::Serialize { source } => {
                write!(f, "failed to serialize disabled set: {source}")
            }
            StoreError::Write { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Read { source, .. } => Some(source),
            StoreError::Parse { source, .. } => Some(source),
            StoreError::Serialize { source } => Some(source),
            StoreError::Write { source, .. } => Some(source),
        }
    }
}

/// Reads and writes the disabled record at a fixed path.
#[derive(Debug, Clone)]
pub struct DisabledStore {
    path: PathBuf,
}

impl DisabledStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record. A missing file is an empty set.
    pub fn load(&self) -> Result<BTreeSet<String>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        let record: DisabledRecord =
            serde_json::from_str(&contents).map_err(|e| StoreError::Parse {
                path: self.path.clone(),
                source: e,
            })?;
        Ok(record.disabled.into_iter().collect())
    }

    /// Overwrite the record with `names`.
    ///
    /// Writes a temporary file next to the target and renames it over, so a
    /// reader never sees a partial record.
    pub fn save(&self, names: &BTreeSet<String>) -> Result<(), StoreError> {
        let record = DisabledRecord {
            disabled: names.iter().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| StoreError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let write_err = |e: std::io::Error| StoreError::Write {
            path: self.path.clone(),
            source: e,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

/// The in-memory disabled set shared by monitor loops and control actions.
///
/// The in-memory copy is authoritative; persistence failures are logged and
/// otherwise ignored.
#[derive(Debug)]
pub struct DisabledSet {
    store: DisabledStore,
    names: Mutex<BTreeSet<String>>,
}

impl DisabledSet {
    /// Load the set from `store`. Unreadable records start empty.
    pub fn load(store: DisabledStore) -> Self {
        let names = match store.load() {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "could not load disabled set, starting with none disabled");
                BTreeSet::new()
            }
        };
        if !names.is_empty() {
            tracing::info!(disabled = ?names, "loaded disabled bots");
        }
        Self {
            store,
            names: Mutex::new(names),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    /// Add `name` and persist. Returns false if it was already present.
    pub fn insert(&self, name: &str) -> bool {
        let mut names = self.lock();
        let added = names.insert(name.to_string());
        // Persist while holding the lock so writes land in mutation order.
        self.persist(&names);
        added
    }

    /// Remove `name` and persist. Returns false if it was not present.
    pub fn remove(&self, name: &str) -> bool {
        let mut names = self.lock();
        let removed = names.remove(name);
        self.persist(&names);
        removed
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.lock().clone()
    }

    fn persist(&self, names: &BTreeSet<String>) {
        if let Err(e) = self.store.save(names) {
            tracing::warn!(error = %e, "failed to persist disabled set");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
