/// Bot discovery: every subdirectory of the bots directory that contains the
/// entrypoint file is a bot, named after the directory.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A supervised bot. Immutable after discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bot {
    pub name: String,
    /// The bot's directory.
    pub launch_path: PathBuf,
    /// The entrypoint file inside `launch_path`.
    pub entrypoint: PathBuf,
}

impl Bot {
    pub fn new(name: impl Into<String>, launch_path: impl Into<PathBuf>, entrypoint: &str) -> Self {
        let launch_path = launch_path.into();
        let entrypoint = launch_path.join(entrypoint);
        Self {
            name: name.into(),
            launch_path,
            entrypoint,
        }
    }
}

/// Scan `bots_dir` for `<bots_dir>/*/<entrypoint>` files.
///
/// Unreadable entries are logged and skipped; an unreadable or missing
/// `bots_dir` yields an empty map.
pub fn discover(bots_dir: &Path, entrypoint: &str) -> BTreeMap<String, Bot> {
    let mut bots = BTreeMap::new();

    let pattern = format!(
        "{}/*/{}",
        glob::Pattern::escape(&bots_dir.to_string_lossy()),
        glob::Pattern::escape(entrypoint)
    );
    let entries = match glob::glob(&pattern) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, pattern, "invalid bot discovery pattern");
            return bots;
        }
    };

    for entry in entries {
        let file = match entry {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read bot directory entry");
                continue;
            }
        };
        if !file.is_file() {
            continue;
        }
        let Some(dir) = file.parent() else { continue };
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            tracing::warn!(path = %dir.display(), "skipping bot directory with non-UTF-8 name");
            continue;
        };
        bots.insert(name.to_string(), Bot::new(name, dir, entrypoint));
    }

    tracing::info!(count = bots.len(), dir = %bots_dir.display(), "discovered bots");
    bots
}
