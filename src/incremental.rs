//! Incremental build bookkeeping
//!
//! Each input tree is fingerprinted after a run. The next incremental run
//! compares a fresh snapshot against the stored one and only rewrites what
//! was added or changed. Directory trees are tracked per file; an archive
//! is tracked as a single entry since its output is rewritten as a whole.

use crate::error::EntryError;
use crate::tree::{native_path, DirSource, EntrySelector, EntrySource};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bumped whenever the state layout or the probe format changes
pub const STATE_VERSION: u32 = 1;

/// Content fingerprint of one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Hex-encoded SHA-256 of the entry bytes
    pub sha256: String,
    pub len: u64,
}

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self {
            sha256: hex::encode(Sha256::digest(bytes)),
            len: bytes.len() as u64,
        }
    }

    /// Hash a file without loading it into memory
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let len = std::io::copy(&mut file, &mut hasher)?;
        Ok(Self {
            sha256: hex::encode(hasher.finalize()),
            len,
        })
    }
}

/// Fingerprints of every entry of one input tree, keyed by relative path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub entries: BTreeMap<String, Fingerprint>,
}

impl TreeSnapshot {
    /// One entry per file under `root`, symbolic links followed
    ///
    /// Files that cannot be read are left out, so the next incremental run
    /// sees them as added and retries them.
    pub fn of_directory(root: &Path) -> Result<Self, EntryError> {
        let mut entries = BTreeMap::new();
        for header in DirSource::new(root).headers()? {
            if header.is_dir {
                continue;
            }
            match Fingerprint::of_file(&native_path(root, &header.relative_path)) {
                Ok(fingerprint) => {
                    entries.insert(header.relative_path, fingerprint);
                }
                Err(error) => {
                    debug!(path = %header.relative_path, %error, "cannot fingerprint entry");
                }
            }
        }
        Ok(Self { entries })
    }

    /// A single entry named after the archive file
    pub fn of_archive(path: &Path) -> Result<Self, EntryError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut entries = BTreeMap::new();
        entries.insert(name, Fingerprint::of_file(path)?);
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Recorded state of one input tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeState {
    /// Where the tree was mirrored to
    pub output: PathBuf,
    pub snapshot: TreeSnapshot,
}

/// Everything the next incremental run needs, keyed by input path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    pub version: u32,
    pub trees: BTreeMap<String, TreeState>,
}

impl Default for BuildState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            trees: BTreeMap::new(),
        }
    }
}

impl BuildState {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read build state {}", path.display()))?;
        let state: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse build state {}", path.display()))?;
        if state.version != STATE_VERSION {
            anyhow::bail!(
                "Build state {} has version {}, expected {}",
                path.display(),
                state.version,
                STATE_VERSION
            );
        }
        Ok(state)
    }

    /// Write as pretty JSON, replacing any previous file atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize build state")?;
        let mut partial = path.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        fs::write(&partial, json)
            .with_context(|| format!("Failed to write {}", partial.display()))?;
        fs::rename(&partial, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn tree(&self, key: &str) -> Option<&TreeState> {
        self.trees.get(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeStatus {
    Added,
    Changed,
    Removed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub relative_path: String,
    pub status: ChangeStatus,
}

/// Classify every entry of `previous` and `current`, ordered by path
pub fn compute_change_set(previous: &TreeSnapshot, current: &TreeSnapshot) -> Vec<ChangeRecord> {
    let mut records: Vec<ChangeRecord> = current
        .entries
        .iter()
        .map(|(path, fingerprint)| {
            let status = match previous.entries.get(path) {
                None => ChangeStatus::Added,
                Some(old) if old != fingerprint => ChangeStatus::Changed,
                Some(_) => ChangeStatus::Unchanged,
            };
            ChangeRecord {
                relative_path: path.clone(),
                status,
            }
        })
        .collect();

    records.extend(
        previous
            .entries
            .keys()
            .filter(|path| !current.entries.contains_key(*path))
            .map(|path| ChangeRecord {
                relative_path: path.clone(),
                status: ChangeStatus::Removed,
            }),
    );
    records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    records
}

/// Selector admitting exactly the Added and Changed entries
pub fn rewrite_selector(records: &[ChangeRecord]) -> EntrySelector {
    EntrySelector::Only(
        records
            .iter()
            .filter(|r| matches!(r.status, ChangeStatus::Added | ChangeStatus::Changed))
            .map(|r| r.relative_path.clone())
            .collect(),
    )
}

pub fn count(records: &[ChangeRecord], status: ChangeStatus) -> usize {
    records.iter().filter(|r| r.status == status).count()
}
