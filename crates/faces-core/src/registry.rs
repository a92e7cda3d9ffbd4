//! Durable, append-only storage for (face patch, identity) pairs.
//!
//! The file-backed registry persists the whole entry set as versioned JSON
//! on every `add`, writing to a temp file in the same directory and renaming
//! it over the store so a failed write never clobbers the previous state.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{FacePatch, Identity, RegistryEntry};

/// Store format version; bumped on incompatible layout changes.
const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry store at {path} is corrupt: {source}")]
    CorruptStore {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("registry store at {path} has unsupported version {found} (expected {STORE_VERSION})")]
    UnsupportedVersion { path: PathBuf, found: u32 },
    #[error("failed to persist registry at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid identity {0:?}: {1}")]
    InvalidIdentity(String, &'static str),
}

/// Set of registered (patch, identity) pairs.
///
/// Entries are unordered as a set, but insertion order is kept as the stable
/// iteration order. Duplicate pairs collapse; there is no removal.
pub trait Registry {
    /// Insert a pair. Idempotent for a pair that is already present.
    fn add(&mut self, patch: FacePatch, identity: Identity) -> Result<(), RegistryError>;

    /// Snapshot of the current entries, in insertion order.
    fn entries(&self) -> &[RegistryEntry];

    /// Number of distinct entries.
    fn len(&self) -> usize {
        self.entries().len()
    }

    fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

fn validate_identity(identity: &Identity) -> Result<(), RegistryError> {
    if identity.is_empty() {
        return Err(RegistryError::InvalidIdentity(
            identity.as_str().to_string(),
            "label must not be empty",
        ));
    }
    Ok(())
}

/// Volatile registry; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: Vec<RegistryEntry>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Registry for MemoryRegistry {
    fn add(&mut self, patch: FacePatch, identity: Identity) -> Result<(), RegistryError> {
        validate_identity(&identity)?;
        let entry = RegistryEntry { patch, identity };
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
        Ok(())
    }

    fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }
}

/// On-disk JSON container for [`FileRegistry`].
#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: Vec<RegistryEntry>,
}

/// Registry persisted as a single JSON file.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    entries: Vec<RegistryEntry>,
}

impl FileRegistry {
    /// Open the registry at `path`.
    ///
    /// A missing file yields an empty registry bound to that path; no file is
    /// created until the first successful `add`. Bytes that do not decode as
    /// a store are a hard error, never silently treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no registry store; starting empty");
            return Ok(Self {
                path,
                entries: Vec::new(),
            });
        }

        let bytes = fs::read(&path).map_err(|source| RegistryError::Persistence {
            path: path.clone(),
            source,
        })?;
        let store: StoreFile =
            serde_json::from_slice(&bytes).map_err(|source| RegistryError::CorruptStore {
                path: path.clone(),
                source,
            })?;
        if store.version != STORE_VERSION {
            return Err(RegistryError::UnsupportedVersion {
                path,
                found: store.version,
            });
        }

        tracing::debug!(
            path = %path.display(),
            entries = store.entries.len(),
            "registry store loaded"
        );
        Ok(Self {
            path,
            entries: store.entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `entries` to a temp file next to the store, then rename it
    /// into place. The previous store stays intact if anything fails.
    fn persist(&self, entries: &[RegistryEntry]) -> Result<(), RegistryError> {
        let io_err = |source| RegistryError::Persistence {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let store = StoreFile {
            version: STORE_VERSION,
            entries: entries.to_vec(),
        };
        let bytes =
            serde_json::to_vec(&store).map_err(|source| RegistryError::Persistence {
                path: self.path.clone(),
                source: io::Error::other(source),
            })?;

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Err(source) = fs::write(&tmp, &bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(source));
        }
        if let Err(source) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(source));
        }
        Ok(())
    }
}

impl Registry for FileRegistry {
    /// Insert and persist. The in-memory set is only updated after the write
    /// has been confirmed, so a failed `add` leaves both the file and the
    /// in-memory state as they were.
    fn add(&mut self, patch: FacePatch, identity: Identity) -> Result<(), RegistryError> {
        validate_identity(&identity)?;
        let entry = RegistryEntry { patch, identity };
        if self.entries.contains(&entry) {
            tracing::debug!(identity = %entry.identity, "duplicate registry entry ignored");
            return Ok(());
        }

        let mut next = self.entries.clone();
        next.push(entry);
        self.persist(&next)?;
        if let Some(added) = next.last() {
            tracing::info!(
                path = %self.path.display(),
                identity = %added.identity,
                entries = next.len(),
                "registry entry persisted"
            );
        }
        self.entries = next;
        Ok(())
    }

    fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(seed: u8) -> FacePatch {
        FacePatch::new(2, 2, vec![seed; 12]).unwrap()
    }

    #[test]
    fn test_memory_registry_add_and_dedupe() {
        let mut reg = MemoryRegistry::new();
        assert_eq!(reg.len(), 0);
        reg.add(patch(1), "alice".into()).unwrap();
        reg.add(patch(2), "bob".into()).unwrap();
        assert_eq!(reg.len(), 2);
        // duplicate pair collapses
        reg.add(patch(1), "alice".into()).unwrap();
        assert_eq!(reg.len(), 2);
        // same patch under a different identity is allowed
        reg.add(patch(1), "alias".into()).unwrap();
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_memory_registry_rejects_empty_identity() {
        let mut reg = MemoryRegistry::new();
        let err = reg.add(patch(1), "  ".into()).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidIdentity(..)));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_open_missing_path_is_empty_and_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.json");
        let reg = FileRegistry::open(&path).unwrap();
        assert!(reg.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_add_persists_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.json");

        let mut reg = FileRegistry::open(&path).unwrap();
        reg.add(patch(1), "alice".into()).unwrap();
        assert!(path.exists());
        assert_eq!(reg.len(), 1);

        let reloaded = FileRegistry::open(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.entries()[0].identity, Identity::from("alice"));
        assert_eq!(reloaded.entries()[0].patch, patch(1));
    }

    #[test]
    fn test_duplicate_add_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.json");

        let mut reg = FileRegistry::open(&path).unwrap();
        reg.add(patch(1), "alice".into()).unwrap();
        reg.add(patch(1), "alice".into()).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(FileRegistry::open(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_insertion_order_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.json");

        let mut reg = FileRegistry::open(&path).unwrap();
        for (seed, name) in [(1u8, "alice"), (2, "bob"), (3, "carol")] {
            reg.add(patch(seed), name.into()).unwrap();
        }
        let names: Vec<_> = reg
            .entries()
            .iter()
            .map(|e| e.identity.as_str().to_string())
            .collect();
        assert_eq!(names, ["alice", "bob", "carol"]);

        let reloaded = FileRegistry::open(&path).unwrap();
        let names: Vec<_> = reloaded
            .entries()
            .iter()
            .map(|e| e.identity.as_str().to_string())
            .collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
    }

    #[test]
    fn test_corrupt_store_is_an_error_not_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.json");
        fs::write(&path, b"not json at all").unwrap();

        let err = FileRegistry::open(&path).unwrap_err();
        assert!(matches!(err, RegistryError::CorruptStore { .. }));
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.json");
        fs::write(&path, br#"{"version": 99, "entries": []}"#).unwrap();

        let err = FileRegistry::open(&path).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UnsupportedVersion { found: 99, .. }
        ));
    }

    #[test]
    fn test_failed_persist_rolls_back_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.json");
        let mut reg = FileRegistry::open(&path).unwrap();
        reg.add(patch(1), "alice".into()).unwrap();

        // Replace the store path's parent with a plain file so the temp-file
        // write must fail.
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, b"x").unwrap();
        reg.path = blocked.join("faces.json");

        let err = reg.add(patch(2), "bob".into()).unwrap_err();
        assert!(matches!(err, RegistryError::Persistence { .. }));
        // in-memory state unchanged
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.entries()[0].identity, Identity::from("alice"));
    }
}
