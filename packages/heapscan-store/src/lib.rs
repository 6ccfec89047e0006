//! heapscan-store - versioned binary persistence for analysis summaries
//!
//! Summaries are persisted one file per procedure under
//! `<results-dir>/specs/`, encoded as msgpack with a fixed envelope header
//! `(magic, kind, format_version)`. A load whose header does not match the
//! requested key returns `Ok(None)` ("absent") rather than a partial value,
//! so readers never observe summaries written by an incompatible build.

pub mod error;

pub use error::{ErrorKind, Result, StoreError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Envelope magic, checked before anything else is decoded.
const MAGIC: &str = "HSCN";

/// Envelope header written before every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Header {
    magic: String,
    kind: String,
    version: u32,
}

/// A key identifying one payload schema.
///
/// `kind` names the payload family ("summary", "issues", ...); `version`
/// is bumped whenever the serialized shape changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreKey {
    pub kind: &'static str,
    pub version: u32,
}

impl StoreKey {
    pub const fn new(kind: &'static str, version: u32) -> Self {
        Self { kind, version }
    }
}

/// File-backed blob store for one payload family.
///
/// Entries are written atomically (write to a temp name, then rename) so a
/// crashed writer never leaves a half-written entry under the final name.
#[derive(Debug, Clone)]
pub struct SpecStore {
    root: PathBuf,
    key: StoreKey,
}

impl SpecStore {
    /// Open (creating if needed) the store directory under `results_dir`.
    pub fn open(results_dir: &Path, subdir: &str, key: StoreKey) -> Result<Self> {
        let root = results_dir.join(subdir);
        fs::create_dir_all(&root).map_err(|e| {
            StoreError::store_directory(format!("cannot create {}: {}", root.display(), e))
        })?;
        Ok(Self { root, key })
    }

    /// Directory holding the entries.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        // Procedure names may contain path separators (C++ scoping); keep
        // the file name flat.
        let safe: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
            .collect();
        self.root.join(format!("{}.{}", safe, self.key.kind))
    }

    /// Persist `value` under `name`, replacing any previous entry.
    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let header = Header {
            magic: MAGIC.to_string(),
            kind: self.key.kind.to_string(),
            version: self.key.version,
        };
        let mut buf = rmp_serde::to_vec(&header)
            .map_err(|e| StoreError::serialization(e.to_string()))?;
        let payload =
            rmp_serde::to_vec(value).map_err(|e| StoreError::serialization(e.to_string()))?;
        buf.extend_from_slice(&payload);

        let path = self.entry_path(name);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, &path)?;
        tracing::debug!(entry = name, bytes = buf.len(), "persisted store entry");
        Ok(())
    }

    /// Load the entry for `name`.
    ///
    /// Returns `Ok(None)` when the entry is absent, or when its header
    /// (magic, kind or version) does not match this store's key. A header
    /// that matches but a payload that fails to decode is a hard error:
    /// the store is corrupt, not merely stale.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.entry_path(name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut cursor = Cursor::new(bytes.as_slice());
        let header: Header = match rmp_serde::from_read(&mut cursor) {
            Ok(h) => h,
            // Unreadable header: written by something else entirely.
            Err(_) => return Ok(None),
        };
        if header.magic != MAGIC
            || header.kind != self.key.kind
            || header.version != self.key.version
        {
            return Ok(None);
        }

        let value: T = rmp_serde::from_read(&mut cursor).map_err(|e| {
            StoreError::corrupt(format!("{}: {}", path.display(), e))
        })?;
        Ok(Some(value))
    }

    /// Remove the entry for `name` if present.
    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.entry_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List the names of all entries currently persisted.
    pub fn list(&self) -> Result<Vec<String>> {
        let suffix = format!(".{}", self.key.kind);
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(stem) = file_name.strip_suffix(&suffix) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        values: Vec<i64>,
    }

    fn sample() -> Payload {
        Payload {
            name: "f".to_string(),
            values: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpecStore::open(dir.path(), "specs", StoreKey::new("summary", 1)).unwrap();

        store.save("f", &sample()).unwrap();
        let loaded: Option<Payload> = store.load("f").unwrap();
        assert_eq!(loaded, Some(sample()));
    }

    #[test]
    fn test_absent_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpecStore::open(dir.path(), "specs", StoreKey::new("summary", 1)).unwrap();

        let loaded: Option<Payload> = store.load("missing").unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn test_version_mismatch_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = SpecStore::open(dir.path(), "specs", StoreKey::new("summary", 1)).unwrap();
        let v2 = SpecStore::open(dir.path(), "specs", StoreKey::new("summary", 2)).unwrap();

        v1.save("f", &sample()).unwrap();
        let loaded: Option<Payload> = v2.load("f").unwrap();
        assert_eq!(loaded, None, "mismatched version must read as absent");
    }

    #[test]
    fn test_kind_mismatch_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let a = SpecStore::open(dir.path(), "specs", StoreKey::new("summary", 1)).unwrap();
        // Same directory, same file extension cannot collide across kinds
        // (kind is part of the file name), so write raw bytes with a bad kind.
        let path = dir.path().join("specs").join("f.summary");
        let header = ("HSCN".to_string(), "other".to_string(), 1u32);
        let mut bytes = rmp_serde::to_vec(&header).unwrap();
        bytes.extend_from_slice(&rmp_serde::to_vec(&sample()).unwrap());
        std::fs::write(path, bytes).unwrap();

        let loaded: Option<Payload> = a.load("f").unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn test_garbage_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpecStore::open(dir.path(), "specs", StoreKey::new("summary", 1)).unwrap();
        std::fs::write(dir.path().join("specs").join("f.summary"), b"not msgpack").unwrap();

        let loaded: Option<Payload> = store.load("f").unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpecStore::open(dir.path(), "specs", StoreKey::new("summary", 1)).unwrap();

        store.save("a", &sample()).unwrap();
        store.save("b", &sample()).unwrap();
        assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".to_string()]);

        store.delete("a").unwrap();
        assert_eq!(store.list().unwrap(), vec!["b".to_string()]);
    }
}
