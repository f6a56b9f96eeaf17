//! Durable record store.
//!
//! One directory holds one data set (the mirror, or a workspace):
//!
//! ```text
//! <root>/
//!   FORMAT                 # "trellis-format 1"
//!   aliases                # alias map, see AliasMap::encode
//!   issues/<id>.issue      # one canonical record per file
//!   attic/<id>/...         # conflict remnants, see crate::attic
//! ```
//!
//! # Invariants
//!
//! - Every write is temp file in the same directory, `fsync`, atomic rename,
//!   then `fsync` of the directory. An interrupted write leaves either the old
//!   or the new file, never a torn one.
//! - Reads go through the codec and fail loudly on anything non-canonical.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::codec;
use crate::error::{Error, Result};
use crate::model::{AliasMap, Issue, IssueId};

pub const FORMAT_FILE: &str = "FORMAT";
pub const FORMAT_LINE: &str = "trellis-format 1";
pub const ISSUES_DIR: &str = "issues";
pub const ALIASES_FILE: &str = "aliases";
pub const ATTIC_DIR: &str = "attic";
pub const ISSUE_EXT: &str = "issue";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Filesystem failures, always carrying the path involved.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub(crate) fn read(path: &Path, source: io::Error) -> Self {
        Self::Read {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn write(path: &Path, source: io::Error) -> Self {
        Self::Write {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Atomic file primitives
// ---------------------------------------------------------------------------

/// Replace `path` with `bytes` atomically.
///
/// # Errors
///
/// Returns [`StoreError::Write`] if any step fails; the previous contents
/// of `path` are then still intact.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::write(path, io::Error::other("path has no parent")))?;
    fs::create_dir_all(dir).map_err(|e| StoreError::write(dir, e))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.tmp-{}", std::process::id()));

    let result = (|| -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        sync_dir(dir)
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::write(path, err));
    }
    Ok(())
}

/// Read `path`, mapping "does not exist" to `None`.
///
/// # Errors
///
/// Returns [`StoreError::Read`] for any other I/O failure.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::read(path, err)),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// IssueStore
// ---------------------------------------------------------------------------

/// A record file found on disk, decoded or not.
#[derive(Debug)]
pub struct RecordFile {
    pub path: PathBuf,
    /// File stem, which should be the record's internal id.
    pub stem: String,
    pub bytes: Vec<u8>,
}

/// Records, alias map and format marker of one data set.
#[derive(Debug, Clone)]
pub struct IssueStore {
    root: PathBuf,
}

impl IssueStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn issues_dir(&self) -> PathBuf {
        self.root.join(ISSUES_DIR)
    }

    #[must_use]
    pub fn attic_dir(&self) -> PathBuf {
        self.root.join(ATTIC_DIR)
    }

    #[must_use]
    pub fn aliases_path(&self) -> PathBuf {
        self.root.join(ALIASES_FILE)
    }

    #[must_use]
    pub fn issue_path(&self, id: &IssueId) -> PathBuf {
        self.issues_dir().join(format!("{id}.{ISSUE_EXT}"))
    }

    /// Create the directory skeleton. Existing files are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory or marker file cannot be written.
    pub fn init(&self) -> Result<()> {
        let issues = self.issues_dir();
        fs::create_dir_all(&issues).map_err(|e| StoreError::write(&issues, e))?;
        let format = self.root.join(FORMAT_FILE);
        if read_optional(&format)?.is_none() {
            write_atomic(&format, format!("{FORMAT_LINE}\n").as_bytes())?;
        }
        if read_optional(&self.aliases_path())?.is_none() {
            write_atomic(&self.aliases_path(), b"")?;
        }
        Ok(())
    }

    /// The format marker line, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker exists but cannot be read.
    pub fn format(&self) -> Result<Option<String>> {
        let path = self.root.join(FORMAT_FILE);
        Ok(read_optional(&path)?.map(|bytes| String::from_utf8_lossy(&bytes).trim_end().to_string()))
    }

    /// Read one record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] if the file exists but is not a canonical
    /// record for `id`.
    pub fn read_issue(&self, id: &IssueId) -> Result<Option<Issue>> {
        let path = self.issue_path(id);
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        let issue = codec::decode(&bytes).map_err(|source| Error::Corrupt {
            path: path.clone(),
            source,
        })?;
        if issue.id != *id {
            return Err(Error::Integrity {
                count: 1,
                summary: format!("{} holds record {}", path.display(), issue.id),
            });
        }
        Ok(Some(issue))
    }

    /// Write one record atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the write fails.
    pub fn write_issue(&self, issue: &Issue) -> Result<()> {
        let path = self.issue_path(&issue.id);
        write_atomic(&path, &codec::encode(issue))?;
        debug!(id = %issue.id, version = issue.version, "record written");
        Ok(())
    }

    /// Every `*.issue` file, sorted by file name, without decoding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the directory cannot be listed or a file
    /// cannot be read.
    pub fn record_files(&self) -> Result<Vec<RecordFile>> {
        let dir = self.issues_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::read(&dir, err).into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::read(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ISSUE_EXT) {
                continue;
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let bytes = fs::read(&path).map_err(|e| StoreError::read(&path, e))?;
            files.push(RecordFile { path, stem, bytes });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Decode every record.
    ///
    /// # Errors
    ///
    /// Fails on the first undecodable or misnamed record; run the integrity
    /// check for a full report.
    pub fn load_all(&self) -> Result<BTreeMap<IssueId, Issue>> {
        let mut out = BTreeMap::new();
        for file in self.record_files()? {
            let issue = codec::decode(&file.bytes).map_err(|source| Error::Corrupt {
                path: file.path.clone(),
                source,
            })?;
            if issue.id.as_str() != file.stem {
                return Err(Error::Integrity {
                    count: 1,
                    summary: format!("{} holds record {}", file.path.display(), issue.id),
                });
            }
            out.insert(issue.id.clone(), issue);
        }
        Ok(out)
    }

    /// The alias map; empty if the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] if the file is not in canonical form.
    pub fn read_aliases(&self) -> Result<AliasMap> {
        let path = self.aliases_path();
        let Some(bytes) = read_optional(&path)? else {
            return Ok(AliasMap::new());
        };
        let text = std::str::from_utf8(&bytes).map_err(|_| Error::Corrupt {
            path: path.clone(),
            source: codec::DecodeError::NotUtf8,
        })?;
        AliasMap::decode(text).map_err(|source| Error::Corrupt { path, source })
    }

    /// Write the alias map atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the write fails.
    pub fn write_aliases(&self, map: &AliasMap) -> Result<()> {
        write_atomic(&self.aliases_path(), map.encode().as_bytes())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::time::parse_timestamp;
    use crate::model::Alias;
    use tempfile::TempDir;

    fn setup() -> (TempDir, IssueStore) {
        let tmp = TempDir::new().expect("tempdir");
        let store = IssueStore::new(tmp.path().join("data"));
        store.init().expect("init");
        (tmp, store)
    }

    fn issue(id: &str, alias: &str) -> Issue {
        Issue::new(
            IssueId::parse(id).unwrap(),
            Alias::parse(alias).unwrap(),
            "Stored",
            "alice",
            parse_timestamp("2026-01-01T00:00:00.000000Z").unwrap(),
        )
    }

    #[test]
    fn init_writes_marker_and_empty_map() {
        let (_tmp, store) = setup();
        assert_eq!(store.format().unwrap().as_deref(), Some(FORMAT_LINE));
        assert!(store.read_aliases().unwrap().is_empty());
        assert!(store.issues_dir().is_dir());
        store.init().unwrap();
    }

    #[test]
    fn write_then_read_record() {
        let (_tmp, store) = setup();
        let rec = issue("01J9ZQ4Y7G0000000000000001", "tr-a1");
        store.write_issue(&rec).unwrap();
        assert_eq!(store.read_issue(&rec.id).unwrap(), Some(rec));
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let (_tmp, store) = setup();
        let path = store.root().join("notes.txt");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        let leftovers: Vec<_> = fs::read_dir(store.root())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupt_record_names_its_path() {
        let (_tmp, store) = setup();
        let rec = issue("01J9ZQ4Y7G0000000000000001", "tr-a1");
        fs::write(store.issue_path(&rec.id), "garbage\n").unwrap();
        let err = store.read_issue(&rec.id).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
        assert!(err.to_string().contains(".issue"));
    }

    #[test]
    fn misnamed_record_is_an_integrity_error() {
        let (_tmp, store) = setup();
        let rec = issue("01J9ZQ4Y7G0000000000000001", "tr-a1");
        let other = IssueId::parse("01J9ZQ4Y7G0000000000000002").unwrap();
        fs::write(store.issue_path(&other), codec::encode(&rec)).unwrap();
        assert!(matches!(store.load_all(), Err(Error::Integrity { .. })));
    }

    #[test]
    fn record_files_ignores_other_extensions() {
        let (_tmp, store) = setup();
        fs::write(store.issues_dir().join("README.md"), "hi").unwrap();
        store
            .write_issue(&issue("01J9ZQ4Y7G0000000000000001", "tr-a1"))
            .unwrap();
        let files = store.record_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].stem, "01J9ZQ4Y7G0000000000000001");
    }

    #[test]
    fn aliases_roundtrip() {
        let (_tmp, store) = setup();
        let mut map = AliasMap::new();
        map.insert(
            Alias::parse("tr-a1").unwrap(),
            IssueId::parse("01J9ZQ4Y7G0000000000000001").unwrap(),
        )
        .unwrap();
        store.write_aliases(&map).unwrap();
        assert_eq!(store.read_aliases().unwrap(), map);
    }
}
