// src/config/atomic_file.rs
//
// Crash-safe document persistence: write-ahead log + temp-file-plus-rename.
//
// Write protocol per document:
//   1. checksum the serialized bytes (rolling XOR; skipped above 10 KiB)
//   2. append a WAL record, completed=false
//   3. write `<path>.tmp`, flush, close, verify non-empty and readable
//   4. remove `<path>` if present, rename `<path>.tmp` -> `<path>`  (commit)
//   5. mark the WAL record completed
//
// The WAL lives in memory only; it drives recovery within one process
// lifetime. After a crash, recovery falls back to the `.tmp` scan: an orphan
// with no live WAL entry is deleted, one with an incomplete write entry gets
// its rename retried.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::ConfigError;

/// Documents larger than this skip the checksum and record `SkippedLarge`.
pub const CHECKSUM_MAX_LEN: usize = 10 * 1024;

/// Integrity hint for a persisted document. The rolling XOR detects gross
/// corruption only; it is not proof of authenticity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    Xor(u8),
    SkippedLarge,
}

/// Rolling XOR over the document bytes.
pub fn rolling_xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Compute the integrity hint for a document.
pub fn checksum_for(bytes: &[u8]) -> Checksum {
    if bytes.len() > CHECKSUM_MAX_LEN {
        Checksum::SkippedLarge
    } else {
        Checksum::Xor(rolling_xor(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Write,
    Delete,
}

/// One pending file mutation.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub op: WalOp,
    pub target_path: PathBuf,
    pub temp_path: Option<PathBuf>,
    pub timestamp_ms: i64,
    pub checksum: Checksum,
    pub completed: bool,
}

/// Atomic document store rooted at one directory.
pub struct AtomicStore {
    root: PathBuf,
    wal: Mutex<Vec<WalRecord>>,
}

impl AtomicStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            wal: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Read a document. `Ok(None)` when the file is absent.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>, ConfigError> {
        let path = self.resolve(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Atomically replace a document with `bytes`.
    pub fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), ConfigError> {
        let path = self.resolve(name);
        let temp_path = temp_path_for(&path);

        fs::create_dir_all(&self.root)?;

        let checksum = checksum_for(bytes);
        let wal_index = {
            let mut wal = self.wal.lock().expect("wal mutex poisoned");
            wal.push(WalRecord {
                op: WalOp::Write,
                target_path: path.clone(),
                temp_path: Some(temp_path.clone()),
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                checksum,
                completed: false,
            });
            wal.len() - 1
        };

        // Step 3: temp write, flush, close, verify
        {
            let mut file = fs::File::create(&temp_path).map_err(|e| {
                ConfigError::TempWriteFailed {
                    path: temp_path.display().to_string(),
                    source: e,
                }
            })?;
            file.write_all(bytes)
                .and_then(|_| file.flush())
                .and_then(|_| file.sync_all())
                .map_err(|e| ConfigError::TempWriteFailed {
                    path: temp_path.display().to_string(),
                    source: e,
                })?;
        }
        self.verify_temp(&temp_path, bytes.len(), checksum)?;

        // Step 4: remove target, rename temp into place (the commit point)
        if path.exists() {
            fs::remove_file(&path).map_err(|e| ConfigError::RenameFailed {
                from: temp_path.display().to_string(),
                to: path.display().to_string(),
                source: e,
            })?;
        }
        fs::rename(&temp_path, &path).map_err(|e| ConfigError::RenameFailed {
            from: temp_path.display().to_string(),
            to: path.display().to_string(),
            source: e,
        })?;

        // Step 5: mark completed
        if let Ok(mut wal) = self.wal.lock() {
            if let Some(record) = wal.get_mut(wal_index) {
                record.completed = true;
            }
        }

        Ok(())
    }

    /// Verify the temp file is non-empty, readable, and matches the checksum.
    fn verify_temp(
        &self,
        temp_path: &Path,
        expected_len: usize,
        checksum: Checksum,
    ) -> Result<(), ConfigError> {
        let read_back = fs::read(temp_path).map_err(|_| {
            ConfigError::IntegrityFailed(temp_path.display().to_string())
        })?;
        if read_back.is_empty() || read_back.len() != expected_len {
            return Err(ConfigError::IntegrityFailed(temp_path.display().to_string()));
        }
        if let Checksum::Xor(expected) = checksum {
            if rolling_xor(&read_back) != expected {
                return Err(ConfigError::IntegrityFailed(temp_path.display().to_string()));
            }
        }
        Ok(())
    }

    /// Delete a document. Idempotent: an absent file is success.
    pub fn delete(&self, name: &str) -> Result<(), ConfigError> {
        let path = self.resolve(name);

        if let Ok(mut wal) = self.wal.lock() {
            wal.push(WalRecord {
                op: WalOp::Delete,
                target_path: path.clone(),
                temp_path: None,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                checksum: Checksum::SkippedLarge,
                completed: false,
            });
        }

        let result = match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConfigError::Io(e)),
        };

        if result.is_ok() {
            if let Ok(mut wal) = self.wal.lock() {
                if let Some(record) = wal
                    .iter_mut()
                    .rev()
                    .find(|r| r.op == WalOp::Delete && r.target_path == path)
                {
                    record.completed = true;
                }
            }
        }
        result
    }

    /// Recovery pass, run exactly once per process start before any read.
    /// Scans the storage root for orphan `.tmp` files; an orphan whose WAL
    /// entry is an incomplete write gets its rename retried, every other
    /// orphan is deleted. The WAL is cleared afterwards.
    pub fn recover(&self) -> Result<RecoveryReport, ConfigError> {
        let mut report = RecoveryReport::default();

        if !self.root.exists() {
            return Ok(report);
        }

        let wal = self.wal.lock().expect("wal mutex poisoned");
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let is_tmp = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "tmp")
                .unwrap_or(false);
            if !is_tmp {
                continue;
            }

            let pending = wal.iter().find(|r| {
                r.op == WalOp::Write
                    && !r.completed
                    && r.temp_path.as_deref() == Some(path.as_path())
            });

            match pending {
                Some(record) => {
                    let target = record.target_path.clone();
                    if target.exists() {
                        fs::remove_file(&target)?;
                    }
                    fs::rename(&path, &target)?;
                    report.renames_retried += 1;
                }
                None => {
                    fs::remove_file(&path)?;
                    report.orphans_removed += 1;
                }
            }
        }
        drop(wal);

        self.wal.lock().expect("wal mutex poisoned").clear();
        Ok(report)
    }

    #[cfg(test)]
    pub(crate) fn wal_len(&self) -> usize {
        self.wal.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn wal_incomplete(&self) -> usize {
        self.wal.lock().unwrap().iter().filter(|r| !r.completed).count()
    }
}

/// `<path>.tmp` sibling for a target document.
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub orphans_removed: usize,
    pub renames_retried: usize,
}
