//! Append-only write-ahead journal of committed change sets.
//!
//! Record layout: `[payload length: u32 LE][blake3 checksum: 32 bytes]
//! [payload: MsgPack ChangeSet]`. `append` flushes and fsyncs before
//! returning, so a record's presence implies the batch it describes was
//! durably committed. Recovery walks the records in order and truncates
//! the file at the first invalid one.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use cfgplane_core::{ChangeSet, ConfigError};

/// Upper bound on a single record payload. A change set is one batch's
/// worth of events; anything larger than this is corruption.
const MAX_RECORD_BYTES: u32 = 64 * 1024 * 1024;

const HEADER_BYTES: usize = 4 + 32;

/// Outcome of a journal replay.
#[derive(Debug)]
pub struct ReplayOutcome {
    /// Valid records in file order.
    pub sets: Vec<ChangeSet>,
    /// `true` when a corrupt tail was truncated away.
    pub truncated: bool,
}

/// Handle to the open journal file.
#[derive(Debug)]
pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Opens (creating if absent) the journal at `path`, mode 0600.
    ///
    /// # Errors
    ///
    /// `CORRUPT` when the file cannot be opened or secured.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(|err| corrupt(path, "open", &err))?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|err| corrupt(path, "chmod", &err))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Appends one change set and fsyncs.
    ///
    /// # Errors
    ///
    /// `CORRUPT` when encoding or the write/fsync fails; the caller rolls
    /// the batch back.
    pub fn append(&mut self, set: &ChangeSet) -> Result<(), ConfigError> {
        let payload = rmp_serde::to_vec_named(set).map_err(|err| ConfigError::Corrupt {
            reason: format!("journal encode: {err}"),
        })?;
        #[allow(clippy::cast_possible_truncation)]
        let len = payload.len() as u32;
        let checksum = blake3::hash(&payload);

        let mut record = Vec::with_capacity(HEADER_BYTES + payload.len());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(checksum.as_bytes());
        record.extend_from_slice(&payload);

        self.file
            .write_all(&record)
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync_data())
            .map_err(|err| corrupt(&self.path, "append", &err))
    }

    /// Current journal size in bytes.
    ///
    /// # Errors
    ///
    /// `CORRUPT` when the file cannot be stat'ed.
    pub fn len_bytes(&self) -> Result<u64, ConfigError> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| corrupt(&self.path, "stat", &err))
    }

    /// Rewrites the journal keeping only records with
    /// `version > keep_after`. Called by the compactor after a snapshot
    /// has subsumed the prefix.
    ///
    /// # Errors
    ///
    /// `CORRUPT` when the rewrite fails; the original journal is left
    /// untouched in that case.
    pub fn rotate(&mut self, keep_after: u64) -> Result<(), ConfigError> {
        let outcome = Self::replay(&self.path)?;
        let tmp = self.path.with_extension("jrn.tmp");
        // A tmp file left by an interrupted rotation must not be appended to.
        match std::fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(corrupt(&tmp, "unlink", &err)),
        }

        {
            let mut writer = Self::open(&tmp)?;
            for set in outcome.sets.iter().filter(|set| set.version > keep_after) {
                writer.append(set)?;
            }
        }

        std::fs::rename(&tmp, &self.path).map_err(|err| corrupt(&self.path, "rotate", &err))?;
        let rotated = Self::open(&self.path)?;
        self.file = rotated.file;
        Ok(())
    }

    /// Reads every valid record from the journal at `path`.
    ///
    /// The first record with a bad length, checksum, or payload marks the
    /// end of usable history: the file is truncated there, the loss is
    /// logged, and replay reports `truncated`. A missing file is an empty
    /// journal.
    ///
    /// # Errors
    ///
    /// `CORRUPT` only for I/O failures; checksum damage is handled by
    /// truncation, not an error.
    pub fn replay(path: &Path) -> Result<ReplayOutcome, ConfigError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReplayOutcome {
                    sets: Vec::new(),
                    truncated: false,
                })
            }
            Err(err) => return Err(corrupt(path, "read", &err)),
        };

        let mut sets = Vec::new();
        let mut offset = 0usize;
        let mut valid_end = 0usize;

        loop {
            if offset == bytes.len() {
                break;
            }
            let Some(set) = decode_record(&bytes[offset..]) else {
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    lost_bytes = bytes.len() - offset,
                    "journal record corrupt; truncating tail"
                );
                truncate_at(path, valid_end as u64)?;
                return Ok(ReplayOutcome {
                    sets,
                    truncated: true,
                });
            };
            offset += HEADER_BYTES + record_payload_len(&bytes[offset..]);
            valid_end = offset;
            sets.push(set);
        }

        Ok(ReplayOutcome {
            sets,
            truncated: false,
        })
    }
}

fn record_payload_len(bytes: &[u8]) -> usize {
    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(len) as usize
}

/// Decodes the record at the start of `bytes`, or `None` when the record
/// is incomplete or damaged.
fn decode_record(bytes: &[u8]) -> Option<ChangeSet> {
    if bytes.len() < HEADER_BYTES {
        return None;
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[..4]);
    let len = u32::from_le_bytes(len);
    if len > MAX_RECORD_BYTES {
        return None;
    }
    let len = len as usize;
    let payload = bytes.get(HEADER_BYTES..HEADER_BYTES + len)?;
    let expected: [u8; 32] = bytes[4..36].try_into().ok()?;
    if *blake3::hash(payload).as_bytes() != expected {
        return None;
    }
    rmp_serde::from_slice(payload).ok()
}

fn truncate_at(path: &Path, len: u64) -> Result<(), ConfigError> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_len(len))
        .map_err(|err| corrupt(path, "truncate", &err))
}

fn corrupt(path: &Path, action: &str, err: &std::io::Error) -> ConfigError {
    ConfigError::Corrupt {
        reason: format!("journal {action} {}: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use cfgplane_core::{ChangeEvent, ChangeKind};
    use tempfile::TempDir;

    use super::*;

    fn change_set(version: u64) -> ChangeSet {
        ChangeSet {
            version,
            commit_ms: 1_700_000_000_000 + i64::try_from(version).unwrap(),
            events: vec![ChangeEvent {
                path: format!("@/rings/guest/vlan{version}"),
                kind: ChangeKind::Updated,
                value: Some(version.to_string()),
                expiry_ms: None,
            }],
        }
    }

    #[test]
    fn append_then_replay_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.jrn");

        let mut journal = Journal::open(&path).unwrap();
        for version in 1..=5 {
            journal.append(&change_set(version)).unwrap();
        }

        let outcome = Journal::replay(&path).unwrap();
        assert!(!outcome.truncated);
        assert_eq!(outcome.sets.len(), 5);
        assert_eq!(outcome.sets[4].version, 5);
    }

    #[test]
    fn replay_of_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let outcome = Journal::replay(&dir.path().join("none.jrn")).unwrap();
        assert!(outcome.sets.is_empty());
        assert!(!outcome.truncated);
    }

    #[test]
    fn corrupt_tail_is_truncated_and_prefix_survives() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.jrn");

        let mut journal = Journal::open(&path).unwrap();
        journal.append(&change_set(1)).unwrap();
        journal.append(&change_set(2)).unwrap();
        let good_len = std::fs::metadata(&path).unwrap().len();
        journal.append(&change_set(3)).unwrap();
        drop(journal);

        // Flip a byte inside the third record's payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let target = usize::try_from(good_len).unwrap() + HEADER_BYTES + 2;
        bytes[target] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let outcome = Journal::replay(&path).unwrap();
        assert!(outcome.truncated);
        assert_eq!(outcome.sets.len(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        // A second replay sees a clean journal.
        let outcome = Journal::replay(&path).unwrap();
        assert!(!outcome.truncated);
        assert_eq!(outcome.sets.len(), 2);
    }

    #[test]
    fn short_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.jrn");

        let mut journal = Journal::open(&path).unwrap();
        journal.append(&change_set(1)).unwrap();
        let good_len = std::fs::metadata(&path).unwrap().len();
        drop(journal);

        // A torn write: header promises more payload than exists.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        std::fs::write(&path, &bytes).unwrap();

        let outcome = Journal::replay(&path).unwrap();
        assert!(outcome.truncated);
        assert_eq!(outcome.sets.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
    }

    #[test]
    fn rotate_drops_subsumed_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.jrn");

        let mut journal = Journal::open(&path).unwrap();
        for version in 1..=6 {
            journal.append(&change_set(version)).unwrap();
        }
        journal.rotate(4).unwrap();

        let outcome = Journal::replay(&path).unwrap();
        let versions: Vec<u64> = outcome.sets.iter().map(|set| set.version).collect();
        assert_eq!(versions, vec![5, 6]);

        // The handle still appends after rotation.
        journal.append(&change_set(7)).unwrap();
        let outcome = Journal::replay(&path).unwrap();
        assert_eq!(outcome.sets.len(), 3);
    }

    #[test]
    fn journal_file_mode_is_0600() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.jrn");
        let _journal = Journal::open(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
