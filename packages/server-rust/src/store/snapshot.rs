//! Durable tree snapshots.
//!
//! A snapshot file is self-describing: an 8-byte magic, the tree schema
//! version (`@/apversion`), the snapshot's batch version, then the
//! MsgPack-encoded tree. Writes go to a temp file that is fsynced and
//! renamed into place, so a crash never leaves a half-written snapshot
//! where the loader can see it.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use cfgplane_core::{ConfigError, PropertyTree, APVERSION};

const MAGIC: &[u8; 8] = b"CFGSNAP\0";

/// Reader/writer for the snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `tree` as the new snapshot, atomically replacing any
    /// previous one.
    ///
    /// # Errors
    ///
    /// `CORRUPT` when encoding or any filesystem step fails.
    pub fn write(&self, tree: &PropertyTree) -> Result<(), ConfigError> {
        let payload = rmp_serde::to_vec_named(tree).map_err(|err| ConfigError::Corrupt {
            reason: format!("snapshot encode: {err}"),
        })?;

        let mut bytes = Vec::with_capacity(MAGIC.len() + 1 + APVERSION.len() + 8 + payload.len());
        bytes.extend_from_slice(MAGIC);
        #[allow(clippy::cast_possible_truncation)]
        bytes.push(APVERSION.len() as u8);
        bytes.extend_from_slice(APVERSION.as_bytes());
        bytes.extend_from_slice(&tree.version().to_le_bytes());
        bytes.extend_from_slice(&payload);

        let tmp = self.path.with_extension("snap.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|err| corrupt(&tmp, "open", &err))?;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|err| corrupt(&tmp, "chmod", &err))?;
            file.write_all(&bytes)
                .and_then(|()| file.sync_all())
                .map_err(|err| corrupt(&tmp, "write", &err))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|err| corrupt(&self.path, "rename", &err))?;

        tracing::debug!(
            path = %self.path.display(),
            version = tree.version(),
            bytes = bytes.len(),
            "snapshot written"
        );
        Ok(())
    }

    /// Loads the snapshot, or `None` when no snapshot exists yet.
    ///
    /// # Errors
    ///
    /// `CORRUPT` for a damaged file or a schema-version mismatch.
    pub fn load(&self) -> Result<Option<PropertyTree>, ConfigError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(corrupt(&self.path, "read", &err)),
        };

        let fail = |reason: &str| ConfigError::Corrupt {
            reason: format!("snapshot {}: {reason}", self.path.display()),
        };

        if bytes.len() < MAGIC.len() + 1 || &bytes[..MAGIC.len()] != MAGIC {
            return Err(fail("bad magic"));
        }
        let mut offset = MAGIC.len();
        let ver_len = bytes[offset] as usize;
        offset += 1;
        let apversion = bytes
            .get(offset..offset + ver_len)
            .ok_or_else(|| fail("short header"))?;
        if apversion != APVERSION.as_bytes() {
            return Err(fail("tree schema version mismatch"));
        }
        offset += ver_len;
        let header_version: [u8; 8] = bytes
            .get(offset..offset + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| fail("short header"))?;
        let header_version = u64::from_le_bytes(header_version);
        offset += 8;

        let tree: PropertyTree =
            rmp_serde::from_slice(&bytes[offset..]).map_err(|_| fail("payload decode"))?;
        if tree.version() != header_version {
            return Err(fail("header/payload version mismatch"));
        }
        Ok(Some(tree))
    }
}

fn corrupt(path: &Path, action: &str, err: &std::io::Error) -> ConfigError {
    ConfigError::Corrupt {
        reason: format!("snapshot {action} {}: {err}", path.display()),
    }
}
