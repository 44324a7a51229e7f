//! Durable group-chat metadata, one blob per group under
//! `gcs/<gcid-hex>/meta`.
//!
//! The stored value is the wire metadata itself; the generation gate in
//! the group controller relies on this surviving restarts.

use std::path::{Path, PathBuf};

use rvchat_types::{GcId, Result, RvChatError};
use rvchat_wire::GcMetadata;

use crate::backup;

/// Durable store of group metadata blobs.
pub struct GcStore {
    root: PathBuf,
    backup_depth: usize,
}

impl GcStore {
    /// Creates a store rooted at `app_dir`.
    pub fn new(app_dir: &Path, backup_depth: usize) -> Self {
        Self {
            root: app_dir.join("gcs"),
            backup_depth,
        }
    }

    fn meta_path(&self, gc: &GcId) -> PathBuf {
        self.root.join(gc.to_string()).join("meta")
    }

    /// Persists group metadata.
    pub fn save(&self, meta: &GcMetadata) -> Result<()> {
        let bytes = serde_json::to_vec(meta).map_err(|e| RvChatError::Storage {
            reason: format!("group metadata encoding failed: {e}"),
        })?;
        backup::write_durable(&self.meta_path(&meta.id), &bytes, self.backup_depth)
    }

    /// Loads one group's metadata.
    pub fn load(&self, gc: &GcId) -> Result<Option<GcMetadata>> {
        let bytes = match backup::read_optional(&self.meta_path(gc))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let meta = serde_json::from_slice(&bytes).map_err(|e| RvChatError::Storage {
            reason: format!("corrupt group metadata for {gc}: {e}"),
        })?;
        Ok(Some(meta))
    }

    /// Loads all stored groups.
    pub fn load_all(&self) -> Result<Vec<GcMetadata>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RvChatError::Storage {
                    reason: format!("read gcs directory: {e}"),
                })
            }
        };

        let mut groups = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(gc) = name.parse::<GcId>() else { continue };
            if let Some(meta) = self.load(&gc)? {
                groups.push(meta);
            }
        }
        Ok(groups)
    }

    /// Removes a group.
    pub fn remove(&self, gc: &GcId) -> Result<()> {
        let dir = self.root.join(gc.to_string());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RvChatError::Storage {
                reason: format!("remove group directory {}: {e}", dir.display()),
            }),
        }
    }
}
