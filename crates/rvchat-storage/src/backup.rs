//! Durable file writes with rotating backups.
//!
//! The write sequence:
//!
//! 1. Write the new content to a temp file in the same directory and
//!    fsync it.
//! 2. Rename the existing file (if any) to `<name>.<unix-millis>`.
//! 3. Rename the temp file into place.
//! 4. Prune backups beyond the configured depth, oldest first.
//!
//! This keeps a short running log of previous versions of every blob,
//! bounded by `depth`. A negative-depth "keep everything" mode is not
//! offered; callers that do not want backups pass `0`.

use std::fs;
use std::path::Path;

use rvchat_types::{Result, RvChatError, Timestamp};

fn storage_err(context: &str, e: std::io::Error) -> RvChatError {
    RvChatError::Storage {
        reason: format!("{context}: {e}"),
    }
}

/// Writes `content` to `path` durably, rotating the previous version to
/// a timestamped backup and pruning to `depth` retained backups.
pub fn write_durable(path: &Path, content: &[u8], depth: usize) -> Result<()> {
    let dir = path.parent().ok_or_else(|| RvChatError::Storage {
        reason: format!("path {} has no parent directory", path.display()),
    })?;
    fs::create_dir_all(dir).map_err(|e| storage_err("create parent directory", e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RvChatError::Storage {
            reason: format!("path {} has no file name", path.display()),
        })?;

    // 1. Temp file with fsync.
    let tmp_path = dir.join(format!("{file_name}.tmp"));
    {
        let mut file = fs::File::create(&tmp_path).map_err(|e| storage_err("create temp file", e))?;
        use std::io::Write;
        file.write_all(content)
            .map_err(|e| storage_err("write temp file", e))?;
        file.sync_all().map_err(|e| storage_err("fsync temp file", e))?;
    }

    // 2. Rotate the previous version.
    if path.exists() {
        let backup = dir.join(format!("{file_name}.{}", Timestamp::now().millis()));
        fs::rename(path, &backup).map_err(|e| storage_err("rotate previous file", e))?;
    }

    // 3. New version into place.
    fs::rename(&tmp_path, path).map_err(|e| storage_err("rename temp into place", e))?;

    // 4. Prune.
    prune_backups(dir, file_name, depth)
}

/// Reads a file, mapping absence to `Ok(None)`.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(storage_err("read file", e)),
    }
}

/// Removes backups of `file_name` in `dir` beyond `depth`, oldest first.
fn prune_backups(dir: &Path, file_name: &str, depth: usize) -> Result<()> {
    let prefix = format!("{file_name}.");
    let mut backups: Vec<String> = fs::read_dir(dir)
        .map_err(|e| storage_err("read backup directory", e))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(String::from))
        .filter(|name| {
            name.starts_with(&prefix)
                && name[prefix.len()..].chars().all(|c| c.is_ascii_digit())
        })
        .collect();

    if backups.len() <= depth {
        return Ok(());
    }

    // Suffixes are unix-millis, so lexicographic-by-length then value
    // ordering equals chronological ordering.
    backups.sort_by(|a, b| {
        let na: u128 = a[prefix.len()..].parse().unwrap_or(0);
        let nb: u128 = b[prefix.len()..].parse().unwrap_or(0);
        na.cmp(&nb)
    });

    let excess = backups.len() - depth;
    for name in &backups[..excess] {
        if let Err(e) = fs::remove_file(dir.join(name)) {
            tracing::warn!(file = %name, error = %e, "failed to prune backup");
        }
    }
    Ok(())
}
