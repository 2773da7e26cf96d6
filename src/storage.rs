//! Small persistence helpers shared by the on-disk stores.

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{KbError, KbResult};

/// Write `bytes` to `path` via a named temp file in the same directory that
/// is then persisted over `path`, so readers see either the old contents or
/// the new ones.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> KbResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| KbError::io(parent, e))?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| KbError::io(parent, e))?;
    tmp.write_all(bytes).map_err(|e| KbError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| KbError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| KbError::io(path, e.error))?;
    Ok(())
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> KbResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| KbError::corrupt(path, e))?;
    write_atomic(path, &bytes)
}

/// Read and decode a JSON file. A missing file is `Ok(None)`; undecodable
/// contents are `CorruptState`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> KbResult<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(KbError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| KbError::corrupt(path, e))
}

/// Remove a file, treating "already gone" as success. Returns whether a file
/// was deleted.
pub(crate) fn remove_if_exists(path: &Path) -> KbResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(KbError::io(path, e)),
    }
}
