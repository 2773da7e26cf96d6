//! Per-file content fingerprints and change detection.
//!
//! A fingerprint is the (SHA-256, size, mtime) triple of a source file. The
//! full set is persisted as one JSON snapshot next to the vector index and
//! replaced atomically after every successful rebuild. Every check is
//! conservative: anything that cannot be read or decoded counts as a change.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{KbError, KbResult};
use crate::models::{FingerprintSet, SourceFile};
use crate::storage::{read_json, remove_if_exists, write_json};

pub const FINGERPRINTS_FILE: &str = "fingerprints.json";

/// Fingerprint one file. Fails with `Io` if it cannot be read.
pub fn compute_fingerprint(path: &Path) -> KbResult<SourceFile> {
    let metadata = std::fs::metadata(path).map_err(|e| KbError::io(path, e))?;
    let bytes = std::fs::read(path).map_err(|e| KbError::io(path, e))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let content_hash = format!("{:x}", hasher.finalize());

    let last_modified = metadata
        .modified()
        .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
        .unwrap_or(0);

    let absolute_path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());

    Ok(SourceFile {
        absolute_path,
        content_hash,
        last_modified,
        size_bytes: bytes.len() as u64,
    })
}

fn key_for(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

pub struct FingerprintStore {
    path: PathBuf,
}

impl FingerprintStore {
    pub fn new(index_dir: &Path) -> Self {
        Self {
            path: index_dir.join(FINGERPRINTS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fingerprint every path. Unreadable files are an error here; the
    /// coordinator only calls this for files it is about to index.
    pub fn fingerprint_all(&self, paths: &[PathBuf], embedding_model: &str) -> KbResult<FingerprintSet> {
        let mut set = FingerprintSet {
            embedding_model: embedding_model.to_string(),
            ..FingerprintSet::default()
        };
        for path in paths {
            let fp = compute_fingerprint(path)?;
            set.files.insert(key_for(path), fp);
        }
        Ok(set)
    }

    /// True unless the stored snapshot matches `current_paths` exactly and
    /// was built with `embedding_model`.
    pub fn has_changes(&self, current_paths: &[PathBuf], embedding_model: &str) -> bool {
        let stored = match self.load() {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                tracing::debug!("no fingerprint snapshot; treating as changed");
                return true;
            }
            Err(e) => {
                tracing::warn!(error = %e, "fingerprint snapshot unreadable; forcing rebuild");
                return true;
            }
        };

        if stored.embedding_model != embedding_model {
            tracing::info!(
                stored = %stored.embedding_model,
                current = %embedding_model,
                "embedding model changed"
            );
            return true;
        }
        if stored.len() != current_paths.len() {
            tracing::debug!(stored = stored.len(), current = current_paths.len(), "file count changed");
            return true;
        }

        for path in current_paths {
            let Some(previous) = stored.files.get(&key_for(path)) else {
                tracing::debug!(path = %path.display(), "new file");
                return true;
            };
            match compute_fingerprint(path) {
                Ok(fresh) if &fresh == previous => {}
                Ok(_) => {
                    tracing::debug!(path = %path.display(), "file modified");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot fingerprint file; treating as changed");
                    return true;
                }
            }
        }
        false
    }

    pub fn save(&self, set: &FingerprintSet) -> KbResult<()> {
        write_json(&self.path, set)
    }

    pub fn load(&self) -> KbResult<Option<FingerprintSet>> {
        read_json(&self.path)
    }

    pub fn clear(&self) -> KbResult<bool> {
        remove_if_exists(&self.path)
    }
}
