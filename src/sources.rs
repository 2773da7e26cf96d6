//! Document set enumeration.
//!
//! Walks `paths.docs_dir` with [`walkdir`], keeps files whose path relative
//! to the docs dir matches `ingestion.include_globs` and none of
//! `ingestion.exclude_globs`, and returns absolute paths in sorted order.
//! A missing docs dir is an empty document set, not an error.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::IngestionConfig;
use crate::error::{KbError, KbResult};

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/.*", "**/~$*"];

pub fn scan_documents(docs_dir: &Path, ingestion: &IngestionConfig) -> KbResult<Vec<PathBuf>> {
    if !docs_dir.exists() {
        tracing::debug!(dir = %docs_dir.display(), "docs dir does not exist; empty document set");
        return Ok(Vec::new());
    }
    let root = std::fs::canonicalize(docs_dir).map_err(|e| KbError::io(docs_dir, e))?;

    let include_set = build_globset(&ingestion.include_globs)?;
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(ingestion.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut paths = Vec::new();
    for entry in WalkDir::new(&root).follow_links(ingestion.follow_symlinks) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
            match e.into_io_error() {
                Some(io) => KbError::io(path, io),
                None => KbError::io(path, std::io::Error::other("filesystem loop")),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        if exclude_set.is_match(relative) || !include_set.is_match(relative) {
            continue;
        }
        paths.push(path.to_path_buf());
    }

    paths.sort();
    Ok(paths)
}

fn build_globset(patterns: &[String]) -> KbResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| KbError::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| KbError::Config(format!("invalid glob set: {}", e)))
}
