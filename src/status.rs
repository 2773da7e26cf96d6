//! Storage overview for `kbh status`.
//!
//! Reads the persisted state directly (fingerprints, index manifest, answer
//! cache, sessions) so it works without loading the index or contacting any
//! provider.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::{CacheInfo, TtlCache};
use crate::config::Config;
use crate::error::KbResult;
use crate::fingerprint::FingerprintStore;
use crate::index::{IndexManifest, VectorIndexStore};
use crate::models::RetrievalAnswer;
use crate::session::SessionStore;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub docs_dir: String,
    pub data_dir: String,
    pub indexed_files: Option<usize>,
    pub fingerprint_model: Option<String>,
    pub index: Option<IndexManifest>,
    pub index_bytes: u64,
    pub cache: CacheInfo,
    pub sessions: usize,
}

impl StatusReport {
    /// True when fingerprints and index agree on the embedding model.
    pub fn is_consistent(&self) -> bool {
        match (&self.fingerprint_model, &self.index) {
            (Some(fp), Some(index)) => fp == &index.model,
            (None, None) => true,
            _ => false,
        }
    }
}

pub fn collect_status(config: &Config) -> KbResult<StatusReport> {
    let index_dir = config.paths.index_dir();
    let fingerprints = FingerprintStore::new(&index_dir).load().ok().flatten();
    let index_store = VectorIndexStore::new(&index_dir);
    let cache: TtlCache<RetrievalAnswer> = TtlCache::new(config.paths.answer_cache_dir());
    let sessions = SessionStore::new(&config.paths.sessions_dir())
        .list()
        .map(|s| s.len())
        .unwrap_or(0);

    Ok(StatusReport {
        docs_dir: config.paths.docs_dir.display().to_string(),
        data_dir: config.paths.data_dir.display().to_string(),
        indexed_files: fingerprints.as_ref().map(|f| f.len()),
        fingerprint_model: fingerprints.map(|f| f.embedding_model),
        index: index_store.manifest().ok().flatten(),
        index_bytes: index_store.size_bytes(),
        cache: cache.info()?,
        sessions,
    })
}

pub fn print_status(report: &StatusReport) {
    println!("Knowledge Harness: Status");
    println!("=========================");
    println!();
    println!("  Documents:   {}", report.docs_dir);
    println!("  Data:        {}", report.data_dir);
    println!();
    match &report.index {
        Some(index) => {
            println!("  Index:       {} chunks, {} ({} dims)", index.count, index.model, index.dims);
            println!("  Built:       {}", format_relative(index.created_at));
            println!("  Size:        {}", format_bytes(report.index_bytes));
        }
        None => println!("  Index:       not built"),
    }
    match report.indexed_files {
        Some(n) => println!("  Files:       {}", n),
        None => println!("  Files:       no fingerprints"),
    }
    if !report.is_consistent() {
        println!("  Warning:     index and fingerprints disagree; next ingest will rebuild");
    }
    println!();
    println!(
        "  Cache:       {} entries ({} expired), {}",
        report.cache.total,
        report.cache.expired,
        format_bytes(report.cache.bytes)
    );
    println!("  Sessions:    {}", report.sessions);
    println!();
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_relative(at: DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(at).num_seconds();
    if delta < 0 {
        at.format("%Y-%m-%d %H:%M").to_string()
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        at.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, PathsConfig};
    use tempfile::TempDir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_status_of_fresh_data_dir() {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            paths: PathsConfig {
                docs_dir: tmp.path().join("docs"),
                data_dir: tmp.path().join("data"),
            },
            ingestion: Default::default(),
            chunking: ChunkingConfig {
                max_tokens: 100,
                overlap_tokens: 0,
            },
            retrieval: Default::default(),
            embedding: Default::default(),
            generation: Default::default(),
        };
        let report = collect_status(&config).unwrap();
        assert!(report.index.is_none());
        assert!(report.indexed_files.is_none());
        assert!(report.is_consistent());
        assert_eq!(report.cache.total, 0);
        assert_eq!(report.sessions, 0);
    }
}
