//! Change-aware ingestion.
//!
//! Each run walks the state machine
//!
//! ```text
//! Idle → Scanning → Unchanged ─────────────┐
//!                 └→ Rebuilding ────────────┴→ Ready
//! ```
//!
//! Scanning compares the current document set against the stored
//! fingerprints. When nothing changed and a persisted index loads cleanly,
//! that index is published as-is. Otherwise every file is parsed and chunked,
//! a fresh index is built, persisted, the fingerprints are saved, and only
//! then is the new snapshot published. A crash between persist and
//! fingerprint save leaves stale fingerprints, so the next scan rebuilds.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::chunk::split_chunks;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{KbError, KbResult};
use crate::fingerprint::{compute_fingerprint, FingerprintStore};
use crate::index::{VectorIndex, VectorIndexStore};
use crate::knowledge::{KnowledgeBase, Snapshot};
use crate::models::{DocumentChunk, FingerprintSet};
use crate::parser::ParserRegistry;
use crate::sources::scan_documents;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestState {
    Idle,
    Scanning,
    Unchanged,
    Rebuilding,
    Ready,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub state: IngestState,
    pub files: usize,
    pub chunks: usize,
    /// Files that could not be fingerprinted or parsed, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    pub rebuilt: bool,
}

/// A document in the knowledge-base directory.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentInfo {
    /// Path relative to the docs dir.
    pub name: String,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

pub struct IngestionCoordinator {
    config: Config,
    parsers: ParserRegistry,
    embedder: Arc<dyn EmbeddingProvider>,
    fingerprints: FingerprintStore,
    index_store: VectorIndexStore,
    knowledge: Arc<KnowledgeBase>,
    state: Mutex<IngestState>,
    run_lock: tokio::sync::Mutex<()>,
}

impl IngestionCoordinator {
    pub fn new(config: &Config, embedder: Arc<dyn EmbeddingProvider>, knowledge: Arc<KnowledgeBase>) -> Self {
        let index_dir = config.paths.index_dir();
        Self {
            config: config.clone(),
            parsers: ParserRegistry::with_defaults(),
            embedder,
            fingerprints: FingerprintStore::new(&index_dir),
            index_store: VectorIndexStore::new(index_dir),
            knowledge,
            state: Mutex::new(IngestState::Idle),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn state(&self) -> IngestState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: IngestState) {
        tracing::debug!(?state, "ingestion state");
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    pub fn fingerprint_store(&self) -> &FingerprintStore {
        &self.fingerprints
    }

    pub fn index_store(&self) -> &VectorIndexStore {
        &self.index_store
    }

    /// Bring the published index in line with the documents on disk.
    ///
    /// `force` skips the unchanged check and always rebuilds. On error the
    /// previously published snapshot stays current.
    pub async fn ingest(&self, force: bool) -> KbResult<IngestReport> {
        let _guard = self.run_lock.lock().await;
        let result = self.run(force).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "ingestion failed");
            self.set_state(IngestState::Idle);
        }
        result
    }

    async fn run(&self, force: bool) -> KbResult<IngestReport> {
        self.set_state(IngestState::Scanning);
        let paths = scan_documents(&self.config.paths.docs_dir, &self.config.ingestion)?;
        let model = self.embedder.model_name().to_string();
        tracing::info!(files = paths.len(), dir = %self.config.paths.docs_dir.display(), "scanned documents");

        if !force && !self.fingerprints.has_changes(&paths, &model) {
            self.set_state(IngestState::Unchanged);
            if let Some(report) = self.try_load(paths.len()) {
                return Ok(report);
            }
        }

        self.rebuild(paths, model).await
    }

    /// The unchanged path: publish the persisted index if it loads. Any
    /// failure to load means "rebuild", never an error.
    fn try_load(&self, files: usize) -> Option<IngestReport> {
        let index = match self.index_store.load(self.embedder.as_ref()) {
            Ok(Some(index)) => index,
            Ok(None) => {
                tracing::info!("fingerprints match but no persisted index; rebuilding");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "persisted index unusable; rebuilding");
                return None;
            }
        };
        let fingerprints = self.fingerprints.load().ok().flatten()?;

        let chunks = if index.is_placeholder() { 0 } else { index.len() };
        self.knowledge.publish(Snapshot { index, fingerprints });
        self.set_state(IngestState::Ready);
        tracing::info!(files, chunks, "loaded persisted index");
        Some(IngestReport {
            state: IngestState::Ready,
            files,
            chunks,
            skipped: Vec::new(),
            rebuilt: false,
        })
    }

    async fn rebuild(&self, paths: Vec<PathBuf>, model: String) -> KbResult<IngestReport> {
        self.set_state(IngestState::Rebuilding);
        let total = paths.len();

        let parsers = self.parsers.clone();
        let parsed = tokio::task::spawn_blocking(move || parse_all(&parsers, paths))
            .await
            .map_err(|e| KbError::Provider(format!("parser task panicked: {}", e)))?;

        if total > 0 && parsed.parsed_files == 0 {
            return Err(KbError::NoDocumentsParsed(total));
        }

        let chunks = split_chunks(
            parsed.sections,
            self.config.chunking.max_tokens,
            self.config.chunking.overlap_tokens,
        );
        let chunk_count = chunks.len();

        let index = VectorIndex::build(chunks, self.embedder.as_ref(), self.config.embedding.batch_size).await?;
        self.index_store.persist(&index)?;

        let fingerprints = FingerprintSet {
            embedding_model: model,
            files: parsed.fingerprints,
        };
        self.fingerprints.save(&fingerprints)?;

        self.knowledge.publish(Snapshot { index, fingerprints });
        self.set_state(IngestState::Ready);
        tracing::info!(
            files = parsed.parsed_files,
            chunks = chunk_count,
            skipped = parsed.skipped.len(),
            "rebuilt index"
        );

        Ok(IngestReport {
            state: IngestState::Ready,
            files: parsed.parsed_files,
            chunks: chunk_count,
            skipped: parsed.skipped,
            rebuilt: true,
        })
    }

    /// Copy `sources` into the docs dir, then ingest. Every file is checked
    /// against the parser registry before anything is copied.
    pub async fn add_files(&self, sources: &[PathBuf]) -> KbResult<IngestReport> {
        for source in sources {
            self.parsers.parser_for(source)?;
            if !source.is_file() {
                return Err(KbError::NotFound(source.display().to_string()));
            }
        }

        let docs_dir = &self.config.paths.docs_dir;
        std::fs::create_dir_all(docs_dir).map_err(|e| KbError::io(docs_dir, e))?;
        for source in sources {
            let name = source
                .file_name()
                .ok_or_else(|| KbError::NotFound(source.display().to_string()))?;
            let dest = docs_dir.join(name);
            std::fs::copy(source, &dest).map_err(|e| KbError::io(&dest, e))?;
            tracing::info!(file = %dest.display(), "added document");
        }
        self.ingest(false).await
    }

    /// Delete documents (named relative to the docs dir), then ingest.
    pub async fn remove_files(&self, names: &[String]) -> KbResult<IngestReport> {
        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            targets.push(self.resolve_document(name)?);
        }
        for target in &targets {
            std::fs::remove_file(target).map_err(|e| KbError::io(target, e))?;
            tracing::info!(file = %target.display(), "removed document");
        }
        self.ingest(false).await
    }

    /// Resolve `name` inside the docs dir, refusing anything that escapes it.
    fn resolve_document(&self, name: &str) -> KbResult<PathBuf> {
        let docs_dir = &self.config.paths.docs_dir;
        let root = std::fs::canonicalize(docs_dir).map_err(|e| KbError::io(docs_dir, e))?;
        let candidate = root.join(name);
        match std::fs::canonicalize(&candidate) {
            Ok(resolved) if resolved.starts_with(&root) && resolved.is_file() => Ok(resolved),
            _ => Err(KbError::NotFound(name.to_string())),
        }
    }

    pub fn list_files(&self) -> KbResult<Vec<DocumentInfo>> {
        let docs_dir = &self.config.paths.docs_dir;
        let paths = scan_documents(docs_dir, &self.config.ingestion)?;
        let root = std::fs::canonicalize(docs_dir).unwrap_or_else(|_| docs_dir.clone());
        paths
            .iter()
            .map(|path| {
                let metadata = std::fs::metadata(path).map_err(|e| KbError::io(path, e))?;
                Ok(DocumentInfo {
                    name: relative_name(&root, path),
                    size_bytes: metadata.len(),
                    modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                })
            })
            .collect()
    }

    /// Delete the persisted index and fingerprints and unpublish the
    /// snapshot. The next ingestion rebuilds from scratch.
    pub fn clear_index(&self) -> KbResult<bool> {
        let removed_index = self.index_store.clear()?;
        let removed_fingerprints = self.fingerprints.clear()?;
        self.knowledge.reset();
        self.set_state(IngestState::Idle);
        tracing::info!("cleared persisted index");
        Ok(removed_index || removed_fingerprints)
    }
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

struct ParsedCorpus {
    sections: Vec<DocumentChunk>,
    fingerprints: std::collections::BTreeMap<String, crate::models::SourceFile>,
    parsed_files: usize,
    skipped: Vec<(PathBuf, String)>,
}

/// Fingerprint and parse every file. Fingerprints are taken before parsing
/// so a file edited mid-run is seen as changed by the next scan. Files that
/// fail to parse keep their fingerprint; unreadable ones do not.
fn parse_all(parsers: &ParserRegistry, paths: Vec<PathBuf>) -> ParsedCorpus {
    let mut corpus = ParsedCorpus {
        sections: Vec::new(),
        fingerprints: Default::default(),
        parsed_files: 0,
        skipped: Vec::new(),
    };

    for path in paths {
        let fingerprint = match compute_fingerprint(&path) {
            Ok(fp) => fp,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable file");
                corpus.skipped.push((path, e.to_string()));
                continue;
            }
        };
        corpus
            .fingerprints
            .insert(fingerprint.absolute_path.to_string_lossy().to_string(), fingerprint);

        match parsers.parse(&path) {
            Ok(sections) => {
                tracing::debug!(file = %path.display(), sections = sections.len(), "parsed");
                corpus.sections.extend(sections);
                corpus.parsed_files += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "skipping file that failed to parse");
                corpus.skipped.push((path, e.to_string()));
            }
        }
    }
    corpus
}
