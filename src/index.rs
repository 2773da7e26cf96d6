//! In-memory vector index with on-disk persistence.
//!
//! A [`VectorIndex`] pairs one embedding per chunk with the chunk itself
//! (the docstore), in insertion order. It is immutable once built; a rebuild
//! produces a new instance.
//!
//! # On-disk layout
//!
//! ```text
//! index/
//! ├── vectors.bin     little-endian f32, count × dims
//! ├── docstore.json   chunks in the same order as the vectors
//! └── manifest.json   model, dims, count (written last)
//! ```
//!
//! The manifest is the commit marker. [`VectorIndexStore::persist`] removes
//! it before touching the data files and writes it only once both are in
//! place, so an interrupted persist reads back as "nothing persisted".

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::{blob_to_vec, cosine_similarity, embed_batched, embed_query, vec_to_blob, EmbeddingProvider};
use crate::error::{KbError, KbResult};
use crate::models::{ChunkMetadata, DocumentChunk, DocumentFormat};
use crate::storage::{read_json, remove_if_exists, write_atomic, write_json};

const VECTORS_FILE: &str = "vectors.bin";
const DOCSTORE_FILE: &str = "docstore.json";
const MANIFEST_FILE: &str = "manifest.json";

/// Text of the stand-in chunk indexed when the corpus is empty.
pub const PLACEHOLDER_TEXT: &str = "The knowledge base is empty.";

/// Summary of a persisted index, stored as `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub model: String,
    pub dims: usize,
    pub count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: DocumentChunk,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    model: String,
    dims: usize,
    vectors: Vec<Vec<f32>>,
    docstore: Vec<DocumentChunk>,
}

impl VectorIndex {
    /// Embed `chunks` and build an index over them.
    ///
    /// An empty input is replaced by a single placeholder chunk so the index
    /// is never degenerate; the placeholder is excluded from every search.
    pub async fn build(
        chunks: Vec<DocumentChunk>,
        embedder: &dyn EmbeddingProvider,
        batch_size: usize,
    ) -> KbResult<Self> {
        let docstore = if chunks.is_empty() {
            tracing::info!("empty corpus; indexing placeholder chunk");
            vec![placeholder_chunk()]
        } else {
            chunks
        };

        let texts: Vec<String> = docstore.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_batched(embedder, &texts, batch_size).await?;

        tracing::info!(
            chunks = docstore.len(),
            model = embedder.model_name(),
            dims = embedder.dims(),
            "built vector index"
        );
        Ok(Self {
            model: embedder.model_name().to_string(),
            dims: embedder.dims(),
            vectors,
            docstore,
        })
    }

    /// Assemble an index from precomputed parts. Fails with `EmptyInput` when
    /// there are no chunks and `Provider` when shapes disagree.
    pub fn from_parts(
        model: String,
        dims: usize,
        vectors: Vec<Vec<f32>>,
        docstore: Vec<DocumentChunk>,
    ) -> KbResult<Self> {
        if docstore.is_empty() {
            return Err(KbError::EmptyInput);
        }
        if vectors.len() != docstore.len() || vectors.iter().any(|v| v.len() != dims) {
            return Err(KbError::Provider(format!(
                "index shape mismatch: {} vectors, {} chunks, {} dims",
                vectors.len(),
                docstore.len(),
                dims
            )));
        }
        Ok(Self {
            model,
            dims,
            vectors,
            docstore,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.docstore.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docstore.is_empty()
    }

    /// True when the only indexed chunk is the empty-corpus placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.docstore.iter().all(DocumentChunk::is_placeholder)
    }

    pub fn chunks(&self) -> &[DocumentChunk] {
        &self.docstore
    }

    /// Up to `k` chunks by descending cosine similarity to `query`. Equal
    /// scores keep insertion order.
    pub fn search_vector(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.docstore[*i].is_placeholder())
            .map(|(i, v)| (i, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
            .into_iter()
            .take(k)
            .map(|(i, score)| SearchHit {
                chunk: self.docstore[i].clone(),
                score,
            })
            .collect()
    }

    /// Embed `query` with `embedder` and search.
    pub async fn search(
        &self,
        query: &str,
        embedder: &dyn EmbeddingProvider,
        k: usize,
    ) -> KbResult<Vec<SearchHit>> {
        if k == 0 || self.is_placeholder() {
            return Ok(Vec::new());
        }
        let query_vec = embed_query(embedder, query).await?;
        Ok(self.search_vector(&query_vec, k))
    }
}

fn placeholder_chunk() -> DocumentChunk {
    DocumentChunk {
        text: PLACEHOLDER_TEXT.to_string(),
        metadata: ChunkMetadata {
            source_path: PathBuf::new(),
            page_or_section: None,
            format: DocumentFormat::Placeholder,
        },
    }
}

/// Reads and writes a [`VectorIndex`] under one directory.
pub struct VectorIndexStore {
    dir: PathBuf,
}

impl VectorIndexStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.join(MANIFEST_FILE).exists()
    }

    /// The committed manifest, without loading vectors.
    pub fn manifest(&self) -> KbResult<Option<IndexManifest>> {
        read_json(&self.dir.join(MANIFEST_FILE))
    }

    /// Total bytes of the persisted index files.
    pub fn size_bytes(&self) -> u64 {
        [MANIFEST_FILE, VECTORS_FILE, DOCSTORE_FILE]
            .iter()
            .filter_map(|f| std::fs::metadata(self.dir.join(f)).ok())
            .map(|m| m.len())
            .sum()
    }

    pub fn persist(&self, index: &VectorIndex) -> KbResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| KbError::io(&self.dir, e))?;
        remove_if_exists(&self.dir.join(MANIFEST_FILE))?;

        let mut blob = Vec::with_capacity(index.len() * index.dims * 4);
        for v in &index.vectors {
            blob.extend_from_slice(&vec_to_blob(v));
        }
        write_atomic(&self.dir.join(VECTORS_FILE), &blob)?;
        write_json(&self.dir.join(DOCSTORE_FILE), &index.docstore)?;

        let manifest = IndexManifest {
            model: index.model.clone(),
            dims: index.dims,
            count: index.len(),
            created_at: Utc::now(),
        };
        write_json(&self.dir.join(MANIFEST_FILE), &manifest)?;
        tracing::debug!(dir = %self.dir.display(), count = manifest.count, "persisted vector index");
        Ok(())
    }

    /// Load the persisted index.
    ///
    /// `Ok(None)` when nothing has been persisted. A partial or inconsistent
    /// index, or one built with a different model than `embedder`, is
    /// `CorruptState`; unreadable files are `Io`.
    pub fn load(&self, embedder: &dyn EmbeddingProvider) -> KbResult<Option<VectorIndex>> {
        let manifest_path = self.dir.join(MANIFEST_FILE);
        let Some(manifest) = read_json::<IndexManifest>(&manifest_path)? else {
            return Ok(None);
        };

        if manifest.model != embedder.model_name() || manifest.dims != embedder.dims() {
            return Err(KbError::corrupt(
                &manifest_path,
                format!(
                    "index built with {} ({} dims), active model is {} ({} dims)",
                    manifest.model,
                    manifest.dims,
                    embedder.model_name(),
                    embedder.dims()
                ),
            ));
        }

        let vectors_path = self.dir.join(VECTORS_FILE);
        let blob = match std::fs::read(&vectors_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KbError::corrupt(&vectors_path, "missing"))
            }
            Err(e) => return Err(KbError::io(&vectors_path, e)),
        };
        if manifest.dims == 0 || blob.len() != manifest.count * manifest.dims * 4 {
            return Err(KbError::corrupt(
                &vectors_path,
                format!("expected {} vectors of {} dims, found {} bytes", manifest.count, manifest.dims, blob.len()),
            ));
        }
        let vectors: Vec<Vec<f32>> = blob
            .chunks_exact(manifest.dims * 4)
            .map(blob_to_vec)
            .collect();

        let docstore_path = self.dir.join(DOCSTORE_FILE);
        let docstore: Vec<DocumentChunk> = read_json(&docstore_path)?
            .ok_or_else(|| KbError::corrupt(&docstore_path, "missing"))?;
        if docstore.len() != manifest.count {
            return Err(KbError::corrupt(
                &docstore_path,
                format!("expected {} chunks, found {}", manifest.count, docstore.len()),
            ));
        }

        VectorIndex::from_parts(manifest.model, manifest.dims, vectors, docstore)
            .map(Some)
            .map_err(|e| KbError::corrupt(&self.dir, e))
    }

    /// Delete the persisted index. Returns whether anything was removed.
    pub fn clear(&self) -> KbResult<bool> {
        let mut removed = remove_if_exists(&self.dir.join(MANIFEST_FILE))?;
        removed |= remove_if_exists(&self.dir.join(VECTORS_FILE))?;
        removed |= remove_if_exists(&self.dir.join(DOCSTORE_FILE))?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use tempfile::TempDir;

    fn chunk(text: &str, name: &str) -> DocumentChunk {
        DocumentChunk {
            text: text.to_string(),
            metadata: ChunkMetadata {
                source_path: PathBuf::from(format!("/docs/{}", name)),
                page_or_section: None,
                format: DocumentFormat::Text,
            },
        }
    }

    fn corpus() -> Vec<DocumentChunk> {
        vec![
            chunk("The capital of France is Paris.", "france.txt"),
            chunk("Berlin is the capital of Germany.", "germany.txt"),
            chunk("Photosynthesis converts sunlight into sugar.", "bio.txt"),
        ]
    }

    #[tokio::test]
    async fn test_search_ranks_best_match_first() {
        let embedder = HashingProvider::default();
        let index = VectorIndex::build(corpus(), &embedder, 8).await.unwrap();
        let hits = index.search("What is the capital of France?", &embedder, 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].chunk.text.contains("Paris"));
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let index = VectorIndex::from_parts(
            "m".into(),
            2,
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0]],
            vec![chunk("first", "a"), chunk("other", "b"), chunk("second", "c")],
        )
        .unwrap();
        let hits = index.search_vector(&[1.0, 0.0], 3);
        let texts: Vec<&str> = hits.iter().map(|h| h.chunk.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "other"]);
    }

    #[test]
    fn test_from_parts_rejects_empty() {
        let err = VectorIndex::from_parts("m".into(), 2, vec![], vec![]).unwrap_err();
        assert!(matches!(err, KbError::EmptyInput));
    }

    #[tokio::test]
    async fn test_empty_corpus_yields_placeholder_never_returned() {
        let embedder = HashingProvider::default();
        let index = VectorIndex::build(Vec::new(), &embedder, 8).await.unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.is_placeholder());
        let hits = index.search("knowledge base", &embedder, 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_persist_load_roundtrip_same_results() {
        let tmp = TempDir::new().unwrap();
        let embedder = HashingProvider::default();
        let index = VectorIndex::build(corpus(), &embedder, 2).await.unwrap();
        let store = VectorIndexStore::new(tmp.path().join("index"));
        store.persist(&index).unwrap();

        let loaded = store.load(&embedder).unwrap().unwrap();
        assert_eq!(loaded, index);

        let query = "capital city of Germany";
        let before = index.search(query, &embedder, 3).await.unwrap();
        let after = loaded.search(query, &embedder, 3).await.unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_load_nothing_persisted_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = VectorIndexStore::new(tmp.path().join("index"));
        assert!(store.load(&HashingProvider::default()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_rejects_other_model() {
        let tmp = TempDir::new().unwrap();
        let store = VectorIndexStore::new(tmp.path());
        let index = VectorIndex::build(corpus(), &HashingProvider::new(32), 8).await.unwrap();
        store.persist(&index).unwrap();
        let err = store.load(&HashingProvider::new(64)).unwrap_err();
        assert!(matches!(err, KbError::CorruptState { .. }));
    }

    #[tokio::test]
    async fn test_truncated_vectors_are_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = VectorIndexStore::new(tmp.path());
        let embedder = HashingProvider::new(16);
        let index = VectorIndex::build(corpus(), &embedder, 8).await.unwrap();
        store.persist(&index).unwrap();
        std::fs::write(tmp.path().join(VECTORS_FILE), [0u8; 10]).unwrap();
        assert!(matches!(
            store.load(&embedder),
            Err(KbError::CorruptState { .. })
        ));
    }

    #[tokio::test]
    async fn test_clear_removes_all_files() {
        let tmp = TempDir::new().unwrap();
        let store = VectorIndexStore::new(tmp.path().join("index"));
        let embedder = HashingProvider::new(16);
        store
            .persist(&VectorIndex::build(corpus(), &embedder, 8).await.unwrap())
            .unwrap();
        assert!(store.exists());
        assert!(store.clear().unwrap());
        assert!(!store.exists());
        assert!(store.load(&embedder).unwrap().is_none());
    }
}
