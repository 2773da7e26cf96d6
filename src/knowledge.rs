//! The shared handle to the current index.
//!
//! Ingestion publishes a new [`Snapshot`] by replacing one `Arc` under a
//! write lock; retrieval clones the `Arc` under a read lock and keeps using
//! that snapshot for the whole query. A snapshot is never mutated after
//! publication, so a reader can never see an index whose docstore does not
//! match its vectors, nor a half-built one.

use std::sync::{Arc, RwLock};

use crate::index::VectorIndex;
use crate::models::FingerprintSet;

/// An index together with the fingerprints of the files it was built from.
#[derive(Debug)]
pub struct Snapshot {
    pub index: VectorIndex,
    pub fingerprints: FingerprintSet,
}

impl Snapshot {
    /// File names of the indexed documents, in path order.
    pub fn file_names(&self) -> Vec<String> {
        self.fingerprints
            .files
            .values()
            .filter_map(|f| f.absolute_path.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .collect()
    }
}

#[derive(Default)]
pub struct KnowledgeBase {
    current: RwLock<Option<Arc<Snapshot>>>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot, or `None` before the first ingestion.
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        snapshot
    }

    /// Drop the current snapshot; queries fall back to generation until the
    /// next ingestion.
    pub fn reset(&self) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, DocumentChunk, DocumentFormat, SourceFile};
    use std::path::PathBuf;

    fn snapshot(text: &str) -> Snapshot {
        let chunk = DocumentChunk {
            text: text.to_string(),
            metadata: ChunkMetadata {
                source_path: PathBuf::from("/docs/a.txt"),
                page_or_section: None,
                format: DocumentFormat::Text,
            },
        };
        let mut fingerprints = FingerprintSet::default();
        fingerprints.files.insert(
            "/docs/a.txt".into(),
            SourceFile {
                absolute_path: PathBuf::from("/docs/a.txt"),
                content_hash: "00".into(),
                last_modified: 0,
                size_bytes: 1,
            },
        );
        Snapshot {
            index: VectorIndex::from_parts("m".into(), 1, vec![vec![1.0]], vec![chunk]).unwrap(),
            fingerprints,
        }
    }

    #[test]
    fn test_readers_keep_their_snapshot_across_publish() {
        let kb = KnowledgeBase::new();
        assert!(kb.current().is_none());

        kb.publish(snapshot("old"));
        let held = kb.current().unwrap();
        kb.publish(snapshot("new"));

        assert_eq!(held.index.chunks()[0].text, "old");
        assert_eq!(kb.current().unwrap().index.chunks()[0].text, "new");
        assert_eq!(held.file_names(), vec!["a.txt"]);
    }

    #[test]
    fn test_reset_clears_current() {
        let kb = KnowledgeBase::new();
        kb.publish(snapshot("x"));
        kb.reset();
        assert!(kb.current().is_none());
    }
}
