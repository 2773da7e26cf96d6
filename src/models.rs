//! Core data models used throughout Knowledge Harness.
//!
//! These types represent the source files, chunks, fingerprints, and answers
//! that flow through the ingestion and retrieval pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Fingerprint of one source file, used only for change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub absolute_path: PathBuf,
    /// Hex SHA-256 of the file bytes.
    pub content_hash: String,
    /// Modification time in milliseconds since the Unix epoch.
    pub last_modified: i64,
    pub size_bytes: u64,
}

/// Format a chunk was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Text,
    Markdown,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    /// Stand-in chunk for an empty corpus; never returned by search.
    Placeholder,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Text => "text",
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Pptx => "pptx",
            DocumentFormat::Xlsx => "xlsx",
            DocumentFormat::Placeholder => "placeholder",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source_path: PathBuf,
    /// Page, slide, sheet, or chunk position within the source.
    pub page_or_section: Option<String>,
    pub format: DocumentFormat,
}

/// A unit of extracted document text; the atomic item indexed and retrieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl DocumentChunk {
    pub fn is_placeholder(&self) -> bool {
        self.metadata.format == DocumentFormat::Placeholder
    }

    /// File name of the originating document, for display.
    pub fn source_name(&self) -> String {
        self.metadata
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.metadata.source_path.display().to_string())
    }
}

/// Snapshot of every indexed file's fingerprint plus the embedding model
/// the paired index was built with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSet {
    pub embedding_model: String,
    pub files: BTreeMap<String, SourceFile>,
}

impl FingerprintSet {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Which retrieval stage produced an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Cache,
    Semantic,
    Lexical,
    Generative,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Origin::Cache => "cache",
            Origin::Semantic => "semantic",
            Origin::Lexical => "lexical",
            Origin::Generative => "generative",
        };
        f.write_str(s)
    }
}

/// Answer returned by the retrieval orchestrator.
///
/// `origin` is `None` only for the fixed apology produced on provider failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalAnswer {
    pub text: String,
    pub source_excerpts: Vec<String>,
    pub origin: Option<Origin>,
}
