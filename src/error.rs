//! Error taxonomy shared by every component boundary.
//!
//! Each variant maps to a degradation policy: per-file [`KbError::Parse`]
//! and [`KbError::UnsupportedFormat`] are skipped during ingestion,
//! [`KbError::Provider`] and [`KbError::Timeout`] degrade a single query,
//! and [`KbError::CorruptState`] is treated as a cache miss that forces a
//! rebuild. Only [`KbError::NoDocumentsParsed`] is surfaced from ingestion.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KbError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported format '{extension}' for {path}")]
    UnsupportedFormat { path: PathBuf, extension: String },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("provider error: {0}")]
    Provider(String),
    #[error("provider call timed out after {0}s")]
    Timeout(u64),
    #[error("corrupt persisted state at {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },
    #[error("cannot build an index from zero chunks")]
    EmptyInput,
    #[error("none of the {0} documents could be parsed")]
    NoDocumentsParsed(usize),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl KbError {
    /// Wrap an [`std::io::Error`] with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KbError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        KbError::CorruptState {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        KbError::Parse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures of an embedding or generation provider.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, KbError::Provider(_) | KbError::Timeout(_))
    }
}

impl From<reqwest::Error> for KbError {
    fn from(e: reqwest::Error) -> Self {
        KbError::Provider(e.to_string())
    }
}

pub type KbResult<T> = Result<T, KbError>;
