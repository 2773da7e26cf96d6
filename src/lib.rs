//! # Knowledge Harness
//!
//! A local-first knowledge cache with change-aware vector indexing and
//! grounded question answering.
//!
//! Documents in a directory are parsed, chunked and embedded into a vector
//! index that is persisted next to a fingerprint of every source file. On the
//! next start the fingerprints are compared and the index is reloaded
//! instead of rebuilt when nothing changed. Questions go through a fixed
//! fallback chain: answer cache, semantic search, lexical scan, and finally
//! unconditioned generation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────────┐
//! │ docs dir  │──▶│  Ingestion   │──▶│ VectorIndex  │
//! │ txt/md/.. │   │ parse+chunk  │   │ + docstore   │
//! └───────────┘   │ fingerprints │   └──────┬───────┘
//!                 └──────────────┘          │ publish (Arc swap)
//!                                           ▼
//!               ┌──────────┐   ┌────────────────────────┐
//!   question ──▶│ TTL cache│──▶│ semantic → lexical →   │──▶ answer
//!               └──────────┘   │ generative             │
//!                              └────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`parser`] | Extension-keyed document parsers |
//! | [`chunk`] | Text chunking |
//! | [`sources`] | Document set enumeration |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generation`] | Generation provider abstraction |
//! | [`fingerprint`] | Change detection |
//! | [`cache`] | TTL answer cache |
//! | [`index`] | Vector index and persistence |
//! | [`knowledge`] | Current-snapshot handle |
//! | [`ingest`] | Ingestion coordinator |
//! | [`retrieval`] | Retrieval orchestrator |
//! | [`session`] | Chat sessions |
//! | [`analysis`] | Single-document summary, keywords and Q&A |
//! | [`status`] | Storage overview |

pub mod analysis;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod generation;
mod http;
pub mod index;
pub mod ingest;
pub mod knowledge;
pub mod models;
pub mod parser;
pub mod retrieval;
pub mod session;
pub mod sources;
pub mod status;
mod storage;
