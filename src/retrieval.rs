//! The retrieval-fallback engine.
//!
//! [`RetrievalOrchestrator::answer`] resolves a question through four stages,
//! stopping at the first that produces something:
//!
//! 1. **cache**: a live answer for the same normalised query and session
//! 2. **semantic**: nearest chunks from the vector index, grounded prompt
//! 3. **lexical**: term-overlap scan of every chunk, grounded prompt
//! 4. **generative**: the raw question, with a short preview of what the
//!    knowledge base covers
//!
//! Stages hand off on empty results, never on the content of an answer.
//! Any generation failure or timeout becomes [`APOLOGY`] with no origin; that
//! answer is not cached and no error reaches the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::cache::TtlCache;
use crate::config::{Config, RetrievalConfig};
use crate::embedding::{tokenize, EmbeddingProvider};
use crate::error::{KbError, KbResult};
use crate::generation::GenerationProvider;
use crate::knowledge::{KnowledgeBase, Snapshot};
use crate::models::{DocumentChunk, Origin, RetrievalAnswer};

/// Shown to the user whenever generation fails. Internal detail is logged only.
pub const APOLOGY: &str =
    "Sorry, I couldn't generate an answer right now. Please try again in a moment.";

/// Which index [`RetrievalOrchestrator::search`] consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Semantic,
    Lexical,
}

impl std::str::FromStr for SearchMode {
    type Err = KbError;

    fn from_str(s: &str) -> KbResult<Self> {
        match s {
            "semantic" => Ok(SearchMode::Semantic),
            "lexical" => Ok(SearchMode::Lexical),
            other => Err(KbError::Config(format!(
                "Unknown search mode: {}. Use semantic or lexical.",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub score: f32,
    pub source: String,
    pub section: Option<String>,
    pub excerpt: String,
}

/// Trim, collapse internal whitespace, lowercase.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Cache key for a query within a session. The session is length-prefixed
/// so distinct (session, query) pairs never produce the same key.
pub fn cache_key(query: &str, session: Option<&str>) -> String {
    let session = session.unwrap_or("");
    format!("{}:{}{}", session.len(), session, normalize_query(query))
}

/// Score every chunk by how many distinct query terms it contains.
///
/// Chunks with no overlap are dropped; the rest are ordered by descending
/// count with corpus order breaking ties, and the first `top_n` returned.
pub fn lexical_search<'a>(chunks: &'a [DocumentChunk], query: &str, top_n: usize) -> Vec<(&'a DocumentChunk, usize)> {
    let mut terms = tokenize(query);
    terms.sort();
    terms.dedup();
    if terms.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(&DocumentChunk, usize)> = chunks
        .iter()
        .filter(|c| !c.is_placeholder())
        .filter_map(|chunk| {
            let mut words = tokenize(&chunk.text);
            words.sort();
            words.dedup();
            let count = terms
                .iter()
                .filter(|t| words.binary_search(t).is_ok())
                .count();
            (count > 0).then_some((chunk, count))
        })
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));
    scored.truncate(top_n);
    scored
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", text[..idx].trim_end()),
        None => text.to_string(),
    }
}

fn source_label(chunk: &DocumentChunk) -> String {
    match &chunk.metadata.page_or_section {
        Some(section) => format!("{}, {}", chunk.source_name(), section),
        None => chunk.source_name(),
    }
}

pub fn grounded_prompt(query: &str, excerpts: &[String]) -> String {
    let mut prompt = String::from(
        "Answer the question using the context below. \
         If the context does not contain the answer, say so briefly.\n\nContext:\n",
    );
    for (i, e) in excerpts.iter().enumerate() {
        prompt.push_str(&format!("[{}] {}\n\n", i + 1, e));
    }
    prompt.push_str(&format!("Question: {}\nAnswer:", query.trim()));
    prompt
}

pub fn unconditioned_prompt(query: &str, preview: &[String]) -> String {
    let mut prompt = String::new();
    if !preview.is_empty() {
        prompt.push_str(&format!(
            "For background, the local knowledge base includes: {}. \
             Nothing in it matched this question, so answer from general knowledge.\n\n",
            preview.join(", ")
        ));
    }
    prompt.push_str(&format!("Question: {}\nAnswer:", query.trim()));
    prompt
}

pub struct RetrievalOrchestrator {
    knowledge: Arc<KnowledgeBase>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
    cache: TtlCache<RetrievalAnswer>,
    settings: RetrievalConfig,
    generation_timeout: Duration,
}

impl RetrievalOrchestrator {
    pub fn new(
        config: &Config,
        knowledge: Arc<KnowledgeBase>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
    ) -> Self {
        Self {
            knowledge,
            embedder,
            generator,
            cache: TtlCache::new(config.paths.answer_cache_dir()),
            settings: config.retrieval.clone(),
            generation_timeout: Duration::from_secs(config.generation.timeout_secs),
        }
    }

    pub fn with_cache(mut self, cache: TtlCache<RetrievalAnswer>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &TtlCache<RetrievalAnswer> {
        &self.cache
    }

    /// Answer `query`, optionally within a conversation `session`.
    pub async fn answer(&self, query: &str, session: Option<&str>) -> RetrievalAnswer {
        let key = cache_key(query, session);
        if let Some(mut cached) = self.cache.get(&key) {
            tracing::debug!("answer served from cache");
            cached.origin = Some(Origin::Cache);
            return cached;
        }

        let snapshot = self.knowledge.current();

        let (origin, prompt, sources) = match snapshot.as_deref() {
            Some(snap) => self.select_stage(snap, query).await,
            None => (Origin::Generative, unconditioned_prompt(query, &[]), Vec::new()),
        };
        tracing::info!(%origin, sources = sources.len(), "retrieval stage selected");

        let text = match self.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, generator = %self.generator.name(), "generation failed");
                return RetrievalAnswer {
                    text: APOLOGY.to_string(),
                    source_excerpts: Vec::new(),
                    origin: None,
                };
            }
        };

        let answer = RetrievalAnswer {
            text,
            source_excerpts: sources,
            origin: Some(origin),
        };
        self.cache.set(&key, answer.clone(), self.settings.cache_ttl_secs);
        answer
    }

    /// Pick the first stage with material and build its prompt and sources.
    async fn select_stage(&self, snap: &Snapshot, query: &str) -> (Origin, String, Vec<String>) {
        let semantic = self.semantic_chunks(snap, query).await;
        if !semantic.is_empty() {
            let sources = self.excerpts(semantic.iter());
            return (Origin::Semantic, grounded_prompt(query, &sources), sources);
        }

        let lexical = lexical_search(snap.index.chunks(), query, self.settings.lexical_top_n);
        if !lexical.is_empty() {
            let sources = self.excerpts(lexical.iter().map(|(c, _)| *c));
            return (Origin::Lexical, grounded_prompt(query, &sources), sources);
        }

        let mut preview = snap.file_names();
        preview.truncate(self.settings.preview_files);
        (Origin::Generative, unconditioned_prompt(query, &preview), Vec::new())
    }

    /// Semantic hits above the optional similarity floor. An embedding
    /// failure yields no hits, which hands off to the lexical stage.
    async fn semantic_chunks(&self, snap: &Snapshot, query: &str) -> Vec<DocumentChunk> {
        let hits = match snap
            .index
            .search(query, self.embedder.as_ref(), self.settings.top_k)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "semantic search failed; trying lexical");
                return Vec::new();
            }
        };
        hits.into_iter()
            .filter(|h| self.settings.min_similarity.map_or(true, |min| h.score >= min))
            .map(|h| h.chunk)
            .collect()
    }

    fn excerpts<'a>(&self, chunks: impl Iterator<Item = &'a DocumentChunk>) -> Vec<String> {
        chunks
            .map(|c| format!("[{}] {}", source_label(c), excerpt(&c.text, self.settings.excerpt_chars)))
            .collect()
    }

    async fn generate(&self, prompt: &str) -> KbResult<String> {
        match tokio::time::timeout(self.generation_timeout, self.generator.generate(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(KbError::Timeout(self.generation_timeout.as_secs())),
        }
    }

    /// Raw search against the current snapshot, without generation.
    pub async fn search(&self, query: &str, mode: SearchMode, limit: usize) -> KbResult<Vec<SearchResult>> {
        search_knowledge(
            &self.knowledge,
            self.embedder.as_ref(),
            query,
            mode,
            limit,
            self.settings.excerpt_chars,
        )
        .await
    }
}

/// Search the current snapshot of `knowledge` without invoking any
/// generation provider. Lexical scores are raw term-overlap counts.
pub async fn search_knowledge(
    knowledge: &KnowledgeBase,
    embedder: &dyn EmbeddingProvider,
    query: &str,
    mode: SearchMode,
    limit: usize,
    excerpt_chars: usize,
) -> KbResult<Vec<SearchResult>> {
    let Some(snap) = knowledge.current() else {
        return Ok(Vec::new());
    };
    let to_result = |chunk: &DocumentChunk, score: f32| SearchResult {
        score,
        source: chunk.source_name(),
        section: chunk.metadata.page_or_section.clone(),
        excerpt: excerpt(&chunk.text, excerpt_chars),
    };
    Ok(match mode {
        SearchMode::Semantic => snap
            .index
            .search(query, embedder, limit)
            .await?
            .iter()
            .map(|h| to_result(&h.chunk, h.score))
            .collect(),
        SearchMode::Lexical => lexical_search(snap.index.chunks(), query, limit)
            .into_iter()
            .map(|(c, count)| to_result(c, count as f32))
            .collect(),
    })
}
