//! Single-document analysis for `kbh analyze`.
//!
//! Statistics are computed locally from the parsed text. The summary,
//! keywords, entities and suggested question/answer pairs come from the
//! generation provider, each prompt fed a bounded prefix of the document.
//! Nothing here touches the index or the answer cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{KbError, KbResult};
use crate::generation::GenerationProvider;
use crate::models::DocumentChunk;
use crate::parser::ParserRegistry;

const SUMMARY_CHARS: usize = 4000;
const KEYWORD_CHARS: usize = 2000;
const ENTITY_CHARS: usize = 2000;
const QA_CHARS: usize = 3000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocumentStats {
    pub sections: usize,
    pub chars: usize,
    pub non_whitespace_chars: usize,
    pub words: usize,
    pub sentences: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentAnalysis {
    pub source: PathBuf,
    pub size_bytes: u64,
    pub stats: DocumentStats,
    pub summary: String,
    pub keywords: Vec<String>,
    pub entities: Vec<String>,
}

/// Counts over the joined text of `sections`. CJK characters count as one
/// word each; sentences end at `.`, `!`, `?` or their full-width forms.
pub fn document_stats(sections: &[DocumentChunk]) -> DocumentStats {
    let text = join_sections(sections);
    let words = crate::embedding::tokenize(&text).len();
    let sentences = text
        .split(['.', '!', '?', '。', '！', '？'])
        .filter(|s| s.chars().any(char::is_alphanumeric))
        .count();
    DocumentStats {
        sections: sections.len(),
        chars: text.chars().count(),
        non_whitespace_chars: text.chars().filter(|c| !c.is_whitespace()).count(),
        words,
        sentences,
    }
}

/// Split a model's list answer into items. Accepts comma, semicolon and
/// newline separators (including full-width ones) and strips bullets and
/// numbering.
pub fn parse_list(raw: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for piece in raw.split([',', ';', '\n', '，', '、', '；']) {
        let item = strip_marker(piece.trim()).trim_matches('"').trim();
        if !item.is_empty() && !items.iter().any(|i| i.eq_ignore_ascii_case(item)) {
            items.push(item.to_string());
        }
    }
    items
}

/// Drop a leading bullet (`-`, `*`, `•`) or list number (`3.`, `3)`).
fn strip_marker(item: &str) -> &str {
    let item = item.trim_start_matches(['-', '*', '•']).trim_start();
    let digits = item.len() - item.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    let rest = &item[digits..];
    let mut chars = rest.chars();
    match (chars.next(), chars.next()) {
        (Some('.' | ')'), None) if digits > 0 => "",
        (Some('.' | ')'), Some(c)) if digits > 0 && c.is_whitespace() => rest[1..].trim_start(),
        _ => item,
    }
}

/// Parse `Q1: ... / A1: ...` blocks. A question without an answer is dropped;
/// a later answer replaces an earlier one for the same question.
pub fn parse_qa_pairs(raw: &str) -> Vec<QaPair> {
    let mut pairs = Vec::new();
    let mut question: Option<String> = None;
    let mut answer: Option<String> = None;

    for line in raw.lines().map(str::trim) {
        let Some((label, rest)) = line.split_once(':') else {
            continue;
        };
        let label = label.trim();
        let is_label = |prefix: char| {
            label.starts_with(prefix) && label[1..].chars().all(|c| c.is_ascii_digit())
        };
        if is_label('Q') {
            if let (Some(q), Some(a)) = (question.take(), answer.take()) {
                pairs.push(QaPair { question: q, answer: a });
            }
            question = Some(rest.trim().to_string());
        } else if is_label('A') {
            answer = Some(rest.trim().to_string());
        }
    }
    if let (Some(q), Some(a)) = (question, answer) {
        pairs.push(QaPair { question: q, answer: a });
    }
    pairs.retain(|p| !p.question.is_empty() && !p.answer.is_empty());
    pairs
}

fn join_sections(sections: &[DocumentChunk]) -> String {
    sections
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn prefix(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub struct DocumentAnalyzer {
    generator: Arc<dyn GenerationProvider>,
    parsers: ParserRegistry,
}

impl DocumentAnalyzer {
    pub fn new(generator: Arc<dyn GenerationProvider>) -> Self {
        Self {
            generator,
            parsers: ParserRegistry::with_defaults(),
        }
    }

    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    async fn parse(&self, path: &Path) -> KbResult<Vec<DocumentChunk>> {
        let parsers = self.parsers.clone();
        let owned = path.to_path_buf();
        let sections = tokio::task::spawn_blocking(move || parsers.parse(&owned))
            .await
            .map_err(|e| KbError::parse(path, format!("parser task panicked: {}", e)))??;
        if sections.iter().all(|s| s.text.trim().is_empty()) {
            return Err(KbError::EmptyInput);
        }
        Ok(sections)
    }

    /// Parse `path`, then ask for a summary, keywords and entities.
    pub async fn analyze(&self, path: &Path) -> KbResult<DocumentAnalysis> {
        let size_bytes = std::fs::metadata(path)
            .map_err(|e| KbError::io(path, e))?
            .len();
        let sections = self.parse(path).await?;
        let stats = document_stats(&sections);
        let text = join_sections(&sections);
        tracing::info!(file = %path.display(), words = stats.words, "analyzing document");

        let summary = self
            .generator
            .generate(&format!(
                "Write a concise summary of the following document.\n\n{}\n\nSummary:",
                prefix(&text, SUMMARY_CHARS)
            ))
            .await?;
        let keywords = self
            .generator
            .generate(&format!(
                "List the 5 to 10 most important keywords of the following document, \
                 separated by commas.\n\n{}\n\nKeywords:",
                prefix(&text, KEYWORD_CHARS)
            ))
            .await?;
        let entities = self
            .generator
            .generate(&format!(
                "List the important named entities (people, places, dates, organizations) \
                 in the following document, separated by commas.\n\n{}\n\nEntities:",
                prefix(&text, ENTITY_CHARS)
            ))
            .await?;

        Ok(DocumentAnalysis {
            source: path.to_path_buf(),
            size_bytes,
            stats,
            summary: summary.trim().to_string(),
            keywords: parse_list(&keywords),
            entities: parse_list(&entities),
        })
    }

    /// Ask for five question/answer pairs a reader could check against `path`.
    pub async fn generate_qa_pairs(&self, path: &Path) -> KbResult<Vec<QaPair>> {
        let sections = self.parse(path).await?;
        let text = join_sections(&sections);
        let raw = self
            .generator
            .generate(&format!(
                "Based on the following document, write 5 questions with their answers.\n\n{}\n\n\
                 Use exactly this format:\nQ1: <question>\nA1: <answer>\n\nQ2: <question>\nA2: <answer>\n...",
                prefix(&text, QA_CHARS)
            ))
            .await?;
        let pairs = parse_qa_pairs(&raw);
        tracing::debug!(pairs = pairs.len(), "parsed question/answer pairs");
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replies by prompt kind and records every prompt it saw.
    #[derive(Default)]
    struct Scripted {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationProvider for Scripted {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        async fn generate(&self, prompt: &str) -> KbResult<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(if prompt.ends_with("Summary:") {
                "  A note about Paris.  ".to_string()
            } else if prompt.ends_with("Keywords:") {
                "1. Paris, France, capital, paris".to_string()
            } else if prompt.ends_with("Entities:") {
                "- Paris\n- France".to_string()
            } else {
                "Q1: What is the capital of France?\nA1: Paris.\n\nQ2: Where is the Seine?\nA2: In Paris.".to_string()
            })
        }
    }

    #[test]
    fn test_document_stats_counts_words_and_sentences() {
        let chunk = |text: &str| DocumentChunk {
            text: text.to_string(),
            metadata: crate::models::ChunkMetadata {
                source_path: PathBuf::from("/docs/a.txt"),
                page_or_section: None,
                format: crate::models::DocumentFormat::Text,
            },
        };
        let stats = document_stats(&[chunk("Paris is big. Is it?"), chunk("北京。")]);
        assert_eq!(stats.sections, 2);
        assert_eq!(stats.words, 7);
        assert_eq!(stats.sentences, 3);
        assert_eq!(stats.non_whitespace_chars, 19);
    }

    #[test]
    fn test_parse_list_strips_numbering_and_duplicates() {
        assert_eq!(
            parse_list("1. Paris, France，capital\n- paris\n\n"),
            vec!["Paris", "France", "capital"]
        );
        assert_eq!(parse_list("2) 1789, 3.5 percent"), vec!["1789", "3.5 percent"]);
        assert!(parse_list("  \n ").is_empty());
    }

    #[test]
    fn test_parse_qa_pairs_drops_unanswered_questions() {
        let raw = "Q1: First?\nA1: One.\nQ2: Orphan?\nQ3: Third?\nA3: Three.\nnoise line";
        let pairs = parse_qa_pairs(raw);
        assert_eq!(
            pairs,
            vec![
                QaPair { question: "First?".into(), answer: "One.".into() },
                QaPair { question: "Third?".into(), answer: "Three.".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_analyze_bounds_prompts_and_parses_replies() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("paris.txt");
        let body = format!("Paris is the capital of France. {}", "x".repeat(10_000));
        std::fs::write(&path, &body).unwrap();

        let generator = Arc::new(Scripted::default());
        let analysis = DocumentAnalyzer::new(generator.clone())
            .analyze(&path)
            .await
            .unwrap();

        assert_eq!(analysis.summary, "A note about Paris.");
        assert_eq!(analysis.keywords, vec!["Paris", "France", "capital"]);
        assert_eq!(analysis.entities, vec!["Paris", "France"]);
        assert_eq!(analysis.size_bytes, body.len() as u64);

        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].len() < SUMMARY_CHARS + 200);
        assert!(prompts[1].len() < KEYWORD_CHARS + 200);
    }

    #[tokio::test]
    async fn test_generate_qa_pairs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("paris.md");
        std::fs::write(&path, "Paris is the capital of France. The Seine flows through it.").unwrap();

        let pairs = DocumentAnalyzer::new(Arc::new(Scripted::default()))
            .generate_qa_pairs(&path)
            .await
            .unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].answer, "In Paris.");
    }

    #[tokio::test]
    async fn test_analyze_rejects_empty_and_unsupported_files() {
        let tmp = TempDir::new().unwrap();
        let empty = tmp.path().join("empty.txt");
        std::fs::write(&empty, "   \n").unwrap();
        let unsupported = tmp.path().join("image.png");
        std::fs::write(&unsupported, [0u8, 1, 2]).unwrap();

        let analyzer = DocumentAnalyzer::new(Arc::new(Scripted::default()));
        assert!(matches!(analyzer.analyze(&empty).await, Err(KbError::EmptyInput)));
        assert!(matches!(
            analyzer.analyze(&unsupported).await,
            Err(KbError::UnsupportedFormat { .. })
        ));
    }
}
