//! # Knowledge Harness CLI (`kbh`)
//!
//! ## Usage
//!
//! ```bash
//! kbh --config ./config/kbh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbh ingest` | Index the docs dir (reloads the persisted index when unchanged) |
//! | `kbh ask "<question>"` | Answer a question through the retrieval fallback chain |
//! | `kbh search "<query>"` | Show matching chunks without generating |
//! | `kbh files list\|add\|remove` | Manage knowledge-base documents |
//! | `kbh cache info\|clear-expired\|clear` | Answer cache maintenance |
//! | `kbh index clear` | Delete the persisted index and fingerprints |
//! | `kbh session ...` | Chat sessions |
//! | `kbh status` | Storage overview |
//! | `kbh analyze <file>` | Summarize one document, optionally with Q&A pairs |
//!
//! ## Examples
//!
//! ```bash
//! kbh ingest --config ./config/kbh.toml
//! kbh ask "What is the capital of France?"
//! kbh session new --title "geography"
//! kbh ask "And of Spain?" --session <id>
//! kbh search "capital" --mode lexical --limit 5
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use knowledge_harness::analysis::DocumentAnalyzer;
use knowledge_harness::cache::TtlCache;
use knowledge_harness::config::{self, Config};
use knowledge_harness::embedding::{create_provider, EmbeddingProvider};
use knowledge_harness::generation::create_generator;
use knowledge_harness::ingest::{IngestReport, IngestionCoordinator};
use knowledge_harness::knowledge::KnowledgeBase;
use knowledge_harness::models::RetrievalAnswer;
use knowledge_harness::retrieval::{search_knowledge, RetrievalOrchestrator, SearchMode};
use knowledge_harness::session::{Role, SessionStore};
use knowledge_harness::status::{collect_status, format_bytes, print_status};

/// Knowledge Harness: a local-first knowledge cache with grounded question
/// answering.
#[derive(Parser)]
#[command(
    name = "kbh",
    about = "Knowledge Harness: a local-first knowledge cache with grounded question answering",
    version,
    long_about = "Knowledge Harness indexes a directory of documents (txt, md, pdf, docx, pptx, xlsx) \
    into a persisted vector index, reuses it while the documents are unchanged, and answers \
    questions from the index before falling back to a language model."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbh.toml")]
    config: PathBuf,

    /// Log debug detail to stderr (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index the documents directory.
    ///
    /// Reloads the persisted index when no document changed since the last
    /// run; otherwise parses every document and rebuilds.
    Ingest {
        /// Rebuild even if nothing changed.
        #[arg(long)]
        force: bool,
    },

    /// Ask a question.
    Ask {
        query: String,

        /// Chat session id; the exchange is recorded in the session and the
        /// answer cache is scoped to it.
        #[arg(long)]
        session: Option<String>,
    },

    /// Search indexed chunks without generating an answer.
    Search {
        query: String,

        /// `semantic` (vector similarity) or `lexical` (term overlap).
        #[arg(long, default_value = "semantic")]
        mode: String,

        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Manage knowledge-base documents.
    Files {
        #[command(subcommand)]
        action: FilesAction,
    },

    /// Answer cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Persisted index maintenance.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Chat sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Show what is indexed and cached.
    Status,

    /// Summarize a single document: statistics, summary, keywords, entities.
    Analyze {
        path: PathBuf,

        /// Also generate question/answer pairs.
        #[arg(long)]
        qa: bool,
    },

    /// Print shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum FilesAction {
    /// List documents in the docs dir.
    List,
    /// Copy files into the docs dir and re-ingest.
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Delete documents (paths relative to the docs dir) and re-ingest.
    Remove {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry counts and size.
    Info,
    /// Delete expired and unreadable entries.
    ClearExpired,
    /// Delete every entry.
    Clear,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Delete the persisted index and fingerprints; the next ingest rebuilds.
    Clear,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a session and print its id.
    New {
        #[arg(long)]
        title: Option<String>,
    },
    List,
    /// Print a session's messages.
    Show {
        id: String,
        /// Only the last N messages.
        #[arg(long)]
        last: Option<usize>,
    },
    /// Write a session to a JSON file.
    Export {
        id: String,
        #[arg(long, short)]
        output: PathBuf,
    },
    Delete {
        id: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "knowledge_harness=debug,kbh=debug"
    } else {
        "knowledge_harness=warn"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .try_init()
        .ok();
}

fn open_coordinator(cfg: &Config) -> Result<(Arc<dyn EmbeddingProvider>, IngestionCoordinator)> {
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::from(create_provider(&cfg.embedding).context("Failed to create embedding provider")?);
    let coordinator = IngestionCoordinator::new(cfg, embedder.clone(), Arc::new(KnowledgeBase::new()));
    Ok((embedder, coordinator))
}

fn print_report(report: &IngestReport) {
    println!("ingest");
    println!("  files: {}", report.files);
    println!("  chunks: {}", report.chunks);
    println!(
        "  index: {}",
        if report.rebuilt { "rebuilt" } else { "loaded (unchanged)" }
    );
    for (path, reason) in &report.skipped {
        println!("  skipped: {} ({})", path.display(), reason);
    }
    println!("ok");
}

fn print_answer(answer: &RetrievalAnswer) {
    println!("{}", answer.text);
    if let Some(origin) = answer.origin {
        println!();
        println!("  origin: {}", origin);
    }
    if !answer.source_excerpts.is_empty() {
        println!("  sources:");
        for source in &answer.source_excerpts {
            println!("    - {}", source);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "kbh", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Ingest { force } => {
            let (_, coordinator) = open_coordinator(&cfg)?;
            print_report(&coordinator.ingest(force).await?);
        }
        Commands::Ask { query, session } => {
            let (embedder, coordinator) = open_coordinator(&cfg)?;
            let generator = Arc::from(
                create_generator(&cfg.generation).context("Failed to create generation provider")?,
            );
            coordinator.ingest(false).await?;

            let sessions = SessionStore::new(&cfg.paths.sessions_dir());
            if let Some(id) = &session {
                sessions.add_message(id, Role::User, &query, None)?;
            }

            let orchestrator =
                RetrievalOrchestrator::new(&cfg, coordinator.knowledge().clone(), embedder, generator);
            let answer = orchestrator.answer(&query, session.as_deref()).await;

            if let Some(id) = &session {
                sessions.add_message(id, Role::Assistant, &answer.text, answer.origin)?;
            }
            print_answer(&answer);
        }
        Commands::Search { query, mode, limit } => {
            let mode: SearchMode = mode.parse()?;
            let (embedder, coordinator) = open_coordinator(&cfg)?;
            coordinator.ingest(false).await?;
            let results = search_knowledge(
                coordinator.knowledge(),
                embedder.as_ref(),
                &query,
                mode,
                limit,
                cfg.retrieval.excerpt_chars,
            )
            .await?;

            if results.is_empty() {
                println!("No results.");
            }
            for (i, r) in results.iter().enumerate() {
                let section = r.section.as_deref().map(|s| format!(" ({})", s)).unwrap_or_default();
                println!("{}. [{:.3}] {}{}", i + 1, r.score, r.source, section);
                println!("    {}", r.excerpt.replace('\n', " "));
                println!();
            }
        }
        Commands::Files { action } => {
            let (_, coordinator) = open_coordinator(&cfg)?;
            match action {
                FilesAction::List => {
                    let files = coordinator.list_files()?;
                    if files.is_empty() {
                        println!("No documents in {}.", cfg.paths.docs_dir.display());
                    }
                    for f in files {
                        let modified = f
                            .modified
                            .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_default();
                        println!("{:<48} {:>10}  {}", f.name, format_bytes(f.size_bytes), modified);
                    }
                }
                FilesAction::Add { paths } => print_report(&coordinator.add_files(&paths).await?),
                FilesAction::Remove { names } => {
                    print_report(&coordinator.remove_files(&names).await?)
                }
            }
        }
        Commands::Cache { action } => {
            let cache: TtlCache<RetrievalAnswer> = TtlCache::new(cfg.paths.answer_cache_dir());
            match action {
                CacheAction::Info => {
                    let info = cache.info()?;
                    println!("cache {}", cache.dir().display());
                    println!("  entries: {}", info.total);
                    println!("  expired: {}", info.expired);
                    println!("  size: {}", format_bytes(info.bytes));
                }
                CacheAction::ClearExpired => {
                    println!("removed {} expired entries", cache.clear_expired()?);
                }
                CacheAction::Clear => {
                    println!("removed {} entries", cache.clear_all()?);
                }
            }
        }
        Commands::Index { action } => match action {
            IndexAction::Clear => {
                let (_, coordinator) = open_coordinator(&cfg)?;
                if coordinator.clear_index()? {
                    println!("Index cleared.");
                } else {
                    println!("No persisted index.");
                }
            }
        },
        Commands::Session { action } => {
            let sessions = SessionStore::new(&cfg.paths.sessions_dir());
            match action {
                SessionAction::New { title } => {
                    println!("{}", sessions.create(title.as_deref())?.id);
                }
                SessionAction::List => {
                    for s in sessions.list()? {
                        println!(
                            "{}  {:>4} msgs  {}  {}",
                            s.id,
                            s.message_count,
                            s.updated_at.format("%Y-%m-%d %H:%M"),
                            s.title
                        );
                    }
                }
                SessionAction::Show { id, last } => {
                    for m in sessions.history(&id, last)? {
                        let who = match m.role {
                            Role::User => "you",
                            Role::Assistant => "kbh",
                        };
                        println!("[{}] {}: {}", m.timestamp.format("%H:%M:%S"), who, m.content);
                    }
                }
                SessionAction::Export { id, output } => {
                    sessions.export(&id, &output)?;
                    println!("Exported to {}", output.display());
                }
                SessionAction::Delete { id } => {
                    if sessions.delete(&id)? {
                        println!("Deleted session {}.", id);
                    } else {
                        println!("No session {}.", id);
                    }
                }
            }
        }
        Commands::Status => print_status(&collect_status(&cfg)?),
        Commands::Analyze { path, qa } => {
            let generator = Arc::from(
                create_generator(&cfg.generation).context("Failed to create generation provider")?,
            );
            let analyzer = DocumentAnalyzer::new(generator);
            let analysis = analyzer
                .analyze(&path)
                .await
                .with_context(|| format!("Failed to analyze {}", path.display()))?;

            println!("{}", analysis.source.display());
            println!("  size: {}", format_bytes(analysis.size_bytes));
            println!("  sections: {}", analysis.stats.sections);
            println!("  words: {}", analysis.stats.words);
            println!("  sentences: {}", analysis.stats.sentences);
            println!("  characters: {} ({} non-blank)", analysis.stats.chars, analysis.stats.non_whitespace_chars);
            println!();
            println!("Summary:");
            println!("  {}", analysis.summary);
            println!();
            println!("Keywords: {}", analysis.keywords.join(", "));
            println!("Entities: {}", analysis.entities.join(", "));

            if qa {
                println!();
                for (i, pair) in analyzer.generate_qa_pairs(&path).await?.iter().enumerate() {
                    println!("Q{}: {}", i + 1, pair.question);
                    println!("A{}: {}", i + 1, pair.answer);
                }
            }
        }
        // Handled before the config is loaded.
        Commands::Completions { .. } => {}
    }

    Ok(())
}
