//! # Policy QA CLI (`pqa`)
//!
//! Ask questions about an insurance policy document from the command line,
//! inspect how it is chunked, or start the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! pqa --config ./config/pqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pqa ask --document <src> -q "<question>"...` | Answer questions about a document |
//! | `pqa chunk --document <src>` | Print the passages a document is split into |
//! | `pqa serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Ask two questions about a local PDF
//! pqa ask --document ./policy.pdf \
//!     -q "Is hospitalization covered?" \
//!     -q "What is the waiting period for pre-existing conditions?"
//!
//! # Same, as JSON, against a remote document
//! pqa ask --document https://example.com/policy.pdf -q "Is maternity covered?" --json
//!
//! # Serve on the configured bind address
//! pqa serve --config ./config/pqa.toml
//! ```
//!
//! Logs go to stderr (`RUST_LOG` overrides the default filter); answers and
//! JSON go to stdout.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use policy_qa::chunk::chunk_text;
use policy_qa::config::{self, Config};
use policy_qa::fetch::{DocumentFetcher, HttpFetcher};
use policy_qa::models::{DocumentSource, RunReport};
use policy_qa::pipeline::PipelineCoordinator;
use policy_qa::server;

const DEFAULT_CONFIG: &str = "./config/pqa.toml";

/// Policy QA: retrieval-augmented question answering over insurance policies.
#[derive(Parser)]
#[command(
    name = "pqa",
    about = "Answer questions about an insurance policy document",
    version,
    long_about = "Policy QA fetches a policy document, splits it into overlapping passages, \
    embeds and indexes them, then answers each question from the most relevant passages \
    with the clauses it relied on."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the default path does not exist, built-in defaults are used
    /// (hashing embeddings, rule-based answers).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one or more questions about a document.
    Ask {
        /// Document URL or local file path.
        #[arg(long, short = 'd')]
        document: String,

        /// Question to answer (repeatable).
        #[arg(long = "question", short = 'q', required = true)]
        questions: Vec<String>,

        /// Passages retrieved per question (overrides `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<i64>,

        /// Passage text allowed per prompt (overrides `[retrieval].max_context_chars`).
        #[arg(long)]
        max_context_chars: Option<usize>,

        /// Print the full run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the passages a document is split into.
    Chunk {
        /// Document URL or local file path.
        #[arg(long, short = 'd')]
        document: String,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,policy_qa=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn load(path: &std::path::Path) -> anyhow::Result<Config> {
    if !path.exists() && path == std::path::Path::new(DEFAULT_CONFIG) {
        tracing::debug!("no config at {}, using defaults", DEFAULT_CONFIG);
        return Ok(Config::default());
    }
    config::load_config(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Ask {
            document,
            questions,
            top_k,
            max_context_chars,
            json,
        } => {
            let coordinator = PipelineCoordinator::from_config(&cfg)
                .context("Failed to set up the pipeline")?;

            let mut options = coordinator.default_options();
            if let Some(k) = top_k {
                options.k = k;
            }
            if let Some(max) = max_context_chars {
                options.max_context_chars = max;
            }

            // Ctrl-C ends the run early; unfinished questions come back as timeouts.
            let cancel = CancellationToken::new();
            options.cancel = Some(cancel.clone());
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let source = DocumentSource::parse(&document);
            let report = coordinator
                .run(&source, &questions, options)
                .await
                .with_context(|| format!("Failed to answer questions about {}", document))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&questions, &report);
            }
        }
        Commands::Chunk { document } => {
            let fetcher = HttpFetcher::new(&cfg.fetch)?;
            let text = fetcher
                .fetch(&DocumentSource::parse(&document))
                .await
                .with_context(|| format!("Failed to fetch {}", document))?;
            let passages = chunk_text(
                &text,
                cfg.chunking.max_chars,
                cfg.chunking.overlap_chars,
            )?;
            for p in &passages {
                println!(
                    "--- passage {} [{}..{}] ({} bytes)",
                    p.index,
                    p.start_offset,
                    p.end_offset,
                    p.text.len()
                );
                println!("{}", p.text.trim());
            }
            println!("{} passages", passages.len());
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

fn print_report(questions: &[String], report: &RunReport) {
    for (i, (question, answer)) in questions.iter().zip(&report.answers).enumerate() {
        println!("Q{}: {}", i + 1, question);
        println!("A{}: {}", i + 1, answer.text);
        if let Some(confidence) = answer.confidence {
            println!("    confidence: {:.1}", confidence);
        }
        if let Some(err) = &answer.error {
            println!("    error: {} ({})", err.kind, err.message);
        }
        for hit in report.retrieved_passages.get(i).into_iter().flatten() {
            let cited = answer
                .cited_passages
                .iter()
                .any(|p| p.index == hit.index);
            println!(
                "    {} clause {} (score {:.3})",
                if cited { "cited" } else { "     " },
                hit.index,
                hit.score
            );
        }
        println!(
            "    latency: {:.2}s",
            report.per_question_latency.get(i).copied().unwrap_or_default()
        );
        println!();
    }
    println!(
        "document {} v{} | {} passages | cache {} | {:.2}s total",
        &report.document_id[..12.min(report.document_id.len())],
        report.document_version,
        report.passage_count,
        if report.cache_hit { "hit" } else { "miss" },
        report.processing_time
    );
}
