//! # Policy QA
//!
//! Retrieval-augmented question answering over a single insurance policy
//! document.
//!
//! A document is fetched once, split into overlapping passages, embedded,
//! and indexed in memory. Each question is then embedded, matched against
//! that index, and answered by a completion model that sees only the top
//! passages and must cite them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌──────────┐   ┌─────────────┐
//! │  Fetch   │──▶│  Chunk  │──▶│  Embed   │──▶│ VectorIndex │
//! │ URL/file │   │ overlap │   │  batch   │   │  (frozen)   │
//! └──────────┘   └─────────┘   └──────────┘   └──────┬──────┘
//!                                                    │ per question
//!                           ┌────────────────────────┤
//!                           ▼                        ▼
//!                     ┌──────────┐            ┌─────────────┐
//!                     │ Retrieve │───top-k───▶│ Synthesize  │──▶ Answer
//!                     └──────────┘            └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pqa ask --document ./policy.pdf -q "Is hospitalization covered?"
//! pqa serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and stage tagging |
//! | [`models`] | Core data types |
//! | [`chunk`] | Boundary-seeking chunker |
//! | [`embedding`] | Embedder trait and providers |
//! | [`index`] | Exact vector index |
//! | [`retriever`] | Index preparation, lookup, retry |
//! | [`cache`] | Prepared-index cache |
//! | [`completion`] | Completion trait and providers |
//! | [`synth`] | Prompt assembly and answer extraction |
//! | [`extract`] | PDF / DOCX / text extraction |
//! | [`fetch`] | Document download and file reads |
//! | [`pipeline`] | Run orchestration |
//! | [`server`] | HTTP server |

pub mod cache;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod index;
pub mod models;
pub mod pipeline;
pub mod retriever;
pub mod server;
pub mod synth;
