//! # codeslice
//!
//! Incremental codebase indexing and hybrid retrieval for code assistants.
//!
//! codeslice keeps a vector index of a local codebase in step with the files
//! on disk, re-embedding only what changed, and answers queries with the
//! handful of chunks most relevant to them so an assistant can work from a
//! small slice of the repository instead of all of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌───────────┐   ┌─────────────┐
//! │ FileWalker │──▶│ Merkle diff │──▶│  Chunker  │──▶│  Embedding  │
//! │ walk+hash  │   │  changeset  │   │ structural│   │   gateway   │
//! └────────────┘   └─────────────┘   └───────────┘   └──────┬──────┘
//!                                                           ▼
//!                  ┌──────────────┐                  ┌─────────────┐
//!                  │   Manifest   │◀──── commit ─────│ VectorStore │
//!                  │ (atomic file)│                  │ upsert/del  │
//!                  └──────┬───────┘                  └──────┬──────┘
//!                         └──────────────┬──────────────────┘
//!                                        ▼
//!                               ┌─────────────────┐
//!                               │ RetrievalEngine │
//!                               │ vector+keyword  │
//!                               └─────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use std::path::Path;
//! use codeslice::config::Config;
//! use codeslice::context::CodebaseContext;
//! use codeslice::coordinator::IndexCoordinator;
//! use codeslice::embedding::create_gateway;
//! use codeslice::retrieval::{RetrievalEngine, SearchOptions};
//! use codeslice::sqlite_store::create_store;
//!
//! let config = Config::default();
//! let ctx = CodebaseContext::open(Path::new("."), config.clone())?;
//! let gateway = create_gateway(&config.embedding)?;
//! let store = create_store(&config, ctx.state_dir()).await?;
//!
//! let report = IndexCoordinator::new(gateway.clone(), store.clone()).sync(&ctx).await?;
//! println!("indexed {} new chunks", report.added_chunks.len());
//!
//! let hits = RetrievalEngine::new(gateway, store)
//!     .search(&ctx, "where is the retry backoff computed", 5, &SearchOptions::default())
//!     .await;
//! for hit in hits {
//!     println!("{}:{}-{} {:.3}", hit.path, hit.start_line, hit.end_line, hit.score);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error type |
//! | [`walker`] | File enumeration, ignore rules and hashing |
//! | [`manifest`] | Persisted index state |
//! | [`context`] | Per-codebase handle shared by sync and search |
//! | [`coordinator`] | Incremental sync |
//! | [`retrieval`] | Hybrid search |
//! | [`embedding`] | HTTP embedding gateways |
//! | [`sqlite_store`] | SQLite vector store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`stats`] | Index status overview |
//!
//! Data model, Merkle snapshots, chunking and re-ranking live in the
//! I/O-free [`codeslice_core`] crate.

pub mod config;
pub mod context;
pub mod coordinator;
pub mod db;
pub mod embedding;
pub mod error;
pub mod manifest;
pub mod migrate;
pub mod retrieval;
pub mod sqlite_store;
pub mod stats;
pub mod walker;
