//! # codeslice core
//!
//! Pure logic for codeslice: data model, Merkle snapshots and diffing,
//! chunking, the embedding and vector-store capability traits, and
//! keyword re-ranking.
//!
//! This crate does no filesystem, network or database I/O and carries no
//! async runtime. The `codeslice` app crate supplies those.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod merkle;
pub mod models;
pub mod search;
pub mod store;
