//! # Knowledge Sync Core
//!
//! Shared, I/O-free logic for Knowledge Sync: data models, chunking,
//! document diffing, text decoding, the vector index adapter, the
//! document store trait, and the embedding provider trait.
//!
//! This crate contains no tokio runtime, sqlx, or filesystem access.
//! Persistence, scanning, and the knowledge-base orchestration live in
//! the `knowledge-sync` application crate.

pub mod chunk;
pub mod decode;
pub mod diff;
pub mod embedding;
pub mod index;
pub mod models;
pub mod store;
