//! # Knowledge Sync
//!
//! Keeps semantic-search knowledge bases in step with directories on disk.
//!
//! Each knowledge base binds one source directory and one embedding model to
//! a document store and a vector index. A refresh scans the directory,
//! hashes every recognized file, and re-embeds only what changed; searches
//! keep running against the last committed state while it does.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │  Scanner   │──▶│ Diff+Extract │──▶│ Chunk + Embed    │
//! │ walk+hash  │   │              │   │ (batched)        │
//! └────────────┘   └──────────────┘   └────────┬─────────┘
//!                                              ▼
//!                            ┌────────────────────────────────┐
//!                            │ commit: vectors.idx, then      │
//!                            │ store.sqlite                   │
//!                            └───────────────┬────────────────┘
//!                      ┌─────────────────────┤
//!                      ▼                     ▼
//!                 ┌──────────┐         ┌──────────┐
//!                 │   CLI    │         │   HTTP   │
//!                 │ (ksync)  │         │  tools   │
//!                 └──────────┘         └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ksync refresh ./docs
//! ksync search ./docs "how do I rotate keys" --top-k 3
//! ksync stats ./docs
//! ksync serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and parameter precedence |
//! | [`error`] | Error taxonomy and per-file errors |
//! | [`scan`] | Directory walk and content hashing |
//! | [`extract`] | Text extraction by file extension |
//! | [`embedding`] | Embedding providers (local, OpenAI, Ollama) |
//! | [`knowledge_base`] | Refresh state machine and search |
//! | [`registry`] | Keyed cache of knowledge bases |
//! | [`sqlite_store`] | SQLite document store |
//! | [`index_file`] | Vector index persistence |
//! | [`server`] | HTTP tool server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index_file;
pub mod knowledge_base;
pub mod migrate;
pub mod registry;
pub mod scan;
pub mod server;
pub mod sqlite_store;
