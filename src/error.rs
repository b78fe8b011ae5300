//! Error taxonomy for knowledge-base construction, refresh, and search.
//!
//! Per-file problems never surface as [`KbError`]; they are collected into
//! the refresh summary as [`FileError`]s tagged with a [`FileErrorKind`].

use std::path::PathBuf;

use knowledge_sync_core::index::IndexError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KbError {
    #[error("invalid source path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("unknown embedding model '{0}'")]
    UnknownModel(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("vector index rejected the commit: {0}")]
    Index(#[from] IndexError),

    #[error("document store failure: {0:#}")]
    Store(anyhow::Error),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("refresh cancelled")]
    Cancelled,

    #[error("refresh timed out after {0}s")]
    TimedOut(u64),

    #[error("{0}")]
    Failed(String),
}

impl KbError {
    /// Stable machine-readable code, used by the HTTP tool server.
    pub fn code(&self) -> &'static str {
        match self {
            KbError::InvalidPath { .. } => "invalid_path",
            KbError::UnknownModel(_) => "unknown_model",
            KbError::InvalidConfig(_) => "invalid_config",
            KbError::Index(_) => "index_error",
            KbError::Store(_) => "store_error",
            KbError::Embedding(_) => "embedding_error",
            KbError::Cancelled => "cancelled",
            KbError::TimedOut(_) => "timeout",
            KbError::Failed(_) => "failed",
        }
    }
}

pub type KbResult<T> = std::result::Result<T, KbError>;

/// Category of a per-file failure reported in a refresh summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileErrorKind {
    Unreadable,
    Undecodable,
    Unsupported,
    Extraction,
    Embedding,
}

/// One file that could not be processed during a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub path: String,
    pub error_kind: FileErrorKind,
    pub message: String,
}

impl FileError {
    pub fn new(path: impl Into<String>, error_kind: FileErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error_kind,
            message: message.into(),
        }
    }
}
