//! TOML configuration and request-parameter resolution.
//!
//! Every request parameter is resolved through a three-layer cascade:
//! the value given on the call, then the process-level value from the
//! `[defaults]` section, then the hardcoded default. See [`resolve`].
//!
//! ```toml
//! [storage]
//! root = "./.ksync"
//!
//! [defaults]
//! embedding_model = "all-minilm-l6-v2"
//! chunk_size = 1000
//! chunk_overlap = 200
//!
//! [embedding]
//! provider = "local"
//!
//! [sync]
//! exclude_globs = ["drafts/**"]
//! refresh_timeout_secs = 600
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```

use anyhow::{bail, Context, Result};
use globset::Glob;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use knowledge_sync_core::index::DEFAULT_REBUILD_RATIO;

use crate::error::{KbError, KbResult};

pub const DEFAULT_EMBEDDING_MODEL: &str = "all-minilm-l6-v2";
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_BATCH_SIZE: usize = 32;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub defaults: DefaultsConfig,
    pub embedding: EmbeddingConfig,
    pub sync: SyncConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per knowledge base.
    pub root: PathBuf,
    /// Keep everything in memory; nothing survives the process.
    pub ephemeral: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./.ksync"),
            ephemeral: false,
        }
    }
}

/// Process-level request defaults. Unset fields fall through to the
/// hardcoded defaults.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DefaultsConfig {
    pub embedding_model: Option<String>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub top_k: Option<usize>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `local`, `openai`, or `ollama`.
    pub provider: String,
    pub dims: Option<usize>,
    pub url: Option<String>,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            dims: None,
            url: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Restrict scanning to these extensions. Unset means every extension
    /// a registered extractor understands.
    pub include_extensions: Option<Vec<String>>,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
    pub refresh_timeout_secs: Option<u64>,
    pub rebuild_ratio: f32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            include_extensions: None,
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            refresh_timeout_secs: None,
            rebuild_ratio: DEFAULT_REBUILD_RATIO,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7341".to_string(),
        }
    }
}

/// Per-call parameters. `None` defers to the process and hardcoded layers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestParams {
    pub source_path: PathBuf,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub chunk_overlap: Option<usize>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl RequestParams {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            ..Self::default()
        }
    }
}

/// Configuration fixed for the lifetime of one knowledge base.
#[derive(Debug, Clone, PartialEq)]
pub struct KbConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub batch_size: usize,
    pub rebuild_ratio: f32,
    pub refresh_timeout_secs: Option<u64>,
    pub include_extensions: Option<Vec<String>>,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            top_k: DEFAULT_TOP_K,
            batch_size: DEFAULT_BATCH_SIZE,
            rebuild_ratio: DEFAULT_REBUILD_RATIO,
            refresh_timeout_secs: None,
            include_extensions: None,
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

impl KbConfig {
    pub fn validate(&self) -> KbResult<()> {
        if self.chunk_size == 0 {
            return Err(KbError::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(KbError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.top_k == 0 {
            return Err(KbError::InvalidConfig("top_k must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(KbError::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.refresh_timeout_secs == Some(0) {
            return Err(KbError::InvalidConfig(
                "refresh_timeout_secs must be > 0".into(),
            ));
        }
        if !(self.rebuild_ratio > 0.0 && self.rebuild_ratio <= 1.0) {
            return Err(KbError::InvalidConfig(format!(
                "rebuild_ratio must be in (0.0, 1.0], got {}",
                self.rebuild_ratio
            )));
        }
        for pattern in &self.exclude_globs {
            Glob::new(pattern).map_err(|e| {
                KbError::InvalidConfig(format!("invalid exclude glob '{}': {}", pattern, e))
            })?;
        }
        Ok(())
    }
}

/// A request with every layer applied.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub source_path: PathBuf,
    pub embedding_model: String,
    /// Instance configuration. Its `top_k` comes from the process and
    /// hardcoded layers only, since one call's value must not become the
    /// fallback for later calls.
    pub kb: KbConfig,
    /// `top_k` for this call.
    pub top_k: usize,
}

/// Pick the first present value: call, then process, then default.
pub fn resolve<T>(call: Option<T>, process: Option<T>, default: T) -> T {
    call.or(process).unwrap_or(default)
}

impl Config {
    /// Apply the precedence cascade to one request.
    pub fn resolve_request(&self, params: &RequestParams) -> ResolvedRequest {
        let d = &self.defaults;
        let kb = KbConfig {
            chunk_size: resolve(params.chunk_size, d.chunk_size, DEFAULT_CHUNK_SIZE),
            chunk_overlap: resolve(params.chunk_overlap, d.chunk_overlap, DEFAULT_CHUNK_OVERLAP),
            top_k: d.top_k.unwrap_or(DEFAULT_TOP_K),
            batch_size: resolve(params.batch_size, d.batch_size, DEFAULT_BATCH_SIZE),
            rebuild_ratio: self.sync.rebuild_ratio,
            refresh_timeout_secs: self.sync.refresh_timeout_secs,
            include_extensions: self.sync.include_extensions.clone(),
            exclude_globs: self.sync.exclude_globs.clone(),
            follow_symlinks: self.sync.follow_symlinks,
        };
        ResolvedRequest {
            source_path: params.source_path.clone(),
            embedding_model: resolve(
                params.embedding_model.clone(),
                d.embedding_model.clone(),
                DEFAULT_EMBEDDING_MODEL.to_string(),
            ),
            kb,
            top_k: resolve(params.top_k, d.top_k, DEFAULT_TOP_K),
        }
    }
}

/// Load and validate a config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    match config.embedding.provider.as_str() {
        "local" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be local, openai, or ollama.",
            other
        ),
    }

    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    // Validate the process layer as if no call overrides were given.
    let resolved = config.resolve_request(&RequestParams::default());
    resolved
        .kb
        .validate()
        .map_err(|e| anyhow::anyhow!("{} (check [defaults] and [sync])", e))?;

    if config.server.bind.trim().is_empty() {
        bail!("server.bind must not be empty");
    }

    Ok(())
}
