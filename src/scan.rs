//! Filesystem scanner.
//!
//! Walks a knowledge base's source root and produces the `(path, hash)`
//! view the differ consumes. Paths are relative to the root and always
//! `/`-separated, so the same tree yields the same keys on every platform.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use knowledge_sync_core::diff::content_hash;

use crate::config::KbConfig;
use crate::error::{FileError, FileErrorKind, KbError, KbResult};

const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/target/**",
    "**/node_modules/**",
    "**/.ksync/**",
];

/// One recognized file found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: String,
    pub abs_path: PathBuf,
    pub content_hash: String,
    pub mtime: i64,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Readable files keyed by normalized path.
    pub files: BTreeMap<String, ScannedFile>,
    /// Recognized files that could not be read.
    pub unreadable: BTreeSet<String>,
    /// Directories the walk could not enter, as normalized prefixes.
    pub unreadable_dirs: Vec<String>,
    pub errors: Vec<FileError>,
}

impl ScanOutcome {
    /// Whether `path` was hidden from this scan by a read failure, so its
    /// previous state must be carried forward rather than deleted.
    pub fn is_obscured(&self, path: &str) -> bool {
        self.unreadable.contains(path)
            || self
                .unreadable_dirs
                .iter()
                .any(|dir| dir.is_empty() || path.starts_with(&format!("{}/", dir)))
    }
}

pub struct Scanner {
    root: PathBuf,
    extensions: BTreeSet<String>,
    excludes: GlobSet,
    follow_symlinks: bool,
}

impl Scanner {
    /// `supported` is the extension list of the registered extractors; the
    /// config's allow-list, when present, narrows it.
    pub fn new(root: &Path, config: &KbConfig, supported: &[String]) -> KbResult<Self> {
        let mut extensions: BTreeSet<String> =
            supported.iter().map(|e| e.to_ascii_lowercase()).collect();
        if let Some(allow) = &config.include_extensions {
            let allow: BTreeSet<String> = allow
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect();
            extensions.retain(|e| allow.contains(e));
        }

        let mut patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        patterns.extend(config.exclude_globs.iter().cloned());
        let excludes = build_globset(&patterns)?;

        Ok(Self {
            root: root.to_path_buf(),
            extensions,
            excludes,
            follow_symlinks: config.follow_symlinks,
        })
    }

    pub fn recognizes(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// Walk the tree, hashing every recognized file. Blocking; run it on a
    /// blocking thread.
    pub fn scan(&self, cancel: &CancellationToken) -> KbResult<ScanOutcome> {
        let mut outcome = ScanOutcome::default();

        let walker = WalkDir::new(&self.root).follow_links(self.follow_symlinks);
        for entry in walker {
            if cancel.is_cancelled() {
                return Err(KbError::Cancelled);
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let rel = e
                        .path()
                        .and_then(|p| normalize_relative(&self.root, p))
                        .unwrap_or_default();
                    tracing::warn!(path = %rel, error = %e, "scan could not read entry");
                    if e.path().map(|p| p.is_dir()).unwrap_or(true) {
                        outcome.unreadable_dirs.push(rel.clone());
                    } else {
                        outcome.unreadable.insert(rel.clone());
                    }
                    outcome
                        .errors
                        .push(FileError::new(rel, FileErrorKind::Unreadable, e.to_string()));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let Some(rel) = normalize_relative(&self.root, path) else {
                continue;
            };
            if self.excludes.is_match(&rel) || !self.recognizes(path) {
                continue;
            }

            match hash_file(path) {
                Ok((content_hash, mtime)) => {
                    outcome.files.insert(
                        rel.clone(),
                        ScannedFile {
                            path: rel,
                            abs_path: path.to_path_buf(),
                            content_hash,
                            mtime,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(path = %rel, error = %e, "unreadable file");
                    outcome.unreadable.insert(rel.clone());
                    outcome
                        .errors
                        .push(FileError::new(rel, FileErrorKind::Unreadable, e.to_string()));
                }
            }
        }

        tracing::debug!(
            root = %self.root.display(),
            files = outcome.files.len(),
            unreadable = outcome.unreadable.len(),
            "scan complete"
        );
        Ok(outcome)
    }
}

fn hash_file(path: &Path) -> std::io::Result<(String, i64)> {
    let bytes = std::fs::read(path)?;
    let mtime = std::fs::metadata(path)?
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    Ok((content_hash(&bytes), mtime))
}

/// `root`-relative, `/`-separated form of `path`. `None` if `path` is
/// outside `root`.
pub fn normalize_relative(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Some(parts.join("/"))
}

fn build_globset(patterns: &[String]) -> KbResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            KbError::InvalidConfig(format!("invalid exclude glob '{}': {}", pattern, e))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| KbError::InvalidConfig(format!("invalid exclude globs: {}", e)))
}
