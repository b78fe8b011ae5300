//! Text extraction from source files.
//!
//! Each file format is handled by a [`TextExtractor`] registered for one or
//! more extensions in [`Extractors`]. The scanner only picks up files whose
//! extension some extractor claims.
//!
//! Built-ins:
//!
//! | Extractor | Extensions |
//! |-----------|------------|
//! | [`PlainTextExtractor`] | `txt md markdown rst csv log json toml yaml yml html` |
//! | [`PdfExtractor`] | `pdf` |
//! | [`DocxExtractor`] | `docx` |

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use knowledge_sync_core::decode::{decode_text, DecodeError, TextEncoding};

use crate::error::FileErrorKind;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no extractor registered for '{0}'")]
    Unsupported(String),
    #[error("undecodable text: {0}")]
    Decode(#[from] DecodeError),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Ooxml(String),
}

impl ExtractError {
    pub fn kind(&self) -> FileErrorKind {
        match self {
            ExtractError::Unsupported(_) => FileErrorKind::Unsupported,
            ExtractError::Decode(_) => FileErrorKind::Undecodable,
            ExtractError::Pdf(_) | ExtractError::Ooxml(_) => FileErrorKind::Extraction,
        }
    }
}

/// Turns a file's raw bytes into plain text.
///
/// Extraction runs on a blocking thread, so implementations may do
/// CPU-heavy parsing synchronously.
pub trait TextExtractor: Send + Sync {
    /// Lowercase extensions, without the dot.
    fn extensions(&self) -> &[&str];

    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError>;
}

pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extensions(&self) -> &[&str] {
        &[
            "txt", "md", "markdown", "rst", "csv", "log", "json", "toml", "yaml", "yml", "html",
        ]
    }

    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let (text, encoding) = decode_text(bytes)?;
        if encoding != TextEncoding::Utf8 {
            tracing::debug!(?encoding, "text is not UTF-8, decoded with fallback");
        }
        Ok(text)
    }
}

pub struct PdfExtractor;

impl TextExtractor for PdfExtractor {
    fn extensions(&self) -> &[&str] {
        &["pdf"]
    }

    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
    }
}

pub struct DocxExtractor;

impl TextExtractor for DocxExtractor {
    fn extensions(&self) -> &[&str] {
        &["docx"]
    }

    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| ExtractError::Ooxml("word/document.xml not found".to_string()))?;
        let mut doc_xml = Vec::new();
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ExtractError::Ooxml(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }
        extract_paragraphs(&doc_xml)
    }
}

/// Collect `<w:t>` runs, one line per `<w:p>` paragraph.
fn extract_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

/// Extension-keyed registry of extractors.
#[derive(Clone, Default)]
pub struct Extractors {
    by_extension: BTreeMap<String, Arc<dyn TextExtractor>>,
}

impl Extractors {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut extractors = Self::empty();
        extractors.register(Arc::new(PlainTextExtractor));
        extractors.register(Arc::new(PdfExtractor));
        extractors.register(Arc::new(DocxExtractor));
        extractors
    }

    /// Register an extractor; it replaces any earlier claim on the same
    /// extensions.
    pub fn register(&mut self, extractor: Arc<dyn TextExtractor>) {
        for ext in extractor.extensions() {
            self.by_extension
                .insert(ext.to_ascii_lowercase(), extractor.clone());
        }
    }

    /// Every claimed extension, sorted.
    pub fn extensions(&self) -> Vec<String> {
        self.by_extension.keys().cloned().collect()
    }

    pub fn extract(&self, path: &Path, bytes: &[u8]) -> Result<String, ExtractError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let extractor = self
            .by_extension
            .get(&ext)
            .ok_or_else(|| ExtractError::Unsupported(path.display().to_string()))?;
        extractor.extract(bytes)
    }
}
