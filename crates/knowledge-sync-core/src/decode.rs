//! Byte-to-text decoding for extracted plain-text files.
//!
//! UTF-8 is tried first (a leading BOM is stripped). On failure the bytes
//! are decoded as Windows-1252, which maps every byte except five
//! undefined code points. A NUL byte in text that is not valid UTF-8
//! marks it as binary.

use serde::Serialize;
use thiserror::Error;

/// Encoding that successfully decoded a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    Utf8,
    Windows1252,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("binary content (NUL byte at offset {0})")]
    Binary(usize),
    #[error("byte 0x{byte:02x} at offset {offset} is neither UTF-8 nor Windows-1252")]
    Undefined { byte: u8, offset: usize },
}

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Windows-1252 mappings for 0x80..=0x9F; `None` marks undefined bytes.
const CP1252_HIGH: [Option<char>; 32] = [
    Some('\u{20AC}'),
    None,
    Some('\u{201A}'),
    Some('\u{0192}'),
    Some('\u{201E}'),
    Some('\u{2026}'),
    Some('\u{2020}'),
    Some('\u{2021}'),
    Some('\u{02C6}'),
    Some('\u{2030}'),
    Some('\u{0160}'),
    Some('\u{2039}'),
    Some('\u{0152}'),
    None,
    Some('\u{017D}'),
    None,
    None,
    Some('\u{2018}'),
    Some('\u{2019}'),
    Some('\u{201C}'),
    Some('\u{201D}'),
    Some('\u{2022}'),
    Some('\u{2013}'),
    Some('\u{2014}'),
    Some('\u{02DC}'),
    Some('\u{2122}'),
    Some('\u{0161}'),
    Some('\u{203A}'),
    Some('\u{0153}'),
    None,
    Some('\u{017E}'),
    Some('\u{0178}'),
];

/// Decode raw file bytes into text.
pub fn decode_text(bytes: &[u8]) -> Result<(String, TextEncoding), DecodeError> {
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    if let Ok(text) = std::str::from_utf8(body) {
        return Ok((text.to_string(), TextEncoding::Utf8));
    }

    decode_windows_1252(bytes).map(|text| (text, TextEncoding::Windows1252))
}

fn decode_windows_1252(bytes: &[u8]) -> Result<String, DecodeError> {
    let mut out = String::with_capacity(bytes.len());
    for (offset, &byte) in bytes.iter().enumerate() {
        let ch = match byte {
            0x00 => return Err(DecodeError::Binary(offset)),
            0x80..=0x9F => CP1252_HIGH[(byte - 0x80) as usize]
                .ok_or(DecodeError::Undefined { byte, offset })?,
            _ => char::from(byte),
        };
        out.push(ch);
    }
    Ok(out)
}
