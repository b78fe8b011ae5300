//! Word-boundary text chunker with fixed overlap.
//!
//! Splits extracted document text into [`TextChunk`]s. Sizes are measured
//! in characters (Unicode scalar values) and offsets refer to character
//! positions in the source text.
//!
//! # Algorithm
//!
//! 1. Each chunk owns a *fresh* span of at most `chunk_size` characters
//!    that no earlier chunk covers. Fresh spans tile the text end to end.
//! 2. A fresh span that does not reach the end of the text is cut back to
//!    the nearest preceding break: after whitespace or punctuation, or
//!    right before whitespace. A single word longer than `chunk_size` is
//!    hard-split.
//! 3. Every chunk after the first is prefixed with the last `overlap`
//!    characters of the previous chunk's fresh span, never reaching back
//!    further than that span's start.
//!
//! Consequently every character is covered by one chunk, or by two inside
//! an overlap region, and text of length `L` yields `ceil(L / chunk_size)`
//! chunks when breaks fall on span edges.
//!
//! # Example
//!
//! ```rust
//! use knowledge_sync_core::chunk::chunk_text;
//!
//! let text = "abcd ".repeat(8); // 40 chars
//! let chunks = chunk_text(&text, 20, 5);
//! assert_eq!(chunks.len(), 2);
//! assert_eq!((chunks[0].start, chunks[0].end), (0, 20));
//! assert_eq!((chunks[1].start, chunks[1].end), (15, 40));
//! ```

use crate::models::TextChunk;

/// Split `text` into overlapping chunks.
///
/// Returns an empty vector for empty text. `overlap` is clamped below
/// `chunk_size`; callers validate the pair up front.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<TextChunk> {
    if text.is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    let overlap = overlap.min(chunk_size - 1);

    let chars: Vec<char> = text.chars().collect();
    let byte_at: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let len = chars.len();

    let mut chunks = Vec::new();
    let mut fresh_start = 0usize;
    let mut prev_fresh_start = 0usize;

    while fresh_start < len {
        let limit = (fresh_start + chunk_size).min(len);
        let end = if limit == len {
            len
        } else {
            find_break(&chars, fresh_start, limit).unwrap_or(limit)
        };

        let start = if chunks.is_empty() {
            0
        } else {
            fresh_start.saturating_sub(overlap).max(prev_fresh_start)
        };

        chunks.push(TextChunk {
            index: chunks.len(),
            start,
            end,
            text: text[byte_at[start]..byte_at[end]].to_string(),
        });

        prev_fresh_start = fresh_start;
        fresh_start = end;
    }

    chunks
}

/// Latest break position `p` in `(from, limit]`; `limit < chars.len()`.
fn find_break(chars: &[char], from: usize, limit: usize) -> Option<usize> {
    (from + 1..=limit)
        .rev()
        .find(|&p| is_break(chars[p - 1]) || chars[p].is_whitespace())
}

fn is_break(c: char) -> bool {
    c.is_whitespace() || c.is_ascii_punctuation()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage(len: usize, chunks: &[TextChunk]) -> Vec<usize> {
        let mut counts = vec![0usize; len];
        for c in chunks {
            for slot in &mut counts[c.start..c.end] {
                *slot += 1;
            }
        }
        counts
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(chunk_text("", 20, 5).is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_text("0123456789", 20, 5);
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 10));
        assert_eq!(chunks[0].text, "0123456789");
    }

    #[test]
    fn test_exact_size_single_chunk() {
        let text = "a".repeat(20);
        assert_eq!(chunk_text(&text, 20, 5).len(), 1);
    }

    #[test]
    fn test_forty_chars_two_chunks() {
        let text = "abcd ".repeat(8);
        let chunks = chunk_text(&text, 20, 5);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].start, 15);
        assert_eq!(chunks[1].end, 40);
        assert!(chunks[0].text.ends_with(' '));
    }

    #[test]
    fn test_never_splits_inside_word() {
        let text = "the quick brown fox jumps over the lazy dog again and again";
        let chunks = chunk_text(text, 12, 3);
        let chars: Vec<char> = text.chars().collect();
        for c in &chunks[..chunks.len() - 1] {
            let before = chars[c.end - 1];
            let after = chars[c.end];
            assert!(
                is_break(before) || after.is_whitespace(),
                "split inside a word at {}: {:?}",
                c.end,
                c.text
            );
        }
    }

    #[test]
    fn test_long_word_hard_split() {
        let text = "x".repeat(50);
        let chunks = chunk_text(&text, 20, 5);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].end, 20);
        assert_eq!(chunks[1].start, 15);
        assert_eq!(chunks[2].end, 50);
    }

    #[test]
    fn test_coverage_once_or_twice() {
        let text = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. \
                    Sed do eiusmod tempor incididunt ut labore et dolore magna aliqua. \
                    Ut enim ad minim veniam, quis nostrud exercitation ullamco.";
        let len = text.chars().count();
        let chunks = chunk_text(text, 30, 8);
        let counts = coverage(len, &chunks);
        assert!(counts.iter().all(|&n| n == 1 || n == 2));
        assert_eq!(chunks.first().unwrap().start, 0);
        assert_eq!(chunks.last().unwrap().end, len);

        // Consecutive chunks share exactly `overlap` chars when the
        // previous fresh span is long enough.
        for pair in chunks.windows(2) {
            let shared = pair[0].end - pair[1].start;
            assert!(shared <= 8);
            assert_eq!(pair[1].start + shared, pair[0].end);
        }
    }

    #[test]
    fn test_multibyte_offsets_are_chars() {
        let text = "héllo wörld ünïcode têxt çhunks";
        let chunks = chunk_text(text, 10, 2);
        for c in &chunks {
            let expected: String = text.chars().skip(c.start).take(c.end - c.start).collect();
            assert_eq!(c.text, expected);
        }
    }

    #[test]
    fn test_indices_contiguous() {
        let text = (0..60)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text, 25, 5);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta gamma.\n\nDelta epsilon zeta eta theta.";
        assert_eq!(chunk_text(text, 10, 3), chunk_text(text, 10, 3));
    }
}
