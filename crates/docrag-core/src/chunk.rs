//! Boundary-aware, overlapping text chunker.
//!
//! Splits document text into [`Chunk`]s of at most `chunk_size` characters,
//! preferring to cut on the most structural separator available (paragraph
//! break, then line break, then sentence end, then word break) and carrying
//! `chunk_overlap` characters of context from one chunk into the next.
//!
//! Each chunk receives a deterministic UUID (v5) derived from its document
//! id, index, and content hash, so chunking the same text with the same
//! configuration always yields identical output.
//!
//! # Algorithm
//!
//! 1. Preprocess: optionally collapse whitespace runs and drop blank lines,
//!    then trim.
//! 2. Open a window of `chunk_size` characters at the cursor.
//! 3. If the window reaches the end of the text, cut there. Otherwise, for
//!    each separator in priority order, find its last occurrence inside the
//!    window that lies strictly after the window start and ends beyond the
//!    previous cut; cut right after it. The empty separator (or no match)
//!    cuts at the hard window boundary.
//! 4. Emit the trimmed span unless it is shorter than `min_chunk_size`.
//! 5. Move the cursor to `max(cut - chunk_overlap, start + 1)`; stop once a
//!    cut reaches the end of the text.
//!
//! # Example
//!
//! ```rust
//! use docrag_core::chunk::{split_text, ChunkerConfig};
//!
//! let config = ChunkerConfig {
//!     chunk_size: 30,
//!     chunk_overlap: 5,
//!     min_chunk_size: 1,
//!     ..ChunkerConfig::default()
//! };
//! let text = "Paris is the capital of France. It is located on the Seine.";
//! let chunks = split_text("doc-1", text, &config).unwrap();
//! assert!(chunks[0].content.starts_with("Paris"));
//! assert_eq!(chunks[0].chunk_index, 0);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{InputKind, Result, RetrievalError};
use crate::models::{Chunk, ChunkMetadata};

/// Chunking parameters. All sizes are measured in characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Boundary markers, most structural first. `""` means character-level.
    #[serde(default = "default_separators")]
    pub separators: Vec<String>,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_true")]
    pub strip_whitespace: bool,
    #[serde(default = "default_true")]
    pub strip_empty_lines: bool,
}

fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    100
}
fn default_min_chunk_size() -> usize {
    100
}
fn default_true() -> bool {
    true
}

/// Paragraph, line, CJK full stop, sentence, word, character.
pub fn default_separators() -> Vec<String> {
    ["\n\n", "\n", "。", ".", " ", ""]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            separators: default_separators(),
            min_chunk_size: default_min_chunk_size(),
            strip_whitespace: true,
            strip_empty_lines: true,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(invalid_config("chunk_size must be > 0"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(invalid_config("chunk_overlap must be less than chunk_size"));
        }
        if self.min_chunk_size > self.chunk_size {
            return Err(invalid_config("min_chunk_size must not exceed chunk_size"));
        }
        Ok(())
    }
}

fn invalid_config(message: &str) -> RetrievalError {
    RetrievalError::input(InputKind::InvalidConfig, message)
}

/// Split `text` into ordered chunks for `document_id`.
///
/// # Errors
///
/// - `Input(empty_input)` when `text` is empty or whitespace-only.
/// - `Input(invalid_config)` when `config` fails [`ChunkerConfig::validate`].
///
/// # Guarantees
///
/// - Chunk indices are contiguous: `0, 1, …, N-1` (dropped short spans do
///   not consume an index).
/// - Every emitted chunk has at least `min_chunk_size` characters.
/// - `start_offset < end_offset` for every chunk.
pub fn split_text(document_id: &str, text: &str, config: &ChunkerConfig) -> Result<Vec<Chunk>> {
    config.validate()?;
    if text.trim().is_empty() {
        return Err(RetrievalError::input(
            InputKind::EmptyInput,
            "text must not be empty",
        ));
    }

    let processed = preprocess(text, config);
    let chars: Vec<char> = processed.chars().collect();
    let separators: Vec<Vec<char>> = config
        .separators
        .iter()
        .map(|s| s.chars().collect())
        .collect();

    let len = chars.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut prev_cut = 0usize;

    while start < len {
        let window_end = (start + config.chunk_size).min(len);
        let (cut, separator_used) = find_cut(&chars, start, window_end, prev_cut, &separators);

        let span: String = chars[start..cut].iter().collect();
        let content = span.trim();
        if !content.is_empty() && content.chars().count() >= config.min_chunk_size {
            chunks.push(make_chunk(
                document_id,
                chunks.len(),
                content,
                start,
                cut,
                separator_used,
            ));
        }

        if cut >= len {
            break;
        }
        prev_cut = cut;
        start = cut.saturating_sub(config.chunk_overlap).max(start + 1);
    }

    Ok(chunks)
}

/// Apply whitespace and empty-line stripping, then trim.
pub fn preprocess(text: &str, config: &ChunkerConfig) -> String {
    let mut out = if config.strip_whitespace {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        text.to_string()
    };

    if config.strip_empty_lines {
        out = out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
    }

    out.trim().to_string()
}

/// Locate the cut position for the window `[start, window_end)`.
fn find_cut(
    chars: &[char],
    start: usize,
    window_end: usize,
    prev_cut: usize,
    separators: &[Vec<char>],
) -> (usize, String) {
    if window_end >= chars.len() {
        return (chars.len(), "none".to_string());
    }

    for sep in separators {
        if sep.is_empty() {
            return (window_end, "none".to_string());
        }
        if let Some(pos) = rfind_chars(&chars[..window_end], sep, start + 1) {
            let cut = pos + sep.len();
            if cut > prev_cut {
                return (cut, sep.iter().collect());
            }
        }
    }

    (window_end, "none".to_string())
}

/// Last position `p >= min_pos` at which `needle` occurs in `haystack`.
fn rfind_chars(haystack: &[char], needle: &[char], min_pos: usize) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    let last = haystack.len() - needle.len();
    if last < min_pos {
        return None;
    }
    (min_pos..=last)
        .rev()
        .find(|&p| haystack[p..p + needle.len()] == *needle)
}

fn make_chunk(
    document_id: &str,
    index: usize,
    content: &str,
    start: usize,
    end: usize,
    separator_used: String,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let content_hash = format!("{:x}", hasher.finalize());

    let name = format!("{}:{}:{}", document_id, index, content_hash);
    let chunk_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string();

    Chunk {
        chunk_id,
        document_id: document_id.to_string(),
        content: content.to_string(),
        chunk_index: index,
        start_offset: start,
        end_offset: end,
        metadata: ChunkMetadata {
            length: content.chars().count(),
            separator_used,
            content_hash,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(size: usize, overlap: usize, min: usize) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size: size,
            chunk_overlap: overlap,
            min_chunk_size: min,
            ..ChunkerConfig::default()
        }
    }

    const PARIS: &str = "Paris is the capital of France. It is located on the Seine.";

    #[test]
    fn test_empty_text_rejected() {
        let err = split_text("doc1", "", &ChunkerConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::Input {
                kind: InputKind::EmptyInput,
                ..
            }
        ));
        assert!(split_text("doc1", "  \n\t ", &ChunkerConfig::default()).is_err());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split_text("doc1", "Hello, world!", &config(800, 100, 1)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "Hello, world!");
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, 13);
    }

    #[test]
    fn test_paris_example() {
        let chunks = split_text("doc1", PARIS, &config(30, 5, 1)).unwrap();
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "Paris is the capital of",
                "l of France.",
                "ance. It is located on the",
                "the Seine.",
            ]
        );
        assert_eq!(chunks[1].metadata.separator_used, ".");
        assert_eq!(chunks[0].metadata.separator_used, " ");
    }

    #[test]
    fn test_cuts_prefer_structural_separators() {
        let text = "First paragraph here.\n\nSecond paragraph follows.";
        let cfg = ChunkerConfig {
            strip_whitespace: false,
            ..config(30, 0, 1)
        };
        let chunks = split_text("doc1", text, &cfg).unwrap();
        assert_eq!(chunks[0].content, "First paragraph here.");
        assert_eq!(chunks[0].metadata.separator_used, "\n\n");
    }

    #[test]
    fn test_min_chunk_size_drops_and_reindexes() {
        let text = "aaaa bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb c";
        let chunks = split_text("doc1", text, &config(20, 0, 10)).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
            assert!(c.content.chars().count() >= 10);
        }
        assert!(chunks.iter().all(|c| c.content != "aaaa"));
    }

    #[test]
    fn test_offsets_and_coverage() {
        let text = (0..40)
            .map(|i| format!("Sentence number {} talks about topic {}.", i, i % 7))
            .collect::<Vec<_>>()
            .join(" ");
        let cfg = config(120, 20, 1);
        let chunks = split_text("doc1", &text, &cfg).unwrap();
        let processed: Vec<char> = preprocess(&text, &cfg).chars().collect();

        let mut covered = vec![false; processed.len()];
        for c in &chunks {
            assert!(c.start_offset < c.end_offset);
            assert!(c.content.chars().count() <= cfg.chunk_size);
            for slot in covered.iter_mut().take(c.end_offset).skip(c.start_offset) {
                *slot = true;
            }
        }
        for (i, ch) in processed.iter().enumerate() {
            if !ch.is_whitespace() {
                assert!(covered[i], "character {} at {} not covered", ch, i);
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta.\n\nGamma delta epsilon.\n\nZeta eta theta iota kappa.";
        let cfg = config(15, 3, 1);
        let c1 = split_text("doc1", text, &cfg).unwrap();
        let c2 = split_text("doc1", text, &cfg).unwrap();
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_terminates_with_large_overlap() {
        let text = "x".repeat(500);
        let chunks = split_text("doc1", &text, &config(10, 9, 1)).unwrap();
        assert!(!chunks.is_empty());
        assert_eq!(chunks.last().unwrap().end_offset, 500);
    }

    #[test]
    fn test_multibyte_offsets_are_chars() {
        let text = "東京は日本の首都です。大阪は西日本の中心です。";
        let chunks = split_text("doc1", text, &config(12, 0, 1)).unwrap();
        assert_eq!(chunks[0].content, "東京は日本の首都です。");
        assert_eq!(chunks[0].end_offset, 11);
        assert_eq!(chunks[0].metadata.separator_used, "。");
    }

    #[test]
    fn test_preprocess_strips_empty_lines() {
        let cfg = ChunkerConfig {
            strip_whitespace: false,
            ..ChunkerConfig::default()
        };
        assert_eq!(preprocess("a\n\n   \nb\n", &cfg), "a\nb");
    }

    #[test]
    fn test_invalid_config() {
        assert!(config(10, 10, 1).validate().is_err());
        assert!(config(0, 0, 0).validate().is_err());
        assert!(config(10, 2, 11).validate().is_err());
        assert!(ChunkerConfig::default().validate().is_ok());
    }
}
