//! Text normalization, content hashing and segmentation.
//!
//! Upstream extraction hands over raw text; everything downstream (queue
//! deduplication, cache keys, chunk boundaries) works on the normalized form
//! produced here.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use super::types::{GenerationError, PreparedRequest, Result, TaskPriority};

/// Canonicalizes source text before hashing and synthesis.
pub trait TextPreprocessor: Send + Sync {
    fn normalize(&self, text: &str) -> String;
}

/// NFC normalization with whitespace runs collapsed to a single space.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPreprocessor;

impl TextPreprocessor for DefaultPreprocessor {
    fn normalize(&self, text: &str) -> String {
        let composed: String = text.nfc().collect();
        composed.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Deterministic digest of (normalized text, voice, language).
///
/// The pipe separators keep `("ab", "c")` and `("a", "bc")` apart.
pub fn content_hash(text: &str, voice: &str, language: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(b"|");
    hasher.update(voice.as_bytes());
    hasher.update(b"|");
    hasher.update(language.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `value` has the shape of a content hash (64 lowercase hex chars).
pub fn is_content_hash(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn voice_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:\-]{1,64}$").expect("valid voice regex"))
}

fn language_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z]{2,3}(-[A-Za-z0-9]{2,8})*$").expect("valid language regex")
    })
}

/// Normalizes and validates a request, computing its content hash.
pub fn prepare_request(
    preprocessor: &dyn TextPreprocessor,
    text: &str,
    voice: &str,
    language: &str,
    max_text_chars: usize,
) -> Result<PreparedRequest> {
    let normalized = preprocessor.normalize(text);
    if normalized.is_empty() {
        return Err(GenerationError::Validation("text is empty".to_string()));
    }

    let char_count = normalized.chars().count();
    if char_count > max_text_chars {
        return Err(GenerationError::Validation(format!(
            "text is {char_count} characters, limit is {max_text_chars}"
        )));
    }

    let voice = voice.trim();
    if !voice_pattern().is_match(voice) {
        return Err(GenerationError::Validation(format!("invalid voice: {voice:?}")));
    }

    let language = language.trim();
    if !language_pattern().is_match(language) {
        return Err(GenerationError::Validation(format!(
            "invalid language: {language:?}"
        )));
    }

    Ok(PreparedRequest {
        content_hash: content_hash(&normalized, voice, language),
        text: normalized,
        voice: voice.to_string(),
        language: language.to_string(),
        priority: TaskPriority::Normal,
        pregenerate: false,
    })
}

// ============================================================================
// Segmentation
// ============================================================================

/// Splits normalized text into sentence-aligned segments.
///
/// Each segment becomes one provider call and one wire chunk, so the first
/// segment bounds the time-to-first-audio.
#[derive(Debug, Clone, Copy)]
pub struct TextSegmenter {
    max_chars: usize,
}

impl TextSegmenter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(16),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let mut segments = Vec::new();
        let mut current = String::new();

        for sentence in split_sentences(text) {
            for piece in self.split_long(sentence) {
                let needed = if current.is_empty() {
                    piece.chars().count()
                } else {
                    current.chars().count() + 1 + piece.chars().count()
                };

                if needed > self.max_chars && !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(&piece);
            }
        }

        if !current.is_empty() {
            segments.push(current);
        }
        segments
    }

    /// Breaks a sentence longer than the limit at word boundaries, hard
    /// splitting single words that still do not fit.
    fn split_long(&self, sentence: &str) -> Vec<String> {
        if sentence.chars().count() <= self.max_chars {
            return vec![sentence.to_string()];
        }

        let mut pieces = Vec::new();
        let mut current = String::new();
        for word in sentence.split_whitespace() {
            let word_len = word.chars().count();
            if word_len > self.max_chars {
                if !current.is_empty() {
                    pieces.push(std::mem::take(&mut current));
                }
                let chars: Vec<char> = word.chars().collect();
                for part in chars.chunks(self.max_chars) {
                    pieces.push(part.iter().collect());
                }
                continue;
            }

            let needed = if current.is_empty() {
                word_len
            } else {
                current.chars().count() + 1 + word_len
            };
            if needed > self.max_chars {
                pieces.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        if !current.is_empty() {
            pieces.push(current);
        }
        pieces
    }
}

impl Default for TextSegmenter {
    fn default() -> Self {
        Self::new(400)
    }
}

/// Sentence split keeping terminal punctuation (and closing quotes) attached.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if !matches!(ch, '.' | '!' | '?' | '。' | '！' | '？' | '…') {
            continue;
        }
        let mut end = idx + ch.len_utf8();
        while let Some(&(next_idx, next)) = chars.peek() {
            if matches!(next, '.' | '!' | '?' | '"' | '\'' | ')' | '”' | '’' | '」') {
                end = next_idx + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let boundary = chars.peek().map_or(true, |&(_, next)| next.is_whitespace());
        if boundary {
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}
