use crate::error::IngestError;
use moka::sync::Cache;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

#[derive(Clone)]
pub struct TokenCounter {
    bpe: Arc<CoreBPE>,
    cache: Cache<String, usize>,
}

impl TokenCounter {
    pub fn new() -> Result<Self, IngestError> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|error| IngestError::Tokenizer(error.to_string()))?;
        Ok(Self {
            bpe: Arc::new(bpe),
            cache: Cache::new(10_000),
        })
    }

    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    pub fn count_cached(&self, text: &str) -> usize {
        let key = content_hash(text);
        self.cache.get_with(key, || self.count(text))
    }

    // Largest prefix within `max_tokens`, found by binary search over char
    // boundaries and snapped back to the nearest preceding whitespace.
    pub fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> String {
        if max_tokens == 0 || text.is_empty() {
            return String::new();
        }
        if self.count(text) <= max_tokens {
            return text.to_string();
        }

        let mut boundaries: Vec<usize> = text.char_indices().map(|(offset, _)| offset).collect();
        boundaries.push(text.len());

        let mut low = 0usize;
        let mut high = boundaries.len() - 1;
        while low < high {
            let mid = (low + high + 1) / 2;
            if self.count(&text[..boundaries[mid]]) <= max_tokens {
                low = mid;
            } else {
                high = mid - 1;
            }
        }

        let cut = boundaries[low];
        let snapped = text[..cut]
            .rfind(|character: char| character.is_whitespace())
            .filter(|position| *position > 0)
            .unwrap_or(cut);

        text[..snapped].trim_end().to_string()
    }
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_for_hash(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

// Lowercased, whitespace-collapsed form used for content-addressed keys so
// near-duplicate chunks that differ only in spacing share one embedding.
pub fn normalize_for_hash(text: &str) -> String {
    normalize_whitespace(text).to_lowercase()
}

// Strips markdown decoration for lexical scoring (page attribution, TF-IDF).
pub fn strip_markdown(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    for line in text.lines() {
        let trimmed = line.trim_start();
        let without_marker = trimmed
            .trim_start_matches('#')
            .trim_start_matches('>')
            .trim_start_matches(['-', '*', '+'])
            .trim_start();
        for character in without_marker.chars() {
            match character {
                '`' | '*' | '_' | '|' | '[' | ']' | '(' | ')' => cleaned.push(' '),
                other => cleaned.push(other),
            }
        }
        cleaned.push('\n');
    }
    cleaned
}

pub fn significant_words(text: &str) -> Vec<String> {
    text.split(|character: char| !character.is_alphanumeric())
        .filter(|word| word.len() > 3)
        .map(|word| word.to_lowercase())
        .collect()
}
