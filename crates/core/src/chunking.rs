use crate::error::IngestError;
use crate::models::{Chunk, ChunkingOptions, PageText};
use crate::tokens::{self, TokenCounter};
use regex::Regex;
use std::collections::HashSet;

const PLACEHOLDER_OPEN: char = '\u{0}';

// Page attribution thresholds. Intentionally approximate; tuned against the
// corpus, not derived.
const PAGE_SCORE_PRIMARY: f64 = 0.25;
const PAGE_MATCHES_PRIMARY: usize = 3;
const PAGE_SCORE_FALLBACK: f64 = 0.15;
const PAGE_MATCHES_FALLBACK: usize = 2;

// Matches the embedding minimum; anything smaller can never be indexed.
const MIN_EMITTED_TOKENS: usize = 5;

pub struct ChunkingEngine {
    counter: TokenCounter,
    options: ChunkingOptions,
}

#[derive(Debug, Clone, Copy)]
pub struct DocumentComplexity {
    pub score: f64,
    pub target_tokens: usize,
    pub overlap_tokens: usize,
}

struct ProtectedText {
    text: String,
    blocks: Vec<String>,
}

struct Segment {
    header: Option<String>,
    hierarchy: Vec<String>,
    body: String,
}

struct DraftChunk {
    content: String,
    header: Option<String>,
    hierarchy: Vec<String>,
}

impl ChunkingEngine {
    pub fn new(counter: TokenCounter, options: ChunkingOptions) -> Result<Self, IngestError> {
        options.validate()?;
        Ok(Self { counter, options })
    }

    pub fn options(&self) -> ChunkingOptions {
        self.options
    }

    pub fn chunk(
        &self,
        text: &str,
        document_id: &str,
        dataroom_id: &str,
        pages: &[PageText],
    ) -> Result<Vec<Chunk>, IngestError> {
        if text.trim().is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "document {document_id} has no extractable text"
            )));
        }

        let complexity = assess_complexity(text, &self.options);
        let protected = protect_markdown(text)?;
        let segments = segment_by_headers(&protected.text);

        let mut drafts: Vec<DraftChunk> = Vec::new();
        for segment in segments {
            let pieces = self.split_segment(
                &segment.body,
                &protected.blocks,
                complexity.target_tokens,
                complexity.overlap_tokens,
            );
            for piece in pieces {
                drafts.push(DraftChunk {
                    content: piece,
                    header: segment.header.clone(),
                    hierarchy: segment.hierarchy.clone(),
                });
            }
        }

        let merged = self.merge_small(drafts, &protected.blocks);
        let page_words = index_page_words(pages);

        let mut chunks = Vec::new();
        for draft in merged {
            let restored = restore_placeholders(&draft.content, &protected.blocks);
            let content = restored.trim().to_string();
            if content.is_empty() {
                continue;
            }

            let token_count = self.counter.count_cached(&content);
            if token_count < MIN_EMITTED_TOKENS {
                continue;
            }

            let page = attribute_page(&content, &page_words);
            chunks.push(Chunk {
                id: String::new(),
                content,
                document_id: document_id.to_string(),
                dataroom_id: dataroom_id.to_string(),
                chunk_index: 0,
                content_hash: String::new(),
                token_count,
                page_ranges: vec![page.to_string()],
                section_header: draft.header,
                header_hierarchy: draft.hierarchy,
                is_small_chunk: token_count < self.options.small_chunk_tokens,
            });
        }

        // Indices must be contiguous and zero-based after every merge/filter
        // pass, and ids derive from them.
        for (index, chunk) in chunks.iter_mut().enumerate() {
            chunk.chunk_index = index;
            chunk.id = Chunk::make_id(document_id, index);
            chunk.content_hash = tokens::content_hash(&chunk.content);
        }

        Ok(chunks)
    }

    fn measure(&self, text: &str, blocks: &[String]) -> usize {
        if text.contains(PLACEHOLDER_OPEN) {
            self.counter.count_cached(&restore_placeholders(text, blocks))
        } else {
            self.counter.count_cached(text)
        }
    }

    fn split_segment(
        &self,
        body: &str,
        blocks: &[String],
        target: usize,
        overlap: usize,
    ) -> Vec<String> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if self.measure(trimmed, blocks) <= target {
            return vec![trimmed.to_string()];
        }

        let mut pieces = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;

        for paragraph in trimmed.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            let paragraph_tokens = self.measure(paragraph, blocks);

            if paragraph_tokens > target {
                if !current.is_empty() {
                    pieces.push(std::mem::take(&mut current));
                    current_tokens = 0;
                }
                pieces.extend(self.split_long_block(paragraph, blocks, target, overlap));
                continue;
            }

            if current_tokens + paragraph_tokens > target && !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
                current_tokens = 0;
            }

            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
            current_tokens += paragraph_tokens;
        }

        if !current.is_empty() {
            pieces.push(current);
        }

        pieces
    }

    // Word-level token windowing with a trailing-word overlap carried into the
    // next window. Placeholders travel as single words, so protected blocks
    // are never cut through.
    fn split_long_block(
        &self,
        text: &str,
        blocks: &[String],
        target: usize,
        overlap: usize,
    ) -> Vec<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let mut pieces = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_tokens = 0usize;

        for word in words {
            let word_tokens = self.measure(word, blocks).max(1) + 1;

            if current_tokens + word_tokens > target && !current.is_empty() {
                pieces.push(current.join(" "));

                let mut tail: Vec<&str> = Vec::new();
                let mut tail_tokens = 0usize;
                for &carried in current.iter().rev() {
                    let carried_tokens = self.measure(carried, blocks).max(1) + 1;
                    if tail_tokens + carried_tokens > overlap {
                        break;
                    }
                    tail.push(carried);
                    tail_tokens += carried_tokens;
                }
                tail.reverse();
                current = tail;
                current_tokens = tail_tokens;
            }

            current.push(word);
            current_tokens += word_tokens;
        }

        if !current.is_empty() {
            let piece = current.join(" ");
            match pieces.last() {
                Some(previous) if previous.ends_with(&piece) => {}
                _ => pieces.push(piece),
            }
        }

        pieces
    }

    fn merge_small(&self, drafts: Vec<DraftChunk>, blocks: &[String]) -> Vec<DraftChunk> {
        let mut merged: Vec<DraftChunk> = Vec::new();
        let mut pending_small: Option<DraftChunk> = None;

        for mut draft in drafts {
            if let Some(small) = pending_small.take() {
                draft.content = format!("{}\n\n{}", small.content, draft.content);
                if draft.header.is_none() {
                    draft.header = small.header;
                    draft.hierarchy = small.hierarchy;
                }
            }

            if self.measure(&draft.content, blocks) < self.options.min_chunk_tokens {
                match merged.last_mut() {
                    Some(previous) => {
                        previous.content.push_str("\n\n");
                        previous.content.push_str(&draft.content);
                    }
                    // Nothing emitted yet; carry forward instead.
                    None => pending_small = Some(draft),
                }
            } else {
                merged.push(draft);
            }
        }

        if let Some(small) = pending_small {
            merged.push(small);
        }

        merged
    }
}

pub fn assess_complexity(text: &str, options: &ChunkingOptions) -> DocumentComplexity {
    let words: Vec<&str> = text.split_whitespace().collect();
    let word_count = words.len().max(1);

    let technical = words
        .iter()
        .filter(|word| word.len() >= 9 || word.chars().any(|c| c.is_ascii_digit()))
        .count();
    let technical_density = technical as f64 / word_count as f64;

    let code_blocks = text.matches("```").count() / 2;
    let table_lines = text
        .lines()
        .filter(|line| line.trim_start().starts_with('|'))
        .count();
    let list_lines = text
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with("- ")
                || trimmed.starts_with("* ")
                || trimmed.starts_with("+ ")
                || starts_with_ordinal(trimmed)
        })
        .count();
    let long_sentences = text
        .split(['.', '!', '?'])
        .filter(|sentence| sentence.split_whitespace().count() > 25)
        .count();

    let structure = (code_blocks * 3 + table_lines + list_lines / 2 + long_sentences * 2) as f64
        / (text.lines().count().max(1)) as f64;

    let score = (technical_density * 2.0 + structure).clamp(0.0, 1.0);

    let target_range = options.max_target_tokens - options.min_target_tokens;
    let overlap_range = options.max_overlap_tokens - options.min_overlap_tokens;

    DocumentComplexity {
        score,
        // Denser documents get smaller chunks with more overlap.
        target_tokens: options.max_target_tokens - (score * target_range as f64) as usize,
        overlap_tokens: options.min_overlap_tokens + (score * overlap_range as f64) as usize,
    }
}

fn starts_with_ordinal(line: &str) -> bool {
    let mut chars = line.chars();
    let mut saw_digit = false;
    for character in chars.by_ref() {
        if character.is_ascii_digit() {
            saw_digit = true;
        } else {
            return saw_digit && (character == '.' || character == ')');
        }
    }
    false
}

fn placeholder(index: usize) -> String {
    format!("{PLACEHOLDER_OPEN}md{index}{PLACEHOLDER_OPEN}")
}

fn restore_placeholders(text: &str, blocks: &[String]) -> String {
    let mut restored = text.to_string();
    for (index, block) in blocks.iter().enumerate() {
        let token = placeholder(index);
        if restored.contains(&token) {
            restored = restored.replace(&token, block);
        }
    }
    restored
}

// Replaces non-splittable markdown constructs with opaque single-word
// placeholders so no splitter pass can cut through them.
fn protect_markdown(text: &str) -> Result<ProtectedText, IngestError> {
    let mut blocks: Vec<String> = Vec::new();

    let fence_re = Regex::new(r"(?s)(```|~~~).*?(```|~~~)")?;
    let mut protected = fence_re
        .replace_all(text, |captures: &regex::Captures<'_>| {
            blocks.push(captures[0].to_string());
            placeholder(blocks.len() - 1)
        })
        .into_owned();

    protected = protect_line_runs(&protected, &mut blocks);

    Ok(ProtectedText {
        text: protected,
        blocks,
    })
}

#[derive(PartialEq, Clone, Copy)]
enum LineKind {
    Table,
    List,
    Quote,
    Rule,
    Plain,
}

fn classify_line(line: &str) -> LineKind {
    let trimmed = line.trim_start();
    if trimmed.starts_with('|') {
        LineKind::Table
    } else if trimmed.starts_with("- ")
        || trimmed.starts_with("* ")
        || trimmed.starts_with("+ ")
        || starts_with_ordinal(trimmed)
    {
        LineKind::List
    } else if trimmed.starts_with('>') {
        LineKind::Quote
    } else if !trimmed.is_empty()
        && trimmed.len() >= 3
        && (trimmed.chars().all(|c| c == '-')
            || trimmed.chars().all(|c| c == '*')
            || trimmed.chars().all(|c| c == '_'))
    {
        LineKind::Rule
    } else {
        LineKind::Plain
    }
}

fn protect_line_runs(text: &str, blocks: &mut Vec<String>) -> String {
    let mut output: Vec<String> = Vec::new();
    let mut run: Vec<&str> = Vec::new();
    let mut run_kind = LineKind::Plain;

    let flush = |run: &mut Vec<&str>, output: &mut Vec<String>, blocks: &mut Vec<String>| {
        if run.is_empty() {
            return;
        }
        blocks.push(run.join("\n"));
        output.push(placeholder(blocks.len() - 1));
        run.clear();
    };

    for line in text.lines() {
        let kind = classify_line(line);
        match kind {
            LineKind::Plain => {
                flush(&mut run, &mut output, blocks);
                output.push(line.to_string());
            }
            _ if kind == run_kind => run.push(line),
            _ => {
                flush(&mut run, &mut output, blocks);
                run_kind = kind;
                run.push(line);
            }
        }
    }
    flush(&mut run, &mut output, blocks);

    output.join("\n")
}

fn segment_by_headers(text: &str) -> Vec<Segment> {
    let header_re = match Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$") {
        Ok(re) => re,
        Err(_) => {
            return vec![Segment {
                header: Some("Introduction".to_string()),
                hierarchy: vec!["Introduction".to_string()],
                body: text.to_string(),
            }]
        }
    };

    let mut segments: Vec<Segment> = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current_header: Option<String> = None;
    let mut current_body: Vec<&str> = Vec::new();

    let close =
        |header: &Option<String>, stack: &[(usize, String)], body: &mut Vec<&str>, out: &mut Vec<Segment>| {
            let text = body.join("\n");
            if !text.trim().is_empty() {
                out.push(Segment {
                    header: header.clone(),
                    hierarchy: stack.iter().map(|(_, title)| title.clone()).collect(),
                    body: text,
                });
            }
            body.clear();
        };

    for line in text.lines() {
        if let Some(captures) = header_re.captures(line) {
            close(&current_header, &stack, &mut current_body, &mut segments);

            let level = captures[1].len();
            let title = captures[2].trim().to_string();
            // A header at level N clears every recorded header at levels >= N.
            stack.retain(|(recorded, _)| *recorded < level);
            stack.push((level, title.clone()));
            current_header = Some(title);
        } else {
            current_body.push(line);
        }
    }
    close(&current_header, &stack, &mut current_body, &mut segments);

    if segments.iter().all(|segment| segment.header.is_none()) && !segments.is_empty() {
        for segment in &mut segments {
            segment.header = Some("Introduction".to_string());
            segment.hierarchy = vec!["Introduction".to_string()];
        }
    }

    segments
}

struct PageWords {
    number: u32,
    words: HashSet<String>,
}

fn index_page_words(pages: &[PageText]) -> Vec<PageWords> {
    pages
        .iter()
        .map(|page| PageWords {
            number: page.number,
            words: tokens::significant_words(&tokens::strip_markdown(&page.text))
                .into_iter()
                .collect(),
        })
        .collect()
}

// Best-effort lexical overlap scoring; falls back to page 1 when nothing
// clears either threshold.
fn attribute_page(content: &str, pages: &[PageWords]) -> u32 {
    if pages.is_empty() {
        return 1;
    }

    let chunk_words: HashSet<String> =
        tokens::significant_words(&tokens::strip_markdown(content))
            .into_iter()
            .collect();
    if chunk_words.is_empty() {
        return 1;
    }

    let mut best: Option<(u32, f64, usize)> = None;
    for page in pages {
        let matched = chunk_words
            .iter()
            .filter(|word| page.words.contains(*word))
            .count();
        let score = matched as f64 / chunk_words.len() as f64;
        match best {
            Some((_, best_score, _)) if score <= best_score => {}
            _ => best = Some((page.number, score, matched)),
        }
    }

    match best {
        Some((number, score, matched))
            if score > PAGE_SCORE_PRIMARY && matched >= PAGE_MATCHES_PRIMARY =>
        {
            number
        }
        Some((number, score, matched))
            if score > PAGE_SCORE_FALLBACK && matched >= PAGE_MATCHES_FALLBACK =>
        {
            number
        }
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ChunkingEngine {
        ChunkingEngine::new(TokenCounter::new().unwrap(), ChunkingOptions::default()).unwrap()
    }

    fn small_engine() -> ChunkingEngine {
        let options = ChunkingOptions {
            min_target_tokens: 40,
            max_target_tokens: 60,
            min_overlap_tokens: 5,
            max_overlap_tokens: 10,
            min_chunk_tokens: 8,
            small_chunk_tokens: 20,
        };
        ChunkingEngine::new(TokenCounter::new().unwrap(), options).unwrap()
    }

    #[test]
    fn headerless_document_becomes_introduction() {
        let chunks = engine()
            .chunk("Just a plain paragraph about revenue.", "doc-1", "room-1", &[])
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section_header.as_deref(), Some("Introduction"));
        assert_eq!(chunks[0].header_hierarchy, vec!["Introduction"]);
    }

    #[test]
    fn chunk_ids_are_deterministic_and_contiguous() {
        let text = "# One\n\nFirst section body that says enough to stand alone as a chunk.\n\n\
                    # Two\n\nSecond section body that also says enough to stand alone here.";
        let first = small_engine().chunk(text, "doc-1", "room-1", &[]).unwrap();
        let second = small_engine().chunk(text, "doc-1", "room-1", &[]).unwrap();

        assert_eq!(first.len(), second.len());
        for (index, (a, b)) in first.iter().zip(second.iter()).enumerate() {
            assert_eq!(a.id, b.id);
            assert_eq!(a.content, b.content);
            assert_eq!(a.chunk_index, index);
            assert_eq!(a.id, format!("doc-1_chunk_{index}"));
        }
    }

    #[test]
    fn header_hierarchy_clears_deeper_levels() {
        let text = "# Top\n\nintro body text for the top section of this file\n\n\
                    ## Nested\n\nnested body text that carries the nested context here\n\n\
                    # Next\n\nbody after returning to the top level of the outline";
        let chunks = small_engine().chunk(text, "doc-1", "room-1", &[]).unwrap();

        let nested = chunks
            .iter()
            .find(|chunk| chunk.section_header.as_deref() == Some("Nested"))
            .unwrap();
        assert_eq!(nested.header_hierarchy, vec!["Top", "Nested"]);

        let next = chunks
            .iter()
            .find(|chunk| chunk.section_header.as_deref() == Some("Next"))
            .unwrap();
        assert_eq!(next.header_hierarchy, vec!["Next"]);
    }

    #[test]
    fn code_fences_survive_splitting() {
        let fence = "```rust\nfn main() { println!(\"hi\"); }\n```";
        let filler = "word ".repeat(400);
        let text = format!("# Code\n\n{filler}\n\n{fence}\n\n{filler}");
        let chunks = small_engine().chunk(&text, "doc-1", "room-1", &[]).unwrap();

        let holder = chunks
            .iter()
            .find(|chunk| chunk.content.contains("fn main"))
            .expect("fence should survive somewhere");
        assert!(holder.content.contains("```rust"));
        assert!(holder.content.matches("```").count() >= 2);
    }

    #[test]
    fn tables_are_not_cut_through() {
        let table = "| term | value |\n|------|-------|\n| fee  | 2%    |\n| cap  | 10M   |";
        let filler = "alpha beta gamma delta ".repeat(80);
        let text = format!("{filler}\n\n{table}\n\n{filler}");
        let chunks = small_engine().chunk(&text, "doc-1", "room-1", &[]).unwrap();

        let holder = chunks
            .iter()
            .find(|chunk| chunk.content.contains("| fee"))
            .expect("table should survive");
        assert!(holder.content.contains("| cap"));
    }

    #[test]
    fn small_trailing_segment_merges_into_previous() {
        let text = "# Long\n\nbody body body body body body body body body body body \
                    body body body body body body body body body\n\n# Tiny\n\nok";
        let chunks = small_engine().chunk(text, "doc-1", "room-1", &[]).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("ok"));
    }

    #[test]
    fn oversized_segment_splits_with_overlap() {
        let long_body: String = (0..400).map(|i| format!("word{i} ")).collect();
        let text = format!("# Big\n\n{long_body}");
        let chunks = small_engine().chunk(&text, "doc-1", "room-1", &[]).unwrap();
        assert!(chunks.len() > 1);

        // Adjacent pieces share their boundary words through the overlap.
        let first_tail: Vec<&str> = chunks[0].content.split_whitespace().rev().take(2).collect();
        assert!(first_tail
            .iter()
            .any(|word| chunks[1].content.contains(*word)));
    }

    #[test]
    fn page_attribution_prefers_matching_page() {
        let pages = vec![
            PageText {
                number: 1,
                text: "Introduction welcome overview general matters".to_string(),
            },
            PageText {
                number: 2,
                text: "termination clause severance indemnity obligations survive".to_string(),
            },
        ];
        let text = "# Terms\n\nThe termination clause and severance indemnity obligations \
                    survive closing.";
        let chunks = small_engine().chunk(text, "doc-1", "room-1", &pages).unwrap();
        assert_eq!(chunks[0].page_ranges, vec!["2".to_string()]);
    }

    #[test]
    fn page_attribution_defaults_to_one() {
        let pages = vec![PageText {
            number: 3,
            text: "completely unrelated vocabulary everywhere".to_string(),
        }];
        let text = "# Terms\n\nzebra quokka wombat axolotl pangolin discussions";
        let chunks = small_engine().chunk(text, "doc-1", "room-1", &pages).unwrap();
        assert_eq!(chunks[0].page_ranges, vec!["1".to_string()]);
    }

    #[test]
    fn attributed_pages_stay_within_the_document() {
        let pages: Vec<PageText> = (1..=4)
            .map(|number| PageText {
                number,
                text: format!("distinct vocabulary cluster number {number} appears here"),
            })
            .collect();
        let text = "# One\n\ndistinct vocabulary cluster number 2 appears here in the body\n\n\
                    # Two\n\nwords that match no page at all whatsoever anywhere";
        let chunks = small_engine().chunk(text, "doc-1", "room-1", &pages).unwrap();

        for chunk in &chunks {
            for range in &chunk.page_ranges {
                let page: u32 = range.parse().unwrap();
                assert!((1..=4).contains(&page));
            }
        }
    }

    #[test]
    fn complexity_scales_target_and_overlap() {
        let options = ChunkingOptions::default();
        let simple = assess_complexity("The cat sat on the mat. It was fine.", &options);
        let dense = assess_complexity(
            "```rust\nfn f() {}\n```\n| a | b |\n| 1 | 2 |\n- item-2983\n- item-9314\n\
             Comprehensive cryptographic initialization parameterization 0x44 characteristics \
             throughput 1234 infrastructure representations 5678 configurations",
            &options,
        );
        assert!(dense.score > simple.score);
        assert!(dense.target_tokens < simple.target_tokens);
        assert!(dense.overlap_tokens >= simple.overlap_tokens);
    }

    #[test]
    fn empty_document_is_rejected() {
        let result = engine().chunk("   \n\n  ", "doc-1", "room-1", &[]);
        assert!(result.is_err());
    }
}
