use crate::config::CompressionOptions;
use crate::error::QueryError;
use crate::models::{
    CompressedContext, ComplexityLevel, ContextSpan, QueryAnalysis, SearchResult,
};
use crate::raptor::RaptorEngine;
use crate::tokens::TokenCounter;
use crate::traits::LanguageModel;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStrategy {
    Ranked,
    Hybrid,
    Raptor,
}

pub struct ContextCompressor {
    counter: TokenCounter,
    options: CompressionOptions,
    raptor: RaptorEngine,
}

impl ContextCompressor {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        counter: TokenCounter,
        options: CompressionOptions,
    ) -> Self {
        let raptor = RaptorEngine::new(llm, counter.clone(), options.clone());
        Self {
            counter,
            options,
            raptor,
        }
    }

    pub fn choose_strategy(
        &self,
        results: &[SearchResult],
        analysis: &QueryAnalysis,
    ) -> CompressionStrategy {
        let estimated_tokens: usize = results
            .iter()
            .map(|result| {
                if result.metadata.token_count > 0 {
                    result.metadata.token_count
                } else {
                    result.content.len() / 4
                }
            })
            .sum();
        let distinct_documents = results
            .iter()
            .map(|result| result.document_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        if estimated_tokens > self.options.raptor_token_cutoff
            && distinct_documents >= self.options.raptor_min_documents
        {
            CompressionStrategy::Raptor
        } else if estimated_tokens > self.options.hybrid_token_cutoff
            || analysis.complexity.level == ComplexityLevel::High
        {
            CompressionStrategy::Hybrid
        } else {
            CompressionStrategy::Ranked
        }
    }

    // Terminal state is always a CompressedContext for non-empty input: every
    // hierarchical failure lands on the deterministic ranked packer.
    pub async fn compress(
        &self,
        results: &[SearchResult],
        analysis: &QueryAnalysis,
        budget: usize,
        cancel: &CancellationToken,
    ) -> Result<CompressedContext, QueryError> {
        if results.is_empty() {
            return Ok(empty_context());
        }
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let strategy = self.choose_strategy(results, analysis);
        let query = analysis.sanitized_query.as_str();
        debug!(?strategy, budget, results = results.len(), "compression strategy chosen");

        match strategy {
            CompressionStrategy::Ranked => {
                Ok(ranked_compress(results, query, budget, &self.counter))
            }
            CompressionStrategy::Raptor => {
                match self.raptor.compress(results, query, budget, cancel).await {
                    Ok(context) => Ok(context),
                    Err(QueryError::Cancelled) => Err(QueryError::Cancelled),
                    Err(error) => {
                        warn!(%error, "raptor compression failed; using ranked fallback");
                        Ok(ranked_compress(results, query, budget, &self.counter))
                    }
                }
            }
            CompressionStrategy::Hybrid => {
                let half_budget = (budget / 2).max(1);
                let raptor_outcome = self
                    .raptor
                    .compress(results, query, half_budget, cancel)
                    .await;
                if cancel.is_cancelled() {
                    return Err(QueryError::Cancelled);
                }
                let ranked = ranked_compress(results, query, half_budget, &self.counter);

                match raptor_outcome {
                    Ok(raptor) => Ok(self.merge(raptor, ranked, budget)),
                    Err(QueryError::Cancelled) => Err(QueryError::Cancelled),
                    Err(error) => {
                        warn!(%error, "hybrid raptor half failed; keeping ranked half");
                        Ok(ranked_compress(results, query, budget, &self.counter))
                    }
                }
            }
        }
    }

    fn merge(
        &self,
        raptor: CompressedContext,
        ranked: CompressedContext,
        budget: usize,
    ) -> CompressedContext {
        let mut content = raptor.content.clone();
        if !ranked.content.is_empty() {
            content.push_str("\n\nSupporting passages:\n");
            content.push_str(&ranked.content);
        }
        if self.counter.count_cached(&content) > budget {
            content = self.counter.truncate_to_tokens(&content, budget);
        }

        let mut spans = raptor.spans;
        for span in ranked.spans {
            if !spans
                .iter()
                .any(|existing| existing.chunk_id == span.chunk_id)
            {
                spans.push(span);
            }
        }

        let token_count = self.counter.count_cached(&content);
        CompressedContext {
            content,
            spans,
            token_count,
            compression_ratio: raptor.compression_ratio.min(ranked.compression_ratio),
            preserved_spans: raptor.preserved_spans + ranked.preserved_spans,
        }
    }
}

fn empty_context() -> CompressedContext {
    CompressedContext {
        content: String::new(),
        spans: Vec::new(),
        token_count: 0,
        compression_ratio: 1.0,
        preserved_spans: 0,
    }
}

struct ScoredSentence<'a> {
    text: &'a str,
    result_index: usize,
    sentence_index: usize,
    score: f64,
    tokens: usize,
}

// Deterministic extractive compression: score sentences by query-term overlap
// and greedily pack the best into the budget, re-emitting them in document
// order. Never fails on non-empty input.
pub fn ranked_compress(
    results: &[SearchResult],
    query: &str,
    budget: usize,
    counter: &TokenCounter,
) -> CompressedContext {
    if results.is_empty() || budget == 0 {
        return empty_context();
    }

    let query_terms: Vec<String> = query
        .split(|character: char| !character.is_alphanumeric())
        .filter(|term| term.len() > 2)
        .map(|term| term.to_lowercase())
        .collect();

    let mut sentences: Vec<ScoredSentence<'_>> = Vec::new();
    for (result_index, result) in results.iter().enumerate() {
        for (sentence_index, sentence) in split_sentences(&result.content).into_iter().enumerate() {
            let lowered = sentence.to_lowercase();
            let matched = query_terms
                .iter()
                .filter(|term| lowered.contains(*term))
                .count();
            let score = if query_terms.is_empty() {
                0.0
            } else {
                matched as f64 / query_terms.len() as f64
            };
            sentences.push(ScoredSentence {
                text: sentence,
                result_index,
                sentence_index,
                score,
                tokens: counter.count_cached(sentence),
            });
        }
    }

    let mut order: Vec<usize> = (0..sentences.len()).collect();
    order.sort_by(|left, right| {
        sentences[*right]
            .score
            .total_cmp(&sentences[*left].score)
            .then_with(|| sentences[*left].result_index.cmp(&sentences[*right].result_index))
            .then_with(|| sentences[*left].sentence_index.cmp(&sentences[*right].sentence_index))
    });

    let mut remaining = budget;
    let mut selected: Vec<usize> = Vec::new();
    for index in order {
        let sentence = &sentences[index];
        if sentence.tokens == 0 || sentence.tokens > remaining {
            continue;
        }
        remaining -= sentence.tokens;
        selected.push(index);
    }

    // Floor guarantee: a tiny budget still yields content, even if the only
    // unit available must be cut mid-sentence.
    if selected.is_empty() {
        let first = results
            .iter()
            .find(|result| !result.content.trim().is_empty());
        if let Some(result) = first {
            let content = counter.truncate_to_tokens(result.content.trim(), budget);
            let token_count = counter.count_cached(&content);
            let original: usize = results.iter().map(|r| counter.count_cached(&r.content)).sum();
            return CompressedContext {
                content,
                spans: vec![ContextSpan {
                    document_id: result.document_id.clone(),
                    chunk_id: result.chunk_id.clone(),
                    page_ranges: result.metadata.page_ranges.clone(),
                }],
                token_count,
                compression_ratio: ratio(token_count, original),
                preserved_spans: 1,
            };
        }
        return empty_context();
    }

    selected.sort_by(|left, right| {
        sentences[*left]
            .result_index
            .cmp(&sentences[*right].result_index)
            .then_with(|| sentences[*left].sentence_index.cmp(&sentences[*right].sentence_index))
    });

    let mut content = String::new();
    let mut spans: Vec<ContextSpan> = Vec::new();
    let mut last_result = usize::MAX;
    for index in &selected {
        let sentence = &sentences[*index];
        if sentence.result_index != last_result {
            if !content.is_empty() {
                content.push_str("\n\n");
            }
            let result = &results[sentence.result_index];
            spans.push(ContextSpan {
                document_id: result.document_id.clone(),
                chunk_id: result.chunk_id.clone(),
                page_ranges: result.metadata.page_ranges.clone(),
            });
            last_result = sentence.result_index;
        } else {
            content.push(' ');
        }
        content.push_str(sentence.text.trim());
    }

    let token_count = counter.count_cached(&content);
    let original: usize = results
        .iter()
        .map(|result| counter.count_cached(&result.content))
        .sum();

    CompressedContext {
        preserved_spans: spans.len(),
        compression_ratio: ratio(token_count, original),
        token_count,
        spans,
        content,
    }
}

fn ratio(compressed: usize, original: usize) -> f64 {
    if original == 0 {
        1.0
    } else {
        compressed as f64 / original as f64
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (index, byte) in bytes.iter().enumerate() {
        if matches!(byte, b'.' | b'!' | b'?' | b'\n') {
            let candidate = text[start..=index].trim();
            if !candidate.is_empty() {
                sentences.push(candidate);
            }
            start = index + 1;
        }
    }
    if start < text.len() {
        let tail = text[start..].trim();
        if !tail.is_empty() {
            sentences.push(tail);
        }
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ChunkMetadata, ContextSize, ExpansionPreference, ProcessingStyle, QueryClassification,
        QueryComplexity, QueryIntent, QueryRewriting, QueryType,
    };
    use crate::traits::{
        LlmUsage, StructuredRequest, StructuredResponse, TextRequest,
    };
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;

    struct FailingLlm;

    #[async_trait]
    impl LanguageModel for FailingLlm {
        async fn generate_structured(
            &self,
            request: StructuredRequest,
        ) -> Result<StructuredResponse, QueryError> {
            Err(QueryError::Provider {
                stage: request.stage,
                details: "always down".to_string(),
            })
        }

        async fn stream_text(
            &self,
            _request: TextRequest,
        ) -> Result<BoxStream<'static, Result<String, QueryError>>, QueryError> {
            Ok(futures::stream::empty().boxed())
        }
    }

    fn result(chunk_id: &str, document_id: &str, content: &str, tokens: usize) -> SearchResult {
        SearchResult {
            chunk_id: chunk_id.to_string(),
            document_id: document_id.to_string(),
            content: content.to_string(),
            similarity: 0.8,
            metadata: ChunkMetadata {
                page_ranges: vec!["1".to_string()],
                section_header: None,
                chunk_index: 0,
                token_count: tokens,
            },
        }
    }

    fn analysis(level: ComplexityLevel) -> QueryAnalysis {
        QueryAnalysis {
            sanitized_query: "What is the termination clause?".to_string(),
            classification: QueryClassification {
                query_type: QueryType::Question,
                intent: QueryIntent::Extraction,
            },
            complexity: QueryComplexity {
                score: 0.3,
                level,
            },
            extracted_pages: Vec::new(),
            keywords: vec!["termination".to_string(), "clause".to_string()],
            desired_context: ContextSize::Medium,
            processing: ProcessingStyle::Balanced,
            expansion: ExpansionPreference::Moderate,
            context_window_hint: 4_000,
            rewriting: QueryRewriting {
                variants: Vec::new(),
                hyde_answer: None,
                requires_hyde: false,
            },
        }
    }

    fn counter() -> TokenCounter {
        TokenCounter::new().unwrap()
    }

    fn compressor() -> ContextCompressor {
        ContextCompressor::new(Arc::new(FailingLlm), counter(), CompressionOptions::default())
    }

    #[test]
    fn ranked_prefers_query_bearing_sentences() {
        let results = vec![
            result(
                "c1",
                "doc-1",
                "The weather was pleasant. The termination clause requires 30 days notice. \
                 Lunch was served at noon.",
                30,
            ),
        ];
        let context = ranked_compress(&results, "termination clause notice", 20, &counter());

        assert!(context.content.contains("termination clause"));
        assert!(!context.content.contains("Lunch"));
        assert!(context.token_count <= 20);
        assert_eq!(context.preserved_spans, 1);
    }

    #[test]
    fn ranked_never_returns_empty_for_nonempty_input() {
        let results = vec![result(
            "c1",
            "doc-1",
            "One single enormous indivisible sentence without any terminal punctuation \
             that goes on and on about representations warranties covenants and conditions",
            40,
        )];
        let context = ranked_compress(&results, "unrelated terms", 10, &counter());
        assert!(!context.content.is_empty());
        assert!(context.token_count <= 10);
    }

    #[test]
    fn ranked_respects_budget_across_many_chunks() {
        let results: Vec<SearchResult> = (0..10)
            .map(|i| {
                result(
                    &format!("c{i}"),
                    "doc-1",
                    "The termination clause requires notice. More words follow here.",
                    16,
                )
            })
            .collect();
        let context = ranked_compress(&results, "termination clause", 50, &counter());
        assert!(context.token_count <= 50);
        assert!(context.compression_ratio < 1.0);
    }

    #[test]
    fn strategy_policy_uses_volume_and_document_spread() {
        let compressor = compressor();
        let small = vec![result("c1", "doc-1", "short", 100)];
        assert_eq!(
            compressor.choose_strategy(&small, &analysis(ComplexityLevel::Low)),
            CompressionStrategy::Ranked
        );

        let medium: Vec<SearchResult> = (0..4)
            .map(|i| result(&format!("c{i}"), "doc-1", "text", 1_000))
            .collect();
        assert_eq!(
            compressor.choose_strategy(&medium, &analysis(ComplexityLevel::Low)),
            CompressionStrategy::Hybrid
        );

        let large: Vec<SearchResult> = (0..4)
            .map(|i| result(&format!("c{i}"), &format!("doc-{i}"), "text", 2_000))
            .collect();
        assert_eq!(
            compressor.choose_strategy(&large, &analysis(ComplexityLevel::Low)),
            CompressionStrategy::Raptor
        );

        assert_eq!(
            compressor.choose_strategy(&small, &analysis(ComplexityLevel::High)),
            CompressionStrategy::Hybrid
        );
    }

    #[tokio::test]
    async fn raptor_failure_falls_back_to_ranked() {
        let compressor = compressor();
        let results: Vec<SearchResult> = (0..4)
            .map(|i| {
                result(
                    &format!("c{i}"),
                    &format!("doc-{i}"),
                    "The termination clause requires 30 days notice before closing.",
                    2_000,
                )
            })
            .collect();

        let context = compressor
            .compress(
                &results,
                &analysis(ComplexityLevel::Low),
                100,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!context.content.is_empty());
        assert!(context.token_count <= 100);
    }

    #[tokio::test]
    async fn hybrid_survives_raptor_failure() {
        let compressor = compressor();
        let results: Vec<SearchResult> = (0..2)
            .map(|i| {
                result(
                    &format!("c{i}"),
                    "doc-1",
                    "The termination clause requires notice. Other sentences pad this out.",
                    2_000,
                )
            })
            .collect();

        let context = compressor
            .compress(
                &results,
                &analysis(ComplexityLevel::Low),
                80,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!context.content.is_empty());
        assert!(context.token_count <= 80);
    }

    #[tokio::test]
    async fn empty_input_is_the_only_empty_output() {
        let compressor = compressor();
        let context = compressor
            .compress(
                &[],
                &analysis(ComplexityLevel::Low),
                100,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(context.content.is_empty());
        assert_eq!(context.token_count, 0);
    }

    #[tokio::test]
    async fn cancellation_beats_fallback() {
        let compressor = compressor();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = vec![result("c1", "doc-1", "anything", 100)];
        let outcome = compressor
            .compress(&results, &analysis(ComplexityLevel::Low), 100, &cancel)
            .await;
        assert!(matches!(outcome, Err(QueryError::Cancelled)));
    }
}
