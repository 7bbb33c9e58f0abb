use crate::config::EmbeddingOptions;
use crate::error::QueryError;
use crate::models::{Chunk, ChunkEmbedding, EmbeddingReport};
use crate::tokens::{self, TokenCounter};
use crate::traits::{EmbeddingBatch, EmbeddingProvider};
use async_trait::async_trait;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 256;

pub struct EmbeddingGenerator {
    provider: Arc<dyn EmbeddingProvider>,
    counter: TokenCounter,
    cache: Cache<String, Vec<f32>>,
    options: EmbeddingOptions,
}

struct UniqueText {
    hash: String,
    text: String,
}

struct BatchOutcome {
    hashes: Vec<String>,
    result: Result<(Vec<Vec<f32>>, Vec<usize>), QueryError>,
}

impl EmbeddingGenerator {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        counter: TokenCounter,
        options: EmbeddingOptions,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(options.cache_capacity)
            .time_to_live(options.cache_ttl)
            .build();
        Self {
            provider,
            counter,
            cache,
            options,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    // Identical normalized content is embedded once no matter how many chunk
    // ids carry it; a failing batch fails only its own group of texts.
    pub async fn embed_chunks(&self, chunks: &[Chunk]) -> EmbeddingReport {
        let mut report = EmbeddingReport {
            embeddings: Vec::with_capacity(chunks.len()),
            cached_count: 0,
            new_count: 0,
            failed_count: 0,
            total_tokens: 0,
        };
        if chunks.is_empty() {
            return report;
        }

        let mut eligible: Vec<(&Chunk, String, String)> = Vec::new();
        for chunk in chunks {
            if chunk.content.len() < self.options.min_chars
                || self.counter.count_cached(&chunk.content) < self.options.min_tokens
            {
                report.failed_count += 1;
                continue;
            }
            let text = if chunk.token_count > self.options.max_tokens {
                self.counter
                    .truncate_to_tokens(&chunk.content, self.options.max_tokens)
            } else {
                chunk.content.clone()
            };
            let hash = tokens::content_hash(&text);
            eligible.push((chunk, hash, text));
        }

        let mut resolved: HashMap<String, Vec<f32>> = HashMap::new();
        let mut missing: Vec<UniqueText> = Vec::new();
        for (_, hash, text) in &eligible {
            if resolved.contains_key(hash) || missing.iter().any(|unique| &unique.hash == hash) {
                continue;
            }
            if let Some(vector) = self.cache.get(hash).await {
                resolved.insert(hash.clone(), vector);
            } else {
                missing.push(UniqueText {
                    hash: hash.clone(),
                    text: text.clone(),
                });
            }
        }

        let fresh_hashes: Vec<String> = missing.iter().map(|unique| unique.hash.clone()).collect();
        if !missing.is_empty() {
            let outcomes = self.dispatch_batches(missing).await;
            for outcome in outcomes {
                match outcome.result {
                    Ok((vectors, token_shares)) => {
                        for ((hash, vector), text_tokens) in outcome
                            .hashes
                            .into_iter()
                            .zip(vectors.into_iter())
                            .zip(token_shares.into_iter())
                        {
                            self.cache.insert(hash.clone(), vector.clone()).await;
                            resolved.insert(hash, vector);
                            report.total_tokens += text_tokens;
                        }
                    }
                    Err(error) => {
                        warn!(failed = outcome.hashes.len(), %error, "embedding batch failed");
                    }
                }
            }
        }

        for (chunk, hash, _) in eligible {
            match resolved.get(&hash) {
                Some(vector) => {
                    if fresh_hashes.contains(&hash) && report.embeddings.iter().all(
                        |existing: &ChunkEmbedding| existing.content_hash != hash,
                    ) {
                        report.new_count += 1;
                    } else {
                        report.cached_count += 1;
                    }
                    report.embeddings.push(ChunkEmbedding {
                        chunk_id: chunk.id.clone(),
                        content_hash: hash,
                        vector: vector.clone(),
                    });
                }
                None => report.failed_count += 1,
            }
        }

        debug!(
            new = report.new_count,
            cached = report.cached_count,
            failed = report.failed_count,
            tokens = report.total_tokens,
            "embedding pass complete"
        );
        report
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, QueryError> {
        let hash = tokens::content_hash(text);
        if let Some(vector) = self.cache.get(&hash).await {
            return Ok(vector);
        }

        let batch = self.provider.embed_batch(&[text.to_string()]).await?;
        let vector = batch
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::Provider {
                stage: "embedding",
                details: "provider returned no vector".to_string(),
            })?;
        self.cache.insert(hash, vector.clone()).await;
        Ok(vector)
    }

    async fn dispatch_batches(&self, missing: Vec<UniqueText>) -> Vec<BatchOutcome> {
        let batches: Vec<Vec<UniqueText>> = {
            let mut batches = Vec::new();
            let mut current = Vec::new();
            for unique in missing {
                current.push(unique);
                if current.len() >= self.options.batch_size {
                    batches.push(std::mem::take(&mut current));
                }
            }
            if !current.is_empty() {
                batches.push(current);
            }
            batches
        };

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let tasks = batches.into_iter().map(|batch| {
            let semaphore = semaphore.clone();
            async move {
                let hashes: Vec<String> = batch.iter().map(|unique| unique.hash.clone()).collect();
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return BatchOutcome {
                            hashes,
                            result: Err(QueryError::Provider {
                                stage: "embedding",
                                details: "worker pool closed".to_string(),
                            }),
                        }
                    }
                };

                let texts: Vec<String> =
                    batch.iter().map(|unique| unique.text.clone()).collect();
                let mut last_error = None;
                for _ in 0..self.options.attempts.max(1) {
                    match self.provider.embed_batch(&texts).await {
                        Ok(response) if response.vectors.len() == texts.len() => {
                            let shares = apportion_tokens(&texts, response.total_tokens);
                            return BatchOutcome {
                                hashes,
                                result: Ok((response.vectors, shares)),
                            };
                        }
                        Ok(response) => {
                            last_error = Some(QueryError::Provider {
                                stage: "embedding",
                                details: format!(
                                    "expected {} vectors, got {}",
                                    texts.len(),
                                    response.vectors.len()
                                ),
                            });
                        }
                        Err(error) => last_error = Some(error),
                    }
                }

                BatchOutcome {
                    hashes,
                    result: Err(last_error.unwrap_or(QueryError::Provider {
                        stage: "embedding",
                        details: "exhausted attempts".to_string(),
                    })),
                }
            }
        });

        futures::future::join_all(tasks).await
    }
}

// Providers often report only an aggregate token count per batch; spread it
// across the batch proportionally to content length.
fn apportion_tokens(texts: &[String], total_tokens: usize) -> Vec<usize> {
    let total_len: usize = texts.iter().map(|text| text.len()).sum();
    if total_len == 0 || texts.is_empty() {
        return vec![0; texts.len()];
    }

    let mut shares: Vec<usize> = texts
        .iter()
        .map(|text| total_tokens * text.len() / total_len)
        .collect();
    let assigned: usize = shares.iter().sum();
    if let Some(last) = shares.last_mut() {
        *last += total_tokens - assigned;
    }
    shares
}

// Deterministic local embedder kept from the original character-ngram design;
// serves tests and offline runs where no provider is reachable.
#[derive(Debug, Clone, Copy)]
pub struct HashedNgramEmbedder {
    pub dimensions: usize,
}

impl Default for HashedNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashedNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashedNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch, QueryError> {
        let vectors = texts.iter().map(|text| self.embed(text)).collect();
        let total_tokens = texts
            .iter()
            .map(|text| text.split_whitespace().count())
            .sum();
        Ok(EmbeddingBatch {
            vectors,
            total_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        texts_seen: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                texts_seen: AtomicUsize::new(0),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn dimensions(&self) -> usize {
            4
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts_seen.fetch_add(texts.len(), Ordering::SeqCst);
            if let Some(marker) = self.fail_on {
                if texts.iter().any(|text| text.contains(marker)) {
                    return Err(QueryError::Provider {
                        stage: "embedding",
                        details: "poisoned batch".to_string(),
                    });
                }
            }
            Ok(EmbeddingBatch {
                vectors: texts.iter().map(|_| vec![0.5; 4]).collect(),
                total_tokens: texts.iter().map(|text| text.len() / 4).sum(),
            })
        }
    }

    fn chunk(id: &str, content: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            content: content.to_string(),
            document_id: "doc-1".to_string(),
            dataroom_id: "room-1".to_string(),
            chunk_index: 0,
            content_hash: tokens::content_hash(content),
            token_count: content.split_whitespace().count(),
            page_ranges: vec!["1".to_string()],
            section_header: None,
            header_hierarchy: Vec::new(),
            is_small_chunk: false,
        }
    }

    fn generator(provider: Arc<dyn EmbeddingProvider>) -> EmbeddingGenerator {
        EmbeddingGenerator::new(provider, TokenCounter::new().unwrap(), EmbeddingOptions::default())
    }

    #[tokio::test]
    async fn identical_content_is_embedded_once() {
        let provider = Arc::new(CountingProvider::new());
        let generator = generator(provider.clone());

        let text = "the termination clause survives for five years after closing";
        let chunks = vec![chunk("a", text), chunk("b", text), chunk("c", text)];
        let report = generator.embed_chunks(&chunks).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.texts_seen.load(Ordering::SeqCst), 1);
        assert_eq!(report.cached_count + report.new_count, 3);
        assert_eq!(report.new_count, 1);
        assert_eq!(report.embeddings.len(), 3);
    }

    #[tokio::test]
    async fn second_pass_is_fully_cached() {
        let provider = Arc::new(CountingProvider::new());
        let generator = generator(provider.clone());
        let chunks = vec![chunk("a", "a sufficiently long first chunk about diligence items")];

        let first = generator.embed_chunks(&chunks).await;
        assert_eq!(first.new_count, 1);

        let second = generator.embed_chunks(&chunks).await;
        assert_eq!(second.new_count, 0);
        assert_eq!(second.cached_count, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tiny_chunks_are_rejected() {
        let provider = Arc::new(CountingProvider::new());
        let generator = generator(provider.clone());
        let chunks = vec![chunk("a", "tiny")];

        let report = generator.embed_chunks(&chunks).await;
        assert_eq!(report.failed_count, 1);
        assert!(report.embeddings.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn poisoned_batch_fails_alone() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            texts_seen: AtomicUsize::new(0),
            fail_on: Some("poison"),
        });
        let options = EmbeddingOptions {
            batch_size: 1,
            attempts: 1,
            ..EmbeddingOptions::default()
        };
        let generator = EmbeddingGenerator::new(
            provider.clone(),
            TokenCounter::new().unwrap(),
            options,
        );

        let chunks = vec![
            chunk("a", "a perfectly reasonable chunk about closing conditions"),
            chunk("b", "this chunk contains poison and must fail on its own"),
        ];
        let report = generator.embed_chunks(&chunks).await;

        assert_eq!(report.new_count, 1);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.embeddings.len(), 1);
        assert_eq!(report.embeddings[0].chunk_id, "a");
    }

    #[tokio::test]
    async fn oversized_content_is_truncated_before_dispatch() {
        let provider = Arc::new(CountingProvider::new());
        let options = EmbeddingOptions {
            max_tokens: 50,
            ..EmbeddingOptions::default()
        };
        let generator = EmbeddingGenerator::new(
            provider.clone(),
            TokenCounter::new().unwrap(),
            options,
        );

        let long = "diligence ".repeat(500);
        let mut oversized = chunk("a", &long);
        oversized.token_count = 500;
        let report = generator.embed_chunks(&[oversized]).await;
        assert_eq!(report.new_count, 1);
        assert_eq!(report.failed_count, 0);
    }

    #[test]
    fn token_apportioning_is_proportional_and_complete() {
        let texts = vec!["aaaa".to_string(), "bbbbbbbbbbbb".to_string()];
        let shares = apportion_tokens(&texts, 100);
        assert_eq!(shares.iter().sum::<usize>(), 100);
        assert!(shares[1] > shares[0]);
    }

    #[test]
    fn ngram_embedder_is_deterministic() {
        let embedder = HashedNgramEmbedder::default();
        let first = embedder.embed("Working capital adjustments");
        let second = embedder.embed("Working capital adjustments");
        assert_eq!(first, second);
        assert_eq!(first.len(), DEFAULT_EMBEDDING_DIMENSIONS);
    }
}
