use crate::config::SearchOptions;
use crate::embedding::EmbeddingGenerator;
use crate::error::QueryError;
use crate::models::{Chunk, ChunkMetadata, QueryAnalysis, SearchResult};
use crate::strategy::StrategyConfig;
use crate::traits::{ChunkStore, ScoredPoint, SearchFilter, VectorIndex};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct SearchOrchestrator {
    index: Arc<dyn VectorIndex>,
    chunks: Arc<dyn ChunkStore>,
    embedder: Arc<EmbeddingGenerator>,
    options: SearchOptions,
}

impl SearchOrchestrator {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        chunks: Arc<dyn ChunkStore>,
        embedder: Arc<EmbeddingGenerator>,
        options: SearchOptions,
    ) -> Self {
        Self {
            index,
            chunks,
            embedder,
            options,
        }
    }

    // The original query always searches; rewritten variants fill the
    // strategy's quota and a hypothetical answer rides along as one extra.
    pub fn build_queries(analysis: &QueryAnalysis, config: &StrategyConfig) -> Vec<String> {
        let mut queries = vec![analysis.sanitized_query.clone()];
        for variant in &analysis.rewriting.variants {
            if queries.len() >= config.max_variants {
                break;
            }
            if !queries.contains(variant) {
                queries.push(variant.clone());
            }
        }
        if analysis.rewriting.requires_hyde {
            if let Some(hyde) = &analysis.rewriting.hyde_answer {
                if !queries.contains(hyde) {
                    queries.push(hyde.clone());
                }
            }
        }
        queries
    }

    pub async fn search(
        &self,
        queries: &[String],
        dataroom_id: &str,
        allowed_document_ids: &[String],
        config: StrategyConfig,
        pages: &[u32],
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, QueryError> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let filter = SearchFilter {
            document_ids: allowed_document_ids.to_vec(),
            pages: pages.to_vec(),
        };
        let timeout = self.variant_timeout(config.top_k);
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));

        let tasks = queries.iter().map(|query| {
            let semaphore = semaphore.clone();
            let filter = filter.clone();
            let cancel = cancel.clone();
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return Vec::new(),
                };
                if cancel.is_cancelled() {
                    return Vec::new();
                }

                let attempt = async {
                    let vector = self.embedder.embed_query(query).await?;
                    self.index
                        .search(
                            dataroom_id,
                            &vector,
                            config.top_k,
                            config.similarity_threshold,
                            Some(&filter),
                        )
                        .await
                };

                // A slow, failing, or cancelled variant yields nothing; the
                // batch carries on with whatever the others return.
                tokio::select! {
                    _ = cancel.cancelled() => Vec::new(),
                    outcome = tokio::time::timeout(timeout, attempt) => match outcome {
                        Ok(Ok(points)) => points,
                        Ok(Err(error)) => {
                            warn!(%error, query_len = query.len(), "search variant failed");
                            Vec::new()
                        }
                        Err(_) => {
                            warn!(query_len = query.len(), "search variant timed out");
                            Vec::new()
                        }
                    },
                }
            }
        });

        let variant_hits = futures::future::join_all(tasks).await;
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let mut deduped: HashMap<String, SearchResult> = HashMap::new();
        for point in variant_hits.into_iter().flatten() {
            if let Some(result) = point_to_result(point) {
                deduped
                    .entry(result.chunk_id.clone())
                    .and_modify(|existing| {
                        if result.similarity > existing.similarity {
                            existing.similarity = result.similarity;
                        }
                    })
                    .or_insert(result);
            }
        }

        let mut results: Vec<SearchResult> = deduped.into_values().collect();
        results.sort_by(|left, right| {
            right
                .similarity
                .total_cmp(&left.similarity)
                .then_with(|| left.chunk_id.cmp(&right.chunk_id))
        });

        debug!(
            variants = queries.len(),
            results = results.len(),
            "multi-query search complete"
        );
        Ok(results)
    }

    // Exact structured lookup by recorded page ranges; similarity 1.0 marks an
    // exact match, not a ranking score.
    pub async fn page_query(
        &self,
        dataroom_id: &str,
        allowed_document_ids: &[String],
        pages: &[u32],
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, QueryError> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let chunks = self
            .chunks
            .chunks_by_pages(dataroom_id, allowed_document_ids, pages)
            .await?;

        let mut results: Vec<SearchResult> = chunks
            .iter()
            .take(self.options.page_lookup_limit)
            .map(|chunk| chunk_to_result(chunk, 1.0))
            .collect();
        results.sort_by(|left, right| {
            left.document_id
                .cmp(&right.document_id)
                .then(left.metadata.chunk_index.cmp(&right.metadata.chunk_index))
        });
        Ok(results)
    }

    fn variant_timeout(&self, top_k: usize) -> Duration {
        self.options.base_timeout + self.options.timeout_per_hit * top_k as u32
    }
}

pub fn chunk_to_result(chunk: &Chunk, similarity: f64) -> SearchResult {
    SearchResult {
        chunk_id: chunk.id.clone(),
        document_id: chunk.document_id.clone(),
        content: chunk.content.clone(),
        similarity,
        metadata: ChunkMetadata {
            page_ranges: chunk.page_ranges.clone(),
            section_header: chunk.section_header.clone(),
            chunk_index: chunk.chunk_index,
            token_count: chunk.token_count,
        },
    }
}

fn point_to_result(point: ScoredPoint) -> Option<SearchResult> {
    let payload = &point.payload;
    let chunk_id = payload_str(payload, "id")?;
    let document_id = payload_str(payload, "document_id")?;
    let content = payload_str(payload, "content")?;

    let page_ranges = payload
        .pointer("/page_ranges")
        .and_then(Value::as_array)
        .map(|ranges| {
            ranges
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(SearchResult {
        chunk_id,
        document_id,
        content,
        similarity: point.score.clamp(0.0, 1.0),
        metadata: ChunkMetadata {
            page_ranges,
            section_header: payload
                .pointer("/section_header")
                .and_then(Value::as_str)
                .map(str::to_string),
            chunk_index: payload
                .pointer("/chunk_index")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
            token_count: payload
                .pointer("/token_count")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
        },
    })
}

fn payload_str(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

// Recorded ranges are strings: single pages, comma lists, and hyphenated
// spans ("5", "2,4", "3-6").
pub fn page_range_matches(range: &str, page: u32) -> bool {
    range.split(',').any(|part| {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            match (start.trim().parse::<u32>(), end.trim().parse::<u32>()) {
                (Ok(start), Ok(end)) => start <= page && page <= end,
                _ => false,
            }
        } else {
            part.parse::<u32>().map(|single| single == page).unwrap_or(false)
        }
    })
}
