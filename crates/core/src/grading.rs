use crate::config::GradingOptions;
use crate::error::QueryError;
use crate::models::{ComplexityLevel, GradedChunk, QueryAnalysis, QueryIntent, QueryType, SearchResult};
use crate::prompts::{self, GradeVerdict, RelevanceGradingPrompt};
use crate::traits::LanguageModel;
use moka::future::Cache;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct RelevanceGrader {
    llm: Arc<dyn LanguageModel>,
    cache: Cache<String, GradeVerdict>,
    options: GradingOptions,
}

impl RelevanceGrader {
    pub fn new(llm: Arc<dyn LanguageModel>, options: GradingOptions) -> Self {
        let cache = Cache::builder()
            .max_capacity(options.cache_capacity)
            .time_to_live(options.cache_ttl)
            .build();
        Self {
            llm,
            cache,
            options,
        }
    }

    pub async fn grade(
        &self,
        analysis: &QueryAnalysis,
        results: &[SearchResult],
        cancel: &CancellationToken,
    ) -> Result<Vec<GradedChunk>, QueryError> {
        if results.is_empty() {
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        if is_conversational(analysis) {
            return Ok(self.conversational_shortcut(results));
        }

        let mut candidates: Vec<&SearchResult> = results.iter().collect();
        candidates.sort_by(|left, right| right.similarity.total_cmp(&left.similarity));
        candidates.truncate(self.candidate_count(analysis.complexity.level));

        let query = analysis.sanitized_query.as_str();
        let mut verdicts: HashMap<String, GradeVerdict> = HashMap::new();
        let mut misses: Vec<&SearchResult> = Vec::new();
        for candidate in &candidates {
            let key = grade_cache_key(query, candidate);
            match self.cache.get(&key).await {
                Some(verdict) => {
                    verdicts.insert(candidate.chunk_id.clone(), verdict);
                }
                None => misses.push(candidate),
            }
        }

        let mut any_batch_succeeded = misses.is_empty();
        if !misses.is_empty() {
            let batches: Vec<Vec<&SearchResult>> = misses
                .chunks(self.options.batch_size.max(1))
                .map(|batch| batch.to_vec())
                .collect();
            let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));

            let tasks = batches.into_iter().map(|batch| {
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                async move {
                    let _permit = match semaphore.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => return None,
                    };
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let graded = tokio::select! {
                        _ = cancel.cancelled() => None,
                        graded = self.grade_batch(query, &batch) => graded,
                    };
                    graded.map(|payload| (batch, payload))
                }
            });

            for outcome in futures::future::join_all(tasks).await.into_iter().flatten() {
                let (batch, payload) = outcome;
                any_batch_succeeded = true;
                let by_id: HashMap<&str, &GradeVerdict> = payload
                    .grades
                    .iter()
                    .map(|grade| (grade.chunk_id.as_str(), grade))
                    .collect();
                for candidate in batch {
                    if let Some(verdict) = by_id.get(candidate.chunk_id.as_str()) {
                        let verdict = (*verdict).clone();
                        self.cache
                            .insert(grade_cache_key(query, candidate), verdict.clone())
                            .await;
                        verdicts.insert(candidate.chunk_id.clone(), verdict);
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        // Every batch failing means the provider is down, not that nothing is
        // relevant; degrade to the raw similarity order at reduced confidence.
        if verdicts.is_empty() && !any_batch_succeeded {
            warn!("all grading batches failed; falling back to similarity order");
            return Ok(self.similarity_fallback(results));
        }

        let mut graded: Vec<GradedChunk> = Vec::new();
        for candidate in candidates {
            let Some(verdict) = verdicts.get(&candidate.chunk_id) else {
                continue;
            };
            let relevance = verdict.relevance_score.clamp(0.0, 1.0);
            let confidence = verdict.confidence.clamp(0.0, 1.0);
            if !verdict.is_relevant || relevance < self.options.relevance_threshold {
                continue;
            }
            graded.push(GradedChunk {
                result: candidate.clone(),
                relevance_score: relevance,
                confidence,
                is_relevant: true,
                suggested_weight: relevance * confidence,
            });
        }

        graded.sort_by(|left, right| right.suggested_weight.total_cmp(&left.suggested_weight));
        debug!(
            candidates = verdicts.len(),
            survivors = graded.len(),
            "relevance grading complete"
        );
        Ok(graded)
    }

    async fn grade_batch(
        &self,
        query: &str,
        batch: &[&SearchResult],
    ) -> Option<prompts::GradingPayload> {
        let mut prompt = format!("Question: {query}\n\nExcerpts:\n");
        for result in batch {
            let preview: String = result.content.chars().take(1_200).collect();
            prompt.push_str(&format!("[chunk_id: {}]\n{}\n\n", result.chunk_id, preview));
        }

        for _ in 0..self.options.attempts.max(1) {
            let request = prompts::request::<RelevanceGradingPrompt>(prompt.clone());
            let outcome = tokio::time::timeout(
                self.options.llm_timeout,
                self.llm.generate_structured(request),
            )
            .await;

            match outcome {
                Ok(Ok(response)) => match prompts::decode::<RelevanceGradingPrompt>(&response) {
                    Ok(payload) => return Some(payload),
                    Err(error) => warn!(%error, "grading payload was malformed"),
                },
                Ok(Err(error)) => warn!(%error, "grading batch failed"),
                Err(_) => warn!("grading batch timed out"),
            }
        }
        None
    }

    fn conversational_shortcut(&self, results: &[SearchResult]) -> Vec<GradedChunk> {
        results
            .iter()
            .take(self.options.conversational_take)
            .map(|result| GradedChunk {
                relevance_score: result.similarity,
                confidence: self.options.conversational_confidence,
                is_relevant: true,
                suggested_weight: result.similarity,
                result: result.clone(),
            })
            .collect()
    }

    fn similarity_fallback(&self, results: &[SearchResult]) -> Vec<GradedChunk> {
        results
            .iter()
            .take(self.options.conversational_take)
            .map(|result| GradedChunk {
                relevance_score: result.similarity,
                confidence: 0.5,
                is_relevant: true,
                suggested_weight: result.similarity * 0.5,
                result: result.clone(),
            })
            .collect()
    }

    fn candidate_count(&self, level: ComplexityLevel) -> usize {
        match level {
            ComplexityLevel::Low => self.options.low_complexity_candidates,
            ComplexityLevel::Medium => self.options.medium_complexity_candidates,
            ComplexityLevel::High => self.options.high_complexity_candidates,
        }
    }
}

fn is_conversational(analysis: &QueryAnalysis) -> bool {
    analysis.classification.query_type == QueryType::Conversational
        || analysis.classification.intent == QueryIntent::Conversational
}

fn grade_cache_key(query: &str, result: &SearchResult) -> String {
    let prefix: String = result.content.chars().take(100).collect();
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(result.chunk_id.as_bytes());
    hasher.update(prefix.as_bytes());
    format!("{:x}", hasher.finalize())
}
