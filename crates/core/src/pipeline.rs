use crate::analyzer::QueryAnalyzer;
use crate::compression::ContextCompressor;
use crate::config::PipelineConfig;
use crate::error::QueryError;
use crate::grading::RelevanceGrader;
use crate::models::{AnswerRecord, ContextSpan, CompressedContext, QueryAnalysis, SearchResult};
use crate::search::SearchOrchestrator;
use crate::strategy::{self, SearchStrategy, Selection};
use crate::traits::{AccessResolver, ChatSink, ChunkStore, LanguageModel, TextRequest};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct QueryRequest {
    pub request_id: Uuid,
    pub dataroom_id: String,
    pub viewer_id: String,
    pub query: String,
    pub token_budget: Option<usize>,
}

impl QueryRequest {
    pub fn new(
        dataroom_id: impl Into<String>,
        viewer_id: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            dataroom_id: dataroom_id.into(),
            viewer_id: viewer_id.into(),
            query: query.into(),
            token_budget: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub request_id: Uuid,
    pub answer: String,
    pub sources: Vec<ContextSpan>,
    pub strategy: &'static str,
    pub confidence: f64,
    pub fallback: bool,
}

pub struct QueryPipeline {
    analyzer: QueryAnalyzer,
    orchestrator: SearchOrchestrator,
    grader: RelevanceGrader,
    compressor: ContextCompressor,
    llm: Arc<dyn LanguageModel>,
    chunks: Arc<dyn ChunkStore>,
    access: Arc<dyn AccessResolver>,
    chat: Arc<dyn ChatSink>,
    config: PipelineConfig,
}

impl QueryPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        analyzer: QueryAnalyzer,
        orchestrator: SearchOrchestrator,
        grader: RelevanceGrader,
        compressor: ContextCompressor,
        llm: Arc<dyn LanguageModel>,
        chunks: Arc<dyn ChunkStore>,
        access: Arc<dyn AccessResolver>,
        chat: Arc<dyn ChatSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            analyzer,
            orchestrator,
            grader,
            compressor,
            llm,
            chunks,
            access,
            chat,
            config,
        }
    }

    // One cancellation signal per request, threaded through every stage.
    // Failures with a user-facing message become explanatory answers;
    // validation errors and cancellation propagate to the request layer.
    pub async fn answer(
        &self,
        request: &QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryOutcome, QueryError> {
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
            run = tokio::time::timeout(self.config.request_timeout, self.run(request, &cancel)) => {
                match run {
                    Ok(inner) => inner,
                    Err(_) => Err(QueryError::Timeout),
                }
            }
        };

        match outcome {
            Ok(mut answered) => {
                answered.request_id = request.request_id;
                self.record(request, &answered, started).await;
                Ok(answered)
            }
            Err(QueryError::Cancelled) => Err(QueryError::Cancelled),
            Err(error) => match error.user_facing_message() {
                Some(message) => {
                    info!(%error, "request resolved with an explanatory fallback");
                    let answered = QueryOutcome {
                        request_id: request.request_id,
                        answer: message.to_string(),
                        sources: Vec::new(),
                        strategy: "fallback",
                        confidence: 1.0,
                        fallback: true,
                    };
                    self.record(request, &answered, started).await;
                    Ok(answered)
                }
                None => Err(error),
            },
        }
    }

    async fn run(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, QueryError> {
        let permitted = self
            .access
            .permitted_documents(&request.dataroom_id, &request.viewer_id)
            .await?;
        if permitted.is_empty() {
            let indexed = self.chunks.list_documents(&request.dataroom_id).await?;
            return Err(if indexed.is_empty() {
                QueryError::NoIndexedDocuments
            } else {
                QueryError::NoPermittedDocuments
            });
        }

        let analysis = match self.analyzer.analyze(&request.query).await {
            Ok(analysis) => analysis,
            Err(error @ QueryError::Validation(_)) => return Err(error),
            Err(QueryError::Cancelled) => return Err(QueryError::Cancelled),
            Err(error) => {
                warn!(%error, "query analysis failed; using deterministic fallback");
                self.analyzer.fallback_analysis(&request.query)?
            }
        };
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let selection = strategy::select(&analysis, permitted.len());
        debug!(
            strategy = selection.strategy.name(),
            confidence = selection.confidence,
            "strategy selected"
        );

        let allowed_ids: Vec<String> = permitted
            .iter()
            .map(|document| document.document_id.clone())
            .collect();

        let results = self
            .retrieve(request, &analysis, &selection, &allowed_ids, &permitted, cancel)
            .await?;
        if results.is_empty() {
            return Err(QueryError::NoRelevantContent);
        }

        let results = if results.len() >= self.config.rerank_trigger {
            crate::rerank::rerank(&analysis.sanitized_query, results)
        } else {
            results
        };

        // Exact page lookups are what the viewer asked for; only vector hits
        // go through relevance grading.
        let selected: Vec<SearchResult> = if selection.strategy == SearchStrategy::PageQuery {
            results
        } else {
            let graded = self.grader.grade(&analysis, &results, cancel).await?;
            graded.into_iter().map(|chunk| chunk.result).collect()
        };
        if selected.is_empty() {
            return Err(QueryError::NoRelevantContent);
        }

        let budget = request
            .token_budget
            .unwrap_or(self.config.compression.default_budget);
        let context = self
            .compressor
            .compress(&selected, &analysis, budget, cancel)
            .await?;
        if context.content.is_empty() {
            return Err(QueryError::NoRelevantContent);
        }

        let answer = self.generate_answer(&analysis, &context, cancel).await?;
        Ok(QueryOutcome {
            request_id: request.request_id,
            answer,
            sources: context.spans,
            strategy: selection.strategy.name(),
            confidence: selection.confidence,
            fallback: false,
        })
    }

    async fn retrieve(
        &self,
        request: &QueryRequest,
        analysis: &QueryAnalysis,
        selection: &Selection,
        allowed_ids: &[String],
        permitted: &[crate::models::IndexedDocument],
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, QueryError> {
        if selection.strategy == SearchStrategy::PageQuery {
            let known_pages = permitted
                .iter()
                .map(|document| document.page_count)
                .max()
                .unwrap_or(0);
            if let Some(out_of_range) = analysis
                .extracted_pages
                .iter()
                .find(|page| **page > known_pages)
            {
                return Err(QueryError::PageOutOfRange {
                    requested: *out_of_range,
                    page_count: known_pages,
                });
            }

            return self
                .orchestrator
                .page_query(
                    &request.dataroom_id,
                    allowed_ids,
                    &analysis.extracted_pages,
                    cancel,
                )
                .await;
        }

        let config = selection.strategy.config();
        let queries = SearchOrchestrator::build_queries(analysis, &config);
        self.orchestrator
            .search(
                &queries,
                &request.dataroom_id,
                allowed_ids,
                config,
                &analysis.extracted_pages,
                cancel,
            )
            .await
    }

    async fn generate_answer(
        &self,
        analysis: &QueryAnalysis,
        context: &CompressedContext,
        cancel: &CancellationToken,
    ) -> Result<String, QueryError> {
        let request = TextRequest {
            system: "You answer questions about a private document set. Use only the \
                     provided context. If the context does not contain the answer, say \
                     so plainly. Cite the documents you relied on."
                .to_string(),
            prompt: format!(
                "Context:\n{}\n\nQuestion: {}",
                context.content, analysis.sanitized_query
            ),
            max_tokens: self.config.answer_max_tokens,
            temperature: 0.2,
        };

        let mut stream = self.llm.stream_text(request).await?;
        let mut answer = String::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(QueryError::Cancelled),
                token = stream.next() => match token {
                    Some(Ok(token)) => answer.push_str(&token),
                    Some(Err(error)) => return Err(error),
                    None => break,
                },
            }
        }

        if answer.trim().is_empty() {
            return Err(QueryError::Provider {
                stage: "answer generation",
                details: "empty completion".to_string(),
            });
        }
        Ok(answer)
    }

    async fn record(&self, request: &QueryRequest, outcome: &QueryOutcome, started: Instant) {
        let record = AnswerRecord {
            request_id: request.request_id,
            dataroom_id: request.dataroom_id.clone(),
            viewer_id: request.viewer_id.clone(),
            query: request.query.clone(),
            answer: outcome.answer.clone(),
            strategy: outcome.strategy.to_string(),
            sources: outcome.sources.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
        };
        if let Err(error) = self.chat.push_answer(&record).await {
            warn!(%error, "failed to persist answer record");
        }
    }
}
