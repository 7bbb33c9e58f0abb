use crate::config::CompressionOptions;
use crate::error::QueryError;
use crate::models::{CompressedContext, ContextSpan, SearchResult};
use crate::prompts::{
    self, DocumentSummaryPrompt, HierarchicalSummaryPrompt, NodeAction, TreeBuildPrompt,
    TreeCompressionPrompt, TreeNodePayload,
};
use crate::tokens::TokenCounter;
use crate::traits::{LanguageModel, StructuredRequest};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// Hierarchical summarize-then-compress. Every phase returns Result; the
// compression orchestrator owns the fallback, this engine never hides one.
pub struct RaptorEngine {
    llm: Arc<dyn LanguageModel>,
    counter: TokenCounter,
    options: CompressionOptions,
}

struct DocumentGroup<'a> {
    document_id: String,
    results: Vec<&'a SearchResult>,
    top_similarity: f64,
}

struct CompressedNode {
    heading: String,
    relevance: f64,
    text: String,
    preserved: bool,
}

impl RaptorEngine {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        counter: TokenCounter,
        options: CompressionOptions,
    ) -> Self {
        Self {
            llm,
            counter,
            options,
        }
    }

    pub async fn compress(
        &self,
        results: &[SearchResult],
        query: &str,
        budget: usize,
        cancel: &CancellationToken,
    ) -> Result<CompressedContext, QueryError> {
        if results.is_empty() {
            return Err(QueryError::Provider {
                stage: "raptor",
                details: "no input to compress".to_string(),
            });
        }

        let groups = group_by_document(results, self.options.summary_group_limit);
        let summaries = self.summarize_groups(&groups, query, cancel).await?;
        self.ensure_live(cancel)?;

        let tree = self.build_tree(&summaries, query).await?;
        self.ensure_live(cancel)?;

        let aggressive = tree.nodes.len() > self.options.aggressive_node_count
            || average_relevance(&tree.nodes) < self.options.aggressive_min_avg_relevance;
        let nodes = self.compress_nodes(tree.nodes, query, aggressive, cancel).await?;
        self.ensure_live(cancel)?;

        let overview = self.hierarchical_summary(&nodes, query).await?;
        self.ensure_live(cancel)?;

        Ok(self.assemble(&tree.topic, &overview, nodes, &groups, results, budget))
    }

    fn ensure_live(&self, cancel: &CancellationToken) -> Result<(), QueryError> {
        if cancel.is_cancelled() {
            Err(QueryError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn call(&self, request: StructuredRequest) -> Result<crate::traits::StructuredResponse, QueryError> {
        let stage = request.stage;
        tokio::time::timeout(self.options.llm_timeout, self.llm.generate_structured(request))
            .await
            .map_err(|_| QueryError::ProviderTimeout { stage })?
    }

    async fn summarize_groups(
        &self,
        groups: &[DocumentGroup<'_>],
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, String)>, QueryError> {
        let semaphore = Arc::new(Semaphore::new(3));
        let tasks = groups.iter().map(|group| {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| QueryError::Provider {
                        stage: "document summary",
                        details: "worker pool closed".to_string(),
                    })?;
                if cancel.is_cancelled() {
                    return Err(QueryError::Cancelled);
                }

                let mut prompt = format!(
                    "Question: {query}\n\nExcerpts from document {}:\n",
                    group.document_id
                );
                for result in &group.results {
                    let preview: String = result.content.chars().take(2_000).collect();
                    prompt.push_str(&preview);
                    prompt.push_str("\n\n");
                }

                let response = self
                    .call(prompts::request::<DocumentSummaryPrompt>(prompt))
                    .await?;
                let payload = prompts::decode::<DocumentSummaryPrompt>(&response)?;
                Ok::<(String, String), QueryError>((group.document_id.clone(), payload.summary))
            }
        });

        let outcomes = futures::future::join_all(tasks).await;
        let mut summaries = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            summaries.push(outcome?);
        }
        if summaries.is_empty() {
            return Err(QueryError::Provider {
                stage: "document summary",
                details: "no document groups produced a summary".to_string(),
            });
        }
        Ok(summaries)
    }

    async fn build_tree(
        &self,
        summaries: &[(String, String)],
        query: &str,
    ) -> Result<prompts::TreePayload, QueryError> {
        let mut prompt = format!("Question: {query}\n\nDocument summaries:\n");
        for (document_id, summary) in summaries {
            prompt.push_str(&format!("[document {document_id}]\n{summary}\n\n"));
        }

        let response = self.call(prompts::request::<TreeBuildPrompt>(prompt)).await?;
        let tree = prompts::decode::<TreeBuildPrompt>(&response)?;
        if tree.nodes.is_empty() {
            return Err(QueryError::Provider {
                stage: "tree build",
                details: "tree has no nodes".to_string(),
            });
        }
        Ok(tree)
    }

    async fn compress_nodes(
        &self,
        nodes: Vec<TreeNodePayload>,
        query: &str,
        aggressive: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<CompressedNode>, QueryError> {
        let target_tokens = if aggressive { 80 } else { 160 };
        let semaphore = Arc::new(Semaphore::new(3));

        let tasks = nodes.into_iter().map(|node| {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            async move {
                match node.action {
                    NodeAction::Remove => Ok(None),
                    NodeAction::Preserve => Ok(Some(CompressedNode {
                        heading: node.heading,
                        relevance: node.relevance,
                        text: node.text,
                        preserved: true,
                    })),
                    NodeAction::Compress => {
                        let _permit =
                            semaphore
                                .acquire()
                                .await
                                .map_err(|_| QueryError::Provider {
                                    stage: "tree compression",
                                    details: "worker pool closed".to_string(),
                                })?;
                        if cancel.is_cancelled() {
                            return Err(QueryError::Cancelled);
                        }

                        let prompt = format!(
                            "Question: {query}\nCompress to roughly {target_tokens} tokens.\n\n{}",
                            node.text
                        );
                        let response = self
                            .call(prompts::request::<TreeCompressionPrompt>(prompt))
                            .await?;
                        let payload = prompts::decode::<TreeCompressionPrompt>(&response)?;
                        Ok(Some(CompressedNode {
                            heading: node.heading,
                            relevance: node.relevance,
                            text: payload.text,
                            preserved: false,
                        }))
                    }
                }
            }
        });

        let outcomes = futures::future::join_all(tasks).await;
        let mut compressed = Vec::new();
        for outcome in outcomes {
            if let Some(node) = outcome? {
                compressed.push(node);
            }
        }
        if compressed.is_empty() {
            return Err(QueryError::Provider {
                stage: "tree compression",
                details: "every node was removed".to_string(),
            });
        }
        Ok(compressed)
    }

    async fn hierarchical_summary(
        &self,
        nodes: &[CompressedNode],
        query: &str,
    ) -> Result<prompts::HierarchicalSummaryPayload, QueryError> {
        let mut prompt = format!("Question: {query}\n\nSections:\n");
        for node in nodes {
            prompt.push_str(&format!("## {}\n{}\n\n", node.heading, node.text));
        }
        let response = self
            .call(prompts::request::<HierarchicalSummaryPrompt>(prompt))
            .await?;
        prompts::decode::<HierarchicalSummaryPrompt>(&response)
    }

    fn assemble(
        &self,
        topic: &str,
        overview: &prompts::HierarchicalSummaryPayload,
        mut nodes: Vec<CompressedNode>,
        groups: &[DocumentGroup<'_>],
        results: &[SearchResult],
        budget: usize,
    ) -> CompressedContext {
        nodes.sort_by(|left, right| right.relevance.total_cmp(&left.relevance));

        let render = |nodes: &[CompressedNode]| -> String {
            let mut content = format!("# {topic}\n\n{}\n", overview.summary);
            for node in nodes {
                if node.relevance >= self.options.section_relevance_floor {
                    content.push_str(&format!("\n## {}\n{}\n", node.heading, node.text));
                }
            }
            if !overview.key_insights.is_empty() {
                content.push_str("\nKey insights:\n");
                for insight in &overview.key_insights {
                    content.push_str(&format!("- {insight}\n"));
                }
            }
            content
        };

        // Trim least-relevant sections first, then hard-truncate, so the
        // budget holds even for an oversized summary.
        let mut content = render(&nodes);
        while self.counter.count_cached(&content) > budget && !nodes.is_empty() {
            nodes.pop();
            content = render(&nodes);
        }
        if self.counter.count_cached(&content) > budget {
            content = self.counter.truncate_to_tokens(&content, budget);
        }

        let original_tokens: usize = results
            .iter()
            .map(|result| {
                if result.metadata.token_count > 0 {
                    result.metadata.token_count
                } else {
                    self.counter.count_cached(&result.content)
                }
            })
            .sum();
        let token_count = self.counter.count_cached(&content);

        let spans: Vec<ContextSpan> = groups
            .iter()
            .flat_map(|group| group.results.iter())
            .map(|result| ContextSpan {
                document_id: result.document_id.clone(),
                chunk_id: result.chunk_id.clone(),
                page_ranges: result.metadata.page_ranges.clone(),
            })
            .collect();
        let preserved_spans = nodes.iter().filter(|node| node.preserved).count();

        debug!(
            nodes = nodes.len(),
            tokens = token_count,
            budget,
            "raptor assembly complete"
        );

        CompressedContext {
            content,
            spans,
            token_count,
            compression_ratio: if original_tokens > 0 {
                token_count as f64 / original_tokens as f64
            } else {
                1.0
            },
            preserved_spans,
        }
    }
}

fn group_by_document<'a>(
    results: &'a [SearchResult],
    limit: usize,
) -> Vec<DocumentGroup<'a>> {
    let mut grouped: BTreeMap<&str, Vec<&SearchResult>> = BTreeMap::new();
    for result in results {
        grouped.entry(&result.document_id).or_default().push(result);
    }

    let mut groups: Vec<DocumentGroup<'a>> = grouped
        .into_iter()
        .map(|(document_id, results)| DocumentGroup {
            document_id: document_id.to_string(),
            top_similarity: results
                .iter()
                .map(|result| result.similarity)
                .fold(0.0, f64::max),
            results,
        })
        .collect();

    groups.sort_by(|left, right| {
        right
            .top_similarity
            .total_cmp(&left.top_similarity)
            .then_with(|| left.document_id.cmp(&right.document_id))
    });
    groups.truncate(limit);
    groups
}

fn average_relevance(nodes: &[TreeNodePayload]) -> f64 {
    if nodes.is_empty() {
        return 0.0;
    }
    nodes.iter().map(|node| node.relevance).sum::<f64>() / nodes.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use crate::traits::{LlmUsage, StructuredResponse, TextRequest};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use serde_json::json;

    struct StagedLlm {
        fail_stage: Option<&'static str>,
    }

    #[async_trait]
    impl LanguageModel for StagedLlm {
        async fn generate_structured(
            &self,
            request: StructuredRequest,
        ) -> Result<StructuredResponse, QueryError> {
            if Some(request.stage) == self.fail_stage {
                return Err(QueryError::Provider {
                    stage: request.stage,
                    details: "forced failure".to_string(),
                });
            }

            let value = match request.stage {
                "document summary" => json!({"summary": "Summary of the document."}),
                "tree build" => json!({
                    "topic": "Fee structure",
                    "nodes": [
                        {"id": "n1", "heading": "Management fee", "relevance": 0.95,
                         "action": "preserve", "text": "The management fee is 2% per annum."},
                        {"id": "n2", "heading": "Fee history", "relevance": 0.7,
                         "action": "compress", "text": "A long recitation of fee changes over time."},
                        {"id": "n3", "heading": "Office locations", "relevance": 0.1,
                         "action": "remove", "text": "Offices in three cities."}
                    ]
                }),
                "tree compression" => json!({"text": "Fees changed twice, most recently in 2021."}),
                "hierarchical summary" => json!({
                    "summary": "The fund charges a 2% management fee.",
                    "key_insights": ["Management fee is 2%"]
                }),
                other => panic!("unexpected stage {other}"),
            };
            Ok(StructuredResponse {
                value,
                usage: LlmUsage::default(),
            })
        }

        async fn stream_text(
            &self,
            _request: TextRequest,
        ) -> Result<BoxStream<'static, Result<String, QueryError>>, QueryError> {
            Ok(futures::stream::empty().boxed())
        }
    }

    fn result(chunk_id: &str, document_id: &str, similarity: f64) -> SearchResult {
        SearchResult {
            chunk_id: chunk_id.to_string(),
            document_id: document_id.to_string(),
            content: "The management fee is two percent per annum, payable quarterly.".to_string(),
            similarity,
            metadata: ChunkMetadata {
                page_ranges: vec!["3".to_string()],
                section_header: Some("Fees".to_string()),
                chunk_index: 0,
                token_count: 14,
            },
        }
    }

    fn engine(fail_stage: Option<&'static str>) -> RaptorEngine {
        RaptorEngine::new(
            Arc::new(StagedLlm { fail_stage }),
            TokenCounter::new().unwrap(),
            CompressionOptions::default(),
        )
    }

    fn inputs() -> Vec<SearchResult> {
        vec![
            result("c1", "doc-1", 0.9),
            result("c2", "doc-2", 0.8),
            result("c3", "doc-3", 0.7),
            result("c4", "doc-4", 0.6),
        ]
    }

    #[tokio::test]
    async fn full_run_produces_structured_context() {
        let context = engine(None)
            .compress(&inputs(), "What are the fees?", 2_000, &CancellationToken::new())
            .await
            .unwrap();

        assert!(context.content.starts_with("# Fee structure"));
        assert!(context.content.contains("## Management fee"));
        assert!(context.content.contains("Key insights:"));
        // Low-relevance and removed sections never render.
        assert!(!context.content.contains("Office locations"));
        assert!(context.token_count <= 2_000);
        assert_eq!(context.preserved_spans, 1);
        // Only the top three document groups feed the tree.
        let documents: std::collections::HashSet<_> =
            context.spans.iter().map(|span| span.document_id.as_str()).collect();
        assert_eq!(documents.len(), 3);
    }

    #[tokio::test]
    async fn each_phase_failure_surfaces_as_error() {
        for stage in [
            "document summary",
            "tree build",
            "tree compression",
            "hierarchical summary",
        ] {
            let outcome = engine(Some(stage))
                .compress(&inputs(), "What are the fees?", 2_000, &CancellationToken::new())
                .await;
            assert!(outcome.is_err(), "stage {stage} should fail the engine");
            assert!(!matches!(outcome, Err(QueryError::Cancelled)));
        }
    }

    #[tokio::test]
    async fn tight_budget_is_respected() {
        let context = engine(None)
            .compress(&inputs(), "What are the fees?", 30, &CancellationToken::new())
            .await
            .unwrap();
        assert!(context.token_count <= 30);
        assert!(!context.content.is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_the_engine() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = engine(None)
            .compress(&inputs(), "What are the fees?", 2_000, &cancel)
            .await;
        assert!(matches!(outcome, Err(QueryError::Cancelled)));
    }
}
