use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dataroom_rag_core::{
    load_extracted_document, AccessResolver, AnswerRecord, ChatSink, ChunkStore, ChunkingEngine,
    ChunkingOptions, ContextCompressor, EmbeddingGenerator, EmbeddingProvider, HashedNgramEmbedder,
    IndexedDocument, IngestPipeline, LanguageModel, OpenAiClient, PipelineConfig, QdrantStore,
    QueryAnalyzer, QueryError, QueryPipeline, QueryRequest, RelevanceGrader, SearchOrchestrator,
    TokenCounter, VectorIndex,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "dataroom-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Qdrant base URL
    #[arg(long, default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Collection name prefix (one collection per dataroom)
    #[arg(long, default_value = "dataroom")]
    collection_prefix: String,

    /// Dataroom to operate on
    #[arg(long, default_value = "default")]
    dataroom: String,

    /// OpenAI-compatible API base URL
    #[arg(long, default_value = "https://api.openai.com/v1")]
    llm_url: String,

    /// API key for the embedding/LLM provider
    #[arg(long, env = "OPENAI_API_KEY", default_value = "")]
    api_key: String,

    /// Embedding model name
    #[arg(long, default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Embedding vector size
    #[arg(long, default_value = "1536")]
    embedding_dimensions: usize,

    /// Chat model name
    #[arg(long, default_value = "gpt-4o-mini")]
    chat_model: String,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a folder of extracted documents (markdown/text, form-feed page breaks).
    Ingest {
        /// Folder containing extracted documents, searched recursively.
        #[arg(long)]
        folder: String,
    },
    /// Delete and re-ingest a single document.
    Reindex {
        /// Path to the extracted document.
        #[arg(long)]
        file: String,
    },
    /// Ask a question against the indexed dataroom.
    Ask {
        /// The question.
        #[arg(long)]
        query: String,
        /// Viewer identity recorded with the answer.
        #[arg(long, default_value = "cli")]
        viewer: String,
        /// Token budget for the compressed context.
        #[arg(long)]
        budget: Option<usize>,
    },
}

struct IndexBackedResolver {
    chunks: Arc<dyn ChunkStore>,
}

#[async_trait]
impl AccessResolver for IndexBackedResolver {
    // The CLI has no permission system; every indexed document is visible.
    async fn permitted_documents(
        &self,
        dataroom_id: &str,
        _viewer_id: &str,
    ) -> Result<Vec<IndexedDocument>, QueryError> {
        self.chunks.list_documents(dataroom_id).await
    }
}

struct LoggingChatSink;

#[async_trait]
impl ChatSink for LoggingChatSink {
    async fn push_answer(&self, record: &AnswerRecord) -> Result<(), QueryError> {
        info!(
            request = %record.request_id,
            strategy = %record.strategy,
            elapsed_ms = record.elapsed_ms,
            sources = record.sources.len(),
            "answer recorded"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::default();
    let counter = TokenCounter::new().map_err(|error| anyhow::anyhow!(error.to_string()))?;

    let online = !cli.api_key.is_empty();
    let openai = Arc::new(OpenAiClient::new(
        &cli.llm_url,
        &cli.api_key,
        &cli.embedding_model,
        &cli.chat_model,
        cli.embedding_dimensions,
    ));

    let embedding_provider: Arc<dyn EmbeddingProvider> = if online {
        openai.clone()
    } else {
        warn!("no api key configured; using the deterministic offline embedder");
        Arc::new(HashedNgramEmbedder::default())
    };

    let store = Arc::new(QdrantStore::new(
        &cli.qdrant_url,
        &cli.collection_prefix,
        embedding_provider.dimensions(),
    ));
    let embedder = Arc::new(EmbeddingGenerator::new(
        embedding_provider,
        counter.clone(),
        config.embedding.clone(),
    ));

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        dataroom = %cli.dataroom,
        "dataroom-rag boot"
    );

    match cli.command {
        Command::Ingest { folder } => {
            let chunker = ChunkingEngine::new(counter, ChunkingOptions::default())
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let pipeline = IngestPipeline::new(chunker, embedder, store.clone());

            let report = pipeline
                .ingest_folder(&cli.dataroom, Path::new(&folder))
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            for skipped in &report.skipped {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped document");
            }
            for document in &report.documents {
                println!(
                    "{}: {} chunks ({} embedded, {} cached, {} failed, {} tokens)",
                    document.document_id,
                    document.chunk_count,
                    document.embedded_count,
                    document.cached_count,
                    document.failed_count,
                    document.total_tokens,
                );
            }
            println!(
                "{} documents ingested, {} skipped at {}",
                report.documents.len(),
                report.skipped.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Reindex { file } => {
            let chunker = ChunkingEngine::new(counter, ChunkingOptions::default())
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let pipeline = IngestPipeline::new(chunker, embedder, store.clone());

            let document = load_extracted_document(Path::new(&file))
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let ingestion = pipeline
                .reindex_document(&cli.dataroom, &document)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            println!(
                "reindexed {} with {} chunks",
                ingestion.document_id, ingestion.chunk_count
            );
        }
        Command::Ask {
            query,
            viewer,
            budget,
        } => {
            if !online {
                anyhow::bail!("asking questions requires an API key (set OPENAI_API_KEY)");
            }
            let llm: Arc<dyn LanguageModel> = openai;
            let index: Arc<dyn VectorIndex> = store.clone();
            let chunks: Arc<dyn ChunkStore> = store;

            let orchestrator = SearchOrchestrator::new(
                index,
                chunks.clone(),
                embedder,
                config.search.clone(),
            );
            let pipeline = QueryPipeline::new(
                QueryAnalyzer::new(llm.clone(), config.analyzer.clone())
                    .map_err(|error| anyhow::anyhow!(error.to_string()))?,
                orchestrator,
                RelevanceGrader::new(llm.clone(), config.grading.clone()),
                ContextCompressor::new(llm.clone(), counter, config.compression.clone()),
                llm,
                chunks.clone(),
                Arc::new(IndexBackedResolver { chunks }),
                Arc::new(LoggingChatSink),
                config,
            );

            let mut request = QueryRequest::new(&cli.dataroom, &viewer, &query);
            request.token_budget = budget;

            let cancel = CancellationToken::new();
            let watcher = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    watcher.cancel();
                }
            });

            let outcome = pipeline
                .answer(&request, cancel)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            println!("{}", outcome.answer);
            if !outcome.sources.is_empty() {
                println!();
                println!("sources:");
                for source in &outcome.sources {
                    println!(
                        "  document={} chunk={} pages={}",
                        source.document_id,
                        source.chunk_id,
                        source.page_ranges.join(",")
                    );
                }
            }
            info!(
                strategy = outcome.strategy,
                confidence = outcome.confidence,
                fallback = outcome.fallback,
                "ask complete"
            );
        }
    }

    Ok(())
}
