pub mod analyzer;
pub mod chunking;
pub mod compression;
pub mod config;
pub mod embedding;
pub mod error;
pub mod grading;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod raptor;
pub mod rerank;
pub mod search;
pub mod stores;
pub mod strategy;
pub mod tokens;
pub mod traits;

pub use analyzer::QueryAnalyzer;
pub use chunking::{assess_complexity, ChunkingEngine};
pub use compression::{ranked_compress, CompressionStrategy, ContextCompressor};
pub use config::PipelineConfig;
pub use embedding::{
    EmbeddingGenerator, HashedNgramEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{IngestError, QueryError};
pub use grading::RelevanceGrader;
pub use ingest::{
    discover_text_files, load_extracted_document, split_pages, ExtractedDocument, IngestPipeline,
    IngestionReport, SkippedDocument,
};
pub use models::{
    AnswerRecord, Chunk, ChunkingOptions, CompressedContext, ContextSpan, DocumentFingerprint,
    EmbeddingReport, GradedChunk, IndexedDocument, PageText, QueryAnalysis, SearchResult,
};
pub use pipeline::{QueryOutcome, QueryPipeline, QueryRequest};
pub use providers::OpenAiClient;
pub use raptor::RaptorEngine;
pub use rerank::rerank;
pub use search::{page_range_matches, SearchOrchestrator};
pub use stores::QdrantStore;
pub use strategy::{select, SearchStrategy, Selection};
pub use tokens::TokenCounter;
pub use traits::{
    AccessResolver, ChatSink, ChunkStore, EmbeddingProvider, LanguageModel, VectorIndex,
};
