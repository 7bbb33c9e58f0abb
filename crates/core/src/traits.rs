use crate::error::QueryError;
use crate::models::{AnswerRecord, Chunk, IndexedDocument};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f64,
    pub payload: Value,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub document_ids: Vec<String>,
    pub pages: Vec<u32>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn ensure_collection(
        &self,
        dataroom_id: &str,
        vector_size: usize,
    ) -> Result<(), QueryError>;

    async fn upsert(&self, dataroom_id: &str, points: Vec<VectorPoint>)
        -> Result<(), QueryError>;

    async fn search(
        &self,
        dataroom_id: &str,
        vector: &[f32],
        top_k: usize,
        threshold: f64,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredPoint>, QueryError>;

    async fn delete_documents(
        &self,
        dataroom_id: &str,
        document_ids: &[String],
    ) -> Result<(), QueryError>;
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn chunks_by_pages(
        &self,
        dataroom_id: &str,
        document_ids: &[String],
        pages: &[u32],
    ) -> Result<Vec<Chunk>, QueryError>;

    async fn chunks_by_document(
        &self,
        dataroom_id: &str,
        document_id: &str,
    ) -> Result<Vec<Chunk>, QueryError>;

    async fn list_documents(&self, dataroom_id: &str) -> Result<Vec<IndexedDocument>, QueryError>;
}

#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub total_tokens: usize,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch, QueryError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LlmUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub stage: &'static str,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct StructuredResponse {
    pub value: Value,
    pub usage: LlmUsage,
}

#[derive(Debug, Clone)]
pub struct TextRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<StructuredResponse, QueryError>;

    async fn stream_text(
        &self,
        request: TextRequest,
    ) -> Result<BoxStream<'static, Result<String, QueryError>>, QueryError>;
}

#[async_trait]
pub trait AccessResolver: Send + Sync {
    async fn permitted_documents(
        &self,
        dataroom_id: &str,
        viewer_id: &str,
    ) -> Result<Vec<IndexedDocument>, QueryError>;
}

#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn push_answer(&self, record: &AnswerRecord) -> Result<(), QueryError>;
}
