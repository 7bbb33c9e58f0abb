use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    pub document_id: String,
    pub document_title: String,
    pub source_path: String,
    pub checksum: String,
    pub page_count: u32,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub document_id: String,
    pub dataroom_id: String,
    pub chunk_index: usize,
    pub content_hash: String,
    pub token_count: usize,
    pub page_ranges: Vec<String>,
    pub section_header: Option<String>,
    pub header_hierarchy: Vec<String>,
    pub is_small_chunk: bool,
}

impl Chunk {
    // Chunk ids are deterministic so re-chunking identical input reproduces them.
    pub fn make_id(document_id: &str, index: usize) -> String {
        format!("{document_id}_chunk_{index}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub page_ranges: Vec<String>,
    pub section_header: Option<String>,
    pub chunk_index: usize,
    pub token_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub similarity: f64,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradedChunk {
    pub result: SearchResult,
    pub relevance_score: f64,
    pub confidence: f64,
    pub is_relevant: bool,
    pub suggested_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSpan {
    pub document_id: String,
    pub chunk_id: String,
    pub page_ranges: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedContext {
    pub content: String,
    pub spans: Vec<ContextSpan>,
    pub token_count: usize,
    pub compression_ratio: f64,
    pub preserved_spans: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Question,
    Instruction,
    Conversational,
    Keyword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Extraction,
    Summarization,
    Analysis,
    Comparison,
    Conversational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSize {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStyle {
    Focused,
    Balanced,
    Thorough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionPreference {
    Narrow,
    Moderate,
    Broad,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryClassification {
    pub query_type: QueryType,
    pub intent: QueryIntent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryComplexity {
    pub score: f64,
    pub level: ComplexityLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRewriting {
    pub variants: Vec<String>,
    pub hyde_answer: Option<String>,
    pub requires_hyde: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub sanitized_query: String,
    pub classification: QueryClassification,
    pub complexity: QueryComplexity,
    pub extracted_pages: Vec<u32>,
    pub keywords: Vec<String>,
    pub desired_context: ContextSize,
    pub processing: ProcessingStyle,
    pub expansion: ExpansionPreference,
    pub context_window_hint: usize,
    pub rewriting: QueryRewriting,
}

#[derive(Debug, Clone)]
pub struct ChunkEmbedding {
    pub chunk_id: String,
    pub content_hash: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingReport {
    pub embeddings: Vec<ChunkEmbedding>,
    pub cached_count: usize,
    pub new_count: usize,
    pub failed_count: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct IndexedDocument {
    pub document_id: String,
    pub title: String,
    pub page_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub request_id: uuid::Uuid,
    pub dataroom_id: String,
    pub viewer_id: String,
    pub query: String,
    pub answer: String,
    pub strategy: String,
    pub sources: Vec<ContextSpan>,
    pub elapsed_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkingOptions {
    pub min_target_tokens: usize,
    pub max_target_tokens: usize,
    pub min_overlap_tokens: usize,
    pub max_overlap_tokens: usize,
    pub min_chunk_tokens: usize,
    pub small_chunk_tokens: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            min_target_tokens: 600,
            max_target_tokens: 1_200,
            min_overlap_tokens: 100,
            max_overlap_tokens: 200,
            min_chunk_tokens: 50,
            small_chunk_tokens: 150,
        }
    }
}

impl ChunkingOptions {
    pub fn validate(&self) -> Result<(), crate::error::IngestError> {
        if self.min_target_tokens == 0 || self.max_target_tokens < self.min_target_tokens {
            return Err(crate::error::IngestError::InvalidChunkConfig(format!(
                "target token range {}..{} is not usable",
                self.min_target_tokens, self.max_target_tokens
            )));
        }
        if self.max_overlap_tokens >= self.min_target_tokens {
            return Err(crate::error::IngestError::InvalidChunkConfig(format!(
                "overlap {} must stay below the smallest target {}",
                self.max_overlap_tokens, self.min_target_tokens
            )));
        }
        Ok(())
    }
}
