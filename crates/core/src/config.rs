use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    pub max_query_chars: usize,
    pub max_variants: usize,
    pub llm_timeout: Duration,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            max_query_chars: 2_000,
            max_variants: 6,
            llm_timeout: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingOptions {
    pub min_chars: usize,
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub batch_size: usize,
    pub concurrency: usize,
    pub attempts: usize,
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self {
            min_chars: 10,
            min_tokens: 5,
            max_tokens: 8_000,
            batch_size: 120,
            concurrency: 5,
            attempts: 2,
            cache_ttl: Duration::from_secs(12 * 60 * 60),
            cache_capacity: 100_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub concurrency: usize,
    pub base_timeout: Duration,
    pub timeout_per_hit: Duration,
    pub page_lookup_limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            base_timeout: Duration::from_millis(500),
            timeout_per_hit: Duration::from_millis(40),
            page_lookup_limit: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GradingOptions {
    pub concurrency: usize,
    pub batch_size: usize,
    pub attempts: usize,
    pub relevance_threshold: f64,
    pub low_complexity_candidates: usize,
    pub medium_complexity_candidates: usize,
    pub high_complexity_candidates: usize,
    pub conversational_take: usize,
    pub conversational_confidence: f64,
    pub llm_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
}

impl Default for GradingOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            batch_size: 4,
            attempts: 2,
            relevance_threshold: 0.55,
            low_complexity_candidates: 8,
            medium_complexity_candidates: 12,
            high_complexity_candidates: 16,
            conversational_take: 3,
            conversational_confidence: 0.9,
            llm_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(60 * 60),
            cache_capacity: 50_000,
        }
    }
}

// Compression cutoffs are inherited heuristics kept configurable rather than
// re-derived; see DESIGN.md.
#[derive(Debug, Clone)]
pub struct CompressionOptions {
    pub default_budget: usize,
    pub raptor_token_cutoff: usize,
    pub raptor_min_documents: usize,
    pub hybrid_token_cutoff: usize,
    pub summary_group_limit: usize,
    pub aggressive_node_count: usize,
    pub aggressive_min_avg_relevance: f64,
    pub section_relevance_floor: f64,
    pub llm_timeout: Duration,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            default_budget: 4_000,
            raptor_token_cutoff: 6_000,
            raptor_min_documents: 3,
            hybrid_token_cutoff: 3_000,
            summary_group_limit: 3,
            aggressive_node_count: 10,
            aggressive_min_avg_relevance: 0.5,
            section_relevance_floor: 0.6,
            llm_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub analyzer: AnalyzerOptions,
    pub embedding: EmbeddingOptions,
    pub search: SearchOptions,
    pub grading: GradingOptions,
    pub rerank_trigger: usize,
    pub compression: CompressionOptions,
    pub request_timeout: Duration,
    pub answer_max_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analyzer: AnalyzerOptions::default(),
            embedding: EmbeddingOptions::default(),
            search: SearchOptions::default(),
            grading: GradingOptions::default(),
            rerank_trigger: 20,
            compression: CompressionOptions::default(),
            request_timeout: Duration::from_secs(45),
            answer_max_tokens: 1_024,
        }
    }
}
