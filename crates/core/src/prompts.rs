use crate::error::QueryError;
use crate::models::{
    ComplexityLevel, ContextSize, ExpansionPreference, ProcessingStyle, QueryIntent, QueryType,
};
use crate::traits::{StructuredRequest, StructuredResponse};
use serde::de::DeserializeOwned;
use serde::Deserialize;

// Each prompt is statically paired with the payload type its response must
// decode into, so a stage can never read another stage's schema.
pub trait PromptSpec {
    type Payload: DeserializeOwned;

    const STAGE: &'static str;

    fn system() -> &'static str;

    fn max_tokens() -> u32 {
        700
    }

    fn temperature() -> f32 {
        0.0
    }
}

pub fn request<P: PromptSpec>(prompt: String) -> StructuredRequest {
    StructuredRequest {
        stage: P::STAGE,
        system: P::system().to_string(),
        prompt,
        max_tokens: P::max_tokens(),
        temperature: P::temperature(),
    }
}

pub fn decode<P: PromptSpec>(response: &StructuredResponse) -> Result<P::Payload, QueryError> {
    serde_json::from_value(response.value.clone()).map_err(|error| QueryError::Provider {
        stage: P::STAGE,
        details: format!("structurally invalid response: {error}"),
    })
}

pub struct QueryAnalysisPrompt;

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisPayload {
    pub query_type: QueryType,
    pub intent: QueryIntent,
    pub complexity_score: f64,
    #[serde(default)]
    pub pages: Vec<u32>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default)]
    pub hyde_answer: Option<String>,
    #[serde(default)]
    pub requires_hyde: bool,
    pub desired_context: ContextSize,
    pub processing: ProcessingStyle,
    pub expansion: ExpansionPreference,
    #[serde(default)]
    pub context_window_hint: usize,
}

impl PromptSpec for QueryAnalysisPrompt {
    type Payload = AnalysisPayload;

    const STAGE: &'static str = "query analysis";

    fn system() -> &'static str {
        "You analyze a viewer's question about a set of business documents. \
         Respond with a single JSON object: \
         {\"query_type\": \"question|instruction|conversational|keyword\", \
         \"intent\": \"extraction|summarization|analysis|comparison|conversational\", \
         \"complexity_score\": 0.0-1.0, \
         \"pages\": [explicitly mentioned page numbers], \
         \"keywords\": [salient search terms], \
         \"variants\": [2-6 rewritten search queries preserving meaning], \
         \"hyde_answer\": \"a short hypothetical answer, or null\", \
         \"requires_hyde\": bool (true when the question is abstract enough that a \
         hypothetical answer would retrieve better than the question itself), \
         \"desired_context\": \"small|medium|large\", \
         \"processing\": \"focused|balanced|thorough\", \
         \"expansion\": \"narrow|moderate|broad\", \
         \"context_window_hint\": estimated tokens of context needed}. \
         Output only the JSON object."
    }
}

pub struct RelevanceGradingPrompt;

#[derive(Debug, Clone, Deserialize)]
pub struct GradeVerdict {
    pub chunk_id: String,
    pub relevance_score: f64,
    pub confidence: f64,
    pub is_relevant: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GradingPayload {
    pub grades: Vec<GradeVerdict>,
}

impl PromptSpec for RelevanceGradingPrompt {
    type Payload = GradingPayload;

    const STAGE: &'static str = "relevance grading";

    fn system() -> &'static str {
        "You judge whether document excerpts can help answer a question. \
         For every excerpt given, respond inside a single JSON object \
         {\"grades\": [{\"chunk_id\": string, \"relevance_score\": 0.0-1.0, \
         \"confidence\": 0.0-1.0, \"is_relevant\": bool}]}. \
         An excerpt is relevant only if it contains information that directly \
         helps answer the question. Output only the JSON object."
    }
}

pub struct DocumentSummaryPrompt;

#[derive(Debug, Clone, Deserialize)]
pub struct SummaryPayload {
    pub summary: String,
}

impl PromptSpec for DocumentSummaryPrompt {
    type Payload = SummaryPayload;

    const STAGE: &'static str = "document summary";

    fn system() -> &'static str {
        "You summarize excerpts that all come from one document, with respect to \
         a question. Keep every fact that could bear on the question; drop \
         boilerplate. Respond with a single JSON object {\"summary\": string}. \
         Output only the JSON object."
    }

    fn max_tokens() -> u32 {
        500
    }
}

pub struct TreeBuildPrompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    Preserve,
    Compress,
    Remove,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeNodePayload {
    pub id: String,
    pub heading: String,
    pub relevance: f64,
    pub action: NodeAction,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreePayload {
    pub topic: String,
    pub nodes: Vec<TreeNodePayload>,
}

impl PromptSpec for TreeBuildPrompt {
    type Payload = TreePayload;

    const STAGE: &'static str = "tree build";

    fn system() -> &'static str {
        "You organize document summaries into a hierarchy relative to a question. \
         Respond with a single JSON object {\"topic\": short heading for the whole \
         answer, \"nodes\": [{\"id\": string, \"heading\": string, \
         \"relevance\": 0.0-1.0 relative to the question, \
         \"action\": \"preserve|compress|remove\", \"text\": the content}]}. \
         Tag verbatim-critical content preserve, background compress, and \
         off-topic material remove. Output only the JSON object."
    }

    fn max_tokens() -> u32 {
        1_200
    }
}

pub struct TreeCompressionPrompt;

#[derive(Debug, Clone, Deserialize)]
pub struct CompressedNodePayload {
    pub text: String,
}

impl PromptSpec for TreeCompressionPrompt {
    type Payload = CompressedNodePayload;

    const STAGE: &'static str = "tree compression";

    fn system() -> &'static str {
        "You compress a passage while keeping everything that bears on a question. \
         Respond with a single JSON object {\"text\": the compressed passage}. \
         Output only the JSON object."
    }

    fn max_tokens() -> u32 {
        400
    }
}

pub struct HierarchicalSummaryPrompt;

#[derive(Debug, Clone, Deserialize)]
pub struct HierarchicalSummaryPayload {
    pub summary: String,
    #[serde(default)]
    pub key_insights: Vec<String>,
}

impl PromptSpec for HierarchicalSummaryPrompt {
    type Payload = HierarchicalSummaryPayload;

    const STAGE: &'static str = "hierarchical summary";

    fn system() -> &'static str {
        "You write a cross-document summary from hierarchical sections, oriented \
         to a question. Respond with a single JSON object {\"summary\": string, \
         \"key_insights\": [at most five short bullet statements]}. \
         Output only the JSON object."
    }

    fn max_tokens() -> u32 {
        600
    }
}

// Derived, never model-reported: levels cut at fixed scores so the selector
// sees stable buckets.
pub fn complexity_level(score: f64) -> ComplexityLevel {
    if score < 0.34 {
        ComplexityLevel::Low
    } else if score < 0.67 {
        ComplexityLevel::Medium
    } else {
        ComplexityLevel::High
    }
}
