use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tokenizer unavailable: {0}")]
    Tokenizer(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding provider failed: {0}")]
    Embedding(String),

    #[error("index rejected chunks: {0}")]
    Index(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    Validation(String),

    #[error("{stage} call timed out")]
    ProviderTimeout { stage: &'static str },

    #[error("{stage} call failed: {details}")]
    Provider {
        stage: &'static str,
        details: String,
    },

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("requested page {requested} exceeds document page count {page_count}")]
    PageOutOfRange { requested: u32, page_count: u32 },

    #[error("no relevant content found")]
    NoRelevantContent,

    #[error("no indexed documents in dataroom")]
    NoIndexedDocuments,

    #[error("viewer has no permitted documents")]
    NoPermittedDocuments,

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,
}

impl QueryError {
    // The bounded set of answers a viewer may see instead of an internal error.
    pub fn user_facing_message(&self) -> Option<&'static str> {
        match self {
            QueryError::PageOutOfRange { .. } => Some(
                "The page you asked about is beyond the end of the documents in this dataroom. \
                 Please check the page number and try again.",
            ),
            QueryError::NoIndexedDocuments => Some(
                "No documents in this dataroom have been indexed yet, so there is nothing to \
                 search. Please try again once indexing has finished.",
            ),
            QueryError::NoPermittedDocuments => Some(
                "You do not have access to any documents in this dataroom, so the question \
                 cannot be answered.",
            ),
            QueryError::NoRelevantContent => Some(
                "I could not find an answer to that question in the available documents.",
            ),
            QueryError::Timeout => Some(
                "The request took too long to complete. Please try again, or ask a narrower \
                 question.",
            ),
            QueryError::Cancelled => Some("The request was cancelled."),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
