//! Error handling for the retrieval service

use thiserror::Error;

/// Result type alias for the retrieval service
pub type Result<T> = std::result::Result<T, RagError>;

/// Coarse error classification used for propagation policy and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Client input failed validation
    Validation,
    /// Startup configuration problem
    Config,
    /// Remote dependency failed in a retryable way
    UpstreamTransient,
    /// Remote dependency rejected the request; retrying will not help
    UpstreamTerminal,
    /// Circuit breaker rejected the call without attempting it
    CircuitOpen,
    /// Operation exceeded its deadline
    Timeout,
    /// Requested entity does not exist
    NotFound,
    /// Some but not all ingestion batches succeeded
    PartialFailure,
    /// Unexpected internal failure
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Config => "config",
            ErrorKind::UpstreamTransient => "upstream_transient",
            ErrorKind::UpstreamTerminal => "upstream_terminal",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PartialFailure => "partial_failure",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Main error type for the retrieval service
#[derive(Error, Debug)]
pub enum RagError {
    #[error("completion service error: {0}")]
    Llm(#[from] LlmError),

    #[error("search index error: {0}")]
    Index(#[from] IndexError),

    #[error("layout service error: {0}")]
    Layout(#[from] LayoutError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("circuit open for policy '{0}'")]
    CircuitOpen(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("partial failure: {failed} of {total} batches failed")]
    PartialFailure {
        total: usize,
        failed: usize,
        errors: Vec<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from the embedding/completion provider
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("timeout: operation took too long")]
    Timeout,
}

/// Errors from the full-text/vector index engine
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("upsert failed: {0}")]
    UpsertFailed(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Errors from the document layout extraction service
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("unsupported document: {0}")]
    UnsupportedDocument(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RagError {
    /// Check if the error is retryable by the resilience layer
    pub fn is_retryable(&self) -> bool {
        match self {
            RagError::Llm(e) => e.is_retryable(),
            RagError::Index(e) => e.is_retryable(),
            RagError::Layout(e) => e.is_retryable(),
            RagError::Timeout(_) => true,
            RagError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Retry-After hint supplied by the upstream, if any
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RagError::Llm(LlmError::RateLimited { retry_after_secs })
            | RagError::Index(IndexError::RateLimited { retry_after_secs }) => *retry_after_secs,
            _ => None,
        }
    }

    /// Classify the error for propagation policy and metrics
    pub fn kind(&self) -> ErrorKind {
        match self {
            RagError::Validation(_) => ErrorKind::Validation,
            RagError::Config(_) => ErrorKind::Config,
            RagError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            RagError::Timeout(_) => ErrorKind::Timeout,
            RagError::Llm(LlmError::Timeout) => ErrorKind::Timeout,
            RagError::NotFound(_) => ErrorKind::NotFound,
            RagError::Index(IndexError::IndexNotFound(_)) => ErrorKind::NotFound,
            RagError::PartialFailure { .. } => ErrorKind::PartialFailure,
            _ if self.is_retryable() => ErrorKind::UpstreamTransient,
            RagError::Llm(_) | RagError::Index(_) | RagError::Layout(_) | RagError::Http(_) => {
                ErrorKind::UpstreamTerminal
            }
            _ => ErrorKind::Internal,
        }
    }
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::ConnectionFailed(_)
                | LlmError::RateLimited { .. }
                | LlmError::ServerError { .. }
                | LlmError::Timeout
        )
    }
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IndexError::ConnectionFailed(_)
                | IndexError::RateLimited { .. }
                | IndexError::ServerError { .. }
        )
    }
}

impl LayoutError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LayoutError::ConnectionFailed(_) | LayoutError::ServerError { .. }
        )
    }
}

/// Map an HTTP status from a remote call into the matching error constructor.
///
/// 429 and 5xx are transient; every other non-success status is terminal.
pub fn classify_status<E>(
    status: u16,
    message: String,
    retry_after_secs: Option<u64>,
    rate_limited: impl FnOnce(Option<u64>) -> E,
    server: impl FnOnce(u16, String) -> E,
    rejected: impl FnOnce(u16, String) -> E,
) -> E {
    if status == 429 {
        rate_limited(retry_after_secs)
    } else if status >= 500 {
        server(status, message)
    } else {
        rejected(status, message)
    }
}
