//! Motorcycle RAG Library
//!
//! Retrieval-augmented question answering over a heterogeneous motorcycle
//! corpus. The crate integrates:
//! - An ingestion pipeline turning CSV specification tables and PDF manuals
//!   into embedded, chunked, indexed documents
//! - A multi-agent retrieval orchestrator that plans queries, fuses and
//!   reranks agent results, and synthesises cited answers
//! - A resilience layer (circuit breakers, retries, fallbacks) guarding
//!   every remote call, plus a query result cache
//!
//! # Example
//!
//! ```rust,no_run
//! use moto_rag::config::AppConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::from_file("config.toml")?;
//!     config.validate()?;
//!     // Wire the clients and orchestrator, then serve or ingest.
//!     Ok(())
//! }
//! ```

pub mod agents;
pub mod api;
pub mod cache;
pub mod compression;
pub mod config;
pub mod document;
pub mod error;
pub mod index;
pub mod ingestion;
pub mod layout;
pub mod llm;
pub mod orchestrator;
pub mod resilience;

// Re-export main types
pub use agents::{
    AgentType, PdfSearchAgent, QueryContext, QueryPlan, QueryPlannerAgent, ResultSource,
    RetrievalAgent, SearchOptions, SearchPreferences, SearchResult, VectorSearchAgent,
    WebSearchAgent,
};
pub use cache::{QueryCache, QueryCacheStats};
pub use compression::CompressedVector;
pub use config::AppConfig;
pub use document::{
    ChunkType, DocumentType, MotorcycleDocument, ProcessedData, ProcessingResult,
};
pub use error::{ErrorKind, RagError, Result};
pub use index::{AzureSearchClient, IndexHit, IndexSchema, IndexStats, SearchIndex, SearchQuery};
pub use ingestion::{CsvProcessor, IndexingService, PdfProcessor};
pub use layout::{DocumentIntelligenceClient, DocumentLayout, LayoutAnalyzer, LocalPdfExtractor};
pub use llm::{AzureOpenAiClient, CompletionService, Message, Role};
pub use orchestrator::{AgentOrchestrator, OrchestratorConfig, QueryOutcome, RequestContext};
pub use resilience::{
    CircuitBreakerState, CorrelationId, RemoteCallGate, ResiliencePolicy, ResilienceService,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
