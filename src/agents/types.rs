//! Shared types for the retrieval agents

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

use crate::error::{RagError, Result};
use crate::resilience::CorrelationId;

/// Discriminating tag carried by every agent and result source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    VectorSearch,
    WebSearch,
    PdfSearch,
    QueryPlanner,
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentType::VectorSearch => write!(f, "vector-search"),
            AgentType::WebSearch => write!(f, "web-search"),
            AgentType::PdfSearch => write!(f, "pdf-search"),
            AgentType::QueryPlanner => write!(f, "query-planner"),
        }
    }
}

/// Where a search result came from
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResultSource {
    pub agent_type: AgentType,
    pub source_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

/// A retrieved snippet
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    /// Relevance in [0, 1]
    pub relevance_score: f32,
    pub source: ResultSource,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SearchResult {
    /// Key used for deduplication across agents
    pub fn dedup_key(&self) -> &str {
        self.source.document_id.as_deref().unwrap_or(&self.id)
    }
}

/// Options bounding one agent invocation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SearchOptions {
    /// Maximum results to return, in [1, 100]
    pub max_results: usize,

    /// Minimum relevance score, in [0, 1]
    pub min_relevance_score: f32,

    /// Include agent metadata on each result
    pub include_metadata: bool,

    /// Field equality filters applied at the index
    #[serde(default)]
    pub filters: HashMap<String, String>,

    /// Per-agent-call timeout in seconds
    pub timeout_s: u64,

    /// Consult and populate the query cache
    pub enable_caching: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: 10,
            min_relevance_score: 0.0,
            include_metadata: true,
            filters: HashMap::new(),
            timeout_s: 30,
            enable_caching: true,
        }
    }
}

impl SearchOptions {
    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.max_results) {
            return Err(RagError::Validation(format!(
                "max_results must be in [1, 100], got {}",
                self.max_results
            )));
        }
        if !(0.0..=1.0).contains(&self.min_relevance_score) {
            return Err(RagError::Validation(format!(
                "min_relevance_score must be in [0, 1], got {}",
                self.min_relevance_score
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_s)
    }
}

/// User preferences attached to a query
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SearchPreferences {
    /// Augment answers with external web sources
    #[serde(default)]
    pub include_web: bool,

    /// Search the PDF manual index
    #[serde(default = "default_include_pdf")]
    pub include_pdf: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_relevance_score: Option<f32>,
}

fn default_include_pdf() -> bool {
    true
}

impl Default for SearchPreferences {
    fn default() -> Self {
        Self {
            include_web: false,
            include_pdf: true,
            max_results: None,
            min_relevance_score: None,
        }
    }
}

/// Conversation context attached to a query
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct QueryContext {
    #[serde(default)]
    pub previous_queries: Vec<String>,

    #[serde(default)]
    pub additional: HashMap<String, String>,
}

/// The planner's decomposition of a user query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub original_query: String,

    /// Non-empty; the union of sub-queries covers the original intent
    pub sub_queries: Vec<String>,

    pub use_web_search: bool,
    pub run_parallel: bool,
}

impl QueryPlan {
    /// The plan used when planning is unavailable: the query stands alone
    pub fn trivial(query: &str, use_web_search: bool) -> Self {
        Self {
            original_query: query.to_string(),
            sub_queries: vec![query.to_string()],
            use_web_search,
            run_parallel: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sub_queries.is_empty() {
            return Err(RagError::Validation(
                "plan must contain at least one sub-query".to_string(),
            ));
        }
        if self.sub_queries.len() > 6 {
            return Err(RagError::Validation(format!(
                "plan contains {} sub-queries, maximum is 6",
                self.sub_queries.len()
            )));
        }
        Ok(())
    }
}

/// Uniform contract every retrieval agent implements
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RetrievalAgent: Send + Sync {
    /// Discriminating type tag
    fn agent_type(&self) -> AgentType;

    /// Run one retrieval. Implementations are pure with respect to their
    /// backing store and return results in backend ranking order.
    async fn search(
        &self,
        correlation: &CorrelationId,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>>;
}
