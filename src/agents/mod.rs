//! Retrieval agents and their shared contract

pub mod pdf;
pub mod planner;
pub mod types;
pub mod vector;
pub mod web;

pub use pdf::PdfSearchAgent;
pub use planner::QueryPlannerAgent;
pub use types::{
    AgentType, QueryContext, QueryPlan, ResultSource, RetrievalAgent, SearchOptions,
    SearchPreferences, SearchResult,
};
pub use vector::VectorSearchAgent;
pub use web::{
    DisabledWebSearch, HttpWebSearch, TokenBucket, WebAgentConfig, WebPage, WebSearchAgent,
    WebSearchFacade,
};
