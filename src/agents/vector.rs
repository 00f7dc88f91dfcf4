//! Vector search agent: hybrid retrieval over the specification indices

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::agents::types::{
    AgentType, ResultSource, RetrievalAgent, SearchOptions, SearchResult,
};
use crate::error::{RagError, Result};
use crate::index::{IndexHit, SearchIndex, SearchQuery};
use crate::llm::CompletionService;
use crate::resilience::CorrelationId;

/// Ceiling on the widened candidate pool fetched for post-filtering
pub const TOP_K_CAP: usize = 100;

/// Hybrid lexical + dense retrieval agent
///
/// Pure with respect to the index: it never writes. Falls back to
/// lexical-only retrieval when the embedding call gives up.
pub struct VectorSearchAgent {
    index: Arc<dyn SearchIndex>,
    completion: Arc<dyn CompletionService>,
    index_name: String,
    enable_hybrid: bool,
}

impl VectorSearchAgent {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        completion: Arc<dyn CompletionService>,
        index_name: String,
        enable_hybrid: bool,
    ) -> Self {
        Self {
            index,
            completion,
            index_name,
            enable_hybrid,
        }
    }

    fn result_from_hit(&self, hit: IndexHit, query: &str, options: &SearchOptions) -> SearchResult {
        let mut metadata = std::collections::HashMap::new();
        if options.include_metadata {
            for (key, value) in &hit.metadata {
                if let Some(text) = value.as_str() {
                    metadata.insert(key.clone(), text.to_string());
                }
            }
            // Surface the quantised vector archive so the rerank stage can
            // reuse it instead of re-embedding the content
            if let Some(archive) = hit
                .metadata
                .get("additional_properties")
                .and_then(|v| v.as_str())
                .and_then(|bag| serde_json::from_str::<serde_json::Value>(bag).ok())
                .and_then(|bag| bag.get("vector_archive")?.as_str().map(String::from))
            {
                metadata.insert("vector_archive".to_string(), archive);
            }
            if let Some(section) = &hit.section {
                metadata.insert("section".to_string(), section.clone());
            }
            metadata.insert("searchQuery".to_string(), query.to_string());
            metadata.insert("searchTimestamp".to_string(), Utc::now().to_rfc3339());
            metadata.insert("agentType".to_string(), self.agent_type().to_string());
        }

        SearchResult {
            id: format!("{}-{}", self.index_name, hit.id),
            content: hit.content,
            relevance_score: hit.score.clamp(0.0, 1.0),
            source: ResultSource {
                agent_type: self.agent_type(),
                source_name: hit.source_file.unwrap_or_else(|| self.index_name.clone()),
                document_id: Some(hit.id),
                url: None,
                page: hit.page_number,
            },
            metadata,
        }
    }
}

#[async_trait]
impl RetrievalAgent for VectorSearchAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::VectorSearch
    }

    async fn search(
        &self,
        correlation: &CorrelationId,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        options.validate()?;

        let top_k = (options.max_results * 3).min(TOP_K_CAP);

        let work = async {
            // Embedding failure degrades to lexical-only with the same pool
            let vector = if self.enable_hybrid {
                match self.completion.embed(correlation, query).await {
                    Ok(vector) => Some(vector),
                    Err(e) => {
                        warn!(
                            correlation = %correlation,
                            "query embedding gave up, lexical-only retrieval: {}",
                            e
                        );
                        None
                    }
                }
            } else {
                None
            };

            let search_query = SearchQuery {
                text: query.to_string(),
                vector,
                top: top_k,
                filters: options.filters.clone(),
            };

            self.index
                .query(correlation, &self.index_name, &search_query)
                .await
        };

        let hits = tokio::time::timeout(options.timeout(), work)
            .await
            .map_err(|_| RagError::Timeout(format!("{} agent timed out", self.agent_type())))??;

        let mut results: Vec<SearchResult> = hits
            .into_iter()
            .map(|hit| self.result_from_hit(hit, query, options))
            .filter(|r| r.relevance_score >= options.min_relevance_score)
            .collect();
        results.truncate(options.max_results);

        debug!(
            correlation = %correlation,
            agent = %self.agent_type(),
            results = results.len(),
            "search completed"
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::index::MockSearchIndex;
    use crate::llm::MockCompletionService;
    use std::collections::HashMap;

    fn hit(id: &str, score: f32) -> IndexHit {
        IndexHit {
            id: id.to_string(),
            title: Some(format!("Title {}", id)),
            content: format!("content {}", id),
            score,
            section: None,
            page_number: None,
            source_file: Some("specs.csv".to_string()),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_blank_query_makes_no_remote_calls() {
        // Mocks with no expectations panic when invoked
        let agent = VectorSearchAgent::new(
            Arc::new(MockSearchIndex::new()),
            Arc::new(MockCompletionService::new()),
            "moto-specs".to_string(),
            true,
        );
        let correlation = CorrelationId::new();

        let results = agent
            .search(&correlation, "   ", &SearchOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_hybrid_query_carries_vector() {
        let mut completion = MockCompletionService::new();
        completion
            .expect_embed()
            .returning(|_, _| Ok(vec![0.1, 0.2, 0.3]));

        let mut index = MockSearchIndex::new();
        index.expect_query().returning(|_, _, query| {
            assert!(query.vector.is_some(), "hybrid query must carry the vector");
            assert_eq!(query.top, 30);
            Ok(vec![hit("a", 0.9)])
        });

        let agent = VectorSearchAgent::new(
            Arc::new(index),
            Arc::new(completion),
            "moto-specs".to_string(),
            true,
        );
        let correlation = CorrelationId::new();

        let results = agent
            .search(&correlation, "honda cbr", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source.document_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_lexical() {
        let mut completion = MockCompletionService::new();
        completion.expect_embed().returning(|_, _| {
            Err(RagError::Llm(LlmError::ConnectionFailed(
                "refused".to_string(),
            )))
        });

        let mut index = MockSearchIndex::new();
        index.expect_query().returning(|_, _, query| {
            assert!(query.vector.is_none(), "fallback must be lexical-only");
            Ok(vec![hit("a", 0.8)])
        });

        let agent = VectorSearchAgent::new(
            Arc::new(index),
            Arc::new(completion),
            "moto-specs".to_string(),
            true,
        );
        let correlation = CorrelationId::new();

        let results = agent
            .search(&correlation, "honda cbr", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_score_filter_and_truncation() {
        let mut completion = MockCompletionService::new();
        completion
            .expect_embed()
            .returning(|_, _| Ok(vec![0.1, 0.2]));

        let mut index = MockSearchIndex::new();
        index.expect_query().returning(|_, _, _| {
            Ok(vec![
                hit("a", 0.95),
                hit("b", 0.85),
                hit("c", 0.75),
                hit("d", 0.30),
            ])
        });

        let agent = VectorSearchAgent::new(
            Arc::new(index),
            Arc::new(completion),
            "moto-specs".to_string(),
            true,
        );
        let correlation = CorrelationId::new();

        let options = SearchOptions {
            max_results: 2,
            min_relevance_score: 0.5,
            ..Default::default()
        };

        let results = agent
            .search(&correlation, "honda", &options)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.relevance_score >= 0.5));
    }

    #[tokio::test]
    async fn test_metadata_enrichment() {
        let mut completion = MockCompletionService::new();
        completion
            .expect_embed()
            .returning(|_, _| Ok(vec![0.1, 0.2]));

        let mut index = MockSearchIndex::new();
        index
            .expect_query()
            .returning(|_, _, _| Ok(vec![hit("a", 0.9)]));

        let agent = VectorSearchAgent::new(
            Arc::new(index),
            Arc::new(completion),
            "moto-specs".to_string(),
            true,
        );
        let correlation = CorrelationId::new();

        let results = agent
            .search(&correlation, "honda cbr", &SearchOptions::default())
            .await
            .unwrap();

        let metadata = &results[0].metadata;
        assert_eq!(metadata.get("searchQuery").unwrap(), "honda cbr");
        assert_eq!(metadata.get("agentType").unwrap(), "vector-search");
        assert!(metadata.contains_key("searchTimestamp"));
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let agent = VectorSearchAgent::new(
            Arc::new(MockSearchIndex::new()),
            Arc::new(MockCompletionService::new()),
            "moto-specs".to_string(),
            true,
        );
        let correlation = CorrelationId::new();

        let options = SearchOptions {
            max_results: 500,
            ..Default::default()
        };
        let result = agent.search(&correlation, "honda", &options).await;
        assert!(matches!(result, Err(RagError::Validation(_))));
    }
}
