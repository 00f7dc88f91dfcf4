//! PDF search agent: structure-aware retrieval from the manual index

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::agents::types::{
    AgentType, ResultSource, RetrievalAgent, SearchOptions, SearchResult,
};
use crate::error::{RagError, Result};
use crate::index::{SearchIndex, SearchQuery};
use crate::llm::CompletionService;
use crate::resilience::CorrelationId;

use super::vector::TOP_K_CAP;

/// Score boost applied when a result's section matches a query phrase
const SECTION_BOOST: f32 = 0.05;

/// Structure-aware retrieval agent over the PDF manual index
///
/// Results keep their section and page so answers can cite the exact spot
/// in a manual. Results whose section heading matches a noun phrase from
/// the query get a small boost.
pub struct PdfSearchAgent {
    index: Arc<dyn SearchIndex>,
    completion: Arc<dyn CompletionService>,
    index_name: String,
    enable_hybrid: bool,
    phrase_pattern: Regex,
}

impl PdfSearchAgent {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        completion: Arc<dyn CompletionService>,
        index_name: String,
        enable_hybrid: bool,
    ) -> Self {
        // Capitalised runs and standalone long words approximate the noun
        // phrases of a query without a full parser
        let phrase_pattern =
            Regex::new(r"[A-Z][a-zA-Z0-9]+(?:\s+[A-Z][a-zA-Z0-9]+)*|\b[a-z]{4,}\b")
                .expect("phrase pattern is valid");
        Self {
            index,
            completion,
            index_name,
            enable_hybrid,
            phrase_pattern,
        }
    }

    fn query_phrases(&self, query: &str) -> Vec<String> {
        self.phrase_pattern
            .find_iter(query)
            .map(|m| m.as_str().to_lowercase())
            .collect()
    }

    fn section_matches(section: &str, phrases: &[String]) -> bool {
        let section = section.to_lowercase();
        phrases.iter().any(|phrase| section.contains(phrase))
    }
}

#[async_trait]
impl RetrievalAgent for PdfSearchAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::PdfSearch
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
        let phrases = self.query_phrases(query);

        let work = async {
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
            .map(|hit| {
                let mut score = hit.score.clamp(0.0, 1.0);
                if let Some(section) = &hit.section {
                    if Self::section_matches(section, &phrases) {
                        score = (score + SECTION_BOOST).min(1.0);
                    }
                }

                let mut metadata = std::collections::HashMap::new();
                if options.include_metadata {
                    if let Some(section) = &hit.section {
                        metadata.insert("section".to_string(), section.clone());
                    }
                    if let Some(chunk_type) =
                        hit.metadata.get("chunk_type").and_then(|v| v.as_str())
                    {
                        metadata.insert("chunkType".to_string(), chunk_type.to_string());
                    }
                    metadata.insert("searchQuery".to_string(), query.to_string());
                    metadata.insert("searchTimestamp".to_string(), Utc::now().to_rfc3339());
                    metadata.insert("agentType".to_string(), self.agent_type().to_string());
                }

                SearchResult {
                    id: format!("{}-{}", self.index_name, hit.id),
                    content: hit.content,
                    relevance_score: score,
                    source: ResultSource {
                        agent_type: self.agent_type(),
                        source_name: hit.source_file.unwrap_or_else(|| self.index_name.clone()),
                        document_id: Some(hit.id),
                        url: None,
                        page: hit.page_number,
                    },
                    metadata,
                }
            })
            .filter(|r| r.relevance_score >= options.min_relevance_score)
            .collect();

        results.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
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
    use crate::index::{IndexHit, MockSearchIndex};
    use crate::llm::MockCompletionService;
    use std::collections::HashMap;

    fn hit(id: &str, score: f32, section: Option<&str>, page: u32) -> IndexHit {
        IndexHit {
            id: id.to_string(),
            title: None,
            content: format!("content {}", id),
            score,
            section: section.map(|s| s.to_string()),
            page_number: Some(page),
            source_file: Some("owners_manual.pdf".to_string()),
            metadata: HashMap::new(),
        }
    }

    fn agent(index: MockSearchIndex) -> PdfSearchAgent {
        let mut completion = MockCompletionService::new();
        completion
            .expect_embed()
            .returning(|_, _| Ok(vec![0.1, 0.2]));
        PdfSearchAgent::new(
            Arc::new(index),
            Arc::new(completion),
            "moto-manuals".to_string(),
            true,
        )
    }

    #[tokio::test]
    async fn test_section_and_page_preserved() {
        let mut index = MockSearchIndex::new();
        index
            .expect_query()
            .returning(|_, _, _| Ok(vec![hit("m1", 0.8, Some("Engine Maintenance"), 42)]));

        let agent = agent(index);
        let correlation = CorrelationId::new();

        let results = agent
            .search(&correlation, "oil change interval", &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(results[0].source.page, Some(42));
        assert_eq!(
            results[0].metadata.get("section").unwrap(),
            "Engine Maintenance"
        );
    }

    #[tokio::test]
    async fn test_section_match_boosts_score() {
        let mut index = MockSearchIndex::new();
        index.expect_query().returning(|_, _, _| {
            Ok(vec![
                hit("plain", 0.80, Some("Appendix"), 7),
                hit("boosted", 0.80, Some("Brake System"), 3),
            ])
        });

        let agent = agent(index);
        let correlation = CorrelationId::new();

        let results = agent
            .search(&correlation, "brake pad replacement", &SearchOptions::default())
            .await
            .unwrap();

        let boosted = results.iter().find(|r| r.id.ends_with("boosted")).unwrap();
        let plain = results.iter().find(|r| r.id.ends_with("plain")).unwrap();
        assert!(boosted.relevance_score > plain.relevance_score);
        assert_eq!(results[0].id, boosted.id, "boosted result ranks first");
    }

    #[tokio::test]
    async fn test_boost_clamped_to_one() {
        let mut index = MockSearchIndex::new();
        index
            .expect_query()
            .returning(|_, _, _| Ok(vec![hit("m1", 0.99, Some("Brake System"), 1)]));

        let agent = agent(index);
        let correlation = CorrelationId::new();

        let results = agent
            .search(&correlation, "brake bleeding", &SearchOptions::default())
            .await
            .unwrap();
        assert!(results[0].relevance_score <= 1.0);
    }

    #[test]
    fn test_query_phrase_extraction() {
        let index = MockSearchIndex::new();
        let completion = MockCompletionService::new();
        let agent = PdfSearchAgent::new(
            Arc::new(index),
            Arc::new(completion),
            "moto-manuals".to_string(),
            true,
        );

        let phrases = agent.query_phrases("how to adjust the Chain Tension on a CBR");
        assert!(phrases.contains(&"chain tension".to_string()));
        assert!(phrases.contains(&"adjust".to_string()));
        // Short function words are not phrases
        assert!(!phrases.contains(&"to".to_string()));
    }
}
