//! Web search agent: external-source augmentation

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::agents::types::{
    AgentType, ResultSource, RetrievalAgent, SearchOptions, SearchResult,
};
use crate::config::HttpClientConfig;
use crate::error::{RagError, Result};
use crate::resilience::{policy, CorrelationId, ResilienceService};

/// A page returned by the external search provider
#[derive(Debug, Clone, Deserialize)]
pub struct WebPage {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub content: String,
}

/// Capability interface for the external web search provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebSearchFacade: Send + Sync {
    async fn fetch(
        &self,
        correlation: &CorrelationId,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<WebPage>>;
}

/// Token bucket limiting outbound web queries
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: usize, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("bucket lock poisoned");

        let elapsed = state.last_refill.elapsed();
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Configuration for the web search agent
#[derive(Debug, Clone)]
pub struct WebAgentConfig {
    /// Rate limiter capacity (burst)
    pub rate_capacity: usize,

    /// Rate limiter refill, tokens per second
    pub rate_refill_per_sec: f64,

    /// Domains results must come from; empty allows all
    pub allowed_domains: Vec<String>,

    /// Domains always dropped
    pub blocked_domains: Vec<String>,

    /// Page text is trimmed to this many characters
    pub content_budget: usize,
}

impl Default for WebAgentConfig {
    fn default() -> Self {
        Self {
            rate_capacity: 10,
            rate_refill_per_sec: 0.5,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            content_budget: 8192,
        }
    }
}

/// External-source retrieval agent
pub struct WebSearchAgent {
    facade: Arc<dyn WebSearchFacade>,
    config: WebAgentConfig,
    bucket: TokenBucket,
}

impl WebSearchAgent {
    pub fn new(facade: Arc<dyn WebSearchFacade>, config: WebAgentConfig) -> Self {
        let bucket = TokenBucket::new(config.rate_capacity, config.rate_refill_per_sec);
        Self {
            facade,
            config,
            bucket,
        }
    }

    fn domain_of(url: &str) -> Option<&str> {
        let rest = url.split("://").nth(1).unwrap_or(url);
        rest.split('/').next().map(|host| host.trim_start_matches("www."))
    }

    fn domain_allowed(&self, url: &str) -> bool {
        let Some(domain) = Self::domain_of(url) else {
            return false;
        };

        if self
            .config
            .blocked_domains
            .iter()
            .any(|blocked| domain.ends_with(blocked.as_str()))
        {
            return false;
        }

        self.config.allowed_domains.is_empty()
            || self
                .config
                .allowed_domains
                .iter()
                .any(|allowed| domain.ends_with(allowed.as_str()))
    }
}

#[async_trait]
impl RetrievalAgent for WebSearchAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::WebSearch
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

        if !self.bucket.try_acquire() {
            warn!(correlation = %correlation, "web search rate limit reached");
            return Ok(Vec::new());
        }

        let pages = tokio::time::timeout(
            options.timeout(),
            self.facade.fetch(correlation, query, options.max_results * 2),
        )
        .await
        .map_err(|_| RagError::Timeout("web search timed out".to_string()))??;

        let mut results = Vec::new();
        for (rank, page) in pages.into_iter().enumerate() {
            if !self.domain_allowed(&page.url) {
                debug!(correlation = %correlation, url = %page.url, "dropped by authority filter");
                continue;
            }

            let mut content = if page.content.is_empty() {
                page.snippet.clone()
            } else {
                page.content.clone()
            };
            if content.len() > self.config.content_budget {
                let mut cut = self.config.content_budget;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
            }

            // The provider returns pages by rank without scores; decay the
            // rank into the [0, 1] relevance band
            let score = 0.9 * 0.92f32.powi(rank as i32);
            if score < options.min_relevance_score {
                continue;
            }

            let domain = Self::domain_of(&page.url).unwrap_or("web").to_string();
            let mut metadata = std::collections::HashMap::new();
            if options.include_metadata {
                metadata.insert("title".to_string(), page.title.clone());
                metadata.insert("searchQuery".to_string(), query.to_string());
                metadata.insert("searchTimestamp".to_string(), Utc::now().to_rfc3339());
                metadata.insert("agentType".to_string(), self.agent_type().to_string());
            }

            results.push(SearchResult {
                id: format!("web-{}", rank),
                content,
                relevance_score: score,
                source: ResultSource {
                    agent_type: self.agent_type(),
                    source_name: domain,
                    document_id: None,
                    url: Some(page.url),
                    page: None,
                },
                metadata,
            });
        }

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

/// Facade over a JSON web search endpoint
///
/// Queries go through the `websearch.fetch` policy. The endpoint is expected
/// to answer `GET ?q=...&count=N` with a JSON array of pages.
pub struct HttpWebSearch {
    client: reqwest::Client,
    endpoint: String,
    resilience: Arc<ResilienceService>,
}

impl HttpWebSearch {
    pub fn new(
        endpoint: String,
        http: &HttpClientConfig,
        resilience: Arc<ResilienceService>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(http.connect_timeout_s))
            .timeout(Duration::from_secs(http.request_timeout_s))
            .build()
            .map_err(|e| RagError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            resilience,
        })
    }
}

#[async_trait]
impl WebSearchFacade for HttpWebSearch {
    async fn fetch(
        &self,
        correlation: &CorrelationId,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<WebPage>> {
        let policy = self.resilience.policy(policy::WEBSEARCH_FETCH);
        policy
            .execute(correlation, || async {
                let response = self
                    .client
                    .get(&self.endpoint)
                    .query(&[("q", query), ("count", &max_results.to_string())])
                    .send()
                    .await?;
                let pages: Vec<WebPage> = response.error_for_status()?.json().await?;
                Ok(pages)
            })
            .await
    }
}

/// Stand-in used when no web provider is configured; always returns
/// nothing so orchestration degrades cleanly
pub struct DisabledWebSearch;

#[async_trait]
impl WebSearchFacade for DisabledWebSearch {
    async fn fetch(&self, _: &CorrelationId, _: &str, _: usize) -> Result<Vec<WebPage>> {
        Ok(Vec::new())
    }
}
