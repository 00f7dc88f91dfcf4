//! Agent orchestrator: plans a query, runs the retrieval agents, fuses and
//! reranks their results, and synthesises a cited answer

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::agents::planner::QueryPlannerAgent;
use crate::agents::types::{
    QueryContext, QueryPlan, RetrievalAgent, SearchOptions, SearchPreferences, SearchResult,
};
use crate::cache::QueryCache;
use crate::compression::CompressedVector;
use crate::config::{SearchConfig, ServerConfig};
use crate::error::{RagError, Result};
use crate::llm::{cosine_similarity, system_message, user_message, CompletionService};
use crate::resilience::{CorrelationId, RemoteCallGate};

/// Snippets included in the synthesis prompt
const SYNTHESIS_TOP_N: usize = 10;

/// Candidate content is trimmed to this length before rerank embedding
const RERANK_CONTENT_BUDGET: usize = 1024;

/// Snippet content is trimmed to this length in the synthesis prompt
const SNIPPET_BUDGET: usize = 1500;

const SYNTHESIS_SYSTEM_PROMPT: &str = "\
You answer motorcycle questions from the numbered source snippets provided. \
Cite the snippet ids you used in square brackets, like [moto-specs-1]. Use \
only information present in the snippets. If the snippets do not contain \
enough evidence to answer, say so plainly instead of guessing.";

/// Orchestrator lifecycle for one query
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryState {
    Planning,
    Retrieving,
    Fusing,
    Synthesising,
    Done,
    Failed,
}

/// Per-query execution metrics
#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct QueryMetrics {
    pub sub_queries: usize,
    pub agents_invoked: Vec<String>,
    pub agent_failures: usize,
    pub cache_hits: usize,
    pub results_before_fusion: usize,
    pub results_after_fusion: usize,
    pub reranked: bool,
    /// Some agents failed or synthesis fell back; the answer is best-effort
    pub degraded: bool,
    pub duration_ms: u64,
}

/// The orchestrator's final product for one query
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub answer: String,
    pub results: Vec<SearchResult>,
    pub metrics: QueryMetrics,
}

/// Request-scoped input to the orchestrator
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub session_id: Option<String>,
    pub preferences: SearchPreferences,
    pub query_context: QueryContext,
    pub additional: HashMap<String, String>,
}

/// Orchestrator tuning derived from configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub default_max_results: usize,
    pub enable_semantic_ranking: bool,
    pub rerank_agent_weight: f32,
    pub rerank_semantic_weight: f32,
    pub request_deadline: Duration,
    /// Concurrent agent invocations per request in parallel mode
    pub fanout_limit: usize,
}

impl OrchestratorConfig {
    pub fn from_config(search: &SearchConfig, server: &ServerConfig) -> Self {
        Self {
            default_max_results: search.max_search_results,
            enable_semantic_ranking: search.enable_semantic_ranking,
            rerank_agent_weight: search.rerank_agent_weight,
            rerank_semantic_weight: search.rerank_semantic_weight,
            request_deadline: Duration::from_secs(server.request_deadline_s),
            fanout_limit: 8,
        }
    }
}

/// Coordinates the retrieval agents for one query at a time
pub struct AgentOrchestrator {
    planner: Arc<QueryPlannerAgent>,
    vector_agent: Arc<dyn RetrievalAgent>,
    pdf_agent: Arc<dyn RetrievalAgent>,
    web_agent: Arc<dyn RetrievalAgent>,
    completion: Arc<dyn CompletionService>,
    cache: Arc<QueryCache>,
    /// Process-wide gate; each query derives a request-scoped layer from it
    gate: RemoteCallGate,
    config: OrchestratorConfig,
}

impl AgentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        planner: Arc<QueryPlannerAgent>,
        vector_agent: Arc<dyn RetrievalAgent>,
        pdf_agent: Arc<dyn RetrievalAgent>,
        web_agent: Arc<dyn RetrievalAgent>,
        completion: Arc<dyn CompletionService>,
        cache: Arc<QueryCache>,
        gate: RemoteCallGate,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            planner,
            vector_agent,
            pdf_agent,
            web_agent,
            completion,
            cache,
            gate,
            config,
        }
    }

    fn search_options(&self, preferences: &SearchPreferences) -> SearchOptions {
        let mut options = SearchOptions::default();
        options.max_results = preferences
            .max_results
            .unwrap_or(self.config.default_max_results)
            .clamp(1, 100);
        if let Some(min_score) = preferences.min_relevance_score {
            options.min_relevance_score = min_score.clamp(0.0, 1.0);
        }
        options
    }

    /// Agents participating in this query, in sequential priority order
    fn select_agents(
        &self,
        plan: &QueryPlan,
        preferences: &SearchPreferences,
    ) -> Vec<Arc<dyn RetrievalAgent>> {
        let mut agents: Vec<Arc<dyn RetrievalAgent>> = vec![self.vector_agent.clone()];
        if preferences.include_pdf {
            agents.push(self.pdf_agent.clone());
        }
        if plan.use_web_search && preferences.include_web {
            agents.push(self.web_agent.clone());
        }
        agents
    }

    /// Answer one query end to end
    pub async fn handle_query(
        &self,
        correlation: &CorrelationId,
        query: &str,
        request: &RequestContext,
    ) -> Result<QueryOutcome> {
        let started = Instant::now();
        let deadline = started + self.config.request_deadline;
        let mut state = QueryState::Planning;
        info!(
            correlation = %correlation,
            session = ?request.session_id,
            state = ?state,
            "query accepted"
        );

        let options = self.search_options(&request.preferences);
        let request_gate = self.gate.for_request(self.config.fanout_limit);

        // Planning. The planner degrades internally; only the deadline can
        // interrupt it here.
        let plan = match tokio::time::timeout(
            remaining(deadline),
            self.planner.plan(
                correlation,
                query,
                &request.query_context,
                &request.preferences,
            ),
        )
        .await
        {
            Ok(plan) => plan,
            Err(_) => QueryPlan::trivial(query, request.preferences.include_web),
        };

        let agents = self.select_agents(&plan, &request.preferences);
        let agents_invoked: Vec<String> = agents.iter().map(|a| a.agent_type().to_string()).collect();

        // Retrieving
        state = QueryState::Retrieving;
        debug!(correlation = %correlation, state = ?state, agents = agents.len(), "retrieval starts");
        let mut collected: Vec<SearchResult> = Vec::new();
        let mut agent_failures = 0usize;
        let mut cache_hits = 0usize;
        let mut attempted = 0usize;

        for sub_query in &plan.sub_queries {
            if Instant::now() >= deadline {
                warn!(correlation = %correlation, "deadline reached during retrieval");
                break;
            }

            if plan.run_parallel {
                let calls = agents.iter().map(|agent| {
                    let gate = request_gate.clone();
                    let agent = agent.clone();
                    let options = options.clone();
                    async move {
                        let _permit = gate.acquire().await;
                        self.cached_search(correlation, agent, sub_query, &options, deadline)
                            .await
                    }
                });

                for outcome in join_all(calls).await {
                    attempted += 1;
                    match outcome {
                        AgentOutcome::Results(results) => collected.extend(results),
                        AgentOutcome::CacheHit(results) => {
                            cache_hits += 1;
                            collected.extend(results);
                        }
                        AgentOutcome::Failed => agent_failures += 1,
                    }
                }
            } else {
                // Sequential priority order with short-circuit once enough
                // unique results have accumulated
                for agent in &agents {
                    if unique_count(&collected) >= options.max_results {
                        debug!(
                            correlation = %correlation,
                            "short-circuit: enough unique results"
                        );
                        break;
                    }
                    attempted += 1;
                    match self
                        .cached_search(correlation, agent.clone(), sub_query, &options, deadline)
                        .await
                    {
                        AgentOutcome::Results(results) => collected.extend(results),
                        AgentOutcome::CacheHit(results) => {
                            cache_hits += 1;
                            collected.extend(results);
                        }
                        AgentOutcome::Failed => agent_failures += 1,
                    }
                }
            }
        }

        let results_before_fusion = collected.len();
        if collected.is_empty() && attempted > 0 && agent_failures == attempted {
            state = QueryState::Failed;
            warn!(correlation = %correlation, state = ?state, "all agents failed with no cached results");
            return Err(RagError::Internal(format!(
                "all retrieval agents failed (correlation {})",
                correlation
            )));
        }

        // Fusing
        state = QueryState::Fusing;
        debug!(correlation = %correlation, state = ?state, candidates = results_before_fusion, "fusion starts");
        let mut fused = dedup_by_best_score(collected);
        let mut reranked = false;
        if self.config.enable_semantic_ranking && fused.len() > 1 {
            reranked = self.semantic_rerank(correlation, query, &mut fused).await;
        }
        if !reranked {
            sort_by_agent_score(&mut fused);
        }
        fused.truncate(options.max_results);

        // Synthesising
        state = QueryState::Synthesising;
        debug!(correlation = %correlation, state = ?state, evidence = fused.len(), "synthesis starts");
        let (answer, synthesis_degraded) = self
            .synthesise(correlation, query, &fused, deadline)
            .await;

        state = QueryState::Done;
        let metrics = QueryMetrics {
            sub_queries: plan.sub_queries.len(),
            agents_invoked,
            agent_failures,
            cache_hits,
            results_before_fusion,
            results_after_fusion: fused.len(),
            reranked,
            degraded: agent_failures > 0 || synthesis_degraded,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            correlation = %correlation,
            state = ?state,
            results = metrics.results_after_fusion,
            degraded = metrics.degraded,
            duration_ms = metrics.duration_ms,
            "query complete"
        );

        Ok(QueryOutcome {
            answer,
            results: fused,
            metrics,
        })
    }

    /// One agent invocation, going through the query cache when enabled
    async fn cached_search(
        &self,
        correlation: &CorrelationId,
        agent: Arc<dyn RetrievalAgent>,
        query: &str,
        options: &SearchOptions,
        deadline: Instant,
    ) -> AgentOutcome {
        let agent_type = agent.agent_type();
        let key = QueryCache::generate_key(agent_type, query, options);

        if options.enable_caching {
            if let Some(results) = self.cache.get(&key) {
                return AgentOutcome::CacheHit(results);
            }
        }

        let budget = remaining(deadline).min(options.timeout());
        let outcome = tokio::time::timeout(budget, agent.search(correlation, query, options)).await;

        match outcome {
            Ok(Ok(results)) => {
                if options.enable_caching {
                    self.cache.set(
                        key,
                        QueryCache::entry_label(agent_type, query),
                        results.clone(),
                    );
                }
                AgentOutcome::Results(results)
            }
            Ok(Err(e)) => {
                // One agent failure never aborts orchestration
                warn!(
                    correlation = %correlation,
                    agent = %agent_type,
                    "agent failed: {}",
                    e
                );
                AgentOutcome::Failed
            }
            Err(_) => {
                warn!(
                    correlation = %correlation,
                    agent = %agent_type,
                    "agent timed out"
                );
                AgentOutcome::Failed
            }
        }
    }

    /// Blend agent scores with embedding similarity; true when applied
    async fn semantic_rerank(
        &self,
        correlation: &CorrelationId,
        query: &str,
        results: &mut [SearchResult],
    ) -> bool {
        let query_vector = match self.completion.embed(correlation, query).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(
                    correlation = %correlation,
                    "rerank skipped, query embedding failed: {}",
                    e
                );
                return false;
            }
        };

        // Archived vectors are reused; the rest embed in one batch
        let mut doc_vectors: Vec<Option<Vec<f32>>> = results
            .iter()
            .map(|r| {
                r.metadata
                    .get("vector_archive")
                    .and_then(|archive| CompressedVector::from_base64(archive).ok())
                    .map(|compressed| compressed.decompress())
            })
            .collect();

        let missing: Vec<usize> = doc_vectors
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.is_none().then_some(i))
            .collect();

        if !missing.is_empty() {
            let texts: Vec<String> = missing
                .iter()
                .map(|&i| {
                    results[i]
                        .content
                        .chars()
                        .take(RERANK_CONTENT_BUDGET)
                        .collect()
                })
                .collect();

            match self.completion.embed_batch(correlation, &texts).await {
                Ok(vectors) => {
                    for (&i, vector) in missing.iter().zip(vectors) {
                        doc_vectors[i] = Some(vector);
                    }
                }
                Err(e) => {
                    warn!(
                        correlation = %correlation,
                        "rerank skipped, candidate embedding failed: {}",
                        e
                    );
                    return false;
                }
            }
        }

        let wa = self.config.rerank_agent_weight;
        let ws = self.config.rerank_semantic_weight;
        for (result, doc_vector) in results.iter_mut().zip(doc_vectors) {
            let similarity = doc_vector
                .map(|v| cosine_similarity(&query_vector, &v).max(0.0))
                .unwrap_or(0.0);
            result.relevance_score =
                (wa * result.relevance_score + ws * similarity).clamp(0.0, 1.0);
        }

        sort_by_agent_score(results);
        debug!(correlation = %correlation, "semantic rerank applied");
        true
    }

    /// Build the bounded evidence prompt and generate the cited answer
    async fn synthesise(
        &self,
        correlation: &CorrelationId,
        query: &str,
        results: &[SearchResult],
        deadline: Instant,
    ) -> (String, bool) {
        if results.is_empty() {
            return (
                "I could not find any relevant information about that in the \
                 indexed specifications, manuals, or web sources."
                    .to_string(),
                false,
            );
        }

        let mut evidence = String::new();
        for result in results.iter().take(SYNTHESIS_TOP_N) {
            let snippet: String = result.content.chars().take(SNIPPET_BUDGET).collect();
            evidence.push_str(&format!("[{}] {}\n\n", result.id, snippet));
        }

        let prompt = format!("Sources:\n{}\nQuestion: {}", evidence, query);
        let messages = vec![system_message(SYNTHESIS_SYSTEM_PROMPT), user_message(prompt)];

        let outcome = tokio::time::timeout(
            remaining(deadline),
            self.completion.chat(correlation, &messages),
        )
        .await;

        match outcome {
            Ok(Ok(answer)) => (answer, false),
            Ok(Err(e)) => {
                warn!(correlation = %correlation, "answer synthesis failed: {}", e);
                (degraded_answer(results), true)
            }
            Err(_) => {
                warn!(correlation = %correlation, "answer synthesis hit the deadline");
                (degraded_answer(results), true)
            }
        }
    }
}

enum AgentOutcome {
    Results(Vec<SearchResult>),
    CacheHit(Vec<SearchResult>),
    Failed,
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn unique_count(results: &[SearchResult]) -> usize {
    let mut keys: Vec<&str> = results.iter().map(|r| r.dedup_key()).collect();
    keys.sort_unstable();
    keys.dedup();
    keys.len()
}

/// Group by document identity, keeping the highest-scored representative
fn dedup_by_best_score(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut best: HashMap<String, SearchResult> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for result in results {
        let key = result.dedup_key().to_string();
        match best.get(&key) {
            Some(existing) if existing.relevance_score >= result.relevance_score => {}
            Some(_) => {
                best.insert(key, result);
            }
            None => {
                order.push(key.clone());
                best.insert(key, result);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| best.remove(&key))
        .collect()
}

fn sort_by_agent_score(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn degraded_answer(results: &[SearchResult]) -> String {
    let sources: Vec<&str> = results.iter().take(3).map(|r| r.id.as_str()).collect();
    format!(
        "Answer generation is currently unavailable. The most relevant \
         sources found were: {}.",
        sources.join(", ")
    )
}
