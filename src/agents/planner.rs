//! Query planner agent: decomposes a user query into an execution plan

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::agents::types::{QueryContext, QueryPlan, SearchPreferences};
use crate::llm::{system_message, user_message, CompletionService};
use crate::resilience::CorrelationId;

const PLANNER_SYSTEM_PROMPT: &str = "\
You decompose motorcycle questions into search sub-queries. Respond with a \
single JSON object and nothing else: {\"sub_queries\": [\"...\"], \
\"use_web_search\": bool, \"run_parallel\": bool}. Produce between one and \
six sub-queries that together cover the whole question. Set use_web_search \
only when the question needs current information not found in \
specifications or manuals.";

/// Structured response expected from the planner model
#[derive(Debug, Deserialize)]
struct PlannerResponse {
    sub_queries: Vec<String>,
    #[serde(default)]
    use_web_search: bool,
    #[serde(default = "default_run_parallel")]
    run_parallel: bool,
}

fn default_run_parallel() -> bool {
    true
}

/// Plans query execution through the completion model
///
/// On model unavailability or an unparseable response the planner yields
/// the trivial plan: the original query as the only sub-query.
pub struct QueryPlannerAgent {
    completion: Arc<dyn CompletionService>,
}

impl QueryPlannerAgent {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self { completion }
    }

    /// Produce a plan for the query
    pub async fn plan(
        &self,
        correlation: &CorrelationId,
        query: &str,
        context: &QueryContext,
        preferences: &SearchPreferences,
    ) -> QueryPlan {
        let mut prompt = format!("Question: {}", query);
        if !context.previous_queries.is_empty() {
            let recent: Vec<&str> = context
                .previous_queries
                .iter()
                .rev()
                .take(5)
                .map(String::as_str)
                .collect();
            prompt.push_str(&format!("\nRecent questions: {}", recent.join("; ")));
        }

        let messages = vec![system_message(PLANNER_SYSTEM_PROMPT), user_message(prompt)];

        let response = match self.completion.chat(correlation, &messages).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    correlation = %correlation,
                    "planner model unavailable, using trivial plan: {}",
                    e
                );
                return QueryPlan::trivial(query, preferences.include_web);
            }
        };

        match Self::parse_response(query, &response) {
            Some(mut plan) => {
                // The planner proposes web search; preferences gate it
                plan.use_web_search = plan.use_web_search && preferences.include_web;
                debug!(
                    correlation = %correlation,
                    sub_queries = plan.sub_queries.len(),
                    parallel = plan.run_parallel,
                    "plan ready"
                );
                plan
            }
            None => {
                warn!(correlation = %correlation, "unparseable plan, using trivial plan");
                QueryPlan::trivial(query, preferences.include_web)
            }
        }
    }

    /// Extract the JSON object from the model output
    fn parse_response(query: &str, response: &str) -> Option<QueryPlan> {
        let start = response.find('{')?;
        let end = response.rfind('}')?;
        if end <= start {
            return None;
        }

        let parsed: PlannerResponse = serde_json::from_str(&response[start..=end]).ok()?;

        let mut sub_queries: Vec<String> = parsed
            .sub_queries
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        if sub_queries.is_empty() {
            return None;
        }
        sub_queries.truncate(6);

        Some(QueryPlan {
            original_query: query.to_string(),
            sub_queries,
            use_web_search: parsed.use_web_search,
            run_parallel: parsed.run_parallel,
        })
    }
}
