//! REST API for the retrieval service
//!
//! Endpoints:
//! - `POST /api/motorcycles/query` answers a free-text question
//! - `GET /api/motorcycles/health` reports dependency health and cache stats

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::agents::types::{AgentType, QueryContext, ResultSource, SearchPreferences, SearchResult};
use crate::cache::QueryCache;
use crate::error::{ErrorKind, RagError, Result};
use crate::index::SearchIndex;
use crate::llm::CompletionService;
use crate::orchestrator::{AgentOrchestrator, QueryMetrics, RequestContext};
use crate::resilience::{CorrelationId, ResilienceService};

/// Query length bounds enforced at the edge
const MIN_QUERY_LEN: usize = 3;
const MAX_QUERY_LEN: usize = 1000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<AgentOrchestrator>,
    pub completion: Arc<dyn CompletionService>,
    pub index: Arc<dyn SearchIndex>,
    pub cache: Arc<QueryCache>,
    pub resilience: Arc<ResilienceService>,
}

/// Request to answer a motorcycle question
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct MotorcycleQueryRequest {
    /// The question, 3 to 1000 characters
    #[schema(example = "What oil does a 2023 CBR600RR take?")]
    pub query: String,

    #[serde(default)]
    pub preferences: Option<SearchPreferences>,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub context: Option<QueryContext>,
}

/// Answer with its supporting sources
#[derive(Debug, Serialize, ToSchema)]
pub struct MotorcycleQueryResponse {
    pub response: String,
    pub sources: Vec<SearchResult>,
    pub metrics: QueryMetrics,
    pub query_id: String,
    pub generated_at: DateTime<Utc>,
}

/// Error payload
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health report
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub is_healthy: bool,
    pub status: String,
    pub details: HashMap<String, String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(OpenApi)]
#[openapi(
    paths(query_handler, health_handler),
    components(schemas(
        MotorcycleQueryRequest,
        MotorcycleQueryResponse,
        ErrorResponse,
        HealthResponse,
        SearchResult,
        ResultSource,
        AgentType,
        SearchPreferences,
        QueryContext,
        QueryMetrics,
    )),
    tags(
        (name = "motorcycles", description = "Motorcycle question answering"),
        (name = "health", description = "Health check endpoints"),
    )
)]
struct ApiDoc;

/// Validate the incoming query string
fn validate_query(query: &str) -> Result<()> {
    let len = query.trim().chars().count();
    if len < MIN_QUERY_LEN {
        return Err(RagError::Validation(format!(
            "query must be at least {} characters",
            MIN_QUERY_LEN
        )));
    }
    if len > MAX_QUERY_LEN {
        return Err(RagError::Validation(format!(
            "query must be at most {} characters",
            MAX_QUERY_LEN
        )));
    }
    Ok(())
}

#[utoipa::path(
    post,
    path = "/api/motorcycles/query",
    tag = "motorcycles",
    request_body = MotorcycleQueryRequest,
    responses(
        (status = 200, description = "Answer with sources", body = MotorcycleQueryResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 500, description = "Unexpected failure", body = ErrorResponse),
    )
)]
async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<MotorcycleQueryRequest>,
) -> Response {
    let correlation = CorrelationId::new();

    if let Err(e) = validate_query(&request.query) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response();
    }

    let context = RequestContext {
        session_id: request.user_id.clone(),
        preferences: request.preferences.clone().unwrap_or_default(),
        query_context: request.context.clone().unwrap_or_default(),
        additional: HashMap::new(),
    };

    match state
        .orchestrator
        .handle_query(&correlation, request.query.trim(), &context)
        .await
    {
        Ok(outcome) => {
            let response = MotorcycleQueryResponse {
                response: outcome.answer,
                sources: outcome.results,
                metrics: outcome.metrics,
                query_id: Uuid::new_v4().to_string(),
                generated_at: Utc::now(),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) if e.kind() == ErrorKind::Validation => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!(correlation = %correlation, "query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!(
                        "an unexpected error occurred (correlation {})",
                        correlation
                    ),
                }),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/motorcycles/health",
    tag = "health",
    responses(
        (status = 200, description = "Health report", body = HealthResponse)
    )
)]
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let completion_healthy = state.completion.health_check().await;
    let index_healthy = state.index.health_check().await;
    let cache_stats = state.cache.stats();

    let mut details = HashMap::new();
    details.insert(
        "completion_service".to_string(),
        if completion_healthy { "up" } else { "down" }.to_string(),
    );
    details.insert(
        "search_index".to_string(),
        if index_healthy { "up" } else { "down" }.to_string(),
    );
    details.insert(
        "cache_entries".to_string(),
        cache_stats.entries.to_string(),
    );
    details.insert(
        "cache_hit_ratio".to_string(),
        format!("{:.2}", cache_stats.hit_ratio),
    );
    let completion_stats = state.completion.stats();
    details.insert(
        "completion_requests".to_string(),
        completion_stats.total_requests.to_string(),
    );
    details.insert(
        "completion_failures".to_string(),
        completion_stats.failed_requests.to_string(),
    );
    for (policy, breaker_state) in state.resilience.breaker_states() {
        details.insert(format!("breaker.{}", policy), format!("{:?}", breaker_state));
    }

    let is_healthy = completion_healthy && index_healthy;
    Json(HealthResponse {
        is_healthy,
        status: if is_healthy { "healthy" } else { "degraded" }.to_string(),
        details,
        checked_at: Utc::now(),
    })
}

async fn openapi_spec_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/motorcycles/query", post(query_handler))
        .route("/api/motorcycles/health", get(health_handler))
        .route("/api-docs/openapi.json", get(openapi_spec_handler))
        .layer(
            tower::ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Start the API server
pub async fn start_server(state: AppState, host: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    info!("starting API server on {}", addr);

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RagError::Config(format!("failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| RagError::Internal(format!("server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_validation_bounds() {
        assert!(validate_query("ok?").is_ok());
        assert!(validate_query("ab").is_err());
        assert!(validate_query("   a   ").is_err());
        assert!(validate_query(&"x".repeat(1000)).is_ok());
        assert!(validate_query(&"x".repeat(1001)).is_err());
    }

    #[test]
    fn test_request_deserialization_defaults() {
        let request: MotorcycleQueryRequest =
            serde_json::from_str(r#"{"query": "what oil for the R6"}"#).unwrap();
        assert_eq!(request.query, "what oil for the R6");
        assert!(request.preferences.is_none());
        assert!(request.context.is_none());
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            error: "query must be at least 3 characters".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("at least 3"));
    }

    #[test]
    fn test_openapi_document_builds() {
        let doc = ApiDoc::openapi();
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("/api/motorcycles/query"));
        assert!(json.contains("/api/motorcycles/health"));
    }
}
