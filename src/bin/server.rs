//! HTTP server for the motorcycle question-answering API

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use moto_rag::agents::{
    DisabledWebSearch, HttpWebSearch, PdfSearchAgent, QueryPlannerAgent, VectorSearchAgent,
    WebAgentConfig, WebSearchAgent, WebSearchFacade,
};
use moto_rag::api::{start_server, AppState};
use moto_rag::cache::QueryCache;
use moto_rag::config::AppConfig;
use moto_rag::index::AzureSearchClient;
use moto_rag::llm::AzureOpenAiClient;
use moto_rag::orchestrator::{AgentOrchestrator, OrchestratorConfig};
use moto_rag::resilience::{RemoteCallGate, ResilienceService};

/// Outbound remote calls allowed across the whole process
const PROCESS_CALL_LIMIT: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MOTO_RAG_CONFIG").ok())
        .unwrap_or_else(|| "config.toml".to_string());

    info!("loading configuration from {}", config_path);
    let config = AppConfig::from_file(&config_path)?;
    config.validate()?;
    let api_key = config.api_key()?;

    let resilience = Arc::new(ResilienceService::from_config(&config.resilience));
    let gate = RemoteCallGate::new(PROCESS_CALL_LIMIT);

    let completion = Arc::new(AzureOpenAiClient::new(
        config.azure_ai.clone(),
        &config.http_clients,
        api_key.clone(),
        config.search.vector_dimension,
        resilience.clone(),
        gate.clone(),
    )?);

    let index = Arc::new(AzureSearchClient::new(
        config.azure_ai.search_endpoint.clone(),
        api_key,
        &config.http_clients,
        resilience.clone(),
        gate.clone(),
    )?);

    let cache = Arc::new(QueryCache::new(config.cache.clone()));

    let web_facade: Arc<dyn WebSearchFacade> = match &config.azure_ai.web_search_endpoint {
        Some(endpoint) => Arc::new(HttpWebSearch::new(
            endpoint.clone(),
            &config.http_clients,
            resilience.clone(),
        )?),
        None => Arc::new(DisabledWebSearch),
    };

    let unified_index = format!("{}-unified", config.search.index_name);
    let pdf_index = format!("{}-manuals", config.search.index_name);

    let orchestrator = Arc::new(AgentOrchestrator::new(
        Arc::new(QueryPlannerAgent::new(completion.clone())),
        Arc::new(VectorSearchAgent::new(
            index.clone(),
            completion.clone(),
            unified_index,
            config.search.enable_hybrid_search,
        )),
        Arc::new(PdfSearchAgent::new(
            index.clone(),
            completion.clone(),
            pdf_index,
            config.search.enable_hybrid_search,
        )),
        Arc::new(WebSearchAgent::new(web_facade, WebAgentConfig::default())),
        completion.clone(),
        cache.clone(),
        gate,
        OrchestratorConfig::from_config(&config.search, &config.server),
    ));

    let state = AppState {
        orchestrator,
        completion,
        index,
        cache,
        resilience,
    };

    start_server(state, &config.server.host, config.server.port).await?;
    Ok(())
}
