//! Configuration management for the retrieval service

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the retrieval service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Remote AI provider endpoints and model deployments
    pub azure_ai: AzureAiConfig,

    /// Search index configuration
    pub search: SearchConfig,

    /// Resilience policies (circuit breaker, retry, fallback)
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Query result cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Outbound HTTP client tuning
    #[serde(default)]
    pub http_clients: HttpClientConfig,

    /// HTTP server binding
    #[serde(default)]
    pub server: ServerConfig,
}

/// Remote AI provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureAiConfig {
    /// AI Foundry endpoint (project scope)
    pub foundry_endpoint: String,

    /// OpenAI-compatible endpoint for chat and embeddings
    pub openai_endpoint: String,

    /// Search service endpoint
    pub search_endpoint: String,

    /// Document layout analysis endpoint
    pub doc_intelligence_endpoint: String,

    /// Environment variable holding the API key; secrets never live in files
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// External web search endpoint; web augmentation is disabled when unset
    #[serde(default)]
    pub web_search_endpoint: Option<String>,

    /// Model deployment names and generation parameters
    pub models: ModelConfig,
}

fn default_api_key_env() -> String {
    "AZURE_AI_API_KEY".to_string()
}

/// Model deployments and generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Chat completion deployment
    pub chat: String,

    /// Embedding deployment
    pub embedding: String,

    /// Query planner deployment (usually a smaller chat model)
    #[serde(default = "default_planner_model")]
    pub planner: String,

    /// Vision deployment for figure descriptions
    #[serde(default = "default_vision_model")]
    pub vision: String,

    /// Maximum tokens for generation
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Temperature for generation, in [0, 2]
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_planner_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.3
}

/// Search index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Base name for the index family; per-source indexes derive from it
    pub index_name: String,

    /// Upsert batch size; clamped to [100, 1000] by the batch heuristic
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Memory budget for the batch-sizing heuristic, in bytes
    #[serde(default = "default_available_memory")]
    pub available_memory_bytes: usize,

    /// Maximum results a single search returns
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,

    /// Dense vector dimension; the single source of truth for all schemas
    #[serde(default = "default_vector_dimension")]
    pub vector_dimension: usize,

    /// Enable combined lexical + vector queries
    #[serde(default = "default_true")]
    pub enable_hybrid_search: bool,

    /// Enable embedding-based reranking of fused results
    #[serde(default = "default_true")]
    pub enable_semantic_ranking: bool,

    /// Attach quantised vector archives to indexed documents
    #[serde(default)]
    pub enable_vector_compression: bool,

    /// Weight of the agent score in the rerank blend
    #[serde(default = "default_rerank_agent_weight")]
    pub rerank_agent_weight: f32,

    /// Weight of the embedding similarity in the rerank blend
    #[serde(default = "default_rerank_semantic_weight")]
    pub rerank_semantic_weight: f32,
}

fn default_batch_size() -> usize {
    250
}

fn default_available_memory() -> usize {
    512 * 1024 * 1024
}

fn default_max_search_results() -> usize {
    10
}

fn default_vector_dimension() -> usize {
    3072
}

fn default_rerank_agent_weight() -> f32 {
    0.7
}

fn default_rerank_semantic_weight() -> f32 {
    0.3
}

fn default_true() -> bool {
    true
}

/// Resilience configuration: circuit breakers, retry, fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Per-policy circuit breaker settings, keyed by policy name
    #[serde(default)]
    pub circuit_breaker: HashMap<String, CircuitBreakerConfig>,

    /// Retry settings shared across policies
    #[serde(default)]
    pub retry: RetryConfig,

    /// Fallback settings
    #[serde(default)]
    pub fallback: FallbackConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: HashMap::new(),
            retry: RetryConfig::default(),
            fallback: FallbackConfig::default(),
        }
    }
}

/// Circuit breaker settings for one policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before probing
    #[serde(default = "default_break_duration")]
    pub break_duration_s: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_break_duration() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            break_duration_s: default_break_duration(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn break_duration(&self) -> Duration {
        Duration::from_secs(self.break_duration_s)
    }
}

/// Retry settings with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in seconds; attempt n waits base * 2^n plus jitter
    #[serde(default = "default_base_delay")]
    pub base_delay_s: f64,

    /// Upper bound on a single delay in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_s: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    30.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_s: default_base_delay(),
            max_delay_s: default_max_delay(),
        }
    }
}

/// Fallback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// How long fallback-produced values may be cached, in seconds
    #[serde(default = "default_fallback_cache_expiration")]
    pub cache_expiration_s: u64,
}

fn default_fallback_cache_expiration() -> u64 {
    300
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            cache_expiration_s: default_fallback_cache_expiration(),
        }
    }
}

/// Query result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default entry lifetime in seconds
    #[serde(default = "default_cache_duration")]
    pub default_duration_s: u64,

    /// Maximum number of entries before oldest-first eviction
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Approximate memory ceiling for cached snapshots
    #[serde(default = "default_cache_memory_limit")]
    pub memory_limit_mb: usize,

    /// Trim cached result contents to a per-result budget
    #[serde(default)]
    pub enable_compression: bool,
}

fn default_cache_duration() -> u64 {
    30 * 60
}

fn default_cache_max_entries() -> usize {
    1000
}

fn default_cache_memory_limit() -> usize {
    100
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_duration_s: default_cache_duration(),
            max_entries: default_cache_max_entries(),
            memory_limit_mb: default_cache_memory_limit(),
            enable_compression: false,
        }
    }
}

/// Outbound HTTP client tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// Maximum pooled connections per endpoint
    #[serde(default = "default_max_conns")]
    pub max_conns_per_endpoint: usize,

    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_s: u64,

    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_s: u64,

    /// Idle pooled connection lifetime in seconds
    #[serde(default = "default_pooled_lifetime")]
    pub pooled_lifetime_s: u64,

    /// Negotiate HTTP/2 where the endpoint supports it
    #[serde(default = "default_true")]
    pub enable_http2: bool,
}

fn default_max_conns() -> usize {
    16
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    60
}

fn default_pooled_lifetime() -> u64 {
    90
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_conns_per_endpoint: default_max_conns(),
            connect_timeout_s: default_connect_timeout(),
            request_timeout_s: default_request_timeout(),
            pooled_lifetime_s: default_pooled_lifetime(),
            enable_http2: true,
        }
    }
}

/// HTTP server binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Overall request deadline in seconds
    #[serde(default = "default_request_deadline")]
    pub request_deadline_s: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_deadline() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_deadline_s: default_request_deadline(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            chat: "gpt-4o".to_string(),
            embedding: "text-embedding-3-large".to_string(),
            planner: default_planner_model(),
            vision: default_vision_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl Default for AzureAiConfig {
    fn default() -> Self {
        Self {
            foundry_endpoint: "https://localhost:5001".to_string(),
            openai_endpoint: "https://localhost:5002".to_string(),
            search_endpoint: "https://localhost:5003".to_string(),
            doc_intelligence_endpoint: "https://localhost:5004".to_string(),
            api_key_env: default_api_key_env(),
            web_search_endpoint: None,
            models: ModelConfig::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            index_name: "motorcycles".to_string(),
            batch_size: default_batch_size(),
            available_memory_bytes: default_available_memory(),
            max_search_results: default_max_search_results(),
            vector_dimension: default_vector_dimension(),
            enable_hybrid_search: true,
            enable_semantic_ranking: true,
            enable_vector_compression: false,
            rerank_agent_weight: default_rerank_agent_weight(),
            rerank_semantic_weight: default_rerank_semantic_weight(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            azure_ai: AzureAiConfig::default(),
            search: SearchConfig::default(),
            resilience: ResilienceConfig::default(),
            cache: CacheConfig::default(),
            http_clients: HttpClientConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// On-disk formats the service configuration can live in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Toml,
    Yaml,
}

impl ConfigFormat {
    const KNOWN: [(&'static str, ConfigFormat); 4] = [
        ("json", ConfigFormat::Json),
        ("toml", ConfigFormat::Toml),
        ("yaml", ConfigFormat::Yaml),
        ("yml", ConfigFormat::Yaml),
    ];

    /// Infer the format from a path's extension
    fn detect(path: &Path) -> anyhow::Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        Self::KNOWN
            .iter()
            .find(|(known, _)| *known == ext)
            .map(|(_, format)| *format)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "cannot tell the configuration format of '{}'; use .json, .toml, .yaml, or .yml",
                    path.display()
                )
            })
    }

    fn parse(self, raw: &str) -> anyhow::Result<AppConfig> {
        Ok(match self {
            ConfigFormat::Json => serde_json::from_str(raw)?,
            ConfigFormat::Toml => toml::from_str(raw)?,
            ConfigFormat::Yaml => serde_yml::from_str(raw)?,
        })
    }

    fn render(self, config: &AppConfig) -> anyhow::Result<String> {
        Ok(match self {
            ConfigFormat::Json => serde_json::to_string_pretty(config)?,
            ConfigFormat::Toml => toml::to_string(config)?,
            ConfigFormat::Yaml => serde_yml::to_string(config)?,
        })
    }
}

impl AppConfig {
    /// Read the service configuration from a JSON, TOML, or YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::detect(path)?;
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
        format.parse(&raw)
    }

    /// Write the configuration in the format the path's extension implies
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let rendered = ConfigFormat::detect(path)?.render(self)?;
        std::fs::write(path, rendered)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, endpoint) in [
            ("foundry_endpoint", &self.azure_ai.foundry_endpoint),
            ("openai_endpoint", &self.azure_ai.openai_endpoint),
            ("search_endpoint", &self.azure_ai.search_endpoint),
            (
                "doc_intelligence_endpoint",
                &self.azure_ai.doc_intelligence_endpoint,
            ),
        ] {
            if !endpoint.starts_with("http") {
                return Err(anyhow::anyhow!("Invalid {}: {}", name, endpoint));
            }
        }

        if self.azure_ai.models.chat.is_empty() {
            return Err(anyhow::anyhow!("Chat model name cannot be empty"));
        }

        if self.azure_ai.models.embedding.is_empty() {
            return Err(anyhow::anyhow!("Embedding model name cannot be empty"));
        }

        let temp = self.azure_ai.models.temperature;
        if !(0.0..=2.0).contains(&temp) {
            return Err(anyhow::anyhow!(
                "Temperature must be between 0.0 and 2.0, got {}",
                temp
            ));
        }

        if self.search.index_name.is_empty() {
            return Err(anyhow::anyhow!("Index name cannot be empty"));
        }

        if self.search.batch_size == 0 {
            return Err(anyhow::anyhow!("Batch size must be greater than 0"));
        }

        if self.search.max_search_results == 0 {
            return Err(anyhow::anyhow!("Max search results must be greater than 0"));
        }

        if self.search.vector_dimension == 0 {
            return Err(anyhow::anyhow!("Vector dimension must be greater than 0"));
        }

        let weight_sum = self.search.rerank_agent_weight + self.search.rerank_semantic_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(anyhow::anyhow!(
                "Rerank weights must sum to 1.0, got {}",
                weight_sum
            ));
        }

        if self.resilience.retry.base_delay_s <= 0.0 {
            return Err(anyhow::anyhow!("Retry base delay must be positive"));
        }

        Ok(())
    }

    /// Circuit breaker settings for a policy, falling back to defaults
    pub fn breaker_for(&self, policy: &str) -> CircuitBreakerConfig {
        self.resilience
            .circuit_breaker
            .get(policy)
            .cloned()
            .unwrap_or_default()
    }

    /// Resolve the provider API key from the configured environment variable
    pub fn api_key(&self) -> anyhow::Result<String> {
        std::env::var(&self.azure_ai.api_key_env).map_err(|_| {
            anyhow::anyhow!(
                "API key environment variable {} is not set",
                self.azure_ai.api_key_env
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.search.vector_dimension, 3072);
        assert_eq!(config.search.batch_size, 250);
        assert_eq!(config.resilience.retry.max_retries, 3);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.azure_ai.openai_endpoint = "not-a-url".to_string();
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.azure_ai.models.temperature = 2.5;
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.search.rerank_agent_weight = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_breaker_lookup_defaults() {
        let mut config = AppConfig::default();
        config.resilience.circuit_breaker.insert(
            "openai.chat".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 3,
                break_duration_s: 10,
            },
        );

        assert_eq!(config.breaker_for("openai.chat").failure_threshold, 3);
        assert_eq!(config.breaker_for("search.query").failure_threshold, 5);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = AppConfig::default();
        config.to_file(&path).unwrap();

        let loaded = AppConfig::from_file(&path).unwrap();
        assert_eq!(loaded.search.index_name, config.search.index_name);
        assert_eq!(
            loaded.http_clients.max_conns_per_endpoint,
            config.http_clients.max_conns_per_endpoint
        );
    }

    #[test]
    fn test_config_format_detection() {
        assert_eq!(
            ConfigFormat::detect(Path::new("conf/app.YAML")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::detect(Path::new("app.yml")).unwrap(),
            ConfigFormat::Yaml
        );

        let err = ConfigFormat::detect(Path::new("app.ini")).unwrap_err();
        assert!(err.to_string().contains("app.ini"));

        let err = AppConfig::default().to_file("no-extension").unwrap_err();
        assert!(err.to_string().contains(".toml"));
    }
}
