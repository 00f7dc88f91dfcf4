//! Embedding and chat completion client
//!
//! Typed wrapper over the remote OpenAI-compatible provider. All calls are
//! routed through the resilience registry under `openai.chat` /
//! `openai.embed` and carry the caller's correlation id.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::config::{AzureAiConfig, HttpClientConfig};
use crate::error::{classify_status, LlmError, RagError, Result};
use crate::resilience::{policy, CorrelationId, RemoteCallGate, ResilienceService};

const API_VERSION: &str = "2024-06-01";

/// Maximum inputs per embedding request; larger batches are split
const EMBED_BATCH_LIMIT: usize = 16;

/// Message role in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Helper function to create a system message
pub fn system_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::System,
        content: content.into(),
    }
}

/// Helper function to create a user message
pub fn user_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::User,
        content: content.into(),
    }
}

/// Usage counters for health reporting
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionStats {
    pub total_requests: u64,
    pub failed_requests: u64,
}

/// Cosine similarity between two dense vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Capability interface for the remote completion/embedding provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Generate a chat completion for a conversation
    async fn chat(&self, correlation: &CorrelationId, messages: &[Message]) -> Result<String>;

    /// Generate an embedding for one text
    async fn embed(&self, correlation: &CorrelationId, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for a batch of texts, preserving order
    async fn embed_batch(
        &self,
        correlation: &CorrelationId,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>>;

    /// Describe an image with the vision model
    async fn describe_image(
        &self,
        correlation: &CorrelationId,
        prompt: &str,
        image: &[u8],
    ) -> Result<String>;

    /// Check whether the provider is reachable
    async fn health_check(&self) -> bool;

    /// Usage statistics (requests made, failures seen)
    fn stats(&self) -> CompletionStats {
        CompletionStats::default()
    }
}

/// OpenAI-compatible client over the configured endpoint
pub struct AzureOpenAiClient {
    client: reqwest::Client,
    config: AzureAiConfig,
    api_key: String,
    /// Dimension every returned embedding must match
    vector_dimension: usize,
    resilience: Arc<ResilienceService>,
    gate: RemoteCallGate,
    request_timeout: Duration,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f32,
}

/// Chat message on the wire; content is a string or vision content parts
#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbedDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl AzureOpenAiClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AzureAiConfig,
        http: &HttpClientConfig,
        api_key: String,
        vector_dimension: usize,
        resilience: Arc<ResilienceService>,
        gate: RemoteCallGate,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(http.connect_timeout_s))
            .timeout(Duration::from_secs(http.request_timeout_s))
            .pool_max_idle_per_host(http.max_conns_per_endpoint)
            .pool_idle_timeout(Duration::from_secs(http.pooled_lifetime_s));
        if !http.enable_http2 {
            builder = builder.http1_only();
        }
        let client = builder
            .build()
            .map_err(|e| RagError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            api_key,
            vector_dimension,
            resilience,
            gate,
            request_timeout: Duration::from_secs(http.request_timeout_s),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        })
    }

    fn deployment_url(&self, deployment: &str, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            self.config.openai_endpoint.trim_end_matches('/'),
            deployment,
            operation,
            API_VERSION
        )
    }

    async fn post_json<B: Serialize>(&self, url: &str, body: &B) -> Result<reqwest::Response> {
        let _permit = self.gate.acquire().await;
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let response = timeout(
            self.request_timeout,
            self.client
                .post(url)
                .header("api-key", &self.api_key)
                .json(body)
                .send(),
        )
        .await
        .map_err(|_| {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            RagError::Llm(LlmError::Timeout)
        })?
        .map_err(|e| {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            RagError::Llm(LlmError::ConnectionFailed(e.to_string()))
        })?;

        if !response.status().is_success() {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            error!("completion provider error {}: {}", status, message);
            return Err(classify_status(
                status,
                message,
                retry_after,
                |ra| LlmError::RateLimited {
                    retry_after_secs: ra,
                },
                |s, m| LlmError::ServerError { status: s, message: m },
                |s, m| LlmError::Rejected { status: s, message: m },
            )
            .into());
        }

        Ok(response)
    }

    async fn chat_once(&self, deployment: &str, messages: Vec<WireMessage>) -> Result<String> {
        let request = ChatRequest {
            messages,
            max_tokens: self.config.models.max_tokens,
            temperature: self.config.models.temperature,
        };

        let url = self.deployment_url(deployment, "chat/completions");
        debug!("chat request to {}", url);

        let response = self.post_json(&url, &request).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices returned".to_string()))?;

        let text = choice
            .message
            .content
            .ok_or_else(|| LlmError::GenerationFailed("empty completion".to_string()))?;

        debug!(
            "completion finished (reason: {})",
            choice.finish_reason.as_deref().unwrap_or("unknown")
        );
        Ok(text)
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            input: texts.to_vec(),
        };
        let url = self.deployment_url(&self.config.models.embedding, "embeddings");

        let response = self.post_json(&url, &request).await?;
        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        if parsed.data.len() != texts.len() {
            return Err(LlmError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            ))
            .into());
        }

        let mut ordered = parsed.data;
        ordered.sort_by_key(|d| d.index);

        for datum in &ordered {
            if datum.embedding.len() != self.vector_dimension {
                return Err(LlmError::DimensionMismatch {
                    expected: self.vector_dimension,
                    actual: datum.embedding.len(),
                }
                .into());
            }
        }

        Ok(ordered.into_iter().map(|d| d.embedding).collect())
    }

    fn wire_messages(messages: &[Message]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                }
                .to_string(),
                content: serde_json::Value::String(m.content.clone()),
            })
            .collect()
    }
}

#[async_trait]
impl CompletionService for AzureOpenAiClient {
    async fn chat(&self, correlation: &CorrelationId, messages: &[Message]) -> Result<String> {
        let policy = self.resilience.policy(policy::OPENAI_CHAT);
        policy
            .execute(correlation, || {
                self.chat_once(&self.config.models.chat, Self::wire_messages(messages))
            })
            .await
    }

    async fn embed(&self, correlation: &CorrelationId, text: &str) -> Result<Vec<f32>> {
        let texts = vec![text.to_string()];
        let mut vectors = self.embed_batch(correlation, &texts).await?;
        vectors
            .pop()
            .ok_or_else(|| LlmError::EmbeddingFailed("empty embedding batch".to_string()).into())
    }

    async fn embed_batch(
        &self,
        correlation: &CorrelationId,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let policy = self.resilience.policy(policy::OPENAI_EMBED);
        let mut vectors = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(EMBED_BATCH_LIMIT) {
            let batch = policy
                .execute(correlation, || self.embed_chunk(chunk))
                .await?;
            vectors.extend(batch);
        }

        info!(
            correlation = %correlation,
            count = vectors.len(),
            "generated embeddings"
        );
        Ok(vectors)
    }

    async fn describe_image(
        &self,
        correlation: &CorrelationId,
        prompt: &str,
        image: &[u8],
    ) -> Result<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let data_url = format!("data:image/png;base64,{}", encoded);

        let content = serde_json::json!([
            { "type": "text", "text": prompt },
            { "type": "image_url", "image_url": { "url": data_url } },
        ]);
        let messages = vec![WireMessage {
            role: "user".to_string(),
            content,
        }];

        let policy = self.resilience.policy(policy::OPENAI_CHAT);
        policy
            .execute(correlation, || {
                // Vision content parts cannot be rebuilt from &[Message],
                // so the wire form is cloned per attempt.
                let messages = messages
                    .iter()
                    .map(|m| WireMessage {
                        role: m.role.clone(),
                        content: m.content.clone(),
                    })
                    .collect();
                self.chat_once(&self.config.models.vision, messages)
            })
            .await
    }

    async fn health_check(&self) -> bool {
        // A minimal embedding round-trip; failures are reported, not raised
        let correlation = CorrelationId::new();
        match self.embed(&correlation, "health check").await {
            Ok(_) => true,
            Err(e) => {
                debug!("completion service health check failed: {}", e);
                false
            }
        }
    }

    fn stats(&self) -> CompletionStats {
        CompletionStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResilienceConfig, RetryConfig};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(endpoint: &str, dimension: usize) -> AzureOpenAiClient {
        let mut config = AzureAiConfig::default();
        config.openai_endpoint = endpoint.to_string();
        config.models.chat = "chat-model".to_string();
        config.models.embedding = "embed-model".to_string();

        let resilience = Arc::new(ResilienceService::from_config(&ResilienceConfig {
            retry: RetryConfig {
                max_retries: 1,
                base_delay_s: 0.001,
                max_delay_s: 0.01,
            },
            ..Default::default()
        }));

        AzureOpenAiClient::new(
            config,
            &HttpClientConfig::default(),
            "test-key".to_string(),
            dimension,
            resilience,
            RemoteCallGate::new(4),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_embed_batch_parses_and_orders() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/openai/deployments/embed-model/embeddings"))
            .and(header("api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    { "index": 1, "embedding": [0.0, 1.0, 0.0] },
                    { "index": 0, "embedding": [1.0, 0.0, 0.0] },
                ]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), 3);
        let correlation = CorrelationId::new();

        let vectors = client
            .embed_batch(
                &correlation,
                &["first".to_string(), "second".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_embed_dimension_mismatch_is_terminal() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/openai/deployments/embed-model/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "index": 0, "embedding": [0.5, 0.5] }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), 3);
        let correlation = CorrelationId::new();

        let err = client.embed(&correlation, "text").await.unwrap_err();
        assert!(!err.is_retryable(), "dimension mismatch must not retry");
        assert!(matches!(
            err,
            RagError::Llm(LlmError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_chat_returns_first_choice() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/openai/deployments/chat-model/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [
                    { "message": { "content": "The CBR600RR has ABS." }, "finish_reason": "stop" }
                ]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), 3);
        let correlation = CorrelationId::new();
        let messages = vec![
            system_message("You answer motorcycle questions."),
            user_message("Does the CBR600RR have ABS?"),
        ];

        let answer = client.chat(&correlation, &messages).await.unwrap();
        assert_eq!(answer, "The CBR600RR has ABS.");
    }

    #[tokio::test]
    async fn test_rate_limit_retried_then_succeeds() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/openai/deployments/embed-model/embeddings"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/openai/deployments/embed-model/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "index": 0, "embedding": [0.1, 0.2, 0.3] }]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), 3);
        let correlation = CorrelationId::new();

        let vector = client.embed(&correlation, "retry me").await.unwrap();
        assert_eq!(vector.len(), 3);
    }
}
