//! Search index client and schema definitions
//!
//! The three index schemas (CSV specs, PDF manuals, unified) are part of the
//! public contract: their fields and vector dimension govern downstream
//! compatibility and are versioned through `schema_version`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::config::HttpClientConfig;
use crate::document::MotorcycleDocument;
use crate::error::{classify_status, IndexError, RagError, Result};
use crate::resilience::{policy, CorrelationId, RemoteCallGate, ResilienceService};

const API_VERSION: &str = "2024-07-01";

/// Field types an index schema can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Key,
    Text,
    TextCollection,
    Integer,
    Double,
    DateTime,
    Vector,
}

/// One field in an index schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub searchable: bool,
    pub filterable: bool,
}

impl FieldDef {
    fn new(name: &str, kind: FieldKind, searchable: bool, filterable: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            searchable,
            filterable,
        }
    }
}

/// A hybrid-search index definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    /// Version tag; bumped whenever fields or the vector dimension change
    pub schema_version: String,
    pub vector_dimension: usize,
    pub fields: Vec<FieldDef>,
}

impl IndexSchema {
    fn common_fields() -> Vec<FieldDef> {
        vec![
            FieldDef::new("id", FieldKind::Key, false, true),
            FieldDef::new("title", FieldKind::Text, true, false),
            FieldDef::new("content", FieldKind::Text, true, false),
            FieldDef::new("type", FieldKind::Text, false, true),
            FieldDef::new("source_file", FieldKind::Text, false, true),
            FieldDef::new("tags", FieldKind::TextCollection, true, true),
            FieldDef::new("additional_properties", FieldKind::Text, false, false),
            FieldDef::new("created_at", FieldKind::DateTime, false, true),
            FieldDef::new("updated_at", FieldKind::DateTime, false, true),
            FieldDef::new("content_vector", FieldKind::Vector, false, false),
        ]
    }

    /// Schema for tabular specification documents
    pub fn csv(base_name: &str, vector_dimension: usize) -> Self {
        let mut fields = Self::common_fields();
        fields.push(FieldDef::new("make", FieldKind::Text, true, true));
        fields.push(FieldDef::new("model", FieldKind::Text, true, true));
        fields.push(FieldDef::new("year", FieldKind::Integer, false, true));
        Self {
            name: format!("{}-specs", base_name),
            schema_version: format!("v1-{}", vector_dimension),
            vector_dimension,
            fields,
        }
    }

    /// Schema for PDF manual documents
    pub fn pdf(base_name: &str, vector_dimension: usize) -> Self {
        let mut fields = Self::common_fields();
        fields.push(FieldDef::new("section", FieldKind::Text, true, true));
        fields.push(FieldDef::new("page_number", FieldKind::Integer, false, true));
        fields.push(FieldDef::new("chunk_type", FieldKind::Text, false, true));
        Self {
            name: format!("{}-manuals", base_name),
            schema_version: format!("v1-{}", vector_dimension),
            vector_dimension,
            fields,
        }
    }

    /// Superset schema used by the multi-source agent
    pub fn unified(base_name: &str, vector_dimension: usize) -> Self {
        let mut fields = Self::common_fields();
        fields.push(FieldDef::new("make", FieldKind::Text, true, true));
        fields.push(FieldDef::new("model", FieldKind::Text, true, true));
        fields.push(FieldDef::new("year", FieldKind::Integer, false, true));
        fields.push(FieldDef::new("section", FieldKind::Text, true, true));
        fields.push(FieldDef::new("page_number", FieldKind::Integer, false, true));
        fields.push(FieldDef::new("chunk_type", FieldKind::Text, false, true));
        fields.push(FieldDef::new("source_url", FieldKind::Text, false, true));
        Self {
            name: format!("{}-unified", base_name),
            schema_version: format!("v1-{}", vector_dimension),
            vector_dimension,
            fields,
        }
    }
}

/// A query against one index
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Lexical query text
    pub text: String,
    /// Dense query vector; present for hybrid queries
    pub vector: Option<Vec<f32>>,
    /// Maximum hits to return
    pub top: usize,
    /// Field equality filters
    pub filters: HashMap<String, String>,
}

/// One hit returned by an index query
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub id: String,
    pub title: Option<String>,
    pub content: String,
    /// Relevance in [0, 1]
    pub score: f32,
    pub section: Option<String>,
    pub page_number: Option<u32>,
    pub source_file: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Per-index statistics
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub name: String,
    pub document_count: u64,
    pub storage_size_bytes: u64,
    pub healthy: bool,
}

/// Capability interface for the full-text/vector index engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index if absent; idempotent
    async fn ensure_index(&self, correlation: &CorrelationId, schema: &IndexSchema) -> Result<()>;

    /// Upsert a batch of documents, returning the number accepted
    async fn upsert(
        &self,
        correlation: &CorrelationId,
        index: &str,
        documents: &[MotorcycleDocument],
    ) -> Result<usize>;

    /// Run a keyword or hybrid query
    async fn query(
        &self,
        correlation: &CorrelationId,
        index: &str,
        query: &SearchQuery,
    ) -> Result<Vec<IndexHit>>;

    /// Fetch per-index statistics
    async fn stats(&self, correlation: &CorrelationId, index: &str) -> Result<IndexStats>;

    /// Check whether the engine is reachable
    async fn health_check(&self) -> bool;
}

/// REST client for the search service
pub struct AzureSearchClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    resilience: Arc<ResilienceService>,
    gate: RemoteCallGate,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    value: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    value: Vec<UpsertItemResult>,
}

#[derive(Debug, Deserialize)]
struct UpsertItemResult {
    key: String,
    status: bool,
    #[serde(default)]
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(rename = "documentCount")]
    document_count: u64,
    #[serde(rename = "storageSize")]
    storage_size: u64,
}

impl AzureSearchClient {
    pub fn new(
        endpoint: String,
        api_key: String,
        http: &HttpClientConfig,
        resilience: Arc<ResilienceService>,
        gate: RemoteCallGate,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(http.connect_timeout_s))
            .timeout(Duration::from_secs(http.request_timeout_s))
            .pool_max_idle_per_host(http.max_conns_per_endpoint)
            .pool_idle_timeout(Duration::from_secs(http.pooled_lifetime_s))
            .build()
            .map_err(|e| RagError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            resilience,
            gate,
            request_timeout: Duration::from_secs(http.request_timeout_s),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}?api-version={}", self.endpoint, path, API_VERSION)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let _permit = self.gate.acquire().await;

        let response = timeout(self.request_timeout, request.send())
            .await
            .map_err(|_| RagError::Timeout("search request timed out".to_string()))?
            .map_err(|e| IndexError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
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
            error!("search service error {}: {}", status, message);
            if status == 404 {
                return Err(IndexError::IndexNotFound(message).into());
            }
            return Err(classify_status(
                status,
                message,
                retry_after,
                |ra| IndexError::RateLimited {
                    retry_after_secs: ra,
                },
                |s, m| IndexError::ServerError { status: s, message: m },
                |s, m| IndexError::Rejected { status: s, message: m },
            )
            .into());
        }

        Ok(response)
    }

    /// Azure scores are unbounded; fold them into [0, 1)
    fn normalise_score(raw: f64) -> f32 {
        let raw = raw.max(0.0);
        (raw / (1.0 + raw)) as f32
    }

    fn schema_body(schema: &IndexSchema) -> serde_json::Value {
        let fields: Vec<serde_json::Value> = schema
            .fields
            .iter()
            .map(|f| match f.kind {
                FieldKind::Key => serde_json::json!({
                    "name": f.name, "type": "Edm.String", "key": true, "filterable": true,
                }),
                FieldKind::Text => serde_json::json!({
                    "name": f.name, "type": "Edm.String",
                    "searchable": f.searchable, "filterable": f.filterable,
                }),
                FieldKind::TextCollection => serde_json::json!({
                    "name": f.name, "type": "Collection(Edm.String)",
                    "searchable": f.searchable, "filterable": f.filterable,
                }),
                FieldKind::Integer => serde_json::json!({
                    "name": f.name, "type": "Edm.Int64", "filterable": f.filterable,
                }),
                FieldKind::Double => serde_json::json!({
                    "name": f.name, "type": "Edm.Double", "filterable": f.filterable,
                }),
                FieldKind::DateTime => serde_json::json!({
                    "name": f.name, "type": "Edm.DateTimeOffset", "filterable": f.filterable,
                }),
                FieldKind::Vector => serde_json::json!({
                    "name": f.name, "type": "Collection(Edm.Single)",
                    "searchable": true,
                    "dimensions": schema.vector_dimension,
                    "vectorSearchProfile": "default-profile",
                }),
            })
            .collect();

        serde_json::json!({
            "name": schema.name,
            "fields": fields,
            "vectorSearch": {
                "algorithms": [
                    { "name": "default-hnsw", "kind": "hnsw" }
                ],
                "profiles": [
                    { "name": "default-profile", "algorithm": "default-hnsw" }
                ],
            },
            "@odata.etag": schema.schema_version,
        })
    }

    fn document_body(doc: &MotorcycleDocument) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(doc)?;
        if let Some(obj) = value.as_object_mut() {
            // The flexible key/value bag is stored as one JSON string field
            let bag = obj
                .remove("additional_properties")
                .unwrap_or(serde_json::Value::Null);
            obj.insert(
                "additional_properties".to_string(),
                serde_json::Value::String(serde_json::to_string(&bag)?),
            );
            obj.insert(
                "@search.action".to_string(),
                serde_json::Value::String("mergeOrUpload".to_string()),
            );
        }
        Ok(value)
    }

    fn filter_expression(filters: &HashMap<String, String>) -> Option<String> {
        if filters.is_empty() {
            return None;
        }
        let mut clauses: Vec<String> = filters
            .iter()
            .map(|(field, value)| format!("{} eq '{}'", field, value.replace('\'', "''")))
            .collect();
        clauses.sort();
        Some(clauses.join(" and "))
    }

    fn hit_from_row(row: serde_json::Map<String, serde_json::Value>) -> Option<IndexHit> {
        let id = row.get("id")?.as_str()?.to_string();
        let content = row
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let score = row
            .get("@search.score")
            .and_then(|v| v.as_f64())
            .map(Self::normalise_score)
            .unwrap_or(0.0);

        let title = row
            .get("title")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let section = row
            .get("section")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let page_number = row
            .get("page_number")
            .and_then(|v| v.as_u64())
            .map(|p| p as u32);
        let source_file = row
            .get("source_file")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let metadata = row
            .into_iter()
            .filter(|(k, _)| !k.starts_with("@search."))
            .collect();

        Some(IndexHit {
            id,
            title,
            content,
            score,
            section,
            page_number,
            source_file,
            metadata,
        })
    }
}

#[async_trait]
impl SearchIndex for AzureSearchClient {
    async fn ensure_index(&self, correlation: &CorrelationId, schema: &IndexSchema) -> Result<()> {
        let body = Self::schema_body(schema);
        let url = self.url(&format!("indexes/{}", schema.name));
        let policy = self.resilience.policy(policy::SEARCH_UPSERT);

        policy
            .execute(correlation, || async {
                // PUT create-or-update keeps this idempotent
                self.send(
                    self.client
                        .put(&url)
                        .header("api-key", &self.api_key)
                        .json(&body),
                )
                .await?;
                Ok(())
            })
            .await?;

        info!(
            correlation = %correlation,
            index = %schema.name,
            version = %schema.schema_version,
            "index ensured"
        );
        Ok(())
    }

    async fn upsert(
        &self,
        correlation: &CorrelationId,
        index: &str,
        documents: &[MotorcycleDocument],
    ) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        let rows: Vec<serde_json::Value> = documents
            .iter()
            .map(Self::document_body)
            .collect::<Result<_>>()?;
        let body = serde_json::json!({ "value": rows });
        let url = self.url(&format!("indexes/{}/docs/index", index));
        let policy = self.resilience.policy(policy::SEARCH_UPSERT);

        let response = policy
            .execute(correlation, || async {
                let response = self
                    .send(
                        self.client
                            .post(&url)
                            .header("api-key", &self.api_key)
                            .json(&body),
                    )
                    .await?;
                let parsed: UpsertResponse = response
                    .json()
                    .await
                    .map_err(|e| IndexError::InvalidResponse(e.to_string()))?;
                Ok(parsed)
            })
            .await?;

        let mut accepted = 0;
        for item in &response.value {
            if item.status {
                accepted += 1;
            } else {
                error!(
                    correlation = %correlation,
                    key = %item.key,
                    "document rejected: {}",
                    item.error_message.as_deref().unwrap_or("unknown")
                );
            }
        }

        if accepted == 0 {
            return Err(IndexError::UpsertFailed(format!(
                "all {} documents rejected",
                documents.len()
            ))
            .into());
        }

        debug!(
            correlation = %correlation,
            index,
            accepted,
            total = documents.len(),
            "batch upserted"
        );
        Ok(accepted)
    }

    async fn query(
        &self,
        correlation: &CorrelationId,
        index: &str,
        query: &SearchQuery,
    ) -> Result<Vec<IndexHit>> {
        let mut body = serde_json::json!({
            "search": query.text,
            "top": query.top,
        });

        if let Some(vector) = &query.vector {
            body["vectorQueries"] = serde_json::json!([{
                "kind": "vector",
                "vector": vector,
                "k": query.top,
                "fields": "content_vector",
            }]);
        }

        if let Some(filter) = Self::filter_expression(&query.filters) {
            body["filter"] = serde_json::Value::String(filter);
        }

        let url = self.url(&format!("indexes/{}/docs/search", index));
        let policy = self.resilience.policy(policy::SEARCH_QUERY);

        let response = policy
            .execute(correlation, || async {
                let response = self
                    .send(
                        self.client
                            .post(&url)
                            .header("api-key", &self.api_key)
                            .json(&body),
                    )
                    .await?;
                let parsed: QueryResponse = response
                    .json()
                    .await
                    .map_err(|e| IndexError::InvalidResponse(e.to_string()))?;
                Ok(parsed)
            })
            .await?;

        let hits: Vec<IndexHit> = response
            .value
            .into_iter()
            .filter_map(Self::hit_from_row)
            .collect();

        debug!(
            correlation = %correlation,
            index,
            hits = hits.len(),
            hybrid = query.vector.is_some(),
            "query completed"
        );
        Ok(hits)
    }

    async fn stats(&self, correlation: &CorrelationId, index: &str) -> Result<IndexStats> {
        let url = self.url(&format!("indexes/{}/stats", index));
        let policy = self.resilience.policy(policy::SEARCH_QUERY);

        let result = policy
            .execute(correlation, || async {
                let response = self
                    .send(self.client.get(&url).header("api-key", &self.api_key))
                    .await?;
                let parsed: StatsResponse = response
                    .json()
                    .await
                    .map_err(|e| IndexError::InvalidResponse(e.to_string()))?;
                Ok(parsed)
            })
            .await;

        match result {
            Ok(stats) => Ok(IndexStats {
                name: index.to_string(),
                document_count: stats.document_count,
                storage_size_bytes: stats.storage_size,
                healthy: true,
            }),
            Err(RagError::Index(IndexError::IndexNotFound(_))) => Ok(IndexStats {
                name: index.to_string(),
                document_count: 0,
                storage_size_bytes: 0,
                healthy: false,
            }),
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> bool {
        let url = self.url("indexes");
        match self
            .send(self.client.get(&url).header("api-key", &self.api_key))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!("search service health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::document::DocumentType;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(endpoint: &str) -> AzureSearchClient {
        let mut resilience_config = ResilienceConfig::default();
        resilience_config.retry.max_retries = 0;
        AzureSearchClient::new(
            endpoint.to_string(),
            "test-key".to_string(),
            &HttpClientConfig::default(),
            Arc::new(ResilienceService::from_config(&resilience_config)),
            RemoteCallGate::new(4),
        )
        .unwrap()
    }

    #[test]
    fn test_schema_families_align() {
        let csv = IndexSchema::csv("moto", 3072);
        let pdf = IndexSchema::pdf("moto", 3072);
        let unified = IndexSchema::unified("moto", 3072);

        assert_eq!(csv.name, "moto-specs");
        assert_eq!(pdf.name, "moto-manuals");
        assert_eq!(unified.name, "moto-unified");

        // The unified schema is a superset of the other two
        for schema in [&csv, &pdf] {
            for field in &schema.fields {
                assert!(
                    unified.fields.iter().any(|f| f.name == field.name),
                    "unified schema missing field {}",
                    field.name
                );
            }
        }

        // Vector dimension is versioned into the schema tag
        assert_eq!(csv.schema_version, "v1-3072");
        assert!(csv
            .fields
            .iter()
            .any(|f| f.name == "content_vector" && f.kind == FieldKind::Vector));
    }

    #[test]
    fn test_score_normalisation() {
        assert_eq!(AzureSearchClient::normalise_score(0.0), 0.0);
        let high = AzureSearchClient::normalise_score(100.0);
        assert!(high > 0.9 && high < 1.0);
        let mid = AzureSearchClient::normalise_score(1.0);
        assert!((mid - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_filter_expression_escapes_and_sorts() {
        let mut filters = HashMap::new();
        filters.insert("make".to_string(), "Honda".to_string());
        filters.insert("model".to_string(), "CBR'600".to_string());

        let expr = AzureSearchClient::filter_expression(&filters).unwrap();
        assert_eq!(expr, "make eq 'Honda' and model eq 'CBR''600'");
        assert!(AzureSearchClient::filter_expression(&HashMap::new()).is_none());
    }

    #[tokio::test]
    async fn test_query_parses_hits() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/indexes/moto-specs/docs/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    {
                        "@search.score": 3.0,
                        "id": "spec-1",
                        "title": "Honda CBR600RR",
                        "content": "Make: Honda",
                        "source_file": "specs.csv",
                    }
                ]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let correlation = CorrelationId::new();
        let query = SearchQuery {
            text: "honda".to_string(),
            vector: None,
            top: 10,
            filters: HashMap::new(),
        };

        let hits = client
            .query(&correlation, "moto-specs", &query)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "spec-1");
        assert!((hits[0].score - 0.75).abs() < 1e-6);
        assert_eq!(hits[0].source_file.as_deref(), Some("specs.csv"));
    }

    #[tokio::test]
    async fn test_upsert_counts_accepted() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/indexes/moto-specs/docs/index"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    { "key": "a", "status": true },
                    { "key": "b", "status": false, "errorMessage": "too large" },
                ]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let correlation = CorrelationId::new();
        let docs = vec![
            MotorcycleDocument::new(
                "a",
                "Doc A",
                "content long enough",
                DocumentType::Specification,
                "specs.csv",
            ),
            MotorcycleDocument::new(
                "b",
                "Doc B",
                "content long enough",
                DocumentType::Specification,
                "specs.csv",
            ),
        ];

        let accepted = client
            .upsert(&correlation, "moto-specs", &docs)
            .await
            .unwrap();
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn test_missing_index_stats_reports_unhealthy() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/indexes/moto-specs/stats"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such index"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let correlation = CorrelationId::new();

        let stats = client.stats(&correlation, "moto-specs").await.unwrap();
        assert!(!stats.healthy);
        assert_eq!(stats.document_count, 0);
    }
}
