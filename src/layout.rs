//! Document layout extraction
//!
//! Wraps the remote layout analysis service behind the `LayoutAnalyzer`
//! capability. A local text-only extractor serves as the registered fallback
//! for the `docintel.analyze` policy when the remote service is down.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::HttpClientConfig;
use crate::error::{classify_status, LayoutError, RagError, Result};
use crate::resilience::{policy, CorrelationId, RemoteCallGate, ResilienceService};

const API_VERSION: &str = "2024-02-29-preview";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Structural role of a paragraph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParagraphRole {
    Title,
    Heading,
    Body,
}

/// One paragraph of extracted text
#[derive(Debug, Clone)]
pub struct LayoutParagraph {
    pub content: String,
    pub role: ParagraphRole,
    pub page: u32,
}

/// One extracted table as a row-major cell grid
#[derive(Debug, Clone)]
pub struct LayoutTable {
    pub page: u32,
    pub cells: Vec<Vec<String>>,
}

/// One figure/image region
#[derive(Debug, Clone)]
pub struct LayoutFigure {
    pub page: u32,
    pub caption: Option<String>,
    /// PNG crop of the region; empty when the service cannot supply one
    pub image: Vec<u8>,
}

/// Extracted structure of one document
#[derive(Debug, Clone, Default)]
pub struct DocumentLayout {
    pub page_count: u32,
    /// Paragraphs in reading order
    pub paragraphs: Vec<LayoutParagraph>,
    pub tables: Vec<LayoutTable>,
    pub figures: Vec<LayoutFigure>,
}

/// Capability interface for layout extraction
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LayoutAnalyzer: Send + Sync {
    /// Extract text, page, and table structure from a binary PDF
    async fn analyze(&self, correlation: &CorrelationId, pdf: &[u8]) -> Result<DocumentLayout>;
}

/// REST client for the document layout service
pub struct DocumentIntelligenceClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    resilience: Arc<ResilienceService>,
    gate: RemoteCallGate,
    request_timeout: Duration,
    /// Local text-only extraction when the remote analyzer gives up
    enable_local_fallback: bool,
}

#[derive(Debug, Deserialize)]
struct AnalyzeOperation {
    status: String,
    #[serde(rename = "analyzeResult")]
    analyze_result: Option<AnalyzeResult>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResult {
    #[serde(default)]
    pages: Vec<RemotePage>,
    #[serde(default)]
    paragraphs: Vec<RemoteParagraph>,
    #[serde(default)]
    tables: Vec<RemoteTable>,
    #[serde(default)]
    figures: Vec<RemoteFigure>,
}

#[derive(Debug, Deserialize)]
struct RemotePage {
    #[serde(rename = "pageNumber")]
    #[allow(dead_code)]
    page_number: u32,
}

#[derive(Debug, Deserialize)]
struct RemoteParagraph {
    content: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default, rename = "boundingRegions")]
    bounding_regions: Vec<RemoteRegion>,
}

#[derive(Debug, Deserialize)]
struct RemoteRegion {
    #[serde(rename = "pageNumber")]
    page_number: u32,
}

#[derive(Debug, Deserialize)]
struct RemoteTable {
    #[serde(rename = "rowCount")]
    row_count: usize,
    #[serde(rename = "columnCount")]
    column_count: usize,
    #[serde(default)]
    cells: Vec<RemoteCell>,
    #[serde(default, rename = "boundingRegions")]
    bounding_regions: Vec<RemoteRegion>,
}

#[derive(Debug, Deserialize)]
struct RemoteCell {
    #[serde(rename = "rowIndex")]
    row_index: usize,
    #[serde(rename = "columnIndex")]
    column_index: usize,
    content: String,
}

#[derive(Debug, Deserialize)]
struct RemoteFigure {
    #[serde(default)]
    caption: Option<RemoteCaption>,
    #[serde(default, rename = "boundingRegions")]
    bounding_regions: Vec<RemoteRegion>,
}

#[derive(Debug, Deserialize)]
struct RemoteCaption {
    content: String,
}

impl DocumentIntelligenceClient {
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
            enable_local_fallback: true,
        })
    }

    async fn submit(&self, pdf: &[u8]) -> Result<String> {
        let url = format!(
            "{}/documentintelligence/documentModels/prebuilt-layout:analyze?api-version={}",
            self.endpoint, API_VERSION
        );

        let response = timeout(
            self.request_timeout,
            self.client
                .post(&url)
                .header("api-key", &self.api_key)
                .header("content-type", "application/pdf")
                .body(pdf.to_vec())
                .send(),
        )
        .await
        .map_err(|_| RagError::Timeout("layout submission timed out".to_string()))?
        .map_err(|e| LayoutError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            error!("layout service error {}: {}", status, message);
            return Err(classify_status(
                status,
                message,
                None,
                |_| LayoutError::ServerError {
                    status: 429,
                    message: "rate limited".to_string(),
                },
                |s, m| LayoutError::ServerError { status: s, message: m },
                |s, m| LayoutError::Rejected { status: s, message: m },
            )
            .into());
        }

        response
            .headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                LayoutError::InvalidResponse("missing operation-location header".to_string()).into()
            })
    }

    async fn poll(&self, operation_url: &str) -> Result<AnalyzeResult> {
        let deadline = tokio::time::Instant::now() + self.request_timeout;

        loop {
            let response = self
                .client
                .get(operation_url)
                .header("api-key", &self.api_key)
                .send()
                .await
                .map_err(|e| LayoutError::ConnectionFailed(e.to_string()))?;

            let operation: AnalyzeOperation = response
                .json()
                .await
                .map_err(|e| LayoutError::InvalidResponse(e.to_string()))?;

            match operation.status.as_str() {
                "succeeded" => {
                    return operation.analyze_result.ok_or_else(|| {
                        LayoutError::InvalidResponse("succeeded without result".to_string()).into()
                    });
                }
                "failed" => {
                    let detail = operation
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    return Err(LayoutError::AnalysisFailed(detail).into());
                }
                _ => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(
                            RagError::Timeout("layout analysis did not complete".to_string())
                        );
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    fn convert(result: AnalyzeResult) -> DocumentLayout {
        let paragraphs = result
            .paragraphs
            .into_iter()
            .map(|p| {
                let role = match p.role.as_deref() {
                    Some("title") => ParagraphRole::Title,
                    Some("sectionHeading") => ParagraphRole::Heading,
                    _ => ParagraphRole::Body,
                };
                let page = p
                    .bounding_regions
                    .first()
                    .map(|r| r.page_number)
                    .unwrap_or(1);
                LayoutParagraph {
                    content: p.content,
                    role,
                    page,
                }
            })
            .collect();

        let tables = result
            .tables
            .into_iter()
            .map(|t| {
                let mut cells = vec![vec![String::new(); t.column_count]; t.row_count];
                for cell in t.cells {
                    if cell.row_index < t.row_count && cell.column_index < t.column_count {
                        cells[cell.row_index][cell.column_index] = cell.content;
                    }
                }
                let page = t
                    .bounding_regions
                    .first()
                    .map(|r| r.page_number)
                    .unwrap_or(1);
                LayoutTable { page, cells }
            })
            .collect();

        let figures = result
            .figures
            .into_iter()
            .map(|f| LayoutFigure {
                page: f
                    .bounding_regions
                    .first()
                    .map(|r| r.page_number)
                    .unwrap_or(1),
                caption: f.caption.map(|c| c.content),
                image: Vec::new(),
            })
            .collect();

        DocumentLayout {
            page_count: result.pages.len() as u32,
            paragraphs,
            tables,
            figures,
        }
    }
}

#[async_trait]
impl LayoutAnalyzer for DocumentIntelligenceClient {
    async fn analyze(&self, correlation: &CorrelationId, pdf: &[u8]) -> Result<DocumentLayout> {
        if pdf.is_empty() {
            return Err(LayoutError::UnsupportedDocument("empty document".to_string()).into());
        }

        let policy = self.resilience.policy(policy::DOCINTEL_ANALYZE);
        let remote = policy.execute(correlation, || async {
            let _permit = self.gate.acquire().await;
            let operation_url = self.submit(pdf).await?;
            let result = self.poll(&operation_url).await?;
            Ok(Self::convert(result))
        });

        match remote.await {
            Ok(layout) => {
                info!(
                    correlation = %correlation,
                    pages = layout.page_count,
                    paragraphs = layout.paragraphs.len(),
                    tables = layout.tables.len(),
                    "layout extracted"
                );
                Ok(layout)
            }
            Err(e) if self.enable_local_fallback => {
                warn!(
                    correlation = %correlation,
                    error = %e,
                    "remote layout analysis gave up, extracting text locally"
                );
                local_text_layout(pdf).await
            }
            Err(e) => Err(e),
        }
    }
}

/// Text-only extraction with no remote dependency
///
/// Produces body paragraphs split on blank lines. Page attribution and
/// tables are unavailable in this mode.
pub async fn local_text_layout(pdf: &[u8]) -> Result<DocumentLayout> {
    let bytes = pdf.to_vec();
    let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| RagError::Internal(format!("extraction task failed: {}", e)))?
        .map_err(|e| LayoutError::UnsupportedDocument(e.to_string()))?;

    let paragraphs: Vec<LayoutParagraph> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| LayoutParagraph {
            content: p.to_string(),
            role: ParagraphRole::Body,
            page: 1,
        })
        .collect();

    debug!("local extraction produced {} paragraphs", paragraphs.len());
    Ok(DocumentLayout {
        page_count: 1,
        paragraphs,
        tables: Vec::new(),
        figures: Vec::new(),
    })
}

/// A layout analyzer that never touches the network; used by the ingest
/// tool when the layout endpoint is not configured
pub struct LocalPdfExtractor;

#[async_trait]
impl LayoutAnalyzer for LocalPdfExtractor {
    async fn analyze(&self, _correlation: &CorrelationId, pdf: &[u8]) -> Result<DocumentLayout> {
        if pdf.is_empty() {
            return Err(LayoutError::UnsupportedDocument("empty document".to_string()).into());
        }
        local_text_layout(pdf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_builds_table_grid() {
        let result = AnalyzeResult {
            pages: vec![RemotePage { page_number: 1 }],
            paragraphs: vec![
                RemoteParagraph {
                    content: "Maintenance".to_string(),
                    role: Some("sectionHeading".to_string()),
                    bounding_regions: vec![RemoteRegion { page_number: 1 }],
                },
                RemoteParagraph {
                    content: "Change the oil every 12,000 km.".to_string(),
                    role: None,
                    bounding_regions: vec![RemoteRegion { page_number: 1 }],
                },
            ],
            tables: vec![RemoteTable {
                row_count: 2,
                column_count: 2,
                cells: vec![
                    RemoteCell {
                        row_index: 0,
                        column_index: 0,
                        content: "Item".to_string(),
                    },
                    RemoteCell {
                        row_index: 0,
                        column_index: 1,
                        content: "Interval".to_string(),
                    },
                    RemoteCell {
                        row_index: 1,
                        column_index: 0,
                        content: "Oil".to_string(),
                    },
                    RemoteCell {
                        row_index: 1,
                        column_index: 1,
                        content: "12,000 km".to_string(),
                    },
                ],
                bounding_regions: vec![RemoteRegion { page_number: 2 }],
            }],
            figures: vec![],
        };

        let layout = DocumentIntelligenceClient::convert(result);
        assert_eq!(layout.page_count, 1);
        assert_eq!(layout.paragraphs.len(), 2);
        assert_eq!(layout.paragraphs[0].role, ParagraphRole::Heading);
        assert_eq!(layout.tables.len(), 1);
        assert_eq!(layout.tables[0].page, 2);
        assert_eq!(layout.tables[0].cells[1][1], "12,000 km");
    }

    #[test]
    fn test_convert_defaults_missing_regions() {
        let result = AnalyzeResult {
            pages: vec![],
            paragraphs: vec![RemoteParagraph {
                content: "orphan paragraph".to_string(),
                role: None,
                bounding_regions: vec![],
            }],
            tables: vec![],
            figures: vec![],
        };

        let layout = DocumentIntelligenceClient::convert(result);
        assert_eq!(layout.paragraphs[0].page, 1);
        assert_eq!(layout.paragraphs[0].role, ParagraphRole::Body);
    }

    #[tokio::test]
    async fn test_local_extractor_rejects_empty() {
        let correlation = CorrelationId::new();
        let result = LocalPdfExtractor.analyze(&correlation, &[]).await;
        assert!(result.is_err());
    }
}
