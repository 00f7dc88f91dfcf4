//! Core document model shared by ingestion and retrieval

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{RagError, Result};

/// Content length bounds enforced on every indexable document
pub const MIN_CONTENT_LEN: usize = 10;
pub const MAX_CONTENT_LEN: usize = 1_000_000;
pub const MAX_TITLE_LEN: usize = 500;

/// Kind of source a document was produced from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Specification,
    Manual,
    WebArticle,
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentType::Specification => write!(f, "specification"),
            DocumentType::Manual => write!(f, "manual"),
            DocumentType::WebArticle => write!(f, "web-article"),
        }
    }
}

/// Kind of chunk a PDF-derived document carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkType {
    Text,
    Table,
    FigureDescription,
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkType::Text => write!(f, "text"),
            ChunkType::Table => write!(f, "table"),
            ChunkType::FigureDescription => write!(f, "figure-description"),
        }
    }
}

/// A metadata value in the open-ended property bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Text(String),
    Number(f64),
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Number(v)
    }
}

impl PropertyValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            PropertyValue::Number(_) => None,
        }
    }
}

/// Atomic indexable unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorcycleDocument {
    /// Stable identity, unique within an index
    pub id: String,

    pub title: String,
    pub content: String,

    #[serde(rename = "type")]
    pub doc_type: DocumentType,

    /// Dense embedding; absent when the embedding call failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_vector: Option<Vec<f32>>,

    pub source_file: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub additional_properties: HashMap<String, PropertyValue>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MotorcycleDocument {
    /// Create a document with the mandatory fields; timestamps are set to now
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        doc_type: DocumentType,
        source_file: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            doc_type,
            content_vector: None,
            source_file: source_file.into(),
            source_url: None,
            section: None,
            page_number: None,
            author: None,
            published_date: None,
            tags: Vec::new(),
            additional_properties: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.content_vector = Some(vector);
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page_number = Some(page);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.additional_properties.insert(key.into(), value.into());
        self
    }

    /// Check the document invariants against the given schema dimension
    pub fn validate(&self, vector_dimension: usize) -> Result<()> {
        if self.id.is_empty() {
            return Err(RagError::Validation("document id is empty".to_string()));
        }

        let content_len = self.content.chars().count();
        if !(MIN_CONTENT_LEN..=MAX_CONTENT_LEN).contains(&content_len) {
            return Err(RagError::Validation(format!(
                "document {} content length {} outside [{}, {}]",
                self.id, content_len, MIN_CONTENT_LEN, MAX_CONTENT_LEN
            )));
        }

        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(RagError::Validation(format!(
                "document {} title exceeds {} characters",
                self.id, MAX_TITLE_LEN
            )));
        }

        if let Some(vector) = &self.content_vector {
            if vector.len() != vector_dimension {
                return Err(RagError::Validation(format!(
                    "document {} vector dimension {} does not match schema dimension {}",
                    self.id,
                    vector.len(),
                    vector_dimension
                )));
            }
        }

        Ok(())
    }
}

/// A processor's output for one ingestion call
#[derive(Debug, Clone)]
pub struct ProcessedData {
    /// Identifies this ingestion batch
    pub batch_id: String,

    /// Indexable documents in source order
    pub documents: Vec<MotorcycleDocument>,

    /// Free-form provenance metadata
    pub metadata: HashMap<String, String>,
}

impl ProcessedData {
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            documents: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// Outcome of one processing run, including non-fatal per-document errors
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub success: bool,
    pub data: Option<ProcessedData>,
    pub message: String,

    /// Non-fatal errors recorded along the way (skipped rows, failed embeddings)
    pub errors: Vec<String>,
}

impl ProcessingResult {
    pub fn ok(data: ProcessedData, errors: Vec<String>) -> Self {
        let message = format!("processed {} documents", data.documents.len());
        Self {
            success: true,
            data: Some(data),
            message,
            errors,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
            errors: Vec::new(),
        }
    }
}
