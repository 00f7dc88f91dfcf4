//! Indexing service: schema management, batched upserts, statistics

use std::sync::Arc;
use tracing::{info, warn};

use crate::compression::CompressedVector;
use crate::config::SearchConfig;
use crate::document::{MotorcycleDocument, ProcessedData};
use crate::error::Result;
use crate::index::{IndexSchema, IndexStats, SearchIndex};
use crate::resilience::CorrelationId;

/// Batch size bounds the heuristic clamps to
const MIN_BATCH: usize = 100;
const MAX_BATCH: usize = 1000;

/// Memory safety factor for the batch-sizing heuristic
const SAFETY_FACTOR: usize = 4;

/// Outcome of indexing one processed batch
#[derive(Debug, Clone)]
pub struct IndexingReport {
    pub index_name: String,
    pub total_documents: usize,
    pub indexed: usize,
    pub total_batches: usize,
    pub failed_batches: usize,
    pub errors: Vec<String>,
}

impl IndexingReport {
    pub fn all_failed(&self) -> bool {
        self.total_batches > 0 && self.failed_batches == self.total_batches
    }

    pub fn partial(&self) -> bool {
        self.failed_batches > 0 && !self.all_failed()
    }
}

/// Aggregate statistics across the index family
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexingStats {
    pub indexes: Vec<IndexStats>,
    pub total_documents: u64,
    pub total_storage_bytes: u64,
}

/// Owns documents from processor hand-off until successful upsert
pub struct IndexingService {
    index: Arc<dyn SearchIndex>,
    config: SearchConfig,
}

impl IndexingService {
    pub fn new(index: Arc<dyn SearchIndex>, config: SearchConfig) -> Self {
        Self { index, config }
    }

    pub fn csv_index_name(&self) -> String {
        format!("{}-specs", self.config.index_name)
    }

    pub fn pdf_index_name(&self) -> String {
        format!("{}-manuals", self.config.index_name)
    }

    pub fn unified_index_name(&self) -> String {
        format!("{}-unified", self.config.index_name)
    }

    /// Create the CSV, PDF, and unified indices if absent; idempotent
    pub async fn ensure_schemas(&self, correlation: &CorrelationId) -> Result<()> {
        let dimension = self.config.vector_dimension;
        for schema in [
            IndexSchema::csv(&self.config.index_name, dimension),
            IndexSchema::pdf(&self.config.index_name, dimension),
            IndexSchema::unified(&self.config.index_name, dimension),
        ] {
            self.index.ensure_index(correlation, &schema).await?;
        }
        Ok(())
    }

    /// Batch size from the memory heuristic, bounded to [100, 1000]
    fn batch_size_for(&self, documents: &[MotorcycleDocument]) -> usize {
        if documents.is_empty() {
            return self.config.batch_size.clamp(MIN_BATCH, MAX_BATCH);
        }

        let total_bytes: usize = documents
            .iter()
            .map(|d| {
                d.content.len() + d.title.len() + d.content_vector.as_ref().map_or(0, |v| v.len() * 4)
            })
            .sum();
        let avg_doc_bytes = (total_bytes / documents.len()).max(1);

        let heuristic =
            (self.config.available_memory_bytes / (avg_doc_bytes * SAFETY_FACTOR))
                .clamp(MIN_BATCH, MAX_BATCH);

        self.config
            .batch_size
            .clamp(MIN_BATCH, MAX_BATCH)
            .min(heuristic)
    }

    /// Upsert processed documents into the named index
    ///
    /// Batches proceed in input order; a failed batch is recorded and the
    /// remaining batches still run.
    pub async fn index_documents(
        &self,
        correlation: &CorrelationId,
        index_name: &str,
        data: ProcessedData,
    ) -> IndexingReport {
        let mut errors = Vec::new();

        // Validate against the schema dimension before anything is sent
        let mut documents: Vec<MotorcycleDocument> = Vec::with_capacity(data.documents.len());
        for document in data.documents {
            match document.validate(self.config.vector_dimension) {
                Ok(()) => documents.push(document),
                Err(e) => {
                    warn!(correlation = %correlation, "dropping invalid document: {}", e);
                    errors.push(e.to_string());
                }
            }
        }

        if self.config.enable_vector_compression {
            for document in &mut documents {
                if let Some(vector) = &document.content_vector {
                    let archive = CompressedVector::compress(vector).to_base64();
                    document
                        .additional_properties
                        .insert("vector_archive".to_string(), archive.into());
                }
            }
        }

        let total_documents = documents.len();
        let batch_size = self.batch_size_for(&documents);
        let batches: Vec<&[MotorcycleDocument]> = documents.chunks(batch_size).collect();
        let total_batches = batches.len();

        let mut indexed = 0;
        let mut failed_batches = 0;
        for (i, batch) in batches.into_iter().enumerate() {
            match self.index.upsert(correlation, index_name, batch).await {
                Ok(accepted) => {
                    indexed += accepted;
                    info!(
                        correlation = %correlation,
                        index = index_name,
                        batch = i + 1,
                        total_batches,
                        accepted,
                        "batch indexed"
                    );
                }
                Err(e) => {
                    failed_batches += 1;
                    warn!(
                        correlation = %correlation,
                        index = index_name,
                        batch = i + 1,
                        "batch failed: {}",
                        e
                    );
                    errors.push(format!("batch {} failed: {}", i + 1, e));
                }
            }
        }

        IndexingReport {
            index_name: index_name.to_string(),
            total_documents,
            indexed,
            total_batches,
            failed_batches,
            errors,
        }
    }

    /// Per-index and aggregate statistics
    pub async fn stats(&self, correlation: &CorrelationId) -> Result<IndexingStats> {
        let mut indexes = Vec::new();
        for name in [
            self.csv_index_name(),
            self.pdf_index_name(),
            self.unified_index_name(),
        ] {
            indexes.push(self.index.stats(correlation, &name).await?);
        }

        let total_documents = indexes.iter().map(|s| s.document_count).sum();
        let total_storage_bytes = indexes.iter().map(|s| s.storage_size_bytes).sum();

        Ok(IndexingStats {
            indexes,
            total_documents,
            total_storage_bytes,
        })
    }
}
