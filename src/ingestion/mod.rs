//! Ingestion pipeline: processors and the indexing service

pub mod csv;
pub mod indexer;
pub mod pdf;

pub use csv::{ChunkMode, CsvProcessor, CsvProcessorConfig};
pub use indexer::{IndexingReport, IndexingService, IndexingStats};
pub use pdf::{PdfProcessor, PdfProcessorConfig};
