//! CSV specification processor
//!
//! Parses delimited specification tables, chunks rows while preserving the
//! relational identity of a motorcycle, and emits embedded indexable
//! documents.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::document::{DocumentType, MotorcycleDocument, ProcessedData, ProcessingResult};
use crate::error::ErrorKind;
use crate::llm::CompletionService;
use crate::resilience::CorrelationId;

/// Hard ceiling on column count; files beyond it are rejected
pub const MAX_COLUMNS: usize = 150;

/// How rows are grouped into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    /// One chunk per identifier tuple; spec rows of one motorcycle stay together
    Grouped,
    /// Chunks of consecutive rows
    FixedSize,
}

/// Configuration for the CSV processor
#[derive(Debug, Clone)]
pub struct CsvProcessorConfig {
    /// Field delimiter
    pub delimiter: u8,

    /// Header presence; `None` detects it from the first row
    pub has_header_row: Option<bool>,

    /// Identifier fields for grouped chunking, matched case-insensitively
    pub group_by: Vec<String>,

    /// Preserve relational integrity (grouped mode) or chunk by size
    pub preserve_relational_integrity: bool,

    /// Rows per chunk in fixed-size mode
    pub chunk_size: usize,

    /// Rows processed per file; the rest are dropped
    pub max_rows: usize,
}

impl Default for CsvProcessorConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header_row: None,
            group_by: vec![
                "Make".to_string(),
                "Model".to_string(),
                "Year".to_string(),
            ],
            preserve_relational_integrity: true,
            chunk_size: 50,
            max_rows: 10_000,
        }
    }
}

impl CsvProcessorConfig {
    pub fn chunk_mode(&self) -> ChunkMode {
        if self.preserve_relational_integrity {
            ChunkMode::Grouped
        } else {
            ChunkMode::FixedSize
        }
    }
}

/// CSV specification processor
pub struct CsvProcessor {
    config: CsvProcessorConfig,
    completion: Arc<dyn CompletionService>,
}

struct ParsedTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    skipped: Vec<String>,
}

impl CsvProcessor {
    pub fn new(config: CsvProcessorConfig, completion: Arc<dyn CompletionService>) -> Self {
        Self { config, completion }
    }

    /// Process one delimited file into embedded indexable documents
    pub async fn process(
        &self,
        correlation: &CorrelationId,
        file_name: &str,
        content: &[u8],
    ) -> ProcessingResult {
        let text = String::from_utf8_lossy(content);

        let table = match self.parse(&text) {
            Ok(table) => table,
            Err(message) => {
                warn!(correlation = %correlation, file = file_name, "{}", message);
                return ProcessingResult::failure(message);
            }
        };

        let mut errors = table.skipped.clone();
        let mut rows = table.rows;
        if rows.len() > self.config.max_rows {
            warn!(
                correlation = %correlation,
                file = file_name,
                dropped = rows.len() - self.config.max_rows,
                "row cap reached"
            );
            rows.truncate(self.config.max_rows);
        }

        let chunks = match self.config.chunk_mode() {
            ChunkMode::Grouped => self.group_rows(&table.headers, rows),
            ChunkMode::FixedSize => self.fixed_chunks(rows),
        };

        let mut data = ProcessedData::new(format!("csv-{}", correlation));
        data.metadata
            .insert("source_file".to_string(), file_name.to_string());
        data.metadata
            .insert("columns".to_string(), table.headers.join(","));

        let mut row_cursor = 0usize;
        for (chunk_index, chunk) in chunks.into_iter().enumerate() {
            let row_range = (row_cursor, row_cursor + chunk.rows.len());
            row_cursor += chunk.rows.len();

            let document = self.synthesise_document(
                file_name,
                &table.headers,
                chunk,
                chunk_index,
                row_range,
            );
            data.documents.push(document);
        }

        data.metadata
            .insert("row_count".to_string(), row_cursor.to_string());

        // Embed each document; individual failures leave the document
        // without a vector and are recorded for the caller.
        for document in &mut data.documents {
            match self.completion.embed(correlation, &document.content).await {
                Ok(vector) => document.content_vector = Some(vector),
                Err(e) if e.kind() == ErrorKind::CircuitOpen => {
                    return ProcessingResult::failure(format!(
                        "embedding service unavailable: {}",
                        e
                    ));
                }
                Err(e) => {
                    warn!(
                        correlation = %correlation,
                        document = %document.id,
                        "embedding failed: {}",
                        e
                    );
                    errors.push(format!("embedding failed for {}: {}", document.id, e));
                }
            }
        }

        info!(
            correlation = %correlation,
            file = file_name,
            documents = data.documents.len(),
            skipped_rows = errors.len(),
            "csv file processed"
        );
        ProcessingResult::ok(data, errors)
    }

    fn parse(&self, text: &str) -> std::result::Result<ParsedTable, String> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.config.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut records: Vec<Vec<String>> = Vec::new();
        for record in reader.records() {
            match record {
                Ok(record) => {
                    records.push(record.iter().map(|f| f.trim().to_string()).collect())
                }
                Err(e) => return Err(format!("unreadable delimited data: {}", e)),
            }
        }

        if records.is_empty() {
            return Err("file contains no rows".to_string());
        }

        let has_header = self
            .config
            .has_header_row
            .unwrap_or_else(|| Self::looks_like_header(&records[0]));

        let (headers, data_rows) = if has_header {
            let headers = records.remove(0);
            (headers, records)
        } else {
            // Synthesise Column1..N when no header row is present
            let width = records.iter().map(|r| r.len()).max().unwrap_or(0);
            let headers = (1..=width).map(|i| format!("Column{}", i)).collect();
            (headers, records)
        };

        if headers.len() > MAX_COLUMNS {
            return Err(format!(
                "file has {} columns, maximum is {}",
                headers.len(),
                MAX_COLUMNS
            ));
        }

        if data_rows.is_empty() {
            return Err("file contains no data rows".to_string());
        }

        // Skip malformed rows; abort only when nothing survives
        let mut rows = Vec::with_capacity(data_rows.len());
        let mut skipped = Vec::new();
        for (i, row) in data_rows.into_iter().enumerate() {
            if row.len() == headers.len() {
                rows.push(row);
            } else {
                debug!(
                    "skipping row {}: {} fields, expected {}",
                    i + 1,
                    row.len(),
                    headers.len()
                );
                skipped.push(format!(
                    "row {} skipped: {} fields, expected {}",
                    i + 1,
                    row.len(),
                    headers.len()
                ));
            }
        }

        if rows.is_empty() {
            return Err("all rows are malformed".to_string());
        }

        Ok(ParsedTable {
            headers,
            rows,
            skipped,
        })
    }

    /// A row whose every field parses as a number is data, not a header
    fn looks_like_header(row: &[String]) -> bool {
        !row.iter().all(|field| field.parse::<f64>().is_ok())
            && row.iter().any(|field| field.parse::<f64>().is_err())
    }

    fn group_rows(&self, headers: &[String], rows: Vec<Vec<String>>) -> Vec<RowChunk> {
        let key_indices: Vec<usize> = self
            .config
            .group_by
            .iter()
            .filter_map(|name| {
                headers
                    .iter()
                    .position(|h| h.eq_ignore_ascii_case(name))
            })
            .collect();

        if key_indices.is_empty() {
            debug!("no identifier columns found, falling back to fixed-size chunks");
            return self.fixed_chunks(rows);
        }

        // Group while preserving first-appearance order
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<Vec<String>>> = HashMap::new();
        for row in rows {
            let key = key_indices
                .iter()
                .map(|&i| row.get(i).map(String::as_str).unwrap_or(""))
                .collect::<Vec<_>>()
                .join(" ");
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(row);
        }

        order
            .into_iter()
            .map(|key| RowChunk {
                title: key.clone(),
                rows: groups.remove(&key).unwrap_or_default(),
            })
            .collect()
    }

    fn fixed_chunks(&self, rows: Vec<Vec<String>>) -> Vec<RowChunk> {
        let size = self.config.chunk_size.max(1);
        rows.chunks(size)
            .enumerate()
            .map(|(i, chunk)| RowChunk {
                title: format!("rows {}", i + 1),
                rows: chunk.to_vec(),
            })
            .collect()
    }

    /// Canonical serialisation: `key: value` lines per row, column order
    /// preserved, rows separated by a blank line
    fn synthesise_document(
        &self,
        file_name: &str,
        headers: &[String],
        chunk: RowChunk,
        chunk_index: usize,
        row_range: (usize, usize),
    ) -> MotorcycleDocument {
        let mut content = String::new();
        for (i, row) in chunk.rows.iter().enumerate() {
            if i > 0 {
                content.push('\n');
            }
            for (header, value) in headers.iter().zip(row.iter()) {
                content.push_str(header);
                content.push_str(": ");
                content.push_str(value);
                content.push('\n');
            }
        }

        let stem = file_name
            .rsplit('/')
            .next()
            .unwrap_or(file_name)
            .trim_end_matches(".csv");
        let id = format!("{}-{}", slugify(stem), slugify(&chunk.title));

        let title = if chunk.title.trim().is_empty() {
            format!("{} chunk {}", stem, chunk_index + 1)
        } else {
            chunk.title.clone()
        };

        MotorcycleDocument::new(id, title, content, DocumentType::Specification, file_name)
            .with_property("columns", headers.join(","))
            .with_property("row_start", row_range.0 as f64)
            .with_property("row_end", row_range.1 as f64)
    }
}

struct RowChunk {
    title: String,
    rows: Vec<Vec<String>>,
}

/// Lowercase alphanumeric identifier fragment
pub(crate) fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut last_dash = true;
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}
