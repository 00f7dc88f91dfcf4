//! PDF manual processor
//!
//! Extracts structure through the layout service, segments the text into
//! semantically coherent chunks, describes figures through the vision model,
//! and emits embedded indexable documents with citation metadata.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::document::{ChunkType, DocumentType, MotorcycleDocument, ProcessedData, ProcessingResult};
use crate::error::ErrorKind;
use crate::layout::{DocumentLayout, LayoutAnalyzer, ParagraphRole};
use crate::llm::{cosine_similarity, CompletionService};
use crate::resilience::CorrelationId;

/// Rough token estimate: four characters per token
fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Configuration for the PDF processor
#[derive(Debug, Clone)]
pub struct PdfProcessorConfig {
    /// Adjacent chunks at or above this cosine similarity are merged
    pub merge_threshold: f32,

    /// Adjacent chunks below this cosine similarity are re-split at the
    /// best sentence boundary
    pub split_threshold: f32,

    /// Target chunk length band, in tokens
    pub min_chunk_tokens: usize,
    pub max_chunk_tokens: usize,

    /// Hard ceiling no chunk may exceed
    pub hard_max_tokens: usize,

    /// Describe figure regions through the vision model
    pub describe_figures: bool,
}

impl Default for PdfProcessorConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.82,
            split_threshold: 0.35,
            min_chunk_tokens: 400,
            max_chunk_tokens: 1200,
            hard_max_tokens: 2000,
            describe_figures: true,
        }
    }
}

/// A chunk candidate before document synthesis
#[derive(Debug, Clone)]
struct ChunkCandidate {
    text: String,
    chunk_type: ChunkType,
    section: Option<String>,
    page: u32,
}

/// PDF manual processor
pub struct PdfProcessor {
    config: PdfProcessorConfig,
    completion: Arc<dyn CompletionService>,
    layout: Arc<dyn LayoutAnalyzer>,
}

impl PdfProcessor {
    pub fn new(
        config: PdfProcessorConfig,
        completion: Arc<dyn CompletionService>,
        layout: Arc<dyn LayoutAnalyzer>,
    ) -> Self {
        Self {
            config,
            completion,
            layout,
        }
    }

    /// Process one PDF into embedded indexable documents
    pub async fn process(
        &self,
        correlation: &CorrelationId,
        file_name: &str,
        pdf: &[u8],
    ) -> ProcessingResult {
        let layout = match self.layout.analyze(correlation, pdf).await {
            Ok(layout) => layout,
            Err(e) => {
                warn!(correlation = %correlation, file = file_name, "layout extraction failed: {}", e);
                return ProcessingResult::failure(format!("layout extraction failed: {}", e));
            }
        };

        let mut errors = Vec::new();

        let mut candidates = self.structural_candidates(&layout);
        candidates = self
            .refine_boundaries(correlation, candidates, &mut errors)
            .await;
        candidates.extend(Self::table_candidates(&layout));

        if self.config.describe_figures {
            let described = self
                .describe_figures(correlation, &layout, &mut errors)
                .await;
            candidates.extend(described);
        }

        if candidates.is_empty() {
            return ProcessingResult::failure("document produced no chunks".to_string());
        }

        let mut data = ProcessedData::new(format!("pdf-{}", correlation));
        data.metadata
            .insert("source_file".to_string(), file_name.to_string());
        data.metadata
            .insert("page_count".to_string(), layout.page_count.to_string());

        let mut used_ids = HashSet::new();
        for (ordinal, candidate) in candidates.into_iter().enumerate() {
            let document =
                Self::synthesise_document(file_name, candidate, ordinal, &mut used_ids);
            data.documents.push(document);
        }

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
            "pdf file processed"
        );
        ProcessingResult::ok(data, errors)
    }

    /// Split on structural boundaries: headings and page breaks
    fn structural_candidates(&self, layout: &DocumentLayout) -> Vec<ChunkCandidate> {
        let mut candidates = Vec::new();
        let mut current = String::new();
        let mut current_section: Option<String> = None;
        let mut current_page = 1u32;
        let mut seen_any = false;

        let mut flush =
            |text: &mut String, section: &Option<String>, page: u32, out: &mut Vec<ChunkCandidate>| {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    out.push(ChunkCandidate {
                        text: trimmed.to_string(),
                        chunk_type: ChunkType::Text,
                        section: section.clone(),
                        page,
                    });
                }
                text.clear();
            };

        for paragraph in &layout.paragraphs {
            let is_boundary = matches!(
                paragraph.role,
                ParagraphRole::Heading | ParagraphRole::Title
            ) || (seen_any && paragraph.page != current_page);

            if is_boundary {
                flush(&mut current, &current_section, current_page, &mut candidates);
                if matches!(paragraph.role, ParagraphRole::Heading | ParagraphRole::Title) {
                    current_section = Some(paragraph.content.trim().to_string());
                }
                current_page = paragraph.page;
            }

            if paragraph.role == ParagraphRole::Body {
                if !current.is_empty() {
                    current.push('\n');
                }
                current.push_str(&paragraph.content);
            }
            seen_any = true;
        }
        flush(&mut current, &current_section, current_page, &mut candidates);

        debug!("structural pass produced {} candidates", candidates.len());
        candidates
    }

    /// Embedding-similarity boundary refinement
    ///
    /// Merges adjacent candidates above the merge threshold, then re-splits
    /// the ones below the split threshold at the sentence boundary with the
    /// highest cohesion score. A hard token ceiling is enforced last.
    async fn refine_boundaries(
        &self,
        correlation: &CorrelationId,
        candidates: Vec<ChunkCandidate>,
        errors: &mut Vec<String>,
    ) -> Vec<ChunkCandidate> {
        if candidates.len() < 2 {
            return self.enforce_hard_max(candidates);
        }

        let texts: Vec<String> = candidates
            .iter()
            .map(|c| c.text.chars().take(2048).collect())
            .collect();

        let embeddings = match self.completion.embed_batch(correlation, &texts).await {
            Ok(embeddings) => Some(embeddings),
            Err(e) => {
                warn!(
                    correlation = %correlation,
                    "boundary refinement skipped, embedding failed: {}",
                    e
                );
                errors.push(format!("boundary refinement skipped: {}", e));
                None
            }
        };

        let refined = match embeddings {
            None => candidates,
            Some(embeddings) => {
                let mut merged: Vec<(ChunkCandidate, Vec<f32>)> = Vec::new();
                for (candidate, embedding) in candidates.into_iter().zip(embeddings) {
                    let mergeable = merged.last().is_some_and(|(last, last_embedding)| {
                        cosine_similarity(last_embedding, &embedding)
                            >= self.config.merge_threshold
                            && estimate_tokens(&last.text) + estimate_tokens(&candidate.text)
                                <= self.config.max_chunk_tokens
                    });
                    if mergeable {
                        // The merged chunk keeps the earlier embedding as
                        // its representative for later comparisons
                        if let Some((last, _)) = merged.last_mut() {
                            last.text.push('\n');
                            last.text.push_str(&candidate.text);
                        }
                    } else {
                        merged.push((candidate, embedding));
                    }
                }

                let mut out = Vec::with_capacity(merged.len());
                let mut iter = merged.into_iter().peekable();
                while let Some((candidate, embedding)) = iter.next() {
                    let dissimilar_neighbour = iter
                        .peek()
                        .map(|(_, next_embedding)| {
                            cosine_similarity(&embedding, next_embedding)
                                < self.config.split_threshold
                        })
                        .unwrap_or(false);

                    if dissimilar_neighbour
                        && estimate_tokens(&candidate.text) > self.config.min_chunk_tokens
                    {
                        let (left, right) = split_at_best_boundary(&candidate.text);
                        if let Some(right) = right {
                            out.push(ChunkCandidate {
                                text: left,
                                ..candidate.clone()
                            });
                            out.push(ChunkCandidate {
                                text: right,
                                ..candidate
                            });
                            continue;
                        }
                        out.push(ChunkCandidate {
                            text: left,
                            ..candidate
                        });
                        continue;
                    }
                    out.push(candidate);
                }
                out
            }
        };

        self.enforce_hard_max(refined)
    }

    /// Split any chunk exceeding the hard ceiling at sentence boundaries
    fn enforce_hard_max(&self, candidates: Vec<ChunkCandidate>) -> Vec<ChunkCandidate> {
        let mut out = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if estimate_tokens(&candidate.text) <= self.config.hard_max_tokens {
                out.push(candidate);
                continue;
            }

            let budget = self.config.hard_max_tokens * 4;
            let mut piece = String::new();
            for sentence in split_sentences(&candidate.text) {
                if !piece.is_empty() && piece.len() + sentence.len() > budget {
                    out.push(ChunkCandidate {
                        text: piece.trim().to_string(),
                        ..candidate.clone()
                    });
                    piece = String::new();
                }
                piece.push_str(sentence);
            }
            if !piece.trim().is_empty() {
                out.push(ChunkCandidate {
                    text: piece.trim().to_string(),
                    ..candidate
                });
            }
        }
        out
    }

    /// Serialise each table as a stable tab-separated chunk
    fn table_candidates(layout: &DocumentLayout) -> Vec<ChunkCandidate> {
        layout
            .tables
            .iter()
            .filter(|t| !t.cells.is_empty())
            .map(|table| {
                let text = table
                    .cells
                    .iter()
                    .map(|row| row.join("\t"))
                    .collect::<Vec<_>>()
                    .join("\n");
                ChunkCandidate {
                    text,
                    chunk_type: ChunkType::Table,
                    section: None,
                    page: table.page,
                }
            })
            .collect()
    }

    /// Obtain a textual description for each figure region
    async fn describe_figures(
        &self,
        correlation: &CorrelationId,
        layout: &DocumentLayout,
        errors: &mut Vec<String>,
    ) -> Vec<ChunkCandidate> {
        let mut candidates = Vec::new();

        for (i, figure) in layout.figures.iter().enumerate() {
            let description = if figure.image.is_empty() {
                // No crop available; the caption is the only signal
                figure.caption.clone()
            } else {
                let prompt = match &figure.caption {
                    Some(caption) => format!(
                        "Describe this figure from a motorcycle manual. Caption: {}",
                        caption
                    ),
                    None => "Describe this figure from a motorcycle manual.".to_string(),
                };
                match self
                    .completion
                    .describe_image(correlation, &prompt, &figure.image)
                    .await
                {
                    Ok(description) => Some(description),
                    Err(e) => {
                        warn!(
                            correlation = %correlation,
                            figure = i,
                            "figure description failed: {}",
                            e
                        );
                        errors.push(format!("figure {} description failed: {}", i, e));
                        figure.caption.clone()
                    }
                }
            };

            if let Some(description) = description {
                candidates.push(ChunkCandidate {
                    text: description,
                    chunk_type: ChunkType::FigureDescription,
                    section: figure.caption.clone(),
                    page: figure.page,
                });
            }
        }

        candidates
    }

    fn synthesise_document(
        file_name: &str,
        candidate: ChunkCandidate,
        ordinal: usize,
        used_ids: &mut HashSet<String>,
    ) -> MotorcycleDocument {
        let stem = file_name
            .rsplit('/')
            .next()
            .unwrap_or(file_name)
            .trim_end_matches(".pdf");

        let mut id = format!("{}-p{}-{}", super::csv::slugify(stem), candidate.page, ordinal);
        while !used_ids.insert(id.clone()) {
            id.push('x');
        }

        let title = match &candidate.section {
            Some(section) => format!("{} - {}", stem, section),
            None => format!("{} page {}", stem, candidate.page),
        };

        let mut document = MotorcycleDocument::new(
            id,
            title,
            candidate.text,
            DocumentType::Manual,
            file_name,
        )
        .with_page(candidate.page)
        .with_property("chunk_type", candidate.chunk_type.to_string())
        .with_property("ordinal", ordinal as f64);

        if let Some(section) = candidate.section {
            document = document.with_section(section);
        }
        document
    }
}

/// Split text into sentences, keeping terminators attached
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        if (b == b'.' || b == b'!' || b == b'?' || b == b'\n')
            && bytes.get(i + 1).map_or(true, |&n| n == b' ' || n == b'\n')
        {
            let end = i + 1;
            if end > start {
                sentences.push(&text[start..end]);
            }
            start = end;
        }
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

/// Find the sentence boundary with the highest cohesion score
///
/// The score favours splits whose two sides share few content words while
/// staying reasonably balanced in length.
fn split_at_best_boundary(text: &str) -> (String, Option<String>) {
    let sentences = split_sentences(text);
    if sentences.len() < 2 {
        return (text.to_string(), None);
    }

    let word_sets: Vec<HashSet<&str>> = sentences
        .iter()
        .map(|s| {
            s.split_whitespace()
                .filter(|w| w.len() > 3)
                .collect::<HashSet<&str>>()
        })
        .collect();

    let mut best_index = sentences.len() / 2;
    let mut best_score = f32::MIN;

    for split in 1..sentences.len() {
        let left: HashSet<&str> = word_sets[..split].iter().flatten().copied().collect();
        let right: HashSet<&str> = word_sets[split..].iter().flatten().copied().collect();

        let intersection = left.intersection(&right).count() as f32;
        let union = left.union(&right).count().max(1) as f32;
        let separation = 1.0 - intersection / union;

        let balance = {
            let left_len: usize = sentences[..split].iter().map(|s| s.len()).sum();
            let ratio = left_len as f32 / text.len().max(1) as f32;
            1.0 - (ratio - 0.5).abs() * 2.0
        };

        let score = separation * 0.7 + balance * 0.3;
        if score > best_score {
            best_score = score;
            best_index = split;
        }
    }

    let left: String = sentences[..best_index].concat().trim().to_string();
    let right: String = sentences[best_index..].concat().trim().to_string();
    if right.is_empty() {
        (left, None)
    } else {
        (left, Some(right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LayoutFigure, LayoutParagraph, LayoutTable, MockLayoutAnalyzer};
    use crate::llm::MockCompletionService;

    fn manual_layout() -> DocumentLayout {
        DocumentLayout {
            page_count: 2,
            paragraphs: vec![
                LayoutParagraph {
                    content: "Engine Maintenance".to_string(),
                    role: ParagraphRole::Heading,
                    page: 1,
                },
                LayoutParagraph {
                    content: "Change the engine oil every 12,000 km or once a year."
                        .to_string(),
                    role: ParagraphRole::Body,
                    page: 1,
                },
                LayoutParagraph {
                    content: "Brake System".to_string(),
                    role: ParagraphRole::Heading,
                    page: 2,
                },
                LayoutParagraph {
                    content: "Inspect brake pads for wear before every ride.".to_string(),
                    role: ParagraphRole::Body,
                    page: 2,
                },
            ],
            tables: vec![LayoutTable {
                page: 2,
                cells: vec![
                    vec!["Item".to_string(), "Interval".to_string()],
                    vec!["Oil".to_string(), "12,000 km".to_string()],
                ],
            }],
            figures: vec![LayoutFigure {
                page: 1,
                caption: Some("Oil drain plug location".to_string()),
                image: vec![1, 2, 3],
            }],
        }
    }

    fn processor_with(
        layout: DocumentLayout,
        completion: MockCompletionService,
    ) -> PdfProcessor {
        let mut analyzer = MockLayoutAnalyzer::new();
        analyzer
            .expect_analyze()
            .returning(move |_, _| Ok(layout.clone()));
        PdfProcessor::new(
            PdfProcessorConfig::default(),
            Arc::new(completion),
            Arc::new(analyzer),
        )
    }

    fn orthogonal_embeddings(texts: &[String]) -> Vec<Vec<f32>> {
        // Distinct basis vectors keep every pair below any split threshold
        texts
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let mut v = vec![0.0; texts.len().max(2)];
                v[i] = 1.0;
                v
            })
            .collect()
    }

    #[tokio::test]
    async fn test_structure_aware_chunks_with_citations() {
        let mut completion = MockCompletionService::new();
        completion
            .expect_embed_batch()
            .returning(|_, texts| Ok(orthogonal_embeddings(texts)));
        completion
            .expect_embed()
            .returning(|_, _| Ok(vec![0.5, 0.5]));
        completion
            .expect_describe_image()
            .returning(|_, _, _| Ok("Arrow pointing at the oil drain plug.".to_string()));

        let processor = processor_with(manual_layout(), completion);
        let correlation = CorrelationId::new();

        let result = processor
            .process(&correlation, "owners_manual.pdf", b"%PDF-fake")
            .await;

        assert!(result.success, "{}", result.message);
        let data = result.data.unwrap();

        let engine = data
            .documents
            .iter()
            .find(|d| d.content.contains("engine oil"))
            .expect("engine chunk missing");
        assert_eq!(engine.section.as_deref(), Some("Engine Maintenance"));
        assert_eq!(engine.page_number, Some(1));
        assert_eq!(
            engine.additional_properties.get("chunk_type").unwrap(),
            &crate::document::PropertyValue::Text("text".to_string())
        );

        let table = data
            .documents
            .iter()
            .find(|d| {
                d.additional_properties.get("chunk_type")
                    == Some(&crate::document::PropertyValue::Text("table".to_string()))
            })
            .expect("table chunk missing");
        assert!(table.content.contains("Oil\t12,000 km"));

        let figure = data
            .documents
            .iter()
            .find(|d| {
                d.additional_properties.get("chunk_type")
                    == Some(&crate::document::PropertyValue::Text(
                        "figure-description".to_string(),
                    ))
            })
            .expect("figure chunk missing");
        assert!(figure.content.contains("drain plug"));
        assert_eq!(figure.page_number, Some(1));
    }

    #[tokio::test]
    async fn test_similar_neighbours_merge() {
        let layout = DocumentLayout {
            page_count: 1,
            paragraphs: vec![
                LayoutParagraph {
                    content: "Check the chain tension weekly.".to_string(),
                    role: ParagraphRole::Body,
                    page: 1,
                },
                LayoutParagraph {
                    content: "Section".to_string(),
                    role: ParagraphRole::Heading,
                    page: 1,
                },
                LayoutParagraph {
                    content: "Lubricate the chain after riding in rain.".to_string(),
                    role: ParagraphRole::Body,
                    page: 1,
                },
            ],
            tables: vec![],
            figures: vec![],
        };

        let mut completion = MockCompletionService::new();
        // Identical embeddings put every adjacent pair above merge_threshold
        completion
            .expect_embed_batch()
            .returning(|_, texts| Ok(vec![vec![1.0, 0.0]; texts.len()]));
        completion
            .expect_embed()
            .returning(|_, _| Ok(vec![0.5, 0.5]));

        let mut processor = processor_with(layout, completion);
        processor.config.describe_figures = false;
        let correlation = CorrelationId::new();

        let result = processor
            .process(&correlation, "manual.pdf", b"%PDF-fake")
            .await;

        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data.documents.len(), 1, "similar chunks should merge");
        assert!(data.documents[0].content.contains("chain tension"));
        assert!(data.documents[0].content.contains("Lubricate"));
    }

    #[tokio::test]
    async fn test_refinement_skipped_on_embedding_failure() {
        let mut completion = MockCompletionService::new();
        completion.expect_embed_batch().returning(|_, _| {
            Err(crate::error::RagError::Llm(
                crate::error::LlmError::ConnectionFailed("refused".to_string()),
            ))
        });
        completion
            .expect_embed()
            .returning(|_, _| Ok(vec![0.5, 0.5]));
        completion
            .expect_describe_image()
            .returning(|_, _, _| Ok("figure".to_string()));

        let processor = processor_with(manual_layout(), completion);
        let correlation = CorrelationId::new();

        let result = processor
            .process(&correlation, "manual.pdf", b"%PDF-fake")
            .await;

        assert!(result.success);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("boundary refinement skipped")));
    }

    #[tokio::test]
    async fn test_figure_description_failure_falls_back_to_caption() {
        let mut completion = MockCompletionService::new();
        completion
            .expect_embed_batch()
            .returning(|_, texts| Ok(orthogonal_embeddings(texts)));
        completion
            .expect_embed()
            .returning(|_, _| Ok(vec![0.5, 0.5]));
        completion.expect_describe_image().returning(|_, _, _| {
            Err(crate::error::RagError::Llm(
                crate::error::LlmError::GenerationFailed("vision refused".to_string()),
            ))
        });

        let processor = processor_with(manual_layout(), completion);
        let correlation = CorrelationId::new();

        let result = processor
            .process(&correlation, "manual.pdf", b"%PDF-fake")
            .await;

        assert!(result.success);
        let data = result.data.unwrap();
        let figure = data
            .documents
            .iter()
            .find(|d| d.content.contains("drain plug location"))
            .expect("caption fallback missing");
        assert_eq!(figure.page_number, Some(1));
        assert!(result.errors.iter().any(|e| e.contains("description failed")));
    }

    #[test]
    fn test_hard_max_enforced() {
        let config = PdfProcessorConfig {
            hard_max_tokens: 20,
            ..Default::default()
        };
        let completion = MockCompletionService::new();
        let analyzer = MockLayoutAnalyzer::new();
        let processor =
            PdfProcessor::new(config, Arc::new(completion), Arc::new(analyzer));

        let long_text = "This is a sentence about motorcycles. ".repeat(20);
        let candidates = vec![ChunkCandidate {
            text: long_text,
            chunk_type: ChunkType::Text,
            section: None,
            page: 1,
        }];

        let pieces = processor.enforce_hard_max(candidates);
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(estimate_tokens(&piece.text) <= 20 + 10, "piece too long");
        }
    }

    #[test]
    fn test_split_at_best_boundary_separates_topics() {
        let text = "The engine requires synthetic oil. The engine oil filter sits below. \
                    Brake fluid should be replaced yearly. Brake pads wear with use.";
        let (left, right) = split_at_best_boundary(text);
        let right = right.expect("expected a split");

        assert!(left.contains("engine"));
        assert!(right.contains("Brake"));
        assert!(!left.contains("Brake fluid"));
    }

    #[test]
    fn test_split_single_sentence_returns_whole() {
        let (left, right) = split_at_best_boundary("Only one sentence here.");
        assert!(right.is_none());
        assert_eq!(left, "Only one sentence here.");
    }

    #[test]
    fn test_sentence_splitting() {
        let sentences = split_sentences("First one. Second one! Third?");
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0].trim(), "First one.");
        assert_eq!(sentences[2].trim(), "Third?");
    }
}
