//! CLI ingestion tool
//!
//! Processes CSV specification tables and PDF manuals into the search
//! indices.
//!
//! Usage: moto-rag-ingest [--config config.toml] FILE...
//!
//! Exit codes: 0 success, 2 validation error, 3 upstream unavailable,
//! 4 partial failure.

use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use moto_rag::config::AppConfig;
use moto_rag::document::ProcessingResult;
use moto_rag::error::ErrorKind;
use moto_rag::index::AzureSearchClient;
use moto_rag::ingestion::{CsvProcessor, CsvProcessorConfig, IndexingService, PdfProcessor, PdfProcessorConfig};
use moto_rag::layout::{DocumentIntelligenceClient, LayoutAnalyzer};
use moto_rag::llm::AzureOpenAiClient;
use moto_rag::resilience::{CorrelationId, RemoteCallGate, ResilienceService};

const EXIT_OK: u8 = 0;
const EXIT_VALIDATION: u8 = 2;
const EXIT_UPSTREAM: u8 = 3;
const EXIT_PARTIAL: u8 = 4;

const PROCESS_CALL_LIMIT: usize = 64;

struct Args {
    config_path: String,
    files: Vec<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut config_path = "config.toml".to_string();
    let mut files = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = args
                    .next()
                    .ok_or_else(|| "--config requires a path".to_string())?;
            }
            "--help" | "-h" => {
                return Err("usage: moto-rag-ingest [--config config.toml] FILE...".to_string());
            }
            other => files.push(other.to_string()),
        }
    }

    if files.is_empty() {
        return Err("no input files given".to_string());
    }

    Ok(Args { config_path, files })
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::from(EXIT_VALIDATION);
        }
    };

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("ingestion failed: {}", e);
            ExitCode::from(EXIT_VALIDATION)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<u8> {
    let config = AppConfig::from_file(&args.config_path)?;
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
        api_key.clone(),
        &config.http_clients,
        resilience.clone(),
        gate.clone(),
    )?);

    let layout: Arc<dyn LayoutAnalyzer> = Arc::new(DocumentIntelligenceClient::new(
        config.azure_ai.doc_intelligence_endpoint.clone(),
        api_key,
        &config.http_clients,
        resilience.clone(),
        gate,
    )?);

    let csv_processor = CsvProcessor::new(CsvProcessorConfig::default(), completion.clone());
    let pdf_processor =
        PdfProcessor::new(PdfProcessorConfig::default(), completion, layout);
    let indexing = IndexingService::new(index, config.search.clone());

    let correlation = CorrelationId::new();
    if let Err(e) = indexing.ensure_schemas(&correlation).await {
        error!(correlation = %correlation, "cannot prepare indices: {}", e);
        return Ok(match e.kind() {
            ErrorKind::CircuitOpen | ErrorKind::UpstreamTransient | ErrorKind::Timeout => {
                EXIT_UPSTREAM
            }
            _ => EXIT_VALIDATION,
        });
    }

    let mut exit = EXIT_OK;
    for file in &args.files {
        info!(correlation = %correlation, file = %file, "ingesting");
        let content = match tokio::fs::read(file).await {
            Ok(content) => content,
            Err(e) => {
                error!(file = %file, "cannot read file: {}", e);
                exit = exit.max(EXIT_VALIDATION);
                continue;
            }
        };

        let (result, target_index): (ProcessingResult, String) =
            if file.to_lowercase().ends_with(".csv") {
                (
                    csv_processor.process(&correlation, file, &content).await,
                    indexing.csv_index_name(),
                )
            } else if file.to_lowercase().ends_with(".pdf") {
                (
                    pdf_processor.process(&correlation, file, &content).await,
                    indexing.pdf_index_name(),
                )
            } else {
                error!(file = %file, "unsupported file type");
                exit = exit.max(EXIT_VALIDATION);
                continue;
            };

        if !result.success {
            error!(file = %file, "processing failed: {}", result.message);
            exit = exit.max(EXIT_VALIDATION);
            continue;
        }
        for issue in &result.errors {
            warn!(file = %file, "{}", issue);
        }

        let data = result.data.expect("successful result carries data");
        // Documents land in their source index and the unified index
        let unified = data.clone();
        let report = indexing
            .index_documents(&correlation, &target_index, data)
            .await;
        let unified_report = indexing
            .index_documents(&correlation, &indexing.unified_index_name(), unified)
            .await;

        for report in [&report, &unified_report] {
            info!(
                file = %file,
                index = %report.index_name,
                indexed = report.indexed,
                batches = report.total_batches,
                failed_batches = report.failed_batches,
                "indexing report"
            );
            if report.all_failed() {
                exit = exit.max(EXIT_UPSTREAM);
            } else if report.partial() {
                exit = exit.max(EXIT_PARTIAL);
            }
        }
    }

    Ok(exit)
}
