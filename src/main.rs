use anyhow::{Context, Error};
use clap::Parser;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use docq::breaker::BreakerConfig;
use docq::config::ProcessorConfig;
use docq::db::DbHandle;
use docq::extract::{CommandBackend, ToolConfig};
use docq::retry::RetryPolicy;
use docq::server::Processor;
use docq::store::{DocumentStore, MemoryStore};
use docq::{telemetry, NewDocument};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Extract text from documents in the background")]
pub struct ConfigContext {
    #[arg(
        short = 'c',
        long = "connect_url",
        env = "DATABASE_URL",
        help = "PostgreSQL Connection URL; documents are kept in memory when unset"
    )]
    connect_url: Option<String>,

    #[arg(
        short = 'n',
        long = "number_active",
        help = "Number of workers extracting in parallel",
        default_value = "3"
    )]
    num: u16,

    #[arg(long, help = "Retries after a transient failure", default_value = "3")]
    max_retries: u32,

    #[arg(long, help = "Backoff before the first retry, doubled each time", default_value = "1000")]
    base_delay_ms: u64,

    #[arg(long, help = "Consecutive failures that open the circuit breaker", default_value = "5")]
    failure_threshold: u32,

    #[arg(long, help = "Seconds the circuit breaker stays open", default_value = "30")]
    cooldown_secs: u64,

    #[arg(long, help = "Timeout for a single extraction call in seconds", default_value = "60")]
    attempt_timeout_secs: u64,

    #[arg(long, help = "Native text shorter than this falls back to OCR", default_value = "16")]
    min_text_chars: usize,

    #[arg(long, default_value = "pdftotext")]
    pdftotext: String,

    #[arg(long, default_value = "pdfinfo")]
    pdfinfo: String,

    #[arg(long, default_value = "pdftoppm")]
    pdftoppm: String,

    #[arg(long, default_value = "tesseract")]
    tesseract: String,

    #[arg(long, default_value = "pandoc")]
    pandoc: String,

    #[arg(long, help = "Tesseract language", default_value = "eng")]
    ocr_language: String,

    #[arg(long, help = "Pages of an image-only PDF to OCR", default_value = "5")]
    max_ocr_pages: u32,

    #[arg(long, help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces")]
    jaeger_endpoint: Option<String>,

    #[arg(required = true, help = "Documents to process (pdf, png, jpg, docx, txt)")]
    files: Vec<PathBuf>,
}

impl ConfigContext {
    fn processor(&self) -> ProcessorConfig {
        ProcessorConfig {
            workers: self.num,
            retry: RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms)),
            breaker: BreakerConfig {
                failure_threshold: self.failure_threshold,
                cooldown: Duration::from_secs(self.cooldown_secs),
            },
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
            min_text_chars: self.min_text_chars,
        }
    }

    fn tools(&self) -> ToolConfig {
        ToolConfig {
            pdftotext: self.pdftotext.clone(),
            pdfinfo: self.pdfinfo.clone(),
            pdftoppm: self.pdftoppm.clone(),
            tesseract: self.tesseract.clone(),
            pandoc: self.pandoc.clone(),
            language: self.ocr_language.clone(),
            max_ocr_pages: self.max_ocr_pages,
            ..ToolConfig::default()
        }
    }
}

async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let store: Arc<dyn DocumentStore> = match &config.connect_url {
        Some(url) => Arc::new(DbHandle::new(url, u32::from(config.num) + 2).await?),
        None => Arc::new(MemoryStore::new()),
    };
    let backend = Arc::new(CommandBackend::new(config.tools()));

    let (processor, mut recv_from_server) = Processor::start(&config.processor(), store, backend);

    let mut uploaded = vec![];
    let mut pending = HashSet::new();
    for path in &config.files {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        match NewDocument::new(file_name, content) {
            Ok(new) => {
                let document = processor.upload(new).await?;
                info!(event = "Uploaded", document_id = %document.id, file = %path.display());
                pending.insert(document.id);
                uploaded.push(document.id);
            }
            Err(err) => error!(message = "Rejected upload", file = %path.display(), error = %err),
        }
    }

    debug!("Done submitting documents");
    while !pending.is_empty() {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Processing Cancelled");
                break;
            },
            server_response = recv_from_server.recv() => {
                match server_response {
                    Some(msg) => {
                        info!(event = "Message", msg = ?msg);
                        if msg.is_settled() {
                            pending.remove(&msg.document_id());
                        }
                    },
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        break;
                    }
                }
            }
        }
    }

    println!("Waiting for workers to shutdown...");
    processor.shutdown().await?;

    for id in uploaded {
        let document = processor.store().get_document(id).await?;
        match (&document.error_message, document.confidence_score) {
            (Some(err), _) => println!("{}: {} ({})", document.file_name, document.status, err),
            (None, Some(confidence)) => println!(
                "{}: {} (confidence {:.2}, {} chars)",
                document.file_name,
                document.status,
                confidence,
                document.raw_text.as_deref().unwrap_or_default().chars().count()
            ),
            (None, None) => println!("{}: {}", document.file_name, document.status),
        }
        if !document.status.is_terminal() {
            warn!(document_id = %id, status = %document.status, "Document left unfinished");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "docq=DEBUG");
    }

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token).instrument(info_span!("docq")));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(err), _) | (_, Err(err)) => {
                    error!(message = "Failed to install signal handlers", error = %err);
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
