//! Extraction backends: one attempt to pull text out of a document.
//!
//! [`CommandBackend`] shells out to the usual command-line tools:
//! - pdftotext (poppler-utils) for PDFs with a text layer
//! - pdfinfo + pdftoppm + tesseract to OCR image-only PDFs
//! - tesseract for PNG/JPEG scans
//! - pandoc for DOCX

use crate::retry::FailureClass;
use crate::DocumentFormat;
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unsupported input: {0}")]
    Unsupported(String),

    #[error("corrupt input: {0}")]
    Corrupt(String),

    #[error("extraction backend unavailable: {0}")]
    Unavailable(String),

    #[error("extraction backend overloaded: {0}")]
    Overloaded(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ExtractionError {
    pub fn class(&self) -> FailureClass {
        match self {
            ExtractionError::Unsupported(_) | ExtractionError::Corrupt(_) => {
                FailureClass::Permanent
            }
            ExtractionError::Unavailable(_)
            | ExtractionError::Overloaded(_)
            | ExtractionError::Io(_) => FailureClass::Transient,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub text: String,
    /// Confidence score in `[0.0, 1.0]`.
    pub confidence: f64,
    pub pages: Option<u32>,
}

impl Extraction {
    /// Text pulled from a native text layer is taken at face value.
    pub fn native(text: impl Into<String>) -> Self {
        Extraction {
            text: text.into(),
            confidence: 1.0,
            pages: None,
        }
    }

    pub fn recognized(text: impl Into<String>, confidence: f64) -> Self {
        Extraction {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            pages: None,
        }
    }

    pub fn with_pages(self, pages: u32) -> Self {
        Extraction {
            pages: Some(pages),
            ..self
        }
    }
}

/// A single extraction attempt. Callers bound every call with a timeout, so
/// implementations must be cancel-safe.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    async fn extract_native(
        &self,
        content: &[u8],
        format: DocumentFormat,
    ) -> Result<Extraction, ExtractionError>;

    async fn recognize_image(
        &self,
        content: &[u8],
        format: DocumentFormat,
    ) -> Result<Extraction, ExtractionError>;
}

#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub pdftotext: String,
    pub pdfinfo: String,
    pub pdftoppm: String,
    pub tesseract: String,
    pub pandoc: String,
    /// Tesseract language, e.g. "eng".
    pub language: String,
    pub max_ocr_pages: u32,
    pub ocr_dpi: u32,
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            pdftotext: "pdftotext".to_string(),
            pdfinfo: "pdfinfo".to_string(),
            pdftoppm: "pdftoppm".to_string(),
            tesseract: "tesseract".to_string(),
            pandoc: "pandoc".to_string(),
            language: "eng".to_string(),
            max_ocr_pages: 5,
            ocr_dpi: 150,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandBackend {
    config: ToolConfig,
}

impl CommandBackend {
    pub fn new(config: ToolConfig) -> Self {
        CommandBackend { config }
    }

    async fn tesseract(&self, image: &[u8]) -> Result<Extraction, ExtractionError> {
        let tsv = run_tool(
            &self.config.tesseract,
            &["stdin", "stdout", "-l", &self.config.language, "tsv"],
            image,
        )
        .await?;
        Ok(parse_tesseract_tsv(&String::from_utf8_lossy(&tsv)))
    }

    async fn page_count(&self, pdf: &[u8]) -> Result<u32, ExtractionError> {
        let info = run_tool(&self.config.pdfinfo, &["-"], pdf).await?;
        parse_page_count(&String::from_utf8_lossy(&info))
            .ok_or_else(|| ExtractionError::Corrupt("pdfinfo reported no page count".into()))
    }

    async fn ocr_pdf(&self, pdf: &[u8]) -> Result<Extraction, ExtractionError> {
        let page_count = self.page_count(pdf).await?;
        if page_count == 0 {
            return Err(ExtractionError::Corrupt("pdf has no pages".into()));
        }

        let dpi = self.config.ocr_dpi.to_string();
        let last_page = page_count.min(self.config.max_ocr_pages.max(1));
        let mut pages = Vec::new();

        for page in 1..=last_page {
            let page_arg = page.to_string();
            let image = run_tool(
                &self.config.pdftoppm,
                &[
                    "-png",
                    "-r",
                    &dpi,
                    "-f",
                    &page_arg,
                    "-l",
                    &page_arg,
                    "-singlefile",
                    "-",
                ],
                pdf,
            )
            .await?;
            if image.is_empty() {
                return Err(ExtractionError::Corrupt(format!(
                    "pdftoppm rendered nothing for page {page}"
                )));
            }

            trace!(page, bytes = image.len(), "Rasterized pdf page");
            pages.push(self.tesseract(&image).await?);
        }

        if last_page < page_count {
            debug!(page_count, last_page, "Skipping pages past the OCR limit");
        }

        let confidence = pages.iter().map(|p| p.confidence).sum::<f64>() / pages.len() as f64;
        let text = pages
            .into_iter()
            .map(|p| p.text)
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(Extraction::recognized(text, confidence).with_pages(page_count))
    }
}

#[async_trait]
impl ExtractionBackend for CommandBackend {
    async fn extract_native(
        &self,
        content: &[u8],
        format: DocumentFormat,
    ) -> Result<Extraction, ExtractionError> {
        match format {
            DocumentFormat::Txt => {
                let text = std::str::from_utf8(content)
                    .map_err(|e| ExtractionError::Corrupt(format!("invalid utf-8: {e}")))?;
                Ok(Extraction::native(text))
            }
            DocumentFormat::Pdf => {
                let text = run_tool(&self.config.pdftotext, &["-layout", "-", "-"], content).await?;
                let text = String::from_utf8_lossy(&text);
                // pdftotext ends every page with a form feed.
                let pages = text.matches('\x0c').count() as u32;
                Ok(Extraction::native(text).with_pages(pages))
            }
            DocumentFormat::Docx => {
                let text =
                    run_tool(&self.config.pandoc, &["-f", "docx", "-t", "plain"], content).await?;
                Ok(Extraction::native(String::from_utf8_lossy(&text)))
            }
            DocumentFormat::Png | DocumentFormat::Jpg => Err(ExtractionError::Unsupported(
                format!("{format} has no native text layer"),
            )),
        }
    }

    async fn recognize_image(
        &self,
        content: &[u8],
        format: DocumentFormat,
    ) -> Result<Extraction, ExtractionError> {
        match format {
            DocumentFormat::Png | DocumentFormat::Jpg => {
                self.tesseract(content).await.map(|e| e.with_pages(1))
            }
            DocumentFormat::Pdf => self.ocr_pdf(content).await,
            DocumentFormat::Docx | DocumentFormat::Txt => Err(ExtractionError::Unsupported(
                format!("{format} cannot be recognized as an image"),
            )),
        }
    }
}

/// Run `program` with `input` on stdin and return its stdout. The child is
/// killed if the returned future is dropped.
async fn run_tool(program: &str, args: &[&str], input: &[u8]) -> Result<Vec<u8>, ExtractionError> {
    debug!(program, ?args, input_bytes = input.len(), "Running extraction tool");

    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ExtractionError::Unavailable(format!("{program} not found")));
        }
        Err(e) => return Err(e.into()),
    };

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stdin not captured"))?;

    let (written, output) = tokio::join!(write_input(stdin, input), child.wait_with_output());
    let output = output?;

    // Killed by a signal: a crash or OOM kill, not a verdict on the input.
    if output.status.code().is_none() {
        return Err(ExtractionError::Unavailable(format!(
            "{program} terminated abnormally ({})",
            output.status
        )));
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExtractionError::Corrupt(format!(
            "{program} failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }

    // Tools may stop reading once they have what they need.
    if let Err(e) = written {
        if e.kind() != io::ErrorKind::BrokenPipe {
            return Err(e.into());
        }
    }

    Ok(output.stdout)
}

async fn write_input(mut stdin: ChildStdin, input: &[u8]) -> io::Result<()> {
    stdin.write_all(input).await?;
    stdin.shutdown().await
}

/// Read the `Pages:` line of `pdfinfo` output.
pub fn parse_page_count(info: &str) -> Option<u32> {
    info.lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|count| count.trim().parse().ok())
}

/// Turn tesseract's `tsv` output into text plus the mean word confidence.
///
/// Columns: level, page_num, block_num, par_num, line_num, word_num, left,
/// top, width, height, conf, text. Only level 5 rows are words.
pub fn parse_tesseract_tsv(tsv: &str) -> Extraction {
    let mut text = String::new();
    let mut current_line = None;
    let mut total = 0.0;
    let mut words = 0usize;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let word = cols[11].trim();
        let conf: f64 = match cols[10].parse() {
            Ok(conf) if conf >= 0.0 => conf,
            _ => continue,
        };
        if word.is_empty() {
            continue;
        }

        let line = (cols[1], cols[2], cols[3], cols[4]);
        match current_line {
            Some(prev) if prev == line => text.push(' '),
            Some(_) => text.push('\n'),
            None => {}
        }
        current_line = Some(line);
        text.push_str(word);

        total += conf;
        words += 1;
    }

    let confidence = if words == 0 {
        0.0
    } else {
        total / words as f64 / 100.0
    };
    Extraction::recognized(text, confidence)
}
