use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

pub mod breaker;
pub mod config;
pub mod db;
pub mod extract;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod worker;

use pipeline::Strategy;

pub type DocumentId = Uuid;

/// Uploads above this size are rejected before a record is created.
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(type_name = "document_status_enum", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    /// Statuses only move forward along `pending -> processing -> completed | failed`.
    /// Re-entering `processing` is allowed so a retried job can claim its document again.
    pub fn can_transition_to(&self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Pending, Status::Processing)
                | (Status::Processing, Status::Processing)
                | (Status::Processing, Status::Completed)
                | (Status::Processing, Status::Failed)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(type_name = "document_format_enum", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Png,
    Jpg,
    Docx,
    Txt,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Png => "png",
            DocumentFormat::Jpg => "jpg",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Txt => "txt",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "png" => Some(DocumentFormat::Png),
            "jpg" | "jpeg" => Some(DocumentFormat::Jpg),
            "docx" => Some(DocumentFormat::Docx),
            "txt" => Some(DocumentFormat::Txt),
            _ => None,
        }
    }

    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let (_, ext) = file_name.rsplit_once('.')?;
        Self::from_extension(ext)
    }

    /// Extraction strategies to try for this format, in order.
    pub fn plan(&self) -> &'static [Strategy] {
        match self {
            DocumentFormat::Pdf => &[Strategy::Native, Strategy::Ocr],
            DocumentFormat::Png | DocumentFormat::Jpg => &[Strategy::Ocr],
            DocumentFormat::Docx | DocumentFormat::Txt => &[Strategy::Native],
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("unsupported file type {0:?}, allowed: pdf, png, jpg, docx, txt")]
    UnsupportedType(String),

    #[error("file too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },
}

/// A validated upload, not yet stored.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub file_name: String,
    pub format: DocumentFormat,
    pub content: Vec<u8>,
}

impl NewDocument {
    pub fn new(file_name: impl Into<String>, content: Vec<u8>) -> Result<Self, UploadError> {
        let file_name = file_name.into();
        let format = DocumentFormat::from_file_name(&file_name)
            .ok_or_else(|| UploadError::UnsupportedType(file_name.clone()))?;

        if content.len() > MAX_FILE_SIZE {
            return Err(UploadError::TooLarge {
                size: content.len(),
                max: MAX_FILE_SIZE,
            });
        }

        Ok(NewDocument {
            file_name,
            format,
            content,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Document {
    pub id: DocumentId,
    pub file_name: String,
    pub format: DocumentFormat,
    pub file_size: i64,
    pub content: Vec<u8>,
    pub status: Status,
    pub raw_text: Option<String>,
    pub confidence_score: Option<f64>,
    pub pages: Option<i32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(new: NewDocument) -> Self {
        let now = Utc::now();
        Document {
            id: Uuid::new_v4(),
            file_name: new.file_name,
            format: new.format,
            file_size: new.content.len() as i64,
            content: new.content,
            status: Status::Pending,
            raw_text: None,
            confidence_score: None,
            pages: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One pending extraction task. Lives only in the in-process queue.
#[derive(Debug, Clone)]
pub struct Job {
    pub document_id: DocumentId,
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub next_attempt_at: Instant,
}

impl Job {
    pub fn new(document_id: DocumentId) -> Self {
        Job {
            document_id,
            attempt_count: 0,
            enqueued_at: Utc::now(),
            next_attempt_at: Instant::now(),
        }
    }

    pub fn retry_after(self, delay: Duration) -> Self {
        Job {
            enqueued_at: Utc::now(),
            next_attempt_at: Instant::now() + delay,
            ..self
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.next_attempt_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Created,
    ExtractionAttempt,
    RetryScheduled,
    CircuitOpen,
    Completed,
    Failed,
    Dropped,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Created => "created",
            LogAction::ExtractionAttempt => "extraction_attempt",
            LogAction::RetryScheduled => "retry_scheduled",
            LogAction::CircuitOpen => "circuit_open",
            LogAction::Completed => "completed",
            LogAction::Failed => "failed",
            LogAction::Dropped => "dropped",
        }
    }
}

impl fmt::Display for LogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit row, one per worker decision point.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingLogEntry {
    pub document_id: DocumentId,
    pub action: LogAction,
    pub status: Status,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ProcessingLogEntry {
    pub fn new(
        document_id: DocumentId,
        action: LogAction,
        status: Status,
        details: serde_json::Value,
    ) -> Self {
        ProcessingLogEntry {
            document_id,
            action,
            status,
            details,
            created_at: Utc::now(),
        }
    }
}
