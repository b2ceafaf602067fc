//! Document state store: where document status, results and the processing
//! log live. The pipeline only relies on the [`DocumentStore`] trait.

use crate::{Document, DocumentId, LogAction, NewDocument, ProcessingLogEntry, Status};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    NotFound(DocumentId),

    #[error("document {id} cannot move from {from} to {to}")]
    Conflict {
        id: DocumentId,
        from: Status,
        to: Status,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Fields written together with a status change. `None` leaves the stored
/// value untouched, except `error_message` which is always overwritten.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub raw_text: Option<String>,
    pub confidence_score: Option<f64>,
    pub pages: Option<i32>,
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn completed(raw_text: String, confidence_score: f64, pages: Option<u32>) -> Self {
        StatusUpdate {
            raw_text: Some(raw_text),
            confidence_score: Some(confidence_score),
            pages: pages.and_then(|p| i32::try_from(p).ok()),
            error_message: None,
        }
    }

    pub fn failed(error_message: String) -> Self {
        StatusUpdate {
            error_message: Some(error_message),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document in `pending` and log its creation.
    async fn create_document(&self, new: NewDocument) -> Result<Document, StoreError>;

    async fn get_document(&self, id: DocumentId) -> Result<Document, StoreError>;

    /// Move a document to `status`. Fails with `Conflict` when the move would
    /// leave a terminal state or go backwards.
    async fn update_status(
        &self,
        id: DocumentId,
        status: Status,
        update: StatusUpdate,
    ) -> Result<(), StoreError>;

    async fn append_log(&self, entry: ProcessingLogEntry) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: HashMap<DocumentId, Document>,
    history: HashMap<DocumentId, Vec<Status>>,
    logs: Vec<ProcessingLogEntry>,
}

/// In-process store. Used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log entries for one document, oldest first.
    pub fn logs(&self, id: DocumentId) -> Vec<ProcessingLogEntry> {
        self.lock()
            .logs
            .iter()
            .filter(|entry| entry.document_id == id)
            .cloned()
            .collect()
    }

    /// Every distinct status the document has been in, in order.
    pub fn status_history(&self, id: DocumentId) -> Vec<Status> {
        self.lock().history.get(&id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_document(&self, new: NewDocument) -> Result<Document, StoreError> {
        let document = Document::new(new);
        let mut state = self.lock();
        state.history.insert(document.id, vec![Status::Pending]);
        state.logs.push(ProcessingLogEntry::new(
            document.id,
            LogAction::Created,
            Status::Pending,
            json!({ "file_name": document.file_name, "file_size": document.file_size }),
        ));
        state.documents.insert(document.id, document.clone());
        Ok(document)
    }

    async fn get_document(&self, id: DocumentId) -> Result<Document, StoreError> {
        self.lock()
            .documents
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_status(
        &self,
        id: DocumentId,
        status: Status,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let document = state
            .documents
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;

        if !document.status.can_transition_to(status) {
            return Err(StoreError::Conflict {
                id,
                from: document.status,
                to: status,
            });
        }

        let changed = document.status != status;
        document.status = status;
        if update.raw_text.is_some() {
            document.raw_text = update.raw_text;
        }
        if update.confidence_score.is_some() {
            document.confidence_score = update.confidence_score;
        }
        if update.pages.is_some() {
            document.pages = update.pages;
        }
        document.error_message = update.error_message;
        document.updated_at = Utc::now();

        if changed {
            state.history.entry(id).or_default().push(status);
        }
        Ok(())
    }

    async fn append_log(&self, entry: ProcessingLogEntry) -> Result<(), StoreError> {
        self.lock().logs.push(entry);
        Ok(())
    }
}
