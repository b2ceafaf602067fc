use crate::store::{DocumentStore, StatusUpdate, StoreError};
use crate::{Document, DocumentId, LogAction, NewDocument, ProcessingLogEntry, Status};
use anyhow::Error;
use async_trait::async_trait;
use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, PgExecutor};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

const DOCUMENT_COLUMNS: &str = "id, file_name, format, file_size, content, status, raw_text, \
    confidence_score, pages, error_message, created_at, updated_at";

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip_all)]
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }
}

async fn insert_log<'e>(
    executor: impl PgExecutor<'e>,
    entry: &ProcessingLogEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO processing_logs \
        (id, document_id, action, status, details, created_at) \
        VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(Uuid::new_v4())
    .bind(entry.document_id)
    .bind(entry.action.as_str())
    .bind(entry.status)
    .bind(&entry.details)
    .bind(entry.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait]
impl DocumentStore for DbHandle {
    #[instrument(name = "db.create_document", skip_all, fields(file_name = %new.file_name))]
    async fn create_document(&self, new: NewDocument) -> Result<Document, StoreError> {
        let document = Document::new(new);
        debug!(document_id = %document.id, "Inserting document");

        // The document and its `created` entry land together or not at all.
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO documents \
            (id, file_name, format, file_size, content, status, created_at, updated_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(document.id)
        .bind(&document.file_name)
        .bind(document.format)
        .bind(document.file_size)
        .bind(&document.content)
        .bind(document.status)
        .bind(document.created_at)
        .bind(document.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_log(
            &mut *tx,
            &ProcessingLogEntry::new(
                document.id,
                LogAction::Created,
                Status::Pending,
                json!({ "file_name": document.file_name, "file_size": document.file_size }),
            ),
        )
        .await?;

        tx.commit().await?;
        Ok(document)
    }

    #[instrument(name = "db.get_document", skip_all, fields(document_id = %id))]
    async fn get_document(&self, id: DocumentId) -> Result<Document, StoreError> {
        sqlx::query_as::<_, Document>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))
    }

    /// The row is locked while the transition is checked, so concurrent
    /// writers for one document are serialized here.
    #[instrument(name = "db.update_status", skip_all, fields(document_id = %id, status = %status))]
    async fn update_status(
        &self,
        id: DocumentId,
        status: Status,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_scalar::<_, Status>(
            "SELECT status FROM documents WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        if !current.can_transition_to(status) {
            return Err(StoreError::Conflict {
                id,
                from: current,
                to: status,
            });
        }

        sqlx::query(
            "UPDATE documents \
                SET status = $2, \
                raw_text = COALESCE($3, raw_text), \
                confidence_score = COALESCE($4, confidence_score), \
                pages = COALESCE($5, pages), \
                error_message = $6, \
                updated_at = now() \
            WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(update.raw_text)
        .bind(update.confidence_score)
        .bind(update.pages)
        .bind(update.error_message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn append_log(&self, entry: ProcessingLogEntry) -> Result<(), StoreError> {
        insert_log(&*self.pool, &entry).await
    }
}
