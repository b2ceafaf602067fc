use crate::pipeline::{AttemptError, Extracted, Pipeline};
use crate::queue::JobQueue;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{DocumentStore, StatusUpdate, StoreError};
use crate::{Document, DocumentId, Job, LogAction, ProcessingLogEntry, Status};
use futures::FutureExt;
use serde_json::json;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::*;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkMessage {
    JobCompleted(DocumentId),
    JobRetrying {
        document_id: DocumentId,
        attempt: u32,
        delay: Duration,
    },
    JobFailed(DocumentId, String),
    /// The job was abandoned without a terminal status, e.g. on a store error.
    JobDropped(DocumentId, String),
}

impl WorkMessage {
    pub fn document_id(&self) -> DocumentId {
        match self {
            WorkMessage::JobCompleted(id)
            | WorkMessage::JobFailed(id, _)
            | WorkMessage::JobDropped(id, _) => *id,
            WorkMessage::JobRetrying { document_id, .. } => *document_id,
        }
    }

    /// No further work is scheduled for this document.
    pub fn is_settled(&self) -> bool {
        !matches!(self, WorkMessage::JobRetrying { .. })
    }
}

/// State shared by all workers of one pool.
pub struct WorkerContext {
    pub(crate) queue: JobQueue,
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) pipeline: Pipeline,
    pub(crate) retry: RetryPolicy,
    in_flight: Mutex<HashSet<DocumentId>>,
}

impl WorkerContext {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        pipeline: Pipeline,
        retry: RetryPolicy,
    ) -> Self {
        WorkerContext {
            queue: JobQueue::new(),
            store,
            pipeline,
            retry,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Mark `id` in flight. False if a job for it is already queued or running.
    pub(crate) fn claim(&self, id: DocumentId) -> bool {
        self.in_flight().insert(id)
    }

    pub(crate) fn release(&self, id: DocumentId) {
        self.in_flight().remove(&id);
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<DocumentId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn log(&self, id: DocumentId, action: LogAction, status: Status, details: serde_json::Value) {
        let entry = ProcessingLogEntry::new(id, action, status, details);
        if let Err(err) = self.store.append_log(entry).await {
            warn!(message = "Failed to append processing log", document_id = %id, action = %action, error = %err);
        }
    }
}

pub async fn start(ctx: Arc<WorkerContext>, send_to_server: UnboundedSender<WorkMessage>) {
    while let Some(job) = ctx.queue.dequeue().await {
        let document_id = job.document_id;

        let message = match AssertUnwindSafe(process(&ctx, job)).catch_unwind().await {
            Ok(message) => message,
            Err(_) => {
                error!(message = "Worker panicked while processing job", document_id = %document_id);
                WorkMessage::JobDropped(document_id, "worker panicked".to_string())
            }
        };

        if message.is_settled() {
            ctx.release(document_id);
        }

        // Nobody listening is fine; the store already holds the outcome.
        let _ = send_to_server.send(message);
    }
    info!("Worker stopped.");
}

#[instrument(skip_all, fields(document_id = %job.document_id, attempt = job.attempt_count + 1))]
async fn process(ctx: &WorkerContext, mut job: Job) -> WorkMessage {
    let id = job.document_id;

    let document = match begin(ctx, id).await {
        Ok(document) => document,
        Err(err) => return drop_job(ctx, id, err).await,
    };

    job.attempt_count += 1;
    let attempt = job.attempt_count;
    ctx.log(
        id,
        LogAction::ExtractionAttempt,
        Status::Processing,
        json!({ "attempt": attempt, "format": document.format }),
    )
    .await;

    let err = match ctx.pipeline.attempt(&document).await {
        Ok(extracted) => return complete(ctx, id, attempt, extracted).await,
        Err(err) => err,
    };

    if err.is_circuit_open() {
        ctx.log(
            id,
            LogAction::CircuitOpen,
            Status::Processing,
            json!({ "attempt": attempt }),
        )
        .await;
    }

    match ctx.retry.decide(attempt, err.class()) {
        RetryDecision::Retry(delay) => {
            info!(message = "Scheduling retry", error = %err, delay_ms = delay.as_millis() as u64);
            ctx.log(
                id,
                LogAction::RetryScheduled,
                Status::Processing,
                json!({
                    "attempt": attempt,
                    "delay_ms": delay.as_millis() as u64,
                    "error": err.to_string(),
                }),
            )
            .await;

            match ctx.queue.enqueue(job.retry_after(delay)) {
                Ok(()) => WorkMessage::JobRetrying {
                    document_id: id,
                    attempt,
                    delay,
                },
                Err(closed) => {
                    warn!(message = "Retry not scheduled", error = %closed);
                    ctx.log(
                        id,
                        LogAction::Dropped,
                        Status::Processing,
                        json!({ "reason": closed.to_string() }),
                    )
                    .await;
                    WorkMessage::JobDropped(id, closed.to_string())
                }
            }
        }
        RetryDecision::GiveUp => fail(ctx, id, attempt, err).await,
    }
}

async fn begin(ctx: &WorkerContext, id: DocumentId) -> Result<Document, StoreError> {
    let document = ctx.store.get_document(id).await?;
    ctx.store
        .update_status(id, Status::Processing, StatusUpdate::default())
        .await?;
    Ok(document)
}

async fn complete(ctx: &WorkerContext, id: DocumentId, attempt: u32, extracted: Extracted) -> WorkMessage {
    let chars = extracted.text.chars().count();
    let update = StatusUpdate::completed(extracted.text, extracted.confidence, extracted.pages);
    if let Err(err) = ctx.store.update_status(id, Status::Completed, update).await {
        return drop_job(ctx, id, err).await;
    }

    info!(message = "Document completed", strategy = %extracted.strategy, chars, confidence = extracted.confidence);
    ctx.log(
        id,
        LogAction::Completed,
        Status::Completed,
        json!({
            "attempt": attempt,
            "strategy": extracted.strategy,
            "confidence": extracted.confidence,
            "pages": extracted.pages,
            "chars": chars,
        }),
    )
    .await;
    WorkMessage::JobCompleted(id)
}

async fn fail(ctx: &WorkerContext, id: DocumentId, attempt: u32, err: AttemptError) -> WorkMessage {
    let error_message = format!("{err} (gave up after {attempt} attempt(s))");
    let update = StatusUpdate::failed(error_message.clone());
    if let Err(err) = ctx.store.update_status(id, Status::Failed, update).await {
        return drop_job(ctx, id, err).await;
    }

    warn!(message = "Document failed", error = %error_message);
    ctx.log(
        id,
        LogAction::Failed,
        Status::Failed,
        json!({ "attempt": attempt, "error": error_message }),
    )
    .await;
    WorkMessage::JobFailed(id, error_message)
}

/// Store errors cannot be fixed by retrying; leave the document as it is.
async fn drop_job(ctx: &WorkerContext, id: DocumentId, err: StoreError) -> WorkMessage {
    error!(message = "Dropping job after store error", error = %err);
    let status = match &err {
        StoreError::NotFound(_) => None,
        StoreError::Conflict { from, .. } => Some(*from),
        StoreError::Database(_) => Some(Status::Processing),
    };
    if let Some(status) = status {
        ctx.log(
            id,
            LogAction::Dropped,
            status,
            json!({ "reason": err.to_string() }),
        )
        .await;
    }
    WorkMessage::JobDropped(id, err.to_string())
}
