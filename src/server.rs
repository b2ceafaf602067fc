use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::ProcessorConfig;
use crate::extract::ExtractionBackend;
use crate::pipeline::Pipeline;
use crate::queue::QueueClosed;
use crate::store::DocumentStore;
use crate::worker::{self, WorkMessage, WorkerContext};
use crate::{Document, DocumentId, Job, NewDocument};
use anyhow::Error;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::*;

/// Handle to a running worker pool. Cheap to clone.
#[derive(Clone)]
pub struct Processor {
    ctx: Arc<WorkerContext>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Processor {
    /// Spawn `config.workers` workers. Every retry and terminal decision is
    /// reported on the returned channel.
    pub fn start(
        config: &ProcessorConfig,
        store: Arc<dyn DocumentStore>,
        backend: Arc<dyn ExtractionBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkMessage>) {
        let pipeline = Pipeline::new(
            backend,
            CircuitBreaker::new(config.breaker),
            config.attempt_timeout,
            config.min_text_chars,
        );
        let ctx = Arc::new(WorkerContext::new(store, pipeline, config.retry));

        let (send_to_client, recv_from_server) = mpsc::unbounded_channel::<WorkMessage>();

        let mut workers = vec![];
        for worker_id in 0..config.workers.max(1) {
            let ctx = ctx.clone();
            let send_to_client = send_to_client.clone();
            let join_handle = tokio::spawn(
                async move {
                    worker::start(ctx, send_to_client).await;
                }
                .instrument(info_span!("worker", worker_id)),
            );
            workers.push(join_handle);
        }
        info!(workers = workers.len(), "Processor started");

        (
            Processor {
                ctx,
                workers: Arc::new(Mutex::new(workers)),
            },
            recv_from_server,
        )
    }

    /// Queue a freshly uploaded document. Returns `false` without queuing
    /// anything when a job for `id` is already pending or running.
    pub fn submit(&self, id: DocumentId) -> Result<bool, QueueClosed> {
        // Jobs discarded at shutdown never release their ids.
        if self.ctx.queue.is_closed() {
            return Err(QueueClosed);
        }

        if !self.ctx.claim(id) {
            debug!(message = "Document already in flight", document_id = %id);
            return Ok(false);
        }

        if let Err(err) = self.ctx.queue.enqueue(Job::new(id)) {
            self.ctx.release(id);
            return Err(err);
        }

        debug!(message = "Submitted document", document_id = %id, queued = self.ctx.queue.len());
        Ok(true)
    }

    /// Store a validated upload and queue it for extraction.
    pub async fn upload(&self, new: NewDocument) -> Result<Document, Error> {
        let document = self.ctx.store.create_document(new).await?;
        self.submit(document.id)?;
        Ok(document)
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.ctx.store
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.ctx.pipeline.breaker().state()
    }

    /// Close the queue and wait for every worker to finish its current
    /// attempt. Delayed retries still waiting are discarded.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.ctx.queue.close();

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        futures::future::join_all(workers)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        info!("Processor stopped.");
        Ok(())
    }
}
