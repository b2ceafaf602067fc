//! Volatile job queue shared by the worker pool.
//!
//! Ready jobs travel through a multi-consumer channel, so each job reaches
//! exactly one worker in FIFO order. Jobs scheduled for later are parked on a
//! timer task and only pushed onto the channel once `next_attempt_at` passes.
//! Nothing here survives a restart.

use crate::Job;
use async_channel::{Receiver, Sender};
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("job queue is closed")]
pub struct QueueClosed;

#[derive(Debug)]
pub struct JobQueue {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    closed: CancellationToken,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        JobQueue {
            sender,
            receiver,
            closed: CancellationToken::new(),
        }
    }

    /// Add a job. A job whose `next_attempt_at` is still ahead is held back
    /// until then; delayed delivery needs a running Tokio runtime.
    pub fn enqueue(&self, job: Job) -> Result<(), QueueClosed> {
        if self.closed.is_cancelled() {
            return Err(QueueClosed);
        }

        if job.is_ready(Instant::now()) {
            return self.sender.try_send(job).map_err(|_| QueueClosed);
        }

        let sender = self.sender.clone();
        let closed = self.closed.clone();
        let ready_at = job.next_attempt_at;
        trace!(document_id = %job.document_id, "Parking delayed job");
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {
                    trace!(document_id = %job.document_id, "Queue closed, discarding delayed job");
                },
                _ = sleep_until(ready_at) => {
                    let _ = sender.send(job).await;
                },
            }
        });
        Ok(())
    }

    /// Wait for the next ready job. Returns `None` once the queue is closed,
    /// even if jobs were still waiting.
    pub async fn dequeue(&self) -> Option<Job> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            job = self.receiver.recv() => job.ok(),
        }
    }

    /// Wake every blocked `dequeue` with `None` and refuse further jobs.
    pub fn close(&self) {
        self.closed.cancel();
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Jobs ready for delivery right now.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
