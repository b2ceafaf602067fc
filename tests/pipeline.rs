use async_trait::async_trait;
use docq::breaker::{BreakerConfig, CircuitState};
use docq::config::ProcessorConfig;
use docq::extract::{Extraction, ExtractionBackend, ExtractionError};
use docq::queue::QueueClosed;
use docq::retry::RetryPolicy;
use docq::server::Processor;
use docq::store::{DocumentStore, MemoryStore};
use docq::worker::WorkMessage;
use docq::{DocumentFormat, DocumentId, LogAction, NewDocument, Status};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
enum Step {
    Text(&'static str, f64),
    Transient,
    Permanent,
    Panic,
}

/// Backend that plays back a fixed script, then repeats `fallback`.
struct ScriptedBackend {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new(steps: impl IntoIterator<Item = Step>, fallback: Step) -> Arc<Self> {
        Arc::new(ScriptedBackend {
            steps: Mutex::new(steps.into_iter().collect()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        step.unwrap_or(self.fallback)
    }
}

#[async_trait]
impl ExtractionBackend for ScriptedBackend {
    async fn extract_native(
        &self,
        _content: &[u8],
        _format: DocumentFormat,
    ) -> Result<Extraction, ExtractionError> {
        match self.next_step() {
            Step::Text(text, _) => Ok(Extraction::native(text)),
            step => Err(failure(step)),
        }
    }

    async fn recognize_image(
        &self,
        _content: &[u8],
        _format: DocumentFormat,
    ) -> Result<Extraction, ExtractionError> {
        match self.next_step() {
            Step::Text(text, confidence) => Ok(Extraction::recognized(text, confidence).with_pages(1)),
            step => Err(failure(step)),
        }
    }
}

fn failure(step: Step) -> ExtractionError {
    match step {
        Step::Transient => ExtractionError::Overloaded("engine busy".into()),
        Step::Permanent => ExtractionError::Corrupt("not a pdf".into()),
        Step::Panic => panic!("backend exploded"),
        Step::Text(..) => unreachable!(),
    }
}

const INVOICE: &str = "Invoice Total: $123.45 on 2024-01-31 Vendor: ACME Corp";
const RECEIPT: &str = "Receipt from Corner Store, total 4.50";

fn config(workers: u16, max_retries: u32, threshold: u32) -> ProcessorConfig {
    ProcessorConfig {
        workers,
        retry: RetryPolicy::new(max_retries, Duration::from_secs(1)),
        breaker: BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(30),
        },
        attempt_timeout: Duration::from_secs(10),
        min_text_chars: 16,
    }
}

fn start(
    config: ProcessorConfig,
    backend: Arc<ScriptedBackend>,
) -> (Processor, Arc<MemoryStore>, UnboundedReceiver<WorkMessage>) {
    let store = Arc::new(MemoryStore::new());
    let (processor, rx) = Processor::start(&config, store.clone(), backend);
    (processor, store, rx)
}

async fn upload(processor: &Processor, name: &str) -> DocumentId {
    let new = NewDocument::new(name, b"%PDF-1.4 ...".to_vec()).unwrap();
    processor.upload(new).await.unwrap().id
}

async fn recv(rx: &mut UnboundedReceiver<WorkMessage>) -> WorkMessage {
    timeout(Duration::from_secs(3600), rx.recv())
        .await
        .expect("no message from workers")
        .expect("worker channel closed")
}

/// Messages for `id` up to and including the one that settles it.
async fn until_settled(rx: &mut UnboundedReceiver<WorkMessage>, id: DocumentId) -> Vec<WorkMessage> {
    let mut seen = vec![];
    loop {
        let msg = recv(rx).await;
        if msg.document_id() != id {
            continue;
        }
        let settled = msg.is_settled();
        seen.push(msg);
        if settled {
            return seen;
        }
    }
}

fn assert_valid_history(store: &MemoryStore, id: DocumentId) {
    let history = store.status_history(id);
    let completed = [Status::Pending, Status::Processing, Status::Completed];
    let failed = [Status::Pending, Status::Processing, Status::Failed];
    assert!(
        completed.starts_with(&history) || failed.starts_with(&history),
        "unexpected status sequence {history:?}"
    );
}

fn retry_delays(store: &MemoryStore, id: DocumentId) -> Vec<u64> {
    store
        .logs(id)
        .iter()
        .filter(|entry| entry.action == LogAction::RetryScheduled)
        .map(|entry| entry.details["delay_ms"].as_u64().unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn text_pdf_completes_on_first_attempt() {
    let backend = ScriptedBackend::new([Step::Text(INVOICE, 0.5)], Step::Transient);
    let (processor, store, mut rx) = start(config(2, 3, 5), backend.clone());

    let id = upload(&processor, "invoice.pdf").await;
    let messages = until_settled(&mut rx, id).await;
    assert_eq!(messages, vec![WorkMessage::JobCompleted(id)]);

    let document = store.get_document(id).await.unwrap();
    assert_eq!(document.status, Status::Completed);
    assert_eq!(document.confidence_score, Some(1.0));
    assert_eq!(document.raw_text.as_deref(), Some(INVOICE));
    assert_eq!(document.error_message, None);
    assert_eq!(
        store.status_history(id),
        vec![Status::Pending, Status::Processing, Status::Completed]
    );
    assert_eq!(backend.calls(), 1);

    processor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn image_recovers_after_two_transient_failures() {
    let backend = ScriptedBackend::new(
        [Step::Transient, Step::Transient, Step::Text(RECEIPT, 0.87)],
        Step::Transient,
    );
    let (processor, store, mut rx) = start(config(2, 3, 5), backend.clone());

    let started = Instant::now();
    let id = upload(&processor, "receipt.png").await;
    let messages = until_settled(&mut rx, id).await;

    assert_eq!(
        messages,
        vec![
            WorkMessage::JobRetrying {
                document_id: id,
                attempt: 1,
                delay: Duration::from_secs(1),
            },
            WorkMessage::JobRetrying {
                document_id: id,
                attempt: 2,
                delay: Duration::from_secs(2),
            },
            WorkMessage::JobCompleted(id),
        ]
    );
    assert!(started.elapsed() >= Duration::from_secs(3));

    let document = store.get_document(id).await.unwrap();
    assert_eq!(document.status, Status::Completed);
    assert_eq!(document.confidence_score, Some(0.87));
    assert_eq!(document.pages, Some(1));
    assert_eq!(retry_delays(&store, id), vec![1000, 2000]);
    assert_valid_history(&store, id);
    assert_eq!(backend.calls(), 3);

    processor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_mark_document_failed() {
    let backend = ScriptedBackend::new([], Step::Transient);
    let (processor, store, mut rx) = start(config(1, 3, 100), backend.clone());

    let id = upload(&processor, "scan.jpg").await;
    let messages = until_settled(&mut rx, id).await;
    assert_eq!(messages.len(), 4);

    let document = store.get_document(id).await.unwrap();
    assert_eq!(document.status, Status::Failed);
    let error_message = document.error_message.unwrap();
    assert!(error_message.contains("engine busy"), "{error_message}");
    assert!(error_message.contains("4 attempt(s)"), "{error_message}");

    assert_eq!(retry_delays(&store, id), vec![1000, 2000, 4000]);
    assert_eq!(
        store.status_history(id),
        vec![Status::Pending, Status::Processing, Status::Failed]
    );
    assert_eq!(backend.calls(), 4);

    processor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let backend = ScriptedBackend::new([Step::Permanent], Step::Text(INVOICE, 1.0));
    let (processor, store, mut rx) = start(config(1, 3, 5), backend.clone());

    let id = upload(&processor, "broken.pdf").await;
    let messages = until_settled(&mut rx, id).await;
    assert!(matches!(messages.as_slice(), [WorkMessage::JobFailed(..)]));

    assert!(retry_delays(&store, id).is_empty());
    assert_eq!(backend.calls(), 1);
    assert_eq!(processor.breaker_state(), CircuitState::Closed);

    processor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn open_breaker_rejects_without_calling_backend() {
    let backend = ScriptedBackend::new([], Step::Transient);
    let (processor, store, mut rx) = start(config(1, 1, 5), backend.clone());

    let mut ids = vec![];
    for i in 0..6 {
        ids.push(upload(&processor, &format!("scan-{i}.png")).await);
    }
    let sixth = ids[5];

    let msg = loop {
        let msg = recv(&mut rx).await;
        if msg.document_id() == sixth {
            break msg;
        }
    };

    assert_eq!(
        msg,
        WorkMessage::JobRetrying {
            document_id: sixth,
            attempt: 1,
            delay: Duration::from_secs(1),
        }
    );
    assert_eq!(backend.calls(), 5);
    assert_eq!(processor.breaker_state(), CircuitState::Open);

    let actions: Vec<LogAction> = store.logs(sixth).iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            LogAction::Created,
            LogAction::ExtractionAttempt,
            LogAction::CircuitOpen,
            LogAction::RetryScheduled,
        ]
    );

    processor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn duplicate_submit_yields_one_terminal_transition() {
    let backend = ScriptedBackend::new([], Step::Text(INVOICE, 1.0));
    let (processor, store, mut rx) = start(config(2, 3, 5), backend.clone());

    let id = upload(&processor, "invoice.pdf").await;
    assert_eq!(processor.submit(id), Ok(false));

    let messages = until_settled(&mut rx, id).await;
    assert_eq!(messages, vec![WorkMessage::JobCompleted(id)]);

    // Once settled the id may be submitted again, but a terminal document
    // cannot be reprocessed.
    assert_eq!(processor.submit(id), Ok(true));
    let messages = until_settled(&mut rx, id).await;
    assert!(matches!(messages.as_slice(), [WorkMessage::JobDropped(..)]));

    assert_eq!(
        store.status_history(id),
        vec![Status::Pending, Status::Processing, Status::Completed]
    );
    assert_eq!(backend.calls(), 1);

    processor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unknown_document_is_dropped() {
    let backend = ScriptedBackend::new([], Step::Text(INVOICE, 1.0));
    let (processor, _store, mut rx) = start(config(1, 3, 5), backend.clone());

    let id = Uuid::new_v4();
    assert_eq!(processor.submit(id), Ok(true));
    let messages = until_settled(&mut rx, id).await;
    assert!(matches!(messages.as_slice(), [WorkMessage::JobDropped(..)]));
    assert_eq!(backend.calls(), 0);

    processor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn panicking_backend_does_not_shrink_pool() {
    let backend = ScriptedBackend::new([Step::Panic], Step::Text(INVOICE, 1.0));
    let (processor, store, mut rx) = start(config(1, 3, 5), backend.clone());

    let first = upload(&processor, "first.txt").await;
    let second = upload(&processor, "second.txt").await;

    let messages = until_settled(&mut rx, first).await;
    assert!(matches!(messages.as_slice(), [WorkMessage::JobDropped(..)]));

    let messages = until_settled(&mut rx, second).await;
    assert_eq!(messages, vec![WorkMessage::JobCompleted(second)]);
    assert_eq!(
        store.get_document(second).await.unwrap().status,
        Status::Completed
    );

    processor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn concurrent_uploads_all_complete() {
    let backend = ScriptedBackend::new([], Step::Text(INVOICE, 1.0));
    let (processor, store, mut rx) = start(config(4, 3, 5), backend.clone());

    let mut ids = vec![];
    for i in 0..10 {
        ids.push(upload(&processor, &format!("doc-{i}.pdf")).await);
    }

    let mut completed = 0;
    while completed < ids.len() {
        match recv(&mut rx).await {
            WorkMessage::JobCompleted(_) => completed += 1,
            other => panic!("unexpected message {other:?}"),
        }
    }

    for id in ids {
        assert_eq!(
            store.status_history(id),
            vec![Status::Pending, Status::Processing, Status::Completed]
        );
    }
    assert_eq!(backend.calls(), 10);

    processor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_discards_pending_retries() {
    let backend = ScriptedBackend::new([], Step::Transient);
    let mut config = config(2, 3, 100);
    config.retry = RetryPolicy::new(3, Duration::from_secs(3600));
    let (processor, store, mut rx) = start(config, backend.clone());

    let id = upload(&processor, "slow.png").await;
    assert!(matches!(recv(&mut rx).await, WorkMessage::JobRetrying { .. }));

    timeout(Duration::from_secs(5), processor.shutdown())
        .await
        .expect("shutdown hung")
        .unwrap();

    assert_eq!(processor.submit(Uuid::new_v4()), Err(QueueClosed));
    assert_eq!(processor.submit(id), Err(QueueClosed));
    assert_eq!(
        store.get_document(id).await.unwrap().status,
        Status::Processing
    );
    assert_eq!(backend.calls(), 1);
}
