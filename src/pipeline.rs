//! One extraction attempt for one document: walk the format's strategy plan,
//! calling the backend through the circuit breaker with a per-call timeout.

use crate::breaker::{CircuitBreaker, CircuitOpenError};
use crate::extract::{Extraction, ExtractionBackend, ExtractionError};
use crate::retry::FailureClass;
use crate::Document;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{timeout, Duration};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Pull the document's own text layer.
    Native,
    /// Run image recognition over the rendered document.
    Ocr,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Native => "native",
            Strategy::Ocr => "ocr",
        })
    }
}

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

impl AttemptError {
    pub fn class(&self) -> FailureClass {
        match self {
            AttemptError::CircuitOpen(_) | AttemptError::Timeout(_) => FailureClass::Transient,
            AttemptError::Extraction(err) => err.class(),
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, AttemptError::CircuitOpen(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub text: String,
    pub confidence: f64,
    pub pages: Option<u32>,
    pub strategy: Strategy,
}

pub struct Pipeline {
    backend: Arc<dyn ExtractionBackend>,
    breaker: CircuitBreaker,
    attempt_timeout: Duration,
    min_text_chars: usize,
}

impl Pipeline {
    pub fn new(
        backend: Arc<dyn ExtractionBackend>,
        breaker: CircuitBreaker,
        attempt_timeout: Duration,
        min_text_chars: usize,
    ) -> Self {
        Pipeline {
            backend,
            breaker,
            attempt_timeout,
            min_text_chars,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run the strategies for the document's format until one yields enough
    /// text. If none does, the last strategy's result stands.
    pub async fn attempt(&self, document: &Document) -> Result<Extracted, AttemptError> {
        let mut extracted = None;

        for &strategy in document.format.plan() {
            let extraction = self.call(strategy, document).await?;
            let chars = extraction.text.trim().chars().count();
            let result = Extracted {
                text: extraction.text,
                confidence: extraction.confidence,
                pages: extraction.pages,
                strategy,
            };
            if chars >= self.min_text_chars {
                return Ok(result);
            }
            debug!(%strategy, chars, "Too little text extracted");
            extracted = Some(result);
        }

        extracted.ok_or_else(|| {
            ExtractionError::Unsupported(format!("no extraction strategy for {}", document.format))
                .into()
        })
    }

    async fn call(&self, strategy: Strategy, document: &Document) -> Result<Extraction, AttemptError> {
        let permit = self.breaker.acquire()?;

        let call = match strategy {
            Strategy::Native => self
                .backend
                .extract_native(&document.content, document.format),
            Strategy::Ocr => self
                .backend
                .recognize_image(&document.content, document.format),
        };

        match timeout(self.attempt_timeout, call).await {
            Ok(Ok(extraction)) => {
                permit.record_success();
                Ok(extraction)
            }
            Ok(Err(err)) => {
                // Bad input says nothing about backend health.
                match err.class() {
                    FailureClass::Permanent => permit.record_success(),
                    FailureClass::Transient => permit.record_failure(),
                }
                Err(err.into())
            }
            Err(_) => {
                permit.record_failure();
                Err(AttemptError::Timeout(self.attempt_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::{DocumentFormat, NewDocument};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeBackend {
        native_text: &'static str,
        ocr_text: &'static str,
        native_calls: AtomicUsize,
        ocr_calls: AtomicUsize,
        hang: bool,
        corrupt: bool,
    }

    #[async_trait]
    impl ExtractionBackend for FakeBackend {
        async fn extract_native(
            &self,
            _content: &[u8],
            _format: DocumentFormat,
        ) -> Result<Extraction, ExtractionError> {
            self.native_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.corrupt {
                return Err(ExtractionError::Corrupt("bad xref table".into()));
            }
            Ok(Extraction::native(self.native_text))
        }

        async fn recognize_image(
            &self,
            _content: &[u8],
            _format: DocumentFormat,
        ) -> Result<Extraction, ExtractionError> {
            self.ocr_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Extraction::recognized(self.ocr_text, 0.8).with_pages(2))
        }
    }

    fn pipeline(backend: Arc<FakeBackend>, threshold: u32) -> Pipeline {
        Pipeline::new(
            backend,
            CircuitBreaker::new(BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(30),
            }),
            Duration::from_secs(5),
            16,
        )
    }

    fn document(name: &str) -> Document {
        Document::new(NewDocument::new(name, b"bytes".to_vec()).unwrap())
    }

    #[tokio::test]
    async fn native_text_wins_when_long_enough() {
        let backend = Arc::new(FakeBackend {
            native_text: "Invoice Total: $123.45 on 2024-01-31",
            ..Default::default()
        });
        let extracted = pipeline(backend.clone(), 5)
            .attempt(&document("invoice.pdf"))
            .await
            .unwrap();

        assert_eq!(extracted.strategy, Strategy::Native);
        assert_eq!(extracted.confidence, 1.0);
        assert_eq!(extracted.pages, None);
        assert_eq!(backend.ocr_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scanned_pdf_falls_back_to_ocr() {
        let backend = Arc::new(FakeBackend {
            native_text: "  \n ",
            ocr_text: "Scanned contract between ACME and Initech",
            ..Default::default()
        });
        let extracted = pipeline(backend.clone(), 5)
            .attempt(&document("scan.pdf"))
            .await
            .unwrap();

        assert_eq!(extracted.strategy, Strategy::Ocr);
        assert_eq!(extracted.confidence, 0.8);
        assert_eq!(extracted.pages, Some(2));
        assert_eq!(backend.native_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.ocr_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_text_is_kept_when_nothing_better_exists() {
        let backend = Arc::new(FakeBackend {
            native_text: "hi",
            ..Default::default()
        });
        let extracted = pipeline(backend, 5)
            .attempt(&document("short.txt"))
            .await
            .unwrap();
        assert_eq!(extracted.text, "hi");
    }

    #[tokio::test]
    async fn images_go_straight_to_ocr() {
        let backend = Arc::new(FakeBackend {
            ocr_text: "Receipt from Corner Store, total 4.50",
            ..Default::default()
        });
        let extracted = pipeline(backend.clone(), 5)
            .attempt(&document("receipt.jpg"))
            .await
            .unwrap();
        assert_eq!(extracted.strategy, Strategy::Ocr);
        assert_eq!(backend.native_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_transient_and_trips_breaker() {
        let backend = Arc::new(FakeBackend {
            hang: true,
            ..Default::default()
        });
        let pipeline = pipeline(backend, 1);

        let err = pipeline.attempt(&document("slow.txt")).await.unwrap_err();
        assert!(matches!(err, AttemptError::Timeout(_)));
        assert_eq!(err.class(), FailureClass::Transient);
        assert_eq!(pipeline.breaker().state(), CircuitState::Open);

        let err = pipeline.attempt(&document("next.txt")).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.class(), FailureClass::Transient);
    }

    #[tokio::test]
    async fn corrupt_input_is_permanent_and_spares_breaker() {
        let backend = Arc::new(FakeBackend {
            corrupt: true,
            ..Default::default()
        });
        let pipeline = pipeline(backend, 1);

        let err = pipeline.attempt(&document("bad.pdf")).await.unwrap_err();
        assert_eq!(err.class(), FailureClass::Permanent);
        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);
    }
}
