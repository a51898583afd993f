//! Email transport abstraction
//!
//! The dispatcher hands a claimed job to an [`EmailTransport`] and reacts to
//! the outcome class: transient failures are retried with backoff, permanent
//! failures are final. A timeout is always treated as transient because the
//! provider may still have accepted the message.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::Job;

/// Outcome classification for a failed delivery attempt
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Worth retrying: connection failures, 4xx-class provider throttling
    #[error("Transient transport failure: {0}")]
    Transient(String),

    /// Never retried: bad address, suppressed recipient, 5xx rejects
    #[error("Permanent transport failure: {0}")]
    Permanent(String),

    /// The provider did not answer in time; retried like a transient failure
    #[error("Transport timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether the dispatcher should schedule another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Provider acknowledgement for one accepted message
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
}

/// A delivery channel for send jobs
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Deliver one message. Success means the provider accepted it and
    /// returned a message id, not that it reached the inbox.
    async fn send(&self, job: &Job) -> Result<DeliveryReceipt, TransportError>;

    fn name(&self) -> &'static str;
}

/// Dry-run transport: logs each delivery and fabricates a receipt
pub struct LoggingTransport;

#[async_trait]
impl EmailTransport for LoggingTransport {
    async fn send(&self, job: &Job) -> Result<DeliveryReceipt, TransportError> {
        let provider_message_id = format!("dry-run-{}", Uuid::new_v4());
        info!(
            job_id = %job.id,
            recipient = %job.recipient,
            message_id = %provider_message_id,
            "Dry-run delivery"
        );
        Ok(DeliveryReceipt {
            provider_message_id,
        })
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

/// Scripted transport for tests: pops queued outcomes, succeeds once the
/// queue is empty, and records every recipient it accepted.
#[derive(Default)]
pub struct MockTransport {
    outcomes: Mutex<VecDeque<Result<(), TransportError>>>,
    delivered: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send sleeps this long before resolving, to keep permits held
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Queue an outcome for the next send; FIFO
    pub fn push_outcome(&self, outcome: Result<(), TransportError>) {
        self.outcomes
            .lock()
            .expect("mock transport poisoned")
            .push_back(outcome);
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered
            .lock()
            .expect("mock transport poisoned")
            .clone()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered
            .lock()
            .expect("mock transport poisoned")
            .len()
    }
}

#[async_trait]
impl EmailTransport for MockTransport {
    async fn send(&self, job: &Job) -> Result<DeliveryReceipt, TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .outcomes
            .lock()
            .expect("mock transport poisoned")
            .pop_front();
        match next.unwrap_or(Ok(())) {
            Ok(()) => {
                self.delivered
                    .lock()
                    .expect("mock transport poisoned")
                    .push(job.recipient.clone());
                Ok(DeliveryReceipt {
                    provider_message_id: format!("mock-{}", Uuid::new_v4()),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_error_classification() {
        assert!(TransportError::transient("451 rate limited").is_transient());
        assert!(TransportError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(!TransportError::permanent("550 no such user").is_transient());
    }

    #[tokio::test]
    async fn test_mock_transport_scripted_outcomes() {
        let transport = MockTransport::new();
        transport.push_outcome(Err(TransportError::transient("connection reset")));

        let job = Job::new("s1", "a@x.com", Utc::now()).unwrap();
        let err = transport.send(&job).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(transport.delivered_count(), 0);

        // queue drained: subsequent sends succeed
        let receipt = transport.send(&job).await.unwrap();
        assert!(receipt.provider_message_id.starts_with("mock-"));
        assert_eq!(transport.delivered(), vec!["a@x.com".to_string()]);
    }

    #[tokio::test]
    async fn test_logging_transport_accepts() {
        let job = Job::new("s1", "a@x.com", Utc::now()).unwrap();
        let receipt = LoggingTransport.send(&job).await.unwrap();
        assert!(receipt.provider_message_id.starts_with("dry-run-"));
    }
}
