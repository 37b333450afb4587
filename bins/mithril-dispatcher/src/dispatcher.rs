/// Dispatcher - Submission Routing
///
/// **Core Responsibility:**
/// Forward each submission to the worker group for its exercise and publish
/// exactly one terminal event (`result` or `error`) back to the client.
///
/// **Properties:**
/// - Stateless: submissions share nothing, any replica can take any message
/// - No retries: timeouts and missing workers are terminal for a submission
/// - Payloads are forwarded and returned byte-for-byte

use async_nats::{Client, Request, RequestErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use mithril_common::subjects::{self, SubmissionRoute};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Worker timed out")]
    Timeout,

    #[error("No Worker available")]
    NoWorker,

    #[error("Communication error")]
    Transport(String),
}

impl DispatchError {
    pub fn outcome(&self) -> &'static str {
        match self {
            DispatchError::Timeout => "timeout",
            DispatchError::NoWorker => "no_worker",
            DispatchError::Transport(_) => "transport_error",
        }
    }
}

/// The slice of the bus the dispatcher needs.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, subject: String, payload: Bytes, timeout: Duration) -> Result<Bytes, DispatchError>;

    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone)]
pub struct NatsTransport {
    client: Client,
}

impl NatsTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn request(&self, subject: String, payload: Bytes, timeout: Duration) -> Result<Bytes, DispatchError> {
        let request = Request::new().payload(payload).timeout(Some(timeout));
        match self.client.send_request(subject, request).await {
            Ok(message) => Ok(message.payload),
            Err(e) => Err(match e.kind() {
                RequestErrorKind::TimedOut => DispatchError::Timeout,
                RequestErrorKind::NoResponders => DispatchError::NoWorker,
                _ => DispatchError::Transport(e.to_string()),
            }),
        }
    }

    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), DispatchError> {
        self.client
            .publish(subject, payload)
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))
    }
}

/// What happened to one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Routing key had no client/exercise to answer; nothing was published
    Dropped,
    Result,
    Error(DispatchError),
}

pub struct Dispatcher<T> {
    transport: T,
    request_timeout: Duration,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, request_timeout: Duration) -> Self {
        Self {
            transport,
            request_timeout,
        }
    }

    /// Route one submission and publish its terminal event.
    pub async fn handle(&self, subject: &str, payload: Bytes) -> Dispatched {
        metrics::SUBMISSIONS_TOTAL.inc();

        let Some(route) = subjects::parse_submission_subject(subject) else {
            warn!(subject = %subject, "Dropping submission with malformed subject");
            metrics::SUBMISSIONS_DROPPED.inc();
            return Dispatched::Dropped;
        };

        let SubmissionRoute {
            client_id,
            exercise_id,
        } = &route;
        info!(client_id = %client_id, exercise_id = %exercise_id, payload_size = payload.len(), "Dispatching submission");

        let start = Instant::now();
        let outcome = self
            .transport
            .request(subjects::worker_subject(exercise_id), payload, self.request_timeout)
            .await;
        metrics::DISPATCH_DURATION.observe(start.elapsed().as_secs_f64());

        match outcome {
            Ok(reply) => {
                debug!(client_id = %client_id, exercise_id = %exercise_id, reply_size = reply.len(), "Worker replied");
                metrics::DISPATCH_OUTCOMES.with_label_values(&["result"]).inc();
                self.emit(subjects::result_subject(client_id, exercise_id), reply).await;
                Dispatched::Result
            }
            Err(e) => {
                match &e {
                    DispatchError::Transport(detail) => {
                        error!(client_id = %client_id, exercise_id = %exercise_id, error = %detail, "Worker request failed")
                    }
                    _ => warn!(client_id = %client_id, exercise_id = %exercise_id, error = %e, "Worker request failed"),
                }
                metrics::DISPATCH_OUTCOMES.with_label_values(&[e.outcome()]).inc();
                let message = Bytes::from(e.to_string());
                self.emit(subjects::error_subject(client_id, exercise_id), message).await;
                Dispatched::Error(e)
            }
        }
    }

    async fn emit(&self, subject: String, payload: Bytes) {
        if let Err(e) = self.transport.publish(subject.clone(), payload).await {
            // the client never hears about this submission
            error!(subject = %subject, error = ?e, "Failed to publish terminal event");
        }
    }
}
