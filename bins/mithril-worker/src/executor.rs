/// Job Executor - Request Handling Glue
///
/// **Responsibility:**
/// Turn one raw job request into one reply body.
///
/// **Architecture:**
/// 1. Decode the payload (JSON array of strings)
/// 2. Resolve the exercise named in the subject through the spec store
/// 3. Grade with the Engine (engine.rs)
/// 4. Encode the `GradingResult`
///
/// Every failure ends in a structured reply; nothing here panics or leaves
/// the requester waiting for a timeout.

use crate::engine::Engine;
use mithril_common::catalog::{CatalogError, SpecStore};
use mithril_common::subjects;
use mithril_common::types::{ErrorReply, INTERNAL_ERROR, INVALID_INPUT_FORMAT};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Reply body plus the outcome label recorded in metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub body: Vec<u8>,
    pub outcome: &'static str,
}

pub const OUTCOME_PASSED: &str = "passed";
pub const OUTCOME_FAILED: &str = "failed";
pub const OUTCOME_REJECTED: &str = "rejected";
pub const OUTCOME_INTERNAL_ERROR: &str = "internal_error";

pub struct JobHandler {
    store: Arc<dyn SpecStore>,
    engine: Engine,
}

impl JobHandler {
    pub fn new(store: Arc<dyn SpecStore>, engine: Engine) -> Self {
        Self { store, engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub async fn handle(&self, job_id: Uuid, subject: &str, payload: &[u8]) -> Reply {
        let entries: Vec<String> = match serde_json::from_slice(payload) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Rejecting payload");
                return rejected();
            }
        };

        let Some(exercise_id) = subjects::parse_worker_subject(subject) else {
            warn!(job_id = %job_id, subject = %subject, "Request subject names no exercise");
            return rejected();
        };

        let exercise = match self.store.resolve(exercise_id).await {
            Ok(exercise) => exercise,
            Err(CatalogError::NotFound(id)) => {
                warn!(job_id = %job_id, exercise = %id, "Unknown exercise");
                return rejected();
            }
            Err(e) => {
                warn!(job_id = %job_id, exercise = %exercise_id, error = %e, "Failed to resolve exercise");
                return rejected();
            }
        };

        let result = self.engine.grade(job_id, &exercise, &entries).await;
        info!(
            job_id = %job_id,
            exercise = %exercise_id,
            success = result.success(),
            passed = result.passed_count(),
            total = result.tests().len(),
            "Job graded"
        );

        match serde_json::to_vec(&result) {
            Ok(body) => Reply {
                body,
                outcome: if result.success() {
                    OUTCOME_PASSED
                } else {
                    OUTCOME_FAILED
                },
            },
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to encode result");
                error_reply(INTERNAL_ERROR, OUTCOME_INTERNAL_ERROR)
            }
        }
    }
}

fn rejected() -> Reply {
    error_reply(INVALID_INPUT_FORMAT, OUTCOME_REJECTED)
}

fn error_reply(message: &str, outcome: &'static str) -> Reply {
    // encoding a two-field struct of plain strings cannot fail; fall back to
    // a literal body regardless
    let body = serde_json::to_vec(&ErrorReply::new(message)).unwrap_or_else(|_| {
        format!(r#"{{"success":false,"error":"{}"}}"#, message).into_bytes()
    });
    Reply { body, outcome }
}
