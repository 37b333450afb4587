/// Bus subject semantics - defines only naming, not runtime logic.
/// Ensures dispatcher, worker and tooling never drift and routing keys stay
/// deterministic.

pub const GRADING_PREFIX: &str = "grading";
pub const WORKER_PREFIX: &str = "worker";

/// Inbound submissions from every client for every exercise.
pub const SUBMIT_WILDCARD: &str = "grading.*.*.submit";

/// Job requests for every exercise.
pub const WORKER_WILDCARD: &str = "worker.*.grade";

/// Queue group shared by all worker replicas.
pub const WORKER_QUEUE_GROUP: &str = "worker.grade";

/// Queue group shared by all dispatcher replicas.
pub const DISPATCHER_QUEUE_GROUP: &str = "grading.dispatcher";

pub const SUBMIT_ACTION: &str = "submit";
pub const RESULT_ACTION: &str = "result";
pub const ERROR_ACTION: &str = "error";
pub const GRADE_ACTION: &str = "grade";

pub fn submit_subject(client_id: &str, exercise_id: &str) -> String {
    format!("{}.{}.{}.{}", GRADING_PREFIX, client_id, exercise_id, SUBMIT_ACTION)
}

pub fn result_subject(client_id: &str, exercise_id: &str) -> String {
    format!("{}.{}.{}.{}", GRADING_PREFIX, client_id, exercise_id, RESULT_ACTION)
}

pub fn error_subject(client_id: &str, exercise_id: &str) -> String {
    format!("{}.{}.{}.{}", GRADING_PREFIX, client_id, exercise_id, ERROR_ACTION)
}

/// Every terminal event for one client and exercise.
pub fn outcome_wildcard(client_id: &str, exercise_id: &str) -> String {
    format!("{}.{}.{}.*", GRADING_PREFIX, client_id, exercise_id)
}

/// Job request address; any replica of the worker group may answer.
pub fn worker_subject(exercise_id: &str) -> String {
    format!("{}.{}.{}", WORKER_PREFIX, exercise_id, GRADE_ACTION)
}

/// Addressing part of a submission subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRoute {
    pub client_id: String,
    pub exercise_id: String,
}

/// Parse `grading.<client>.<exercise>.<action>`.
///
/// Returns `None` when any of the three addressable segments is missing or
/// empty; such a message cannot be answered.
pub fn parse_submission_subject(subject: &str) -> Option<SubmissionRoute> {
    let mut parts = subject.split('.');
    if parts.next()? != GRADING_PREFIX {
        return None;
    }
    let client_id = parts.next().filter(|s| !s.is_empty())?;
    let exercise_id = parts.next().filter(|s| !s.is_empty())?;
    parts.next().filter(|s| !s.is_empty())?;

    Some(SubmissionRoute {
        client_id: client_id.to_string(),
        exercise_id: exercise_id.to_string(),
    })
}

/// Extract the exercise id from `worker.<exercise>.grade`.
pub fn parse_worker_subject(subject: &str) -> Option<&str> {
    let mut parts = subject.split('.');
    if parts.next()? != WORKER_PREFIX {
        return None;
    }
    parts.next().filter(|s| !s.is_empty())
}
