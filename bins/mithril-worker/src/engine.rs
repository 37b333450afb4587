/// Execution Engine - Grading Protocols per Exercise Type
///
/// **Core Responsibility:**
/// Drive one job through the protocol selected by `spec.kind` and produce a
/// `GradingResult`.
///
/// **Protocols:**
/// - program / function: materialize files → build → (symbols) → run tests
/// - text: run each test with the matching submitted answer appended
/// - mcq: compare answer lines with the expected file, no subprocess
///
/// **Critical Architectural Boundary:**
/// - Engine knows WHAT to run and in which order
/// - Sandbox knows HOW a command runs
/// - Evaluator judges outputs
///
/// Nothing here is fatal to the worker: every failure becomes either a
/// failed test or an aborted job result.

use crate::evaluator;
use crate::sandbox::{JobMounts, Sandbox, SandboxView};
use crate::workdir::{JobDir, SubmittedFile};
use mithril_common::catalog::ResolvedExercise;
use mithril_common::types::{
    BuildSpec, CommandSpec, ExerciseType, GradingResult, TestCase, TestResult, ValidationRules,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Exit code valgrind reports when it found memory errors.
pub const LEAK_CHECK_EXIT_CODE: i32 = 97;

const VALGRIND: &[&str] = &[
    "valgrind",
    "--leak-check=full",
    "--error-exitcode=97",
    "--quiet",
];

/// Name of the synthetic test reporting forbidden symbol usage.
pub const SYMBOLS_TEST: &str = "symbols";

const SYMBOLS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GradingError {
    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("test '{name}' could not run: {reason}")]
    TestExecutionFailed { name: String, reason: String },

    #[error("missing expected output: {0}")]
    MissingExpectedOutput(String),

    #[error("malformed submission: {0}")]
    MalformedSubmission(String),

    #[error("working directory error: {0}")]
    Workspace(String),
}

pub struct Engine {
    sandbox: Arc<dyn Sandbox>,
    work_root: PathBuf,
}

impl Engine {
    pub fn new(sandbox: Arc<dyn Sandbox>, work_root: PathBuf) -> Self {
        Self { sandbox, work_root }
    }

    pub fn sandbox_name(&self) -> &'static str {
        self.sandbox.name()
    }

    /// Grade one submission against a resolved exercise.
    #[instrument(skip_all, fields(job_id = %job_id, exercise = %exercise.id(), kind = %exercise.spec.kind))]
    pub async fn grade(
        &self,
        job_id: Uuid,
        exercise: &ResolvedExercise,
        payload: &[String],
    ) -> GradingResult {
        let outcome = match exercise.spec.kind {
            ExerciseType::Program | ExerciseType::Function => {
                self.grade_compiled(job_id, exercise, payload).await
            }
            ExerciseType::Text => self.grade_text(job_id, exercise, payload).await,
            ExerciseType::Mcq => Ok(grade_mcq(exercise, payload).await),
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Job aborted");
                GradingResult::aborted(e.to_string())
            }
        }
    }

    async fn grade_compiled(
        &self,
        job_id: Uuid,
        exercise: &ResolvedExercise,
        payload: &[String],
    ) -> Result<GradingResult, GradingError> {
        let spec = &exercise.spec;
        let build = spec.build.as_ref().ok_or_else(|| {
            GradingError::BuildFailed(format!("{} exercise has no build section", spec.kind))
        })?;

        let files = SubmittedFile::parse_all(payload)?;
        let job_dir = self.job_dir(job_id)?;
        job_dir.materialize(&files).await?;
        debug!(files = files.len(), workdir = %job_dir.path().display(), "Submission materialized");

        let mounts = JobMounts {
            workdir: job_dir.path().to_path_buf(),
            exercise_dir: exercise.dir.clone(),
        };
        let view = self.sandbox.view(&mounts);
        let vars = placeholders(&view, &build.output);

        self.build(&mounts, build, &vars).await?;

        let rules = spec.validation_rules();
        let mut tests = Vec::with_capacity(spec.tests.len() + 1);
        if rules.checks_symbols() {
            tests.push(self.check_symbols(&mounts, &build.output, &rules).await);
        }

        for case in &spec.tests {
            let result = self
                .run_case(&mounts, exercise, case, &vars, None, rules.require_leak_check)
                .await;
            tests.push(result);
        }

        Ok(evaluator::aggregate(tests))
    }

    async fn grade_text(
        &self,
        job_id: Uuid,
        exercise: &ResolvedExercise,
        answers: &[String],
    ) -> Result<GradingResult, GradingError> {
        let spec = &exercise.spec;
        let job_dir = self.job_dir(job_id)?;
        let mounts = JobMounts {
            workdir: job_dir.path().to_path_buf(),
            exercise_dir: exercise.dir.clone(),
        };
        let view = self.sandbox.view(&mounts);
        let output = spec.build.as_ref().map(|b| b.output.as_str()).unwrap_or("");
        let vars = placeholders(&view, output);

        let mut tests = Vec::with_capacity(spec.tests.len());
        for (idx, case) in spec.tests.iter().enumerate() {
            let Some(answer) = answers.get(idx) else {
                tests.push(TestResult::failed(&case.name, "no answer submitted"));
                continue;
            };
            let result = self
                .run_case(&mounts, exercise, case, &vars, Some(answer), false)
                .await;
            tests.push(result);
        }

        Ok(evaluator::aggregate(tests))
    }

    fn job_dir(&self, job_id: Uuid) -> Result<JobDir, GradingError> {
        JobDir::create(&self.work_root, job_id).map_err(|e| GradingError::Workspace(e.to_string()))
    }

    async fn build(
        &self,
        mounts: &JobMounts,
        build: &BuildSpec,
        vars: &[(&str, &str)],
    ) -> Result<(), GradingError> {
        let command = build.command.substitute(vars);
        info!(command = %command, "Building submission");

        let output = self
            .sandbox
            .run(mounts, &command, build.timeout())
            .await
            .map_err(|e| GradingError::BuildFailed(e.to_string()))?;

        if !output.success() {
            let mut logs = output.status();
            for stream in [&output.stderr, &output.stdout] {
                let text = stream.trim_end();
                if !text.is_empty() {
                    logs.push('\n');
                    logs.push_str(text);
                }
            }
            return Err(GradingError::BuildFailed(logs));
        }

        debug!(elapsed_ms = output.elapsed_ms, "Build succeeded");
        Ok(())
    }

    /// List the artifact's undefined symbols and check them against the rules.
    async fn check_symbols(
        &self,
        mounts: &JobMounts,
        artifact: &str,
        rules: &ValidationRules,
    ) -> TestResult {
        let command = CommandSpec::new("nm", vec!["-u".to_string(), artifact.to_string()]);

        let output = match self.sandbox.run(mounts, &command, SYMBOLS_TIMEOUT).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                return TestResult::failed(
                    SYMBOLS_TEST,
                    format!("nm {}\n{}", output.status(), output.stderr.trim_end()),
                )
            }
            Err(e) => return TestResult::failed(SYMBOLS_TEST, format!("nm {}", e)),
        };

        let violations = symbol_violations(&undefined_symbols(&output.stdout), rules);
        if violations.is_empty() {
            TestResult::passed(SYMBOLS_TEST)
        } else {
            TestResult::failed(SYMBOLS_TEST, violations.join("\n"))
        }
    }

    async fn run_case(
        &self,
        mounts: &JobMounts,
        exercise: &ResolvedExercise,
        case: &TestCase,
        vars: &[(&str, &str)],
        answer: Option<&str>,
        leak_check: bool,
    ) -> TestResult {
        let expected = match expected_output(exercise, case).await {
            Ok(expected) => expected,
            Err(e) => return TestResult::failed(&case.name, e.to_string()),
        };
        let mut args = match input_args(exercise, case).await {
            Ok(args) => args,
            Err(e) => return TestResult::failed(&case.name, e.to_string()),
        };
        if let Some(answer) = answer {
            args.push(answer.to_string());
        }

        let mut command = case.run.substitute(vars).with_args(args);
        if leak_check {
            command = command.wrapped_in(VALGRIND);
        }

        debug!(test = %case.name, command = %command, "Running test");
        let outcome = self.sandbox.run(mounts, &command, case.timeout()).await;
        evaluator::evaluate_run(&case.name, outcome, &expected, leak_check)
    }
}

fn placeholders<'a>(view: &'a SandboxView, output: &'a str) -> [(&'static str, &'a str); 3] {
    [
        ("output", output),
        ("workdir", view.workdir.as_str()),
        ("exercise_dir", view.exercise_dir.as_str()),
    ]
}

/// Expected stdout of a test; a test without an expected file expects nothing.
async fn expected_output(exercise: &ResolvedExercise, case: &TestCase) -> Result<String, GradingError> {
    let Some(rel) = case.expected_output.as_deref() else {
        return Ok(String::new());
    };
    tokio::fs::read_to_string(exercise.file(rel))
        .await
        .map_err(|_| GradingError::MissingExpectedOutput(rel.to_string()))
}

/// Lines of the test's input file, one argument each.
async fn input_args(exercise: &ResolvedExercise, case: &TestCase) -> Result<Vec<String>, GradingError> {
    let Some(rel) = case.input.as_deref() else {
        return Ok(Vec::new());
    };
    let content = tokio::fs::read_to_string(exercise.file(rel))
        .await
        .map_err(|e| GradingError::TestExecutionFailed {
            name: case.name.clone(),
            reason: format!("cannot read input {}: {}", rel, e),
        })?;
    Ok(content.lines().map(str::to_string).collect())
}

/// Single synthetic test: answer lines against the first test's expected file.
async fn grade_mcq(exercise: &ResolvedExercise, answers: &[String]) -> GradingResult {
    // validated specs always have at least one test
    let Some(case) = exercise.spec.tests.first() else {
        return GradingResult::aborted("exercise defines no tests");
    };

    let expected = match expected_output(exercise, case).await {
        Ok(expected) => expected,
        Err(e) => return GradingResult::from_tests(vec![TestResult::failed(&case.name, e.to_string())]),
    };

    let submitted: Vec<&str> = answers.iter().flat_map(|a| a.lines()).collect();
    let comparison = evaluator::compare_lines(&evaluator::output_lines(&expected), &submitted);
    let result = if comparison.is_match() {
        TestResult::passed(&case.name)
    } else {
        debug!(detail = %comparison.describe(), "Answer mismatch");
        TestResult::failed(&case.name, "")
    };

    evaluator::aggregate(vec![result])
}

/// Undefined symbol names from `nm -u` output, version suffixes stripped.
pub fn undefined_symbols(nm_output: &str) -> BTreeSet<String> {
    nm_output
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .filter(|token| *token != "U" && !token.ends_with(':'))
        .map(|token| token.split('@').next().unwrap_or(token).to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Rule violations, one line each. Runtime symbols (leading `_`) are exempt
/// from the allow-list.
pub fn symbol_violations(symbols: &BTreeSet<String>, rules: &ValidationRules) -> Vec<String> {
    let mut violations = Vec::new();
    for symbol in symbols {
        if rules.forbidden_symbols.contains(symbol) {
            violations.push(format!("forbidden function used: {}", symbol));
        } else if !rules.allowed_symbols.is_empty()
            && !symbol.starts_with('_')
            && !rules.allowed_symbols.contains(symbol)
        {
            violations.push(format!("function not allowed: {}", symbol));
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(allowed: &[&str], forbidden: &[&str]) -> ValidationRules {
        ValidationRules {
            require_leak_check: false,
            allowed_symbols: allowed.iter().map(|s| s.to_string()).collect(),
            forbidden_symbols: forbidden.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_undefined_symbols_parses_nm_output() {
        let out = "                 w __gmon_start__\n                 U printf@GLIBC_2.2.5\n                 U write\n";
        let symbols = undefined_symbols(out);
        assert!(symbols.contains("printf"));
        assert!(symbols.contains("write"));
        assert!(symbols.contains("__gmon_start__"));
    }

    #[test]
    fn test_forbidden_symbol_violation() {
        let symbols = undefined_symbols("U printf\nU write\n");
        let violations = symbol_violations(&symbols, &rules(&[], &["printf"]));
        assert_eq!(violations, ["forbidden function used: printf"]);
    }

    #[test]
    fn test_allow_list_ignores_runtime_symbols() {
        let symbols = undefined_symbols("U __libc_start_main\nU write\nU malloc\n");
        let violations = symbol_violations(&symbols, &rules(&["write"], &[]));
        assert_eq!(violations, ["function not allowed: malloc"]);
    }

    #[test]
    fn test_no_rules_no_violations() {
        let symbols = undefined_symbols("U anything\n");
        assert!(symbol_violations(&symbols, &rules(&[], &[])).is_empty());
    }

    #[test]
    fn test_grading_error_messages() {
        assert_eq!(
            GradingError::MissingExpectedOutput("tests/1.out".into()).to_string(),
            "missing expected output: tests/1.out"
        );
        assert!(GradingError::BuildFailed("exit status 1".into())
            .to_string()
            .starts_with("build failed"));
    }
}
