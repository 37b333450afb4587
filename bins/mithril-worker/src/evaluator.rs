/// Test Evaluator - Output Comparison and Aggregation
///
/// **Core Responsibility:**
/// Compare what a command printed against the expected output and turn the
/// outcome into a `TestResult`.
///
/// **Critical Properties:**
/// - Knows nothing about sandboxes or the bus
/// - Pure functions: (outputs, expected outputs) → results
///
/// **Comparison Rule:**
/// - Both sides are split into lines
/// - Different line counts fail immediately, without per-line detail
/// - Otherwise every line must be byte-identical, in order
/// - No whitespace trimming, no case folding

use crate::engine::LEAK_CHECK_EXIT_CODE;
use crate::sandbox::{ProcessOutput, SandboxError};
use mithril_common::types::{GradingResult, TestResult};
use tracing::{debug, info};

/// Longest stderr excerpt copied into test logs.
const MAX_STDERR_IN_LOGS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    Match,
    LineCount { expected: usize, actual: usize },
    Line {
        number: usize,
        expected: String,
        actual: String,
    },
}

impl Comparison {
    pub fn is_match(&self) -> bool {
        matches!(self, Comparison::Match)
    }

    /// Log text for a failed comparison; empty for a match.
    pub fn describe(&self) -> String {
        match self {
            Comparison::Match => String::new(),
            Comparison::LineCount { expected, actual } => {
                format!("expected {} lines, got {}", expected, actual)
            }
            Comparison::Line {
                number,
                expected,
                actual,
            } => format!("line {}: expected {:?}, got {:?}", number, expected, actual),
        }
    }
}

pub fn output_lines(output: &str) -> Vec<&str> {
    output.lines().collect()
}

pub fn compare_lines<E, A>(expected: &[E], actual: &[A]) -> Comparison
where
    E: AsRef<str>,
    A: AsRef<str>,
{
    if expected.len() != actual.len() {
        return Comparison::LineCount {
            expected: expected.len(),
            actual: actual.len(),
        };
    }

    for (idx, (e, a)) in expected.iter().zip(actual).enumerate() {
        if e.as_ref().as_bytes() != a.as_ref().as_bytes() {
            return Comparison::Line {
                number: idx + 1,
                expected: e.as_ref().to_string(),
                actual: a.as_ref().to_string(),
            };
        }
    }

    Comparison::Match
}

pub fn compare_output(expected: &str, actual: &str) -> Comparison {
    compare_lines(&output_lines(expected), &output_lines(actual))
}

fn stderr_excerpt(stderr: &str) -> &str {
    let stderr = stderr.trim_end();
    if stderr.len() <= MAX_STDERR_IN_LOGS {
        return stderr;
    }
    let mut end = MAX_STDERR_IN_LOGS;
    while !stderr.is_char_boundary(end) {
        end -= 1;
    }
    &stderr[..end]
}

/// Evaluate one test run.
///
/// Priority: execution failure (spawn error, timeout), then memory errors
/// when leak checking, then non-zero exit, then output comparison.
pub fn evaluate_run(
    name: &str,
    outcome: Result<ProcessOutput, SandboxError>,
    expected: &str,
    leak_checked: bool,
) -> TestResult {
    let output = match outcome {
        Ok(output) => output,
        Err(e) => return TestResult::failed(name, e.to_string()),
    };

    if leak_checked && output.exit_code == Some(LEAK_CHECK_EXIT_CODE) {
        let mut logs = "memory errors detected".to_string();
        let excerpt = stderr_excerpt(&output.stderr);
        if !excerpt.is_empty() {
            logs.push('\n');
            logs.push_str(excerpt);
        }
        return TestResult::failed(name, logs);
    }

    if !output.success() {
        let mut logs = output.status();
        let excerpt = stderr_excerpt(&output.stderr);
        if !excerpt.is_empty() {
            logs.push('\n');
            logs.push_str(excerpt);
        }
        return TestResult::failed(name, logs);
    }

    let comparison = compare_output(expected, &output.stdout);
    if comparison.is_match() {
        TestResult::passed(name)
    } else {
        TestResult::failed(name, comparison.describe())
    }
}

/// Aggregate per-test results, in order, into the job result.
pub fn aggregate(tests: Vec<TestResult>) -> GradingResult {
    for (idx, test) in tests.iter().enumerate() {
        debug!(test_num = idx + 1, test = %test.name, success = test.success, "Test result");
    }

    let result = GradingResult::from_tests(tests);
    info!(
        passed = result.passed_count(),
        total = result.tests().len(),
        success = result.success(),
        "Evaluation complete"
    );
    result
}
