use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Reply text for a payload that is not a JSON array of strings, or for an
/// exercise the worker cannot resolve.
pub const INVALID_INPUT_FORMAT: &str = "Invalid input format";

/// Reply text when a grading result cannot be encoded.
pub const INTERNAL_ERROR: &str = "Internal server error during JSON encoding";

fn default_output() -> String {
    "a.out".to_string()
}

fn default_build_timeout() -> u64 {
    10
}

fn default_test_timeout() -> u64 {
    5
}

/// Grading protocol selected for an exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExerciseType {
    #[serde(alias = "code")]
    Program,
    Function,
    Text,
    #[serde(alias = "qcm")]
    Mcq,
}

impl ExerciseType {
    /// Whether submissions of this type are built and executed.
    pub fn is_compiled(&self) -> bool {
        matches!(self, ExerciseType::Program | ExerciseType::Function)
    }
}

impl fmt::Display for ExerciseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExerciseType::Program => write!(f, "program"),
            ExerciseType::Function => write!(f, "function"),
            ExerciseType::Text => write!(f, "text"),
            ExerciseType::Mcq => write!(f, "mcq"),
        }
    }
}

/// An executable plus its argument list.
///
/// Written in YAML as a sequence (`["cc", "-o", "{output}", "main.c"]`) so
/// arguments containing spaces never need quoting rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Replace every `{name}` occurrence in the program and arguments.
    pub fn substitute(&self, vars: &[(&str, &str)]) -> CommandSpec {
        let render = |part: &str| {
            vars.iter().fold(part.to_string(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        };

        CommandSpec {
            program: render(&self.program),
            args: self.args.iter().map(|a| render(a)).collect(),
        }
    }

    /// Return a copy with extra arguments appended.
    pub fn with_args<I>(&self, extra: I) -> CommandSpec
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = self.args.clone();
        args.extend(extra);
        CommandSpec {
            program: self.program.clone(),
            args,
        }
    }

    /// Return a copy run through `wrapper` (e.g. valgrind).
    pub fn wrapped_in(&self, wrapper: &[&str]) -> CommandSpec {
        let Some((program, rest)) = wrapper.split_first() else {
            return self.clone();
        };
        let mut args: Vec<String> = rest.iter().map(|s| s.to_string()).collect();
        args.push(self.program.clone());
        args.extend(self.args.iter().cloned());
        CommandSpec {
            program: program.to_string(),
            args,
        }
    }
}

impl TryFrom<Vec<String>> for CommandSpec {
    type Error = String;

    fn try_from(mut argv: Vec<String>) -> Result<Self, Self::Error> {
        if argv.is_empty() || argv[0].trim().is_empty() {
            return Err("command must name an executable".to_string());
        }
        let program = argv.remove(0);
        Ok(Self {
            program,
            args: argv,
        })
    }
}

impl From<CommandSpec> for Vec<String> {
    fn from(cmd: CommandSpec) -> Self {
        let mut argv = Vec::with_capacity(cmd.args.len() + 1);
        argv.push(cmd.program);
        argv.extend(cmd.args);
        argv
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub command: CommandSpec,
    /// Artifact name, substituted for `{output}` in commands.
    #[serde(default = "default_output")]
    pub output: String,
    #[serde(rename = "timeout", default = "default_build_timeout")]
    pub timeout_secs: u64,
}

impl BuildSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub run: CommandSpec,
    /// File (relative to the exercise directory) whose lines become arguments.
    #[serde(default)]
    pub input: Option<String>,
    /// File (relative to the exercise directory) holding the expected stdout.
    #[serde(default, alias = "expected")]
    pub expected_output: Option<String>,
    #[serde(rename = "timeout", default = "default_test_timeout")]
    pub timeout_secs: u64,
}

impl TestCase {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default, alias = "check_valgrind")]
    pub require_leak_check: bool,
    #[serde(default, alias = "allowed_functions")]
    pub allowed_symbols: BTreeSet<String>,
    #[serde(default, alias = "forbidden_functions")]
    pub forbidden_symbols: BTreeSet<String>,
}

impl ValidationRules {
    pub fn checks_symbols(&self) -> bool {
        !self.allowed_symbols.is_empty() || !self.forbidden_symbols.is_empty()
    }
}

/// Declarative grading definition of one exercise. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseSpec {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub pool_id: String,
    #[serde(rename = "type")]
    pub kind: ExerciseType,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub build: Option<BuildSpec>,
    #[serde(default)]
    pub tests: Vec<TestCase>,
    #[serde(default)]
    pub validation: Option<ValidationRules>,
}

impl ExerciseSpec {
    /// Check the structural rules a spec must satisfy before it can grade
    /// anything. Returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("exercise id is empty".to_string());
        }
        if self.id.contains('.') || self.id.contains('*') || self.id.contains('>') {
            return Err(format!("exercise id '{}' is not a valid subject token", self.id));
        }
        if self.kind.is_compiled() && self.build.is_none() {
            return Err(format!("{} exercise '{}' has no build section", self.kind, self.id));
        }
        if self.tests.is_empty() {
            return Err(format!("exercise '{}' defines no tests", self.id));
        }
        for test in &self.tests {
            if test.name.trim().is_empty() {
                return Err(format!("exercise '{}' has a test without a name", self.id));
            }
            for path in test.input.iter().chain(test.expected_output.iter()) {
                if !is_contained_path(path) {
                    return Err(format!(
                        "test '{}' references '{}' outside the exercise directory",
                        test.name, path
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn validation_rules(&self) -> ValidationRules {
        self.validation.clone().unwrap_or_default()
    }
}

/// A relative path with no parent or root components.
pub fn is_contained_path(path: &str) -> bool {
    let path = std::path::Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub success: bool,
    pub logs: String,
}

impl TestResult {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: true,
            logs: String::new(),
        }
    }

    pub fn failed(name: impl Into<String>, logs: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: false,
            logs: logs.into(),
        }
    }
}

/// Outcome of one job.
///
/// `success` is never stored: it is derived from the job-level failure (a
/// broken build or malformed submission) and the per-test results, both when
/// constructed and when decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradingResult {
    tests: Vec<TestResult>,
    failure: Option<String>,
}

impl GradingResult {
    pub fn from_tests(tests: Vec<TestResult>) -> Self {
        Self {
            tests,
            failure: None,
        }
    }

    /// A job that stopped before any test ran.
    pub fn aborted(logs: impl Into<String>) -> Self {
        Self {
            tests: Vec::new(),
            failure: Some(logs.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.failure.is_none() && self.tests.iter().all(|t| t.success)
    }

    pub fn tests(&self) -> &[TestResult] {
        &self.tests
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn passed_count(&self) -> usize {
        self.tests.iter().filter(|t| t.success).count()
    }
}

#[derive(Serialize)]
struct GradingResultOut<'a> {
    success: bool,
    tests: &'a [TestResult],
    #[serde(skip_serializing_if = "Option::is_none")]
    logs: Option<&'a str>,
}

#[derive(Deserialize)]
struct GradingResultIn {
    tests: Vec<TestResult>,
    #[serde(default)]
    logs: Option<String>,
}

impl Serialize for GradingResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        GradingResultOut {
            success: self.success(),
            tests: &self.tests,
            logs: self.failure.as_deref(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for GradingResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = GradingResultIn::deserialize(deserializer)?;
        Ok(Self {
            tests: wire.tests,
            failure: wire.logs,
        })
    }
}

/// Structured reply for a job that could not be graded at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub success: bool,
    pub error: String,
}

impl ErrorReply {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// Any body a worker may send back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerReply {
    Rejected(ErrorReply),
    Graded(GradingResult),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> ExerciseSpec {
        serde_yaml::from_str(
            r#"
id: hello
title: Hello
type: program
build:
  command: ["cc", "-o", "{output}", "main.c"]
  output: hello
tests:
  - name: greets
    run: ["./{output}"]
    expected_output: tests/greets.out
validation:
  check_valgrind: true
  forbidden_functions: [printf]
"#,
        )
        .expect("valid yaml")
    }

    #[test]
    fn test_spec_parses_original_field_names() {
        let spec = sample_spec();
        assert_eq!(spec.kind, ExerciseType::Program);
        let build = spec.build.as_ref().unwrap();
        assert_eq!(build.output, "hello");
        assert_eq!(build.timeout_secs, 10);
        assert_eq!(spec.tests[0].timeout_secs, 5);
        let rules = spec.validation_rules();
        assert!(rules.require_leak_check);
        assert!(rules.forbidden_symbols.contains("printf"));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_type_aliases() {
        let kind: ExerciseType = serde_yaml::from_str("qcm").unwrap();
        assert_eq!(kind, ExerciseType::Mcq);
        let kind: ExerciseType = serde_yaml::from_str("code").unwrap();
        assert_eq!(kind, ExerciseType::Program);
    }

    #[test]
    fn test_empty_command_rejected() {
        let parsed: Result<CommandSpec, _> = serde_json::from_str("[]");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_substitute_placeholders() {
        let cmd = CommandSpec::new("cc", vec!["-o".into(), "{output}".into(), "{workdir}/main.c".into()]);
        let rendered = cmd.substitute(&[("output", "prog"), ("workdir", "/work")]);
        assert_eq!(rendered.args(), ["-o", "prog", "/work/main.c"]);
    }

    #[test]
    fn test_wrapped_in() {
        let cmd = CommandSpec::new("./prog", vec!["1".into()]);
        let wrapped = cmd.wrapped_in(&["valgrind", "--quiet"]);
        assert_eq!(wrapped.program(), "valgrind");
        assert_eq!(wrapped.args(), ["--quiet", "./prog", "1"]);
    }

    #[test]
    fn test_validate_rejects_missing_build() {
        let mut spec = sample_spec();
        spec.build = None;
        assert!(spec.validate().unwrap_err().contains("no build"));
    }

    #[test]
    fn test_validate_rejects_escaping_paths() {
        let mut spec = sample_spec();
        spec.tests[0].expected_output = Some("../secret".into());
        assert!(spec.validate().is_err());
        spec.tests[0].expected_output = Some("/etc/passwd".into());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_no_tests() {
        let mut spec = sample_spec();
        spec.tests.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_success_is_and_of_tests() {
        let all_pass = GradingResult::from_tests(vec![TestResult::passed("a"), TestResult::passed("b")]);
        assert!(all_pass.success());

        let one_fails = GradingResult::from_tests(vec![TestResult::passed("a"), TestResult::failed("b", "x")]);
        assert!(!one_fails.success());
        assert_eq!(one_fails.passed_count(), 1);
    }

    #[test]
    fn test_success_survives_wire() {
        let result = GradingResult::from_tests(vec![TestResult::passed("a"), TestResult::failed("b", "line 1")]);
        let json = serde_json::to_string(&result).unwrap();
        let decoded: GradingResult = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, result);
        assert_eq!(decoded.success(), result.success());
    }

    #[test]
    fn test_success_rederived_from_tests() {
        // a lying `success` field is ignored
        let decoded: GradingResult = serde_json::from_str(
            r#"{"success": true, "tests": [{"name": "a", "success": false, "logs": ""}]}"#,
        )
        .unwrap();
        assert!(!decoded.success());
    }

    #[test]
    fn test_aborted_result_shape() {
        let result = GradingResult::aborted("build failed");
        assert!(!result.success());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["tests"].as_array().unwrap().len(), 0);
        assert_eq!(value["logs"], "build failed");
    }

    #[test]
    fn test_success_shape_has_no_logs_key() {
        let value = serde_json::to_value(GradingResult::from_tests(vec![TestResult::passed("t")])).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"success": true, "tests": [{"name": "t", "success": true, "logs": ""}]})
        );
    }

    #[test]
    fn test_worker_reply_variants() {
        let rejected: WorkerReply =
            serde_json::from_str(r#"{"success": false, "error": "Invalid input format"}"#).unwrap();
        assert_eq!(rejected, WorkerReply::Rejected(ErrorReply::new(INVALID_INPUT_FORMAT)));

        let graded: WorkerReply = serde_json::from_str(r#"{"success": true, "tests": []}"#).unwrap();
        assert!(matches!(graded, WorkerReply::Graded(_)));
    }
}
