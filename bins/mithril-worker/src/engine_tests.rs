/// Integration tests for the grading protocols
///
/// These drive the real Engine with the process sandbox and `sh`-based
/// exercises, so they run anywhere a POSIX shell exists:
/// 1. Build failures short-circuit the job
/// 2. Output comparison reports the first difference
/// 3. Timeouts fail one test without cancelling the rest
/// 4. text and mcq protocols pair answers with tests
/// 5. Concurrent jobs never see each other's files
/// 6. The job handler always answers with a structured reply

#[cfg(test)]
mod protocol_tests {
    use crate::engine::{Engine, SYMBOLS_TEST};
    use crate::executor::{JobHandler, OUTCOME_PASSED, OUTCOME_REJECTED};
    use crate::sandbox::ProcessSandbox;
    use mithril_common::catalog::{ExerciseIndex, ResolvedExercise};
    use mithril_common::types::{ErrorReply, ExerciseSpec, GradingResult, INVALID_INPUT_FORMAT};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    /// Shell "program": the build syntax-checks main.sh and copies it to the
    /// artifact, tests run the artifact with sh.
    const SH_BUILD: &str = "build:\n  command: ['sh', '-c', 'sh -n main.sh && cp main.sh {output}']\n  output: prog\n";

    struct Fixture {
        exercise_dir: TempDir,
        work_root: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                exercise_dir: tempfile::tempdir().unwrap(),
                work_root: tempfile::tempdir().unwrap(),
            }
        }

        fn file(&self, rel: &str, content: &str) -> &Self {
            let path = self.exercise_dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
            self
        }

        fn exercise(&self, yaml: &str) -> ResolvedExercise {
            let spec: ExerciseSpec = serde_yaml::from_str(yaml).expect("valid exercise yaml");
            spec.validate().expect("valid exercise");
            ResolvedExercise {
                spec: Arc::new(spec),
                dir: self.exercise_dir.path().to_path_buf(),
            }
        }

        fn engine(&self) -> Engine {
            Engine::new(
                Arc::new(ProcessSandbox::default()),
                self.work_root.path().to_path_buf(),
            )
        }
    }

    fn program(tests: &str) -> String {
        format!("id: sh-prog\ntype: program\n{}tests:\n{}", SH_BUILD, tests)
    }

    fn submission(script: &str) -> Vec<String> {
        vec![format!("main.sh\n{}", script)]
    }

    async fn grade(fixture: &Fixture, exercise: &ResolvedExercise, payload: &[String]) -> GradingResult {
        fixture.engine().grade(Uuid::new_v4(), exercise, payload).await
    }

    #[tokio::test]
    async fn test_program_with_empty_expected_output_passes() {
        let fixture = Fixture::new();
        let exercise = fixture.exercise(&program("  - name: silent\n    run: ['sh', '{output}']\n"));

        let result = grade(&fixture, &exercise, &submission("exit 0\n")).await;

        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({"success": true, "tests": [{"name": "silent", "success": true, "logs": ""}]})
        );
    }

    #[tokio::test]
    async fn test_build_failure_short_circuits() {
        let fixture = Fixture::new();
        let exercise = fixture.exercise(&program(
            "  - name: one\n    run: ['sh', '{output}']\n  - name: two\n    run: ['sh', '{output}']\n",
        ));

        let result = grade(&fixture, &exercise, &submission("if true; then\n")).await;

        assert!(!result.success());
        assert!(result.tests().is_empty());
        assert!(result.failure().unwrap().starts_with("build failed"));
    }

    #[tokio::test]
    async fn test_output_mismatch_reports_line() {
        let fixture = Fixture::new();
        fixture.file("tests/answer.out", "42\n");
        let exercise = fixture.exercise(&program(
            "  - name: answer\n    run: ['sh', '{output}']\n    expected_output: tests/answer.out\n",
        ));

        let wrong = grade(&fixture, &exercise, &submission("echo 41\n")).await;
        assert!(!wrong.success());
        assert_eq!(wrong.tests()[0].logs, "line 1: expected \"42\", got \"41\"");

        let right = grade(&fixture, &exercise, &submission("echo 42\n")).await;
        assert!(right.success());
    }

    #[tokio::test]
    async fn test_line_count_mismatch() {
        let fixture = Fixture::new();
        fixture.file("tests/one.out", "a\n");
        let exercise = fixture.exercise(&program(
            "  - name: one-line\n    run: ['sh', '{output}']\n    expected_output: tests/one.out\n",
        ));

        let result = grade(&fixture, &exercise, &submission("echo a\necho b\n")).await;
        assert_eq!(result.tests()[0].logs, "expected 1 lines, got 2");
    }

    #[tokio::test]
    async fn test_input_lines_become_arguments() {
        let fixture = Fixture::new();
        fixture.file("tests/sum.in", "3\n4\n");
        fixture.file("tests/sum.out", "7\n");
        let exercise = fixture.exercise(&program(
            "  - name: sum\n    run: ['sh', '{output}']\n    input: tests/sum.in\n    expected_output: tests/sum.out\n",
        ));

        let result = grade(&fixture, &exercise, &submission("echo $(($1 + $2))\n")).await;
        assert!(result.success(), "{:?}", result);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_test() {
        let fixture = Fixture::new();
        fixture.file("tests/hi.out", "hi\n");
        let exercise = fixture.exercise(&program(
            "  - name: hi\n    run: ['sh', '{output}']\n    expected_output: tests/hi.out\n",
        ));

        let result = grade(&fixture, &exercise, &submission("echo hi\nexit 2\n")).await;
        assert!(!result.success());
        assert!(result.tests()[0].logs.starts_with("exit status 2"));
    }

    #[tokio::test]
    async fn test_timeout_fails_one_test_and_continues() {
        let fixture = Fixture::new();
        let exercise = fixture.exercise(&program(
            "  - name: slow\n    run: ['sh', '{output}', 'slow']\n    timeout: 1\n  - name: fast\n    run: ['sh', '{output}']\n",
        ));

        let script = "if [ \"$1\" = slow ]; then sleep 10; fi\n";
        let result = grade(&fixture, &exercise, &submission(script)).await;

        assert_eq!(result.tests().len(), 2);
        assert!(!result.tests()[0].success);
        assert!(result.tests()[0].logs.starts_with("timed out after"));
        assert!(result.tests()[1].success);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_missing_expected_output_fails_test() {
        let fixture = Fixture::new();
        let exercise = fixture.exercise(&program(
            "  - name: ghost\n    run: ['sh', '{output}']\n    expected_output: tests/missing.out\n",
        ));

        let result = grade(&fixture, &exercise, &submission("exit 0\n")).await;
        assert_eq!(result.tests()[0].logs, "missing expected output: tests/missing.out");
    }

    #[tokio::test]
    async fn test_malformed_submission_aborts_job() {
        let fixture = Fixture::new();
        let exercise = fixture.exercise(&program("  - name: t\n    run: ['sh', '{output}']\n"));

        let result = grade(&fixture, &exercise, &["\necho nameless".to_string()]).await;
        assert!(!result.success());
        assert!(result.tests().is_empty());
        assert!(result.failure().unwrap().contains("malformed submission"));

        let result = grade(&fixture, &exercise, &["../escape.sh\nexit 0".to_string()]).await;
        assert!(result.failure().unwrap().contains("malformed submission"));
    }

    #[tokio::test]
    async fn test_symbol_check_is_reported_first() {
        let fixture = Fixture::new();
        let yaml = format!(
            "{}validation:\n  forbidden_functions: [printf]\n",
            program("  - name: t\n    run: ['sh', '{output}']\n")
        );
        let exercise = fixture.exercise(&yaml);

        // a shell script is no object file, so nm cannot list its symbols
        let result = grade(&fixture, &exercise, &submission("exit 0\n")).await;
        assert_eq!(result.tests().len(), 2);
        assert_eq!(result.tests()[0].name, SYMBOLS_TEST);
        assert!(!result.tests()[0].success);
        assert!(result.tests()[1].success);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_are_isolated() {
        let fixture = Fixture::new();
        let exercise = fixture.exercise(&program("  - name: alone\n    run: ['sh', '{output}']\n"));
        let engine = fixture.engine();

        let job_a = vec![
            "main.sh\nsleep 1\n[ -e only_b.txt ] && exit 1\nexit 0\n".to_string(),
            "only_a.txt\na".to_string(),
        ];
        let job_b = vec![
            "main.sh\nsleep 1\n[ -e only_a.txt ] && exit 1\nexit 0\n".to_string(),
            "only_b.txt\nb".to_string(),
        ];

        let (a, b) = tokio::join!(
            engine.grade(Uuid::new_v4(), &exercise, &job_a),
            engine.grade(Uuid::new_v4(), &exercise, &job_b),
        );
        assert!(a.success(), "{:?}", a);
        assert!(b.success(), "{:?}", b);

        // working directories are gone once the jobs finish
        let leftovers = std::fs::read_dir(fixture.work_root.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_exercise_dir_resolves_from_relative_catalog() {
        let tree = tempfile::Builder::new().prefix("relative-catalog").tempdir_in(".").unwrap();
        let root = Path::new(".").join(tree.path().file_name().unwrap());
        let dir = root.join("shell/with-lib");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("lib.sh"), "echo from-lib\n").unwrap();
        std::fs::write(dir.join("lib.out"), "from-lib\n").unwrap();
        std::fs::write(
            dir.join("exercise.yaml"),
            "id: with-lib\ntype: function\nbuild:\n  command: ['cp', '{exercise_dir}/lib.sh', '{output}']\n  output: prog\ntests:\n  - name: lib\n    run: ['sh', '{output}']\n    expected_output: lib.out\n",
        )
        .unwrap();

        let (index, problems) = ExerciseIndex::load(&root).unwrap();
        assert!(problems.is_empty(), "{:?}", problems);

        let fixture = Fixture::new();
        let exercise = index.get("with-lib").unwrap();
        let result = grade(&fixture, exercise, &submission("exit 0\n")).await;
        assert!(result.success(), "{:?}", result);
    }

    #[tokio::test]
    async fn test_background_child_cannot_outlive_test() {
        let fixture = Fixture::new();
        let exercise = fixture.exercise(&program(
            "  - name: detached\n    run: ['sh', '{output}']\n    timeout: 1\n",
        ));

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(8),
            grade(&fixture, &exercise, &submission("sleep 20 &\nexit 0\n")),
        )
        .await
        .expect("grading returns once the test process exits");

        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(result.tests().len(), 1);
    }

    #[tokio::test]
    async fn test_mcq_wrong_answer() {
        let fixture = Fixture::new();
        fixture.file("answer.txt", "b\n");
        let exercise = fixture.exercise(
            "id: quiz\ntype: mcq\ntests:\n  - name: q1\n    run: ['true']\n    expected_output: answer.txt\n",
        );

        let wrong = grade(&fixture, &exercise, &["a".to_string()]).await;
        assert_eq!(
            serde_json::to_value(&wrong).unwrap(),
            serde_json::json!({"success": false, "tests": [{"name": "q1", "success": false, "logs": ""}]})
        );

        let right = grade(&fixture, &exercise, &["b".to_string()]).await;
        assert!(right.success());
    }

    #[tokio::test]
    async fn test_mcq_answer_lines_span_entries() {
        let fixture = Fixture::new();
        fixture.file("answer.txt", "a\nc\nd\n");
        let exercise = fixture.exercise(
            "id: quiz\ntype: qcm\ntests:\n  - name: q\n    run: ['true']\n    expected_output: answer.txt\n",
        );

        let result = grade(&fixture, &exercise, &["a\nc".to_string(), "d".to_string()]).await;
        assert!(result.success());

        let result = grade(&fixture, &exercise, &["a".to_string(), "c".to_string()]).await;
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_text_pairs_answers_with_tests() {
        let fixture = Fixture::new();
        fixture.file("tests/capital.out", "paris\n");
        fixture.file("tests/river.out", "seine\n");
        let exercise = fixture.exercise(
            r#"id: geo
type: text
tests:
  - name: capital
    run: ['sh', '-c', 'echo "$1"', 'sh']
    expected_output: tests/capital.out
  - name: river
    run: ['sh', '-c', 'echo "$1"', 'sh']
    expected_output: tests/river.out
"#,
        );

        let result = grade(&fixture, &exercise, &["paris".to_string()]).await;
        assert_eq!(result.tests().len(), 2);
        assert!(result.tests()[0].success);
        assert!(!result.tests()[1].success);
        assert_eq!(result.tests()[1].logs, "no answer submitted");

        let result = grade(&fixture, &exercise, &["paris".to_string(), "seine".to_string()]).await;
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_text_answer_follows_input_arguments() {
        let fixture = Fixture::new();
        fixture.file("tests/prefix.in", "hello\n");
        fixture.file("tests/greet.out", "hello world\n");
        let exercise = fixture.exercise(
            r#"id: greet
type: text
tests:
  - name: greet
    run: ['sh', '-c', 'echo "$1 $2"', 'sh']
    input: tests/prefix.in
    expected_output: tests/greet.out
"#,
        );

        let result = grade(&fixture, &exercise, &["world".to_string()]).await;
        assert!(result.success(), "{:?}", result);
    }

    fn write_catalog(root: &Path) {
        let dir = root.join("basics/echo");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(root.join("basics/pool.yaml"), "id: basics\nname: Basics\n").unwrap();
        std::fs::write(dir.join("expected.txt"), "b\n").unwrap();
        std::fs::write(
            dir.join("exercise.yaml"),
            "id: pick\ntype: mcq\ntests:\n  - name: q\n    run: ['true']\n    expected_output: expected.txt\n",
        )
        .unwrap();
    }

    fn handler(fixture: &Fixture) -> JobHandler {
        write_catalog(fixture.exercise_dir.path());
        let (index, problems) = ExerciseIndex::load(fixture.exercise_dir.path()).unwrap();
        assert!(problems.is_empty());
        JobHandler::new(Arc::new(index), fixture.engine())
    }

    #[tokio::test]
    async fn test_handler_rejects_invalid_payload() {
        let fixture = Fixture::new();
        let handler = handler(&fixture);
        let expected = serde_json::to_vec(&ErrorReply::new(INVALID_INPUT_FORMAT)).unwrap();

        for payload in [&b"not json"[..], &br#"{"a": 1}"#[..], &br#"[1, 2]"#[..]] {
            let reply = handler.handle(Uuid::new_v4(), "worker.pick.grade", payload).await;
            assert_eq!(reply.body, expected);
            assert_eq!(reply.outcome, OUTCOME_REJECTED);
        }
    }

    #[tokio::test]
    async fn test_handler_rejects_unknown_exercise() {
        let fixture = Fixture::new();
        let handler = handler(&fixture);

        let reply = handler.handle(Uuid::new_v4(), "worker.nope.grade", br#"["a"]"#).await;
        let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body, serde_json::json!({"success": false, "error": "Invalid input format"}));
    }

    #[tokio::test]
    async fn test_handler_grades_resolved_exercise() {
        let fixture = Fixture::new();
        let handler = handler(&fixture);

        let reply = handler.handle(Uuid::new_v4(), "worker.pick.grade", br#"["b"]"#).await;
        assert_eq!(reply.outcome, OUTCOME_PASSED);
        let result: GradingResult = serde_json::from_slice(&reply.body).unwrap();
        assert!(result.success());
        assert_eq!(result.tests()[0].name, "q");
    }

    /// Test: the canonical C submission compiles, runs and passes
    #[tokio::test]
    #[ignore] // Requires a C compiler
    async fn test_c_program_end_to_end() {
        let fixture = Fixture::new();
        let exercise = fixture.exercise(
            r#"id: c-empty
type: program
build:
  command: ['cc', '-o', '{output}', 'main.c']
  output: main
tests:
  - name: runs
    run: ['./{output}']
"#,
        );

        let result = grade(&fixture, &exercise, &["main.c\nint main(){return 0;}".to_string()]).await;
        assert_eq!(
            serde_json::to_string(&result).unwrap(),
            r#"{"success":true,"tests":[{"name":"runs","success":true,"logs":""}]}"#
        );
    }

    /// Test: forbidden libc calls are caught from the binary's symbol table
    #[tokio::test]
    #[ignore] // Requires a C compiler and binutils
    async fn test_c_forbidden_function() {
        let fixture = Fixture::new();
        let exercise = fixture.exercise(
            r#"id: c-no-printf
type: function
build:
  command: ['cc', '-o', '{output}', 'main.c']
tests:
  - name: runs
    run: ['./{output}']
validation:
  forbidden_functions: [printf]
"#,
        );

        let payload = ["main.c\n#include <stdio.h>\nint main(){printf(\"%d\", 0);return 0;}".to_string()];
        let result = grade(&fixture, &exercise, &payload).await;
        assert_eq!(result.tests()[0].name, SYMBOLS_TEST);
        assert_eq!(result.tests()[0].logs, "forbidden function used: printf");
    }
}
