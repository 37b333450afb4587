// CLI commands for authoring exercises and submitting solutions
use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use mithril_common::catalog::{ExerciseIndex, ResolvedExercise};
use mithril_common::subjects;
use mithril_common::types::{GradingResult, WorkerReply};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Load the exercise tree and report every problem found
pub fn check_exercises(dir: &Path) -> Result<()> {
    println!("→ Checking exercises in {}", dir.display());

    let (index, problems) = ExerciseIndex::load(dir)
        .with_context(|| format!("Failed to load exercises from {}", dir.display()))?;

    for problem in &problems {
        println!("  ✗ {}", problem);
    }

    let pools = index.pools().count();
    if problems.is_empty() {
        println!("✓ {} exercises in {} pools, no problems", index.len(), pools);
        Ok(())
    } else {
        bail!(
            "{} problem(s) found ({} valid exercises in {} pools)",
            problems.len(),
            index.len(),
            pools
        )
    }
}

/// Print pools and their exercises
pub fn list_exercises(dir: &Path) -> Result<()> {
    let (index, problems) = ExerciseIndex::load(dir)
        .with_context(|| format!("Failed to load exercises from {}", dir.display()))?;
    print!("{}", render_listing(&index));
    if !problems.is_empty() {
        println!();
        println!("⚠ {} file(s) skipped, run `mithril-cli check` for details", problems.len());
    }
    Ok(())
}

fn exercise_line(exercise: &ResolvedExercise) -> String {
    let spec = &exercise.spec;
    let title = if spec.title.is_empty() {
        String::new()
    } else {
        format!("  {}", spec.title)
    };
    format!(
        "    {:<24} {:<9} {} test(s){}\n",
        spec.id,
        spec.kind,
        spec.tests.len(),
        title
    )
}

pub fn render_listing(index: &ExerciseIndex) -> String {
    let mut out = String::new();

    for pool in index.pools() {
        let name = if pool.name.is_empty() { &pool.id } else { &pool.name };
        let _ = writeln!(out, "{} ({})", name, pool.id);
        for exercise in index.pool_exercises(&pool.id) {
            out.push_str(&exercise_line(exercise));
        }
    }

    let loose = index.pool_exercises("");
    if !loose.is_empty() {
        out.push_str("(no pool)\n");
        for exercise in loose {
            out.push_str(&exercise_line(exercise));
        }
    }

    out
}

/// Build a submission payload: files become `"<name>\n<content>"` entries,
/// followed by the plain answers.
pub fn build_payload(files: &[PathBuf], answers: &[String]) -> Result<Vec<String>> {
    let mut payload = Vec::with_capacity(files.len() + answers.len());

    for path in files {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Invalid file name: {}", path.display()))?;
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        payload.push(format!("{}\n{}", name, content));
    }

    payload.extend(answers.iter().cloned());
    Ok(payload)
}

pub fn render_result(result: &GradingResult) -> String {
    let mut out = String::new();

    if let Some(logs) = result.failure() {
        let _ = writeln!(out, "✗ Job failed");
        for line in logs.lines() {
            let _ = writeln!(out, "    {}", line);
        }
    }

    for test in result.tests() {
        let mark = if test.success { "✓" } else { "✗" };
        let _ = writeln!(out, "  {} {}", mark, test.name);
        for line in test.logs.lines() {
            let _ = writeln!(out, "      {}", line);
        }
    }

    let _ = writeln!(
        out,
        "{} {}/{} tests passed",
        if result.success() { "✓" } else { "✗" },
        result.passed_count(),
        result.tests().len()
    );
    out
}

/// Publish a submission and wait for its terminal event
pub async fn submit(
    nats_url: &str,
    client_id: &str,
    exercise_id: &str,
    payload: Vec<String>,
    timeout: Duration,
) -> Result<()> {
    let client = async_nats::connect(nats_url)
        .await
        .with_context(|| format!("Failed to connect to NATS at {}", nats_url))?;

    // subscribe before publishing so the outcome cannot be missed
    let mut outcomes = client
        .subscribe(subjects::outcome_wildcard(client_id, exercise_id))
        .await
        .context("Failed to subscribe to grading outcomes")?;

    let body = serde_json::to_vec(&payload)?;
    let subject = subjects::submit_subject(client_id, exercise_id);
    client
        .publish(subject.clone(), body.into())
        .await
        .context("Failed to publish submission")?;
    client.flush().await.context("Failed to flush submission")?;

    println!("→ Submitted {} entries to {}", payload.len(), subject);

    loop {
        let message = match tokio::time::timeout(timeout, outcomes.next()).await {
            Ok(Some(message)) => message,
            Ok(None) => bail!("Outcome subscription closed before a result arrived"),
            Err(_) => bail!("No outcome within {} ms", timeout.as_millis()),
        };

        let action = message.subject.rsplit('.').next().unwrap_or_default();
        if action == subjects::RESULT_ACTION {
            match serde_json::from_slice::<WorkerReply>(&message.payload) {
                Ok(WorkerReply::Graded(result)) => {
                    print!("{}", render_result(&result));
                    return Ok(());
                }
                Ok(WorkerReply::Rejected(reply)) => bail!("Submission rejected: {}", reply.error),
                Err(_) => {
                    println!("{}", String::from_utf8_lossy(&message.payload));
                    return Ok(());
                }
            }
        } else if action == subjects::ERROR_ACTION {
            bail!("Grading error: {}", String::from_utf8_lossy(&message.payload));
        }
        // our own submission echoes back on the wildcard
    }
}
