//! Per-job working directories.
//!
//! Every job gets a fresh directory that nothing else writes to; it is
//! removed when the job's [`JobDir`] is dropped.

use crate::engine::GradingError;
use mithril_common::types::is_contained_path;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

/// One file of a submission: `"<relative name>\n<content>"` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedFile {
    pub name: String,
    pub content: String,
}

impl SubmittedFile {
    pub fn parse(entry: &str) -> Result<Self, GradingError> {
        let (name, content) = entry.split_once('\n').unwrap_or((entry, ""));
        let name = name.trim();

        if name.is_empty() {
            return Err(GradingError::MalformedSubmission(
                "submitted file has no name".to_string(),
            ));
        }
        if !is_contained_path(name) {
            return Err(GradingError::MalformedSubmission(format!(
                "file name '{}' escapes the working directory",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            content: content.to_string(),
        })
    }

    /// Parse every entry; the first bad entry rejects the whole submission.
    pub fn parse_all(entries: &[String]) -> Result<Vec<Self>, GradingError> {
        entries.iter().map(|e| Self::parse(e)).collect()
    }
}

#[derive(Debug)]
pub struct JobDir {
    dir: TempDir,
}

impl JobDir {
    /// Create a fresh directory under `root`, named after the job.
    pub fn create(root: &Path, job_id: Uuid) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", job_id))
            .tempdir_in(root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write the submitted files into the directory.
    pub async fn materialize(&self, files: &[SubmittedFile]) -> Result<Vec<PathBuf>, GradingError> {
        let mut written = Vec::with_capacity(files.len());
        for file in files {
            let path = self.path().join(&file.name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| GradingError::Workspace(e.to_string()))?;
            }
            tokio::fs::write(&path, &file.content)
                .await
                .map_err(|e| GradingError::Workspace(format!("{}: {}", file.name, e)))?;
            written.push(path);
        }
        Ok(written)
    }
}
