//! Exercise catalog: pools and exercise specifications discovered in a
//! directory tree and indexed by id once, at load time.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::types::{ExerciseSpec, Pool};

pub const POOL_FILE: &str = "pool.yaml";
pub const EXERCISE_FILE: &str = "exercise.yaml";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("exercise not found: {0}")]
    NotFound(String),

    #[error("exercises directory not found: {}", .0.display())]
    MissingRoot(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("invalid exercise {}: {reason}", .path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("duplicate exercise id '{id}' in {} (already defined in {})", .path.display(), .first.display())]
    Duplicate {
        id: String,
        path: PathBuf,
        first: PathBuf,
    },
}

/// A specification together with the directory its relative paths
/// (expected outputs, inputs, harness files) are resolved against.
#[derive(Debug, Clone)]
pub struct ResolvedExercise {
    pub spec: Arc<ExerciseSpec>,
    pub dir: PathBuf,
}

impl ResolvedExercise {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Path of a file declared relative to the exercise directory.
    pub fn file(&self, relative: &str) -> PathBuf {
        self.dir.join(relative)
    }
}

/// Resolves an exercise id to its specification.
///
/// Returned specs are shared snapshots; no implementation mutates a spec
/// after handing it out.
#[async_trait]
pub trait SpecStore: Send + Sync {
    async fn resolve(&self, exercise_id: &str) -> Result<ResolvedExercise, CatalogError>;
}

#[async_trait]
impl<S: SpecStore + ?Sized> SpecStore for Arc<S> {
    async fn resolve(&self, exercise_id: &str) -> Result<ResolvedExercise, CatalogError> {
        (**self).resolve(exercise_id).await
    }
}

/// In-memory id → spec index built from one walk of the exercise tree.
#[derive(Debug, Default)]
pub struct ExerciseIndex {
    root: PathBuf,
    pools: BTreeMap<String, Pool>,
    exercises: HashMap<String, ResolvedExercise>,
}

impl ExerciseIndex {
    /// Walk `root` and index every pool and exercise below it.
    ///
    /// Files that fail to read, parse or validate are skipped and returned
    /// alongside the index; only a missing root is fatal.
    pub fn load(root: impl AsRef<Path>) -> Result<(Self, Vec<CatalogError>), CatalogError> {
        // exercise dirs are handed to sandboxes whose cwd is the job dir
        let root = match std::fs::canonicalize(root.as_ref()) {
            Ok(root) if root.is_dir() => root,
            _ => return Err(CatalogError::MissingRoot(root.as_ref().to_path_buf())),
        };

        let mut problems = Vec::new();
        let mut pool_files = Vec::new();
        let mut exercise_files = Vec::new();

        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    problems.push(CatalogError::Io {
                        path,
                        source: e.into(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match entry.file_name().to_str() {
                Some(POOL_FILE) => pool_files.push(entry.into_path()),
                Some(EXERCISE_FILE) => exercise_files.push(entry.into_path()),
                _ => {}
            }
        }

        let mut pools = BTreeMap::new();
        let mut pool_dirs: HashMap<PathBuf, String> = HashMap::new();
        for path in pool_files {
            match parse_yaml::<Pool>(&path) {
                Ok(pool) => {
                    if let Some(dir) = path.parent() {
                        pool_dirs.insert(dir.to_path_buf(), pool.id.clone());
                    }
                    pools.insert(pool.id.clone(), pool);
                }
                Err(e) => {
                    warn!(error = %e, "Skipping pool");
                    problems.push(e);
                }
            }
        }

        let mut exercises: HashMap<String, ResolvedExercise> = HashMap::new();
        for path in exercise_files {
            let dir = match path.parent() {
                Some(dir) => dir.to_path_buf(),
                None => continue,
            };

            let mut spec = match parse_yaml::<ExerciseSpec>(&path) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(error = %e, "Skipping exercise");
                    problems.push(e);
                    continue;
                }
            };

            if let Err(reason) = spec.validate() {
                warn!(path = %path.display(), reason = %reason, "Skipping invalid exercise");
                problems.push(CatalogError::Invalid { path, reason });
                continue;
            }

            if let Some(pool_id) = enclosing_pool(&dir, &root, &pool_dirs) {
                spec.pool_id = pool_id.to_string();
            }

            if let Some(existing) = exercises.get(&spec.id) {
                problems.push(CatalogError::Duplicate {
                    id: spec.id.clone(),
                    path,
                    first: existing.dir.join(EXERCISE_FILE),
                });
                continue;
            }

            debug!(exercise_id = %spec.id, kind = %spec.kind, dir = %dir.display(), "Indexed exercise");
            exercises.insert(
                spec.id.clone(),
                ResolvedExercise {
                    spec: Arc::new(spec),
                    dir,
                },
            );
        }

        Ok((
            Self {
                root,
                pools,
                exercises,
            },
            problems,
        ))
    }

    /// Absolute path of the indexed tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, exercise_id: &str) -> Option<&ResolvedExercise> {
        self.exercises.get(exercise_id)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    /// All exercises, ordered by id.
    pub fn exercises(&self) -> Vec<&ResolvedExercise> {
        let mut all: Vec<_> = self.exercises.values().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Exercises of one pool, ordered by id. An empty id selects exercises
    /// that live outside any pool.
    pub fn pool_exercises(&self, pool_id: &str) -> Vec<&ResolvedExercise> {
        self.exercises()
            .into_iter()
            .filter(|e| e.spec.pool_id == pool_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.exercises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exercises.is_empty()
    }
}

#[async_trait]
impl SpecStore for ExerciseIndex {
    async fn resolve(&self, exercise_id: &str) -> Result<ResolvedExercise, CatalogError> {
        self.get(exercise_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(exercise_id.to_string()))
    }
}

fn parse_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|e| CatalogError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Nearest pool directory at or above `dir`, without leaving `root`.
fn enclosing_pool<'a>(
    dir: &Path,
    root: &Path,
    pool_dirs: &'a HashMap<PathBuf, String>,
) -> Option<&'a str> {
    dir.ancestors()
        .take_while(|ancestor| ancestor.starts_with(root))
        .find_map(|ancestor| pool_dirs.get(ancestor).map(String::as_str))
}
