use crate::catalog::{CatalogError, ResolvedExercise, SpecStore};
use crate::types::ExerciseSpec;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Redis key semantics for the exercise catalog.
/// Keys are deterministic so every service reading the catalog agrees.

pub const EXERCISE_PREFIX: &str = "mithril:exercise";
pub const POOL_PREFIX: &str = "mithril:pool";

/// Generate the cache key of an exercise spec
pub fn exercise_key(exercise_id: &str) -> String {
    format!("{}:{}", EXERCISE_PREFIX, exercise_id)
}

/// Generate the cache key listing a pool's exercise ids
pub fn pool_exercises_key(pool_id: &str) -> String {
    format!("{}:{}:exercises", POOL_PREFIX, pool_id)
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedExercise {
    spec: ExerciseSpec,
    dir: PathBuf,
}

fn encode_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Store an exercise spec with its directory, expiring after `ttl_secs`
pub async fn store_exercise(
    conn: &mut ConnectionManager,
    exercise: &ResolvedExercise,
    ttl_secs: u64,
) -> RedisResult<()> {
    let payload = serde_json::to_string(&CachedExercise {
        spec: exercise.spec.as_ref().clone(),
        dir: exercise.dir.clone(),
    })
    .map_err(encode_error)?;

    redis::cmd("SET")
        .arg(exercise_key(exercise.id()))
        .arg(payload)
        .arg("EX")
        .arg(ttl_secs)
        .query_async(conn)
        .await
}

/// Retrieve a cached exercise spec
pub async fn fetch_exercise(
    conn: &mut ConnectionManager,
    exercise_id: &str,
) -> RedisResult<Option<ResolvedExercise>> {
    let payload: Option<String> = conn.get(exercise_key(exercise_id)).await?;

    match payload {
        Some(data) => {
            let cached: CachedExercise = serde_json::from_str(&data).map_err(encode_error)?;
            Ok(Some(ResolvedExercise {
                spec: Arc::new(cached.spec),
                dir: cached.dir,
            }))
        }
        None => Ok(None),
    }
}

/// Replace the id list of a pool
pub async fn store_pool_exercises(
    conn: &mut ConnectionManager,
    pool_id: &str,
    exercise_ids: &[String],
    ttl_secs: u64,
) -> RedisResult<()> {
    let key = pool_exercises_key(pool_id);
    let _: () = conn.del(&key).await?;
    if exercise_ids.is_empty() {
        return Ok(());
    }
    let _: () = conn.rpush(&key, exercise_ids).await?;
    redis::cmd("EXPIRE")
        .arg(&key)
        .arg(ttl_secs)
        .query_async(conn)
        .await
}

/// Cache-aside spec store: Redis first, `inner` on a miss.
///
/// Redis failures count as misses, so grading keeps working when the cache
/// is down.
pub struct CachedCatalog<S> {
    conn: ConnectionManager,
    inner: S,
    ttl_secs: u64,
}

impl<S: SpecStore> CachedCatalog<S> {
    pub fn new(conn: ConnectionManager, inner: S, ttl_secs: u64) -> Self {
        Self {
            conn,
            inner,
            ttl_secs,
        }
    }

    /// Populate the cache with every given exercise, returning how many
    /// were stored.
    pub async fn warm<'a, I>(&self, exercises: I) -> usize
    where
        I: IntoIterator<Item = &'a ResolvedExercise>,
    {
        let mut conn = self.conn.clone();
        let mut stored = 0;
        let mut by_pool: std::collections::BTreeMap<String, Vec<String>> = Default::default();

        for exercise in exercises {
            match store_exercise(&mut conn, exercise, self.ttl_secs).await {
                Ok(()) => stored += 1,
                Err(e) => warn!(exercise_id = %exercise.id(), error = %e, "Failed to cache exercise"),
            }
            by_pool
                .entry(exercise.spec.pool_id.clone())
                .or_default()
                .push(exercise.id().to_string());
        }

        for (pool_id, ids) in by_pool.iter().filter(|(pool_id, _)| !pool_id.is_empty()) {
            if let Err(e) = store_pool_exercises(&mut conn, pool_id, ids, self.ttl_secs).await {
                warn!(pool_id = %pool_id, error = %e, "Failed to cache pool exercise list");
            }
        }

        stored
    }
}

#[async_trait]
impl<S: SpecStore> SpecStore for CachedCatalog<S> {
    async fn resolve(&self, exercise_id: &str) -> Result<ResolvedExercise, CatalogError> {
        let mut conn = self.conn.clone();

        match fetch_exercise(&mut conn, exercise_id).await {
            Ok(Some(exercise)) => {
                debug!(exercise_id = %exercise_id, "Exercise cache hit");
                return Ok(exercise);
            }
            Ok(None) => debug!(exercise_id = %exercise_id, "Exercise cache miss"),
            Err(e) => warn!(exercise_id = %exercise_id, error = %e, "Exercise cache unavailable"),
        }

        let exercise = self.inner.resolve(exercise_id).await?;

        if let Err(e) = store_exercise(&mut conn, &exercise, self.ttl_secs).await {
            warn!(exercise_id = %exercise_id, error = %e, "Failed to cache exercise");
        }

        Ok(exercise)
    }
}
