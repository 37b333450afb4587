mod config;
mod docker;
mod engine;
mod evaluator;
mod executor;
mod metrics;
mod sandbox;
mod workdir;

#[cfg(test)]
mod engine_tests;

use async_nats::Client;
use config::{SandboxKind, SandboxProfile, WorkerConfig};
use docker::DockerSandbox;
use engine::Engine;
use executor::JobHandler;
use futures_util::StreamExt;
use mithril_common::cache::CachedCatalog;
use mithril_common::catalog::{ExerciseIndex, SpecStore};
use mithril_common::config::{log_format, LogFormat};
use mithril_common::{bus, subjects};
use sandbox::{ProcessSandbox, Sandbox};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Mithril Worker booting...");

    let config = WorkerConfig::from_env()?;

    // Build the exercise index once; broken files are reported, not fatal
    let (index, problems) = ExerciseIndex::load(&config.exercises_dir)?;
    for problem in &problems {
        warn!(error = %problem, "Skipping exercise file");
    }
    info!(
        root = %index.root().display(),
        exercises = index.len(),
        pools = index.pools().count(),
        "Exercise index loaded"
    );
    let index = Arc::new(index);

    let store: Arc<dyn SpecStore> = match &config.redis_url {
        Some(redis_url) => match connect_redis(redis_url).await {
            Ok(conn) => {
                info!("Connected to Redis: {}", redis_url);
                let catalog = CachedCatalog::new(conn, index.clone(), config.cache_ttl_secs);
                let warmed = catalog.warm(index.exercises()).await;
                info!(warmed, ttl_secs = config.cache_ttl_secs, "Exercise cache warmed");
                Arc::new(catalog)
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, serving exercises from the index only");
                index.clone()
            }
        },
        None => index.clone(),
    };

    let profile = SandboxProfile::load_or_default(&config.sandbox_config)?;
    let sandbox: Arc<dyn Sandbox> = match config.sandbox {
        SandboxKind::Process => {
            warn!("Process sandbox selected: submissions run without container isolation");
            Arc::new(ProcessSandbox::new(profile.output_limit_bytes()))
        }
        SandboxKind::Docker => {
            info!(image = %profile.image, memory_mb = profile.memory_limit_mb, cpu_limit = profile.cpu_limit, "Docker sandbox selected");
            let docker = DockerSandbox::connect(profile)?;
            docker.ensure_image().await?;
            Arc::new(docker)
        }
    };

    let engine = Engine::new(sandbox, config.work_root.clone());
    let handler = Arc::new(JobHandler::new(store, engine));

    let client = bus::connect(&config.nats_url, "mithril-worker").await?;

    let metrics_addr = config.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    worker_loop(
        client.clone(),
        handler,
        config.max_concurrent_jobs,
        shutdown_signal(),
    )
    .await?;

    if let Err(e) = client.drain().await {
        warn!(error = %e, "Failed to drain NATS connection");
    }

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    match log_format() {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn connect_redis(url: &str) -> redis::RedisResult<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url)?;
    redis::aio::ConnectionManager::new(client).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("Received shutdown signal, finishing in-flight jobs...");
}

/// Pull job requests from the worker queue group until `shutdown` fires.
///
/// At most `max_jobs` jobs run at once. While every permit is taken the
/// subscription is not polled, but the server keeps delivering into its
/// client-side buffer; those requests wait here until a permit frees up or
/// the dispatcher's request times out.
#[instrument(skip_all, fields(max_jobs = max_jobs))]
async fn worker_loop(
    client: Client,
    handler: Arc<JobHandler>,
    max_jobs: usize,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let mut subscriber = client
        .queue_subscribe(subjects::WORKER_WILDCARD, subjects::WORKER_QUEUE_GROUP.to_string())
        .await?;
    info!(
        subject = subjects::WORKER_WILDCARD,
        queue_group = subjects::WORKER_QUEUE_GROUP,
        sandbox = handler.engine().sandbox_name(),
        "Ready to accept jobs"
    );

    let permits = Arc::new(Semaphore::new(max_jobs));
    let mut jobs = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        let permit = tokio::select! {
            _ = &mut shutdown => break,
            permit = permits.clone().acquire_owned() => permit?,
        };

        let message = tokio::select! {
            _ = &mut shutdown => break,
            message = subscriber.next() => match message {
                Some(message) => message,
                None => {
                    warn!("Job subscription closed");
                    break;
                }
            },
        };

        // Reap finished jobs so the set does not grow unbounded
        while let Some(finished) = jobs.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Job task panicked");
            }
        }

        let client = client.clone();
        let handler = handler.clone();
        jobs.spawn(async move {
            process_message(&client, &handler, message).await;
            drop(permit);
        });
    }

    if let Err(e) = subscriber.unsubscribe().await {
        warn!(error = %e, "Failed to unsubscribe from job subject");
    }

    info!(in_flight = jobs.len(), "Waiting for in-flight jobs");
    while let Some(finished) = jobs.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Job task panicked");
        }
    }

    Ok(())
}

async fn process_message(client: &Client, handler: &JobHandler, message: async_nats::Message) {
    let job_id = Uuid::new_v4();
    let start = Instant::now();
    metrics::JOBS_IN_FLIGHT.inc();

    info!(
        job_id = %job_id,
        subject = %message.subject,
        payload_size = message.payload.len(),
        "Received job"
    );

    let reply = handler.handle(job_id, message.subject.as_str(), &message.payload).await;

    metrics::JOBS_IN_FLIGHT.dec();
    metrics::JOBS_TOTAL.with_label_values(&[reply.outcome]).inc();
    metrics::JOB_DURATION.observe(start.elapsed().as_secs_f64());

    match message.reply {
        Some(reply_to) => match client.publish(reply_to, reply.body.into()).await {
            Ok(()) => debug!(job_id = %job_id, outcome = reply.outcome, "Reply sent"),
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to send reply"),
        },
        None => warn!(
            job_id = %job_id,
            outcome = reply.outcome,
            result = %String::from_utf8_lossy(&reply.body),
            "Request has no reply address, result discarded"
        ),
    }
}
