mod config;
mod dispatcher;
mod metrics;

use config::DispatcherConfig;
use dispatcher::{Dispatcher, NatsTransport};
use futures_util::StreamExt;
use mithril_common::config::{log_format, LogFormat};
use mithril_common::{bus, subjects};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Mithril Dispatcher booting...");

    let config = DispatcherConfig::from_env()?;
    let client = bus::connect(&config.nats_url, "mithril-dispatcher").await?;

    let metrics_addr = config.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let dispatcher = Arc::new(Dispatcher::new(
        NatsTransport::new(client.clone()),
        config.request_timeout,
    ));

    let mut subscriber = client
        .queue_subscribe(subjects::SUBMIT_WILDCARD, subjects::DISPATCHER_QUEUE_GROUP.to_string())
        .await?;
    info!(
        subject = subjects::SUBMIT_WILDCARD,
        queue_group = subjects::DISPATCHER_QUEUE_GROUP,
        timeout_ms = config.request_timeout.as_millis() as u64,
        "Ready to dispatch submissions"
    );

    let mut in_flight = JoinSet::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            message = subscriber.next() => {
                let Some(message) = message else {
                    warn!("Submission subscription closed");
                    break;
                };

                while let Some(finished) = in_flight.try_join_next() {
                    if let Err(e) = finished {
                        error!(error = %e, "Dispatch task panicked");
                    }
                }

                let dispatcher = dispatcher.clone();
                in_flight.spawn(async move {
                    dispatcher.handle(message.subject.as_str(), message.payload).await;
                });
            }
        }
    }

    if let Err(e) = subscriber.unsubscribe().await {
        warn!(error = %e, "Failed to unsubscribe from submissions");
    }
    info!(in_flight = in_flight.len(), "Waiting for in-flight submissions");
    while let Some(finished) = in_flight.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Dispatch task panicked");
        }
    }

    if let Err(e) = client.drain().await {
        warn!(error = %e, "Failed to drain NATS connection");
    }

    info!("Dispatcher shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_line_number(true);

    match log_format() {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
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
    warn!("Received shutdown signal, finishing in-flight submissions...");
}
