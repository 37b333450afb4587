//! Connection to the message bus.

use async_nats::{Client, ConnectError, ConnectOptions, Event};
use tracing::{debug, info, warn};

/// Connect to NATS, naming the connection after the service and logging
/// connection state changes for the life of the client.
pub async fn connect(url: &str, service_name: &str) -> Result<Client, ConnectError> {
    info!(url = %url, service = %service_name, "Connecting to NATS");

    let client = ConnectOptions::new()
        .name(service_name)
        .event_callback(|event| async move {
            match event {
                Event::Disconnected => warn!("Disconnected from NATS, reconnecting..."),
                Event::Connected => info!("Connected to NATS"),
                Event::SlowConsumer(sid) => warn!(sid, "NATS slow consumer, messages dropped"),
                Event::ServerError(e) => warn!(error = %e, "NATS server error"),
                Event::ClientError(e) => warn!(error = %e, "NATS client error"),
                other => debug!(event = %other, "NATS event"),
            }
        })
        .connect(url)
        .await?;

    Ok(client)
}
