use std::sync::Arc;
use std::time::Duration;

use tokio_stomp_notify::client::Client;
use tokio_stomp_notify::config::{BackoffReconnect, Config, DEFAULT_ENDPOINT};
use tokio_stomp_notify::identity::{FileStore, IdentitySource};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    #[derive(Debug, serde::Serialize)]
    struct Chat {
        text: String,
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            Targets::new()
                .with_default(LevelFilter::INFO)
                .with_target("tokio_stomp_notify", LevelFilter::DEBUG),
        )
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let storage = std::env::var("STORAGE").unwrap_or_else(|_| "storage.json".to_string());

    let client = Client::new(
        &endpoint,
        Config::new()
            .with_identity(IdentitySource::store(Arc::new(FileStore::new(storage))))
            .with_reconnect_strategy(BackoffReconnect::default())
            .use_json(),
    );

    client.on_connecting(|| {
        log::info!("connecting");
    });
    client.on_connected(|e| {
        log::info!("connected (version={}, identity={:?})", e.version, e.identity);
    });
    client.on_disconnected(|| {
        log::info!("disconnected");
    });
    client.on_error(|err| {
        log::info!("error: {:#}", err);
    });
    client.on_message(|message| {
        log::info!("{} message on {}: {:?}", message.kind, message.destination, message.payload);
    });

    if let Err(err) = client.connect().await {
        log::error!("could not connect: {}", err);
        return;
    }
    log::info!("subscribed to {:?}", client.subscriptions());

    for i in 0..10 {
        let _ = client.send_json(&Chat {
            text: format!("hello #{}", i),
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    client.disconnect().await;
}
