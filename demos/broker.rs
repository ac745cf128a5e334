use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stomp_notify::server::Broker;
use tokio_stomp_notify::server::types::{Publication, ServeParams};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            Targets::new()
                .with_default(LevelFilter::INFO)
                .with_target("tokio_stomp_notify", LevelFilter::TRACE),
        )
        .init();

    let broker = Broker::new();

    // Every chat message is broadcast to the interaction topic.
    broker
        .add_app_destination("/app/chat", |ctx, body| async move {
            log::info!("chat from {}: {}", ctx.session_id, String::from_utf8_lossy(&body));
            Ok(vec![Publication::new("/topic/interaction", body)])
        })
        .unwrap();

    let ticker = broker.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        for i in 0.. {
            interval.tick().await;
            let body = format!("{{\"tick\":{}}}", i);
            let delivered = ticker.publish(Publication::json("/topic/interaction", body));
            log::info!("tick {} delivered to {} subscription(s)", i, delivered);
        }
    });

    let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
    log::info!("listening on: ws://{}/ws", listener.local_addr().unwrap());

    while let Ok((stream, addr)) = listener.accept().await {
        log::info!("accepted connection from: {}", addr);
        let broker = broker.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => {
                    let params = ServeParams::default().with_heartbeat(Duration::from_secs(10));
                    broker.serve_with_params(ws, params).await;
                }
                Err(err) => log::error!("handshake failed: {:?}", err),
            }
            log::info!("closed connection with: {}", addr);
        });
    }
}
