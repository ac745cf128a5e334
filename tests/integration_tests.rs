use std::future::IntoFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stomp_notify::{
    client::{Client, ConnectError, State},
    config::{Config, FixedDelay, Heartbeat},
    events::{InboundMessage, Payload},
    identity::{IdentitySource, MemoryStore},
    server::{
        Broker,
        types::{Publication, ServeParams},
    },
    subscription::TopicKind,
    tungstenite::Message,
};
use tokio_tungstenite::accept_async;

const WAIT: Duration = Duration::from_secs(5);

/// Starts `broker` on a random port and returns its endpoint
async fn start_broker(broker: Broker, params: ServeParams) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _addr)) = listener.accept().await {
            let broker = broker.clone();
            tokio::spawn(async move {
                if let Ok(ws) = accept_async(stream).await {
                    broker.serve_with_params(ws, params).await;
                }
            });
        }
    });

    format!("ws://{}/ws", addr)
}

/// Polls `check` until it holds, panicking after `WAIT`
async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn collect_messages(client: &Client) -> mpsc::UnboundedReceiver<InboundMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on_message(move |message| {
        let _ = tx.send(message);
    });
    rx
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<InboundMessage>) -> InboundMessage {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no message in time")
        .expect("message channel closed")
}

fn identity(id: &str) -> Config {
    Config::new().with_identity(IdentitySource::Fixed(id.into()))
}

#[tokio::test]
async fn test_connect_subscribes_identity_scoped_topics() {
    let broker = Broker::new();
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let client = Client::new(&url, identity("42"));
    assert_eq!(client.state(), State::Disconnected);

    client.connect().await.unwrap();
    assert_eq!(client.state(), State::Connected);
    assert_eq!(client.identity().as_deref(), Some("42"));

    let expected = vec![
        "/topic/chat/42".to_string(),
        "/topic/interaction".to_string(),
        "/topic/notification/42".to_string(),
    ];
    wait_until("subscriptions", || broker.subscriptions() == expected).await;

    let mut local = client.subscriptions();
    local.sort();
    assert_eq!(local, expected);

    client.disconnect().await;
    assert_eq!(client.state(), State::Disconnected);
    assert!(client.subscriptions().is_empty());
}

#[tokio::test]
async fn test_identity_read_from_store_at_connect_time() {
    let broker = Broker::new();
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let store = Arc::new(MemoryStore::new());
    let client = Client::new(
        &url,
        Config::new().with_identity(IdentitySource::store(store.clone())),
    );

    store.set("userId", "7");
    client.connect().await.unwrap();
    assert_eq!(client.connection().identity.as_deref(), Some("7"));
    wait_until("subscriptions", || broker.subscriptions().len() == 3).await;
    assert!(broker.subscriptions().contains(&"/topic/notification/7".to_string()));

    client.disconnect().await;
}

#[tokio::test]
async fn test_absent_identity_subscribes_broadcast_topic_only() {
    let broker = Broker::new();
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let store = Arc::new(MemoryStore::new());
    let client = Client::new(
        &url,
        Config::new().with_identity(IdentitySource::store(store)),
    );

    client.connect().await.unwrap();
    assert_eq!(client.state(), State::Connected);
    assert_eq!(client.identity(), None);

    wait_until("subscriptions", || {
        broker.subscriptions() == vec!["/topic/interaction".to_string()]
    })
    .await;
    assert_eq!(client.subscriptions(), vec!["/topic/interaction".to_string()]);

    client.disconnect().await;
}

#[tokio::test]
async fn test_connected_before_first_message() {
    let broker = Broker::new();
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let client = Client::new(&url, identity("42"));
    let events = Arc::new(Mutex::new(Vec::new()));

    let events_clone = events.clone();
    client.on_connecting(move || events_clone.lock().unwrap().push("connecting".to_string()));
    let events_clone = events.clone();
    client.on_connected(move |_| events_clone.lock().unwrap().push("connected".to_string()));
    let events_clone = events.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_message(move |message| {
        events_clone.lock().unwrap().push(format!("message {}", message.kind));
        let _ = tx.send(message);
    });

    client.connect().await.unwrap();
    wait_until("subscriptions", || broker.subscriptions().len() == 3).await;
    assert_eq!(broker.publish(Publication::new("/topic/chat/42", "hello")), 1);
    next_message(&mut rx).await;

    assert_eq!(
        *events.lock().unwrap(),
        vec!["connecting", "connected", "message chat"]
    );

    client.disconnect().await;
}

#[tokio::test]
async fn test_delivers_raw_messages_tagged_by_topic() {
    let broker = Broker::new();
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let client = Client::new(&url, identity("42"));
    let mut rx = collect_messages(&client);

    client.connect().await.unwrap();
    wait_until("subscriptions", || broker.subscriptions().len() == 3).await;

    broker.publish(Publication::new("/topic/notification/42", "you have mail"));
    let message = next_message(&mut rx).await;
    assert_eq!(message.kind, TopicKind::Notification);
    assert_eq!(message.destination, "/topic/notification/42");
    assert_eq!(message.payload, Payload::Raw(b"you have mail".to_vec()));
    assert!(message.message_id.is_some());

    broker.publish(Publication::new("/topic/interaction", vec![0u8, 159, 146, 150]));
    let message = next_message(&mut rx).await;
    assert_eq!(message.kind, TopicKind::Interaction);
    assert_eq!(message.payload.as_bytes(), Some(&[0u8, 159, 146, 150][..]));

    // other users' topics are not subscribed
    assert_eq!(broker.publish(Publication::new("/topic/chat/43", "nope")), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn test_json_payloads_and_undecodable_bodies() {
    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Chat {
        from: String,
        text: String,
    }

    let broker = Broker::new();
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let client = Client::new(&url, identity("42").use_json());
    let mut rx = collect_messages(&client);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_clone = errors.clone();
    client.on_error(move |err| errors_clone.lock().unwrap().push(err.to_string()));

    client.connect().await.unwrap();
    wait_until("subscriptions", || broker.subscriptions().len() == 3).await;

    broker.publish(Publication::json("/topic/chat/42", "not json"));
    broker.publish(Publication::json(
        "/topic/chat/42",
        r#"{"from":"7","text":"hi"}"#,
    ));

    let message = next_message(&mut rx).await;
    assert_eq!(message.kind, TopicKind::Chat);
    assert_eq!(message.content_type.as_deref(), Some("application/json"));
    assert_eq!(message.payload.as_json().unwrap()["text"], "hi");
    assert_eq!(
        message.payload.decode::<Chat>().unwrap(),
        Chat {
            from: "7".into(),
            text: "hi".into(),
        }
    );

    assert_eq!(errors.lock().unwrap().len(), 1);
    assert!(rx.try_recv().is_err());

    client.disconnect().await;
}

#[tokio::test]
async fn test_send_reaches_application_destination() {
    let broker = Broker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .add_app_destination("/app/chat", move |ctx, body| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((ctx.destination, ctx.content_type, body.clone()));
                Ok(vec![Publication::new("/topic/interaction", body)])
            }
        })
        .unwrap();
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let client = Client::new(&url, identity("42"));
    let mut messages = collect_messages(&client);
    client.connect().await.unwrap();
    wait_until("subscriptions", || broker.subscriptions().len() == 3).await;

    client.send(b"hello broker".to_vec()).unwrap();
    let (destination, content_type, body) = tokio::time::timeout(WAIT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(destination, "/app/chat");
    assert_eq!(content_type, None);
    assert_eq!(body, b"hello broker");

    let echo = next_message(&mut messages).await;
    assert_eq!(echo.kind, TopicKind::Interaction);
    assert_eq!(echo.payload, Payload::Raw(b"hello broker".to_vec()));

    client.send_json(&serde_json::json!({ "text": "hi" })).unwrap();
    let (_, content_type, body) = tokio::time::timeout(WAIT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(content_type.as_deref(), Some("application/json"));
    assert_eq!(body, br#"{"text":"hi"}"#);

    client.disconnect().await;
}

#[tokio::test]
async fn test_send_to_custom_destination_with_params() {
    let broker = Broker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .add_app_destination("/app/room/{room}", move |ctx, _body| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ctx.params.get("room").cloned());
                Ok(Vec::new())
            }
        })
        .unwrap();
    let url = start_broker(broker, ServeParams::default()).await;

    let client = Client::new(&url, identity("42").with_send_destination("/app/room/lobby"));
    client.connect().await.unwrap();
    client.send("hi").unwrap();

    let room = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(room.as_deref(), Some("lobby"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_application_error_is_reported_and_session_survives() {
    let broker = Broker::new();
    broker
        .add_app_destination("/app/chat", |_ctx, _body| async move {
            Err("chat is closed".to_string())
        })
        .unwrap();
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let client = Client::new(&url, identity("42"));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_clone = errors.clone();
    client.on_error(move |err| errors_clone.lock().unwrap().push(err.to_string()));

    client.connect().await.unwrap();
    client.send("hi").unwrap();

    wait_until("broker error", || !errors.lock().unwrap().is_empty()).await;
    assert!(errors.lock().unwrap()[0].contains("chat is closed"));
    assert_eq!(client.state(), State::Connected);

    client.disconnect().await;
}

#[tokio::test]
async fn test_unreachable_endpoint_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::new(&format!("ws://{}/ws", addr), Config::new());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_clone = errors.clone();
    client.on_error(move |err| errors_clone.lock().unwrap().push(err.to_string()));

    let result = client.connect().await;
    assert!(matches!(result, Err(ConnectError::Transport(_))));
    assert_eq!(client.state(), State::Failed);

    let errors = errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(!errors[0].is_empty());
    assert!(client.connection().last_error.is_some());

    // disconnect after failure is safe and idempotent
    client.disconnect().await;
    assert_eq!(client.state(), State::Disconnected);
    client.disconnect().await;
    assert_eq!(client.state(), State::Disconnected);
}

#[tokio::test]
async fn test_invalid_endpoint_fails_without_retry() {
    let client = Client::new(
        "ftp://localhost/ws",
        Config::new().with_reconnect_strategy(FixedDelay::new(Duration::from_millis(10))),
    );

    let result = client.connect().await;
    assert!(matches!(result, Err(ConnectError::InvalidEndpoint(_))));
    assert_eq!(client.state(), State::Failed);
}

#[tokio::test]
async fn test_rejected_connection() {
    let mut broker = Broker::new();
    broker.on_connect(|ctx| async move {
        match ctx.headers.get("passcode").map(String::as_str) {
            Some("secret") => Ok(()),
            _ => Err("bad credentials".to_string()),
        }
    });
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let client = Client::new(
        &url,
        Config::new().with_reconnect_strategy(FixedDelay::new(Duration::from_millis(10))),
    );
    let result = client.connect().await;
    assert_eq!(
        result,
        Err(ConnectError::Rejected("bad credentials".to_string()))
    );
    assert_eq!(client.state(), State::Failed);

    let client = Client::new(&url, Config::new().with_header("passcode", "secret"));
    client.connect().await.unwrap();
    assert_eq!(client.state(), State::Connected);
    assert_eq!(broker.session_count(), 1);

    client.disconnect().await;
}

#[tokio::test]
async fn test_reconnects_after_broker_drops_connection() {
    let broker = Broker::new();
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let client = Client::new(
        &url,
        identity("42").with_reconnect_strategy(FixedDelay::new(Duration::from_millis(50))),
    );
    let connected = Arc::new(Mutex::new(0));
    let connected_clone = connected.clone();
    client.on_connected(move |_| *connected_clone.lock().unwrap() += 1);
    let mut rx = collect_messages(&client);

    client.connect().await.unwrap();
    wait_until("subscriptions", || broker.subscriptions().len() == 3).await;

    broker.disconnect_all();

    wait_until("reconnect", || *connected.lock().unwrap() == 2).await;
    wait_until("resubscribe", || broker.subscriptions().len() == 3).await;
    assert_eq!(client.state(), State::Connected);
    assert_eq!(client.connection().attempt, 0);

    broker.publish(Publication::new("/topic/interaction", "back"));
    let message = next_message(&mut rx).await;
    assert_eq!(message.payload, Payload::Raw(b"back".to_vec()));

    client.disconnect().await;
}

#[tokio::test]
async fn test_connection_loss_without_retry_fails() {
    let broker = Broker::new();
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let client = Client::new(&url, Config::new());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_clone = errors.clone();
    client.on_error(move |err| errors_clone.lock().unwrap().push(err.to_string()));

    client.connect().await.unwrap();
    wait_until("session", || broker.session_count() == 1).await;

    broker.disconnect_all();
    wait_until("failed state", || client.state() == State::Failed).await;
    assert!(!errors.lock().unwrap().is_empty());
    assert!(client.subscriptions().is_empty());

    // a failed client can connect again
    client.connect().await.unwrap();
    assert_eq!(client.state(), State::Connected);
    client.disconnect().await;
}

#[tokio::test]
async fn test_broker_heartbeats_keep_connection_alive() {
    let broker = Broker::new();
    let params = ServeParams::default().with_heartbeat(Duration::from_millis(50));
    let url = start_broker(broker.clone(), params).await;

    let client = Client::new(
        &url,
        Config::new().with_heartbeat(Heartbeat {
            outgoing: 0,
            incoming: 50,
        }),
    );
    client.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.state(), State::Connected);

    client.disconnect().await;
}

/// Accepts one connection, answers CONNECTED with `heart_beat` when given
/// and then never sends anything again
async fn start_silent_server(heart_beat: Option<&'static str>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _connect = ws.next().await;
        if let Some(heart_beat) = heart_beat {
            let connected = format!("CONNECTED\nversion:1.2\nheart-beat:{}\n\n\0", heart_beat);
            ws.send(Message::Text(connected.into())).await.unwrap();
        }
        while let Some(Ok(_)) = ws.next().await {}
    });

    format!("ws://{}/ws", addr)
}

#[tokio::test]
async fn test_missing_heartbeats_mean_connection_lost() {
    let url = start_silent_server(Some("100,0")).await;

    let client = Client::new(
        &url,
        Config::new().with_heartbeat(Heartbeat {
            outgoing: 0,
            incoming: 100,
        }),
    );
    client.connect().await.unwrap();

    wait_until("failed state", || client.state() == State::Failed).await;
    let last_error = client.connection().last_error.unwrap();
    assert!(last_error.contains("no data from broker"), "{}", last_error);
}

#[tokio::test]
async fn test_client_sends_heartbeats_at_negotiated_interval() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let (beats_tx, mut beats_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _connect = ws.next().await;
        let connected = "CONNECTED\nversion:1.2\nheart-beat:0,50\n\n\0";
        ws.send(Message::Text(connected.into())).await.unwrap();

        let window = tokio::time::sleep(Duration::from_millis(600));
        tokio::pin!(window);
        let mut beats = 0;
        loop {
            tokio::select! {
                _ = &mut window => break,
                message = ws.next() => match message {
                    Some(Ok(Message::Text(text))) if text.as_str() == "\n" => beats += 1,
                    Some(Ok(_)) => {}
                    _ => break,
                },
            }
        }
        let _ = beats_tx.send(beats);
        while let Some(Ok(_)) = ws.next().await {}
    });

    let client = Client::new(
        &url,
        identity("1").with_heartbeat(Heartbeat {
            outgoing: 50,
            incoming: 0,
        }),
    );
    client.connect().await.unwrap();

    let beats = tokio::time::timeout(WAIT, beats_rx.recv())
        .await
        .expect("no heart-beat count in time")
        .unwrap();
    assert!((5..=13).contains(&beats), "{} heart-beats in 600ms", beats);
    assert_eq!(client.state(), State::Connected);

    client.disconnect().await;
}

#[tokio::test]
async fn test_huge_content_length_is_reported_and_connection_survives() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _connect = ws.next().await;
        let connected = "CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0";
        ws.send(Message::Text(connected.into())).await.unwrap();

        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                if text.as_str().contains("destination:/topic/interaction") {
                    break;
                }
            }
        }
        let bad = "MESSAGE\ndestination:/topic/interaction\ncontent-length:18446744073709551615\n\nhi\0";
        ws.send(Message::Text(bad.into())).await.unwrap();
        let good = "MESSAGE\ndestination:/topic/interaction\nmessage-id:2\n\nstill here\0";
        ws.send(Message::Text(good.into())).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let client = Client::new(
        &url,
        identity("1").with_reconnect_strategy(FixedDelay::new(Duration::from_millis(20))),
    );
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_clone = errors.clone();
    client.on_error(move |err| errors_clone.lock().unwrap().push(err.to_string()));
    let mut messages = collect_messages(&client);

    client.connect().await.unwrap();

    let message = next_message(&mut messages).await;
    assert_eq!(message.kind, TopicKind::Interaction);
    assert_eq!(message.payload, Payload::Raw(b"still here".to_vec()));

    let errors = errors.lock().unwrap().clone();
    assert!(
        errors.iter().any(|e| e.contains("content-length")),
        "{:?}",
        errors
    );
    assert_eq!(client.state(), State::Connected);
    assert_eq!(client.connection().last_error, None);

    client.disconnect().await;
}

#[tokio::test]
async fn test_connect_timeout() {
    let url = start_silent_server(None).await;

    let client = Client::new(
        &url,
        Config::new().with_connect_timeout(Duration::from_millis(200)),
    );
    let result = client.connect().await;
    assert_eq!(
        result,
        Err(ConnectError::Timeout(Duration::from_millis(200)))
    );
    assert_eq!(client.state(), State::Failed);
}

#[tokio::test]
async fn test_disconnect_interrupts_pending_connect() {
    let url = start_silent_server(None).await;

    let client = Client::new(&url, Config::new());
    let connecting = client.connect();
    let pending = tokio::spawn(connecting.into_future());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state(), State::Connecting);

    client.disconnect().await;
    assert_eq!(client.state(), State::Disconnected);
    assert_eq!(pending.await.unwrap(), Err(ConnectError::Interrupted));
}

#[tokio::test]
async fn test_disconnect_closes_broker_session() {
    let broker = Broker::new();
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let client = Client::new(&url, Config::new());
    let disconnected = Arc::new(Mutex::new(0));
    let disconnected_clone = disconnected.clone();
    client.on_disconnected(move || *disconnected_clone.lock().unwrap() += 1);

    client.connect().await.unwrap();
    wait_until("session", || broker.session_count() == 1).await;

    client.disconnect().await;
    client.disconnect().await;
    wait_until("session closed", || broker.session_count() == 0).await;
    assert_eq!(*disconnected.lock().unwrap(), 1);
    assert!(matches!(client.send("late"), Err(_)));
}

#[tokio::test]
async fn test_drop_closes_connection() {
    let broker = Broker::new();
    let url = start_broker(broker.clone(), ServeParams::default()).await;

    let client = Client::new(&url, identity("42"));
    client.connect().await.unwrap();
    wait_until("session", || broker.session_count() == 1).await;

    drop(client);
    wait_until("session closed", || broker.session_count() == 0).await;
}
