//! # WebSocket Module
//!
//! Drives one broker connection over any tungstenite-compatible stream.
//!
//! The stream is split into a reader task, which decodes frames and feeds
//! them to the [`ServerSession`], and a writer task, which sends whatever
//! the session and the registry queue for this connection, plus heart-beats
//! once they have been negotiated.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use matchit::Router;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::server::callbacks::{AppDestinationFn, OnConnectFn, OnDisconnectFn};
use crate::server::session::{Outgoing, ServerSession, SessionRegistry};
use crate::server::types::ServeParams;
use crate::utils::{Incoming, decode_frames, encode_frame, heartbeat_message};

/// Serves a single STOMP connection until either side closes it.
pub(crate) async fn serve_websocket<S>(
    stream: S,
    params: ServeParams,
    on_connect: OnConnectFn,
    on_disconnect: Option<OnDisconnectFn>,
    app_destinations: Arc<Mutex<Router<AppDestinationFn>>>,
    registry: Arc<Mutex<SessionRegistry>>,
) where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message> + Send + Unpin + 'static,
{
    let (mut write_ws, mut read_ws) = stream.split();
    let (closer_tx, mut closer_rx) = mpsc::channel::<()>(1);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outgoing>();

    let reader_task = tokio::spawn(async move {
        let mut session = ServerSession::new(
            params,
            outbound_tx.clone(),
            on_connect,
            on_disconnect,
            app_destinations,
            registry,
        );

        let reason = 'outer: loop {
            tokio::select! {
                biased;

                _ = closer_rx.recv() => {
                    break 'outer "closed by broker";
                }

                remote_msg = read_ws.next() => {
                    let message = match remote_msg {
                        Some(Ok(message)) => message,
                        _ => break 'outer "connection lost",
                    };

                    let mut frames = Vec::new();
                    let mut malformed = None;
                    let data = match &message {
                        Message::Text(text) => text.as_str().as_bytes(),
                        Message::Binary(bin) => &bin[..],
                        Message::Close(_) => break 'outer "closed by client",
                        _ => continue,
                    };
                    decode_frames(data, |result| match result {
                        Ok(Incoming::Frame(frame)) => frames.push(frame),
                        Ok(Incoming::Heartbeat) => {}
                        Err(err) => malformed = Some(err.to_string()),
                    });

                    for frame in frames {
                        session.process_frame(frame).await;
                    }
                    if let Some(err) = malformed {
                        session.fail(&format!("malformed frame: {}", err));
                    }
                }
            }
        };

        log::debug!("session ended: {}", reason);
        let _ = outbound_tx.send(Outgoing::Close(reason.to_string()));
        drop(session);
        read_ws
    });

    let writer_task = tokio::spawn(async move {
        let mut heartbeat: Option<Interval> = None;

        let reason = 'outer: loop {
            tokio::select! {
                biased;

                outgoing = outbound_rx.recv() => {
                    let message = match outgoing {
                        Some(Outgoing::Frame(frame)) => encode_frame(&frame),
                        Some(Outgoing::Heartbeat(interval)) => {
                            let mut timer = tokio::time::interval(interval);
                            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            heartbeat = Some(timer);
                            continue;
                        }
                        Some(Outgoing::Close(reason)) => break 'outer reason,
                        None => break 'outer String::from("session dropped"),
                    };
                    if write_ws.send(message).await.is_err() {
                        break 'outer String::from("write error");
                    }
                }

                _ = tick(&mut heartbeat) => {
                    if write_ws.send(heartbeat_message()).await.is_err() {
                        break 'outer String::from("write error");
                    }
                }
            }
        };

        let _ = closer_tx.try_send(());
        let _ = write_ws
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: reason.into(),
            })))
            .await;
        write_ws
    });

    let (read_ws, write_ws) = tokio::join!(reader_task, writer_task);

    if let (Ok(read_ws), Ok(write_ws)) = (read_ws, write_ws) {
        if let Ok(mut stream) = read_ws.reunite(write_ws) {
            let _ = tokio::time::timeout(Duration::from_secs(1), stream.close()).await;
        }
    } else {
        log::debug!("failed to join reader and writer tasks");
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
