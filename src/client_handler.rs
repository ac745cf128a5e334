use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::client::types::{LinkEnd, WsStream};
use crate::protocol::Frame;
use crate::utils::{Incoming, decode_frames, encode_frame, heartbeat_message};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Drives an established STOMP session until it is closed or lost.
///
/// The stream is split into a reader task, which decodes inbound frames and
/// hands them to `on_frame`, and a writer task, which sends `outbound`
/// frames and heart-beats. Dropping the sender side of `closer_ch` closes
/// the session; frames already queued in `outbound` are flushed first.
///
/// `heartbeat` is the negotiated `(send, receive)` pair. When receiving is
/// enabled, silence for twice the interval counts as a lost connection.
pub(crate) async fn websocket_handler(
    rt: tokio::runtime::Handle,
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut closer_ch: mpsc::Receiver<()>,
    heartbeat: (Option<Duration>, Option<Duration>),
    on_frame: impl Fn(Frame) + Send + Sync + 'static,
    on_error: impl Fn(anyhow::Error) + Send + Sync + 'static,
) -> LinkEnd {
    let (send_interval, recv_interval) = heartbeat;
    let (mut write_ws, mut read_ws) = stream.split();
    let (stop_write, mut stop_read) = mpsc::channel::<()>(1);
    let (failed_write, mut failed_read) = mpsc::channel::<String>(1);
    let on_error_arc = Arc::new(on_error);

    let on_error = on_error_arc.clone();
    let reader_task = rt.spawn(async move {
        let tolerance = recv_interval.map(|interval| interval * 2);

        let end = 'outer: loop {
            tokio::select! {
                biased;

                _ = closer_ch.recv() => {
                    break 'outer LinkEnd::Closed;
                }

                Some(reason) = failed_read.recv() => {
                    break 'outer LinkEnd::Lost(reason);
                }

                remote_msg = next_message(&mut read_ws, tolerance) => {
                    let message = match remote_msg {
                        Ok(Some(Ok(message))) => message,
                        Ok(Some(Err(err))) => {
                            log::debug!("failed to read message: {}", err);
                            on_error(anyhow!(err));
                            break 'outer LinkEnd::Lost("read error".into());
                        }
                        Ok(None) => break 'outer LinkEnd::Lost("connection closed".into()),
                        Err(_) => {
                            break 'outer LinkEnd::Lost(format!(
                                "no data from broker for {:?}",
                                tolerance.unwrap_or_default()
                            ));
                        }
                    };

                    let data = match &message {
                        Message::Text(text) => text.as_str().as_bytes(),
                        Message::Binary(bin) => &bin[..],
                        Message::Close(close_frame) => {
                            let reason = match close_frame {
                                Some(frame) => format!(
                                    "closed by broker, code={}, reason={}",
                                    u16::from(frame.code),
                                    frame.reason
                                ),
                                None => "closed by broker".to_string(),
                            };
                            log::debug!("{}", reason);
                            break 'outer LinkEnd::Lost(reason);
                        }
                        _ => continue 'outer,
                    };

                    decode_frames(data, |result| match result {
                        Ok(Incoming::Frame(frame)) => on_frame(frame),
                        Ok(Incoming::Heartbeat) => {}
                        Err(err) => on_error(err),
                    });
                }
            }
        };

        drop(stop_write);
        (read_ws, end)
    });

    let on_error = on_error_arc;
    let writer_task = rt.spawn(async move {
        let mut ticker = send_interval.map(|interval| {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker
        });

        loop {
            let message = tokio::select! {
                biased;

                frame = outbound.recv() => match frame {
                    Some(frame) => encode_frame(&frame),
                    None => break,
                },

                _ = stop_read.recv() => break,

                _ = tick(&mut ticker) => heartbeat_message(),
            };

            if let Err(err) = write_ws.send(message).await {
                log::debug!("failed to write message: {}", err);
                let reason = err.to_string();
                on_error(anyhow!(err));
                let _ = failed_write.try_send(reason);
                break;
            }
        }

        write_ws
    });

    let (read_ws, write_ws) = tokio::join!(reader_task, writer_task);

    if let (Ok((read_ws, end)), Ok(write_ws)) = (read_ws, write_ws) {
        if let Ok(mut stream) = read_ws.reunite(write_ws) {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, stream.close(None)).await;
        }
        log::debug!("websocket connection closed: {:?}", end);
        end
    } else {
        // a panicking callback must not turn into a reconnect loop
        log::debug!("websocket connection aborted");
        LinkEnd::Aborted("connection task panicked".into())
    }
}

async fn next_message<S: Stream + Unpin>(
    read_ws: &mut S,
    tolerance: Option<Duration>,
) -> Result<Option<S::Item>, tokio::time::error::Elapsed> {
    match tolerance {
        Some(tolerance) => tokio::time::timeout(tolerance, read_ws.next()).await,
        None => Ok(read_ws.next().await),
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
