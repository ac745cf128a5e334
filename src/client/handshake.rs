//! STOMP handshake.
//!
//! Sends `CONNECT` over a freshly opened WebSocket and waits for the
//! broker's `CONNECTED` (or `ERROR`) frame.

use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::http::Uri;

use crate::client::types::{AttemptError, WsStream};
use crate::errors::ConnectError;
use crate::protocol::{Command, Frame, SUPPORTED_VERSIONS, headers};
use crate::utils::{Incoming, decode_frames, encode_frame};

use super::inner::ClientInner;

pub(crate) struct HandshakeManager;

impl HandshakeManager {
    /// Builds the CONNECT frame from the client configuration.
    pub(crate) fn connect_frame(inner: &ClientInner) -> Frame {
        let host = inner.host.clone().or_else(|| {
            inner
                .url
                .parse::<Uri>()
                .ok()
                .and_then(|uri| uri.host().map(str::to_string))
        });

        let mut frame = Frame::new(Command::Connect)
            .with_header(headers::ACCEPT_VERSION, SUPPORTED_VERSIONS)
            .with_header(headers::HEART_BEAT, inner.heartbeat.header_value());
        if let Some(host) = host {
            frame = frame.with_header(headers::HOST, host);
        }
        for (name, value) in &inner.connect_headers {
            frame = frame.with_header(name.clone(), value.clone());
        }
        frame
    }

    /// Performs the handshake and hands the stream back with the
    /// `CONNECTED` frame.
    ///
    /// An `ERROR` reply is a [`ConnectError::Rejected`]. Waits forever for
    /// the reply unless a connect timeout is configured.
    pub(crate) async fn do_handshake(
        client: &Arc<Mutex<ClientInner>>,
        closer_read: &mut mpsc::Receiver<()>,
        mut stream: WsStream,
    ) -> Result<(WsStream, Frame), AttemptError> {
        let (frame, timeout) = {
            let inner = client.lock().unwrap();
            (Self::connect_frame(&inner), inner.connect_timeout)
        };

        let result = {
            let exchange = async {
                stream
                    .send(encode_frame(&frame))
                    .await
                    .map_err(|err| ConnectError::Transport(err.to_string()))?;
                let connected = Self::wait_connected(&mut stream).await?;
                Ok::<_, ConnectError>(connected)
            };

            let exchange = async {
                match timeout {
                    Some(timeout) => tokio::time::timeout(timeout, exchange)
                        .await
                        .unwrap_or(Err(ConnectError::Timeout(timeout))),
                    None => exchange.await,
                }
            };

            tokio::select! {
                biased;
                _ = closer_read.recv() => {
                    log::debug!("handshake interrupted by user");
                    Err(AttemptError::Interrupted)
                }
                result = exchange => result.map_err(AttemptError::Failed),
            }
        };

        match result {
            Ok(connected) => Ok((stream, connected)),
            Err(err) => {
                let _ = stream.close(None).await;
                Err(err)
            }
        }
    }

    async fn wait_connected(stream: &mut WsStream) -> Result<Frame, ConnectError> {
        loop {
            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(ConnectError::Transport(err.to_string())),
                None => return Err(ConnectError::Closed),
            };

            let data = match &message {
                Message::Text(text) => text.as_str().as_bytes(),
                Message::Binary(bin) => &bin[..],
                Message::Close(_) => return Err(ConnectError::Closed),
                _ => continue,
            };

            let mut frames = Vec::new();
            decode_frames(data, |item| match item {
                Ok(Incoming::Frame(frame)) => frames.push(frame),
                Ok(Incoming::Heartbeat) => {}
                Err(err) => log::debug!("ignoring bad frame during handshake: {err}"),
            });

            for frame in frames {
                match frame.command {
                    Command::Connected => {
                        log::debug!(
                            "handshake completed, version={}",
                            frame.header(headers::VERSION).unwrap_or("1.0")
                        );
                        return Ok(frame);
                    }
                    Command::Error => {
                        let reason = error_detail(&frame);
                        log::debug!("handshake failed: {}", reason);
                        return Err(ConnectError::Rejected(reason));
                    }
                    other => log::debug!("unexpected {} frame during handshake", other),
                }
            }
        }
    }
}

/// Human-readable detail of an ERROR frame: the `message` header, then the
/// body, whichever are present.
pub(crate) fn error_detail(frame: &Frame) -> String {
    let body = String::from_utf8_lossy(&frame.body);
    let body = body.trim();
    match (frame.header(headers::MESSAGE), body.is_empty()) {
        (Some(message), true) => message.to_string(),
        (Some(message), false) => format!("{message}: {body}"),
        (None, false) => body.to_string(),
        (None, true) => "unspecified broker error".to_string(),
    }
}
