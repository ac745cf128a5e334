//! Connection management and reconnection logic.
//!
//! Low-level steps of a connection attempt: waiting out the reconnect delay,
//! opening the WebSocket, and checking that the attempt is still wanted
//! between the two.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::client::types::{AttemptError, State, WsStream};
use crate::errors::ConnectError;

use super::inner::ClientInner;

pub(crate) struct ConnectionManager;

impl ConnectionManager {
    /// Sleeps for `delay` unless the attempt is interrupted first.
    pub(crate) async fn do_delay(
        closer_read: &mut mpsc::Receiver<()>,
        delay: Duration,
    ) -> Result<(), AttemptError> {
        if delay.is_zero() {
            return Ok(());
        }
        log::debug!("reconnecting in {:?}", delay);

        tokio::select! {
            biased;
            _ = closer_read.recv() => {
                log::debug!("reconnect interrupted by user");
                Err(AttemptError::Interrupted)
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Opens the WebSocket to the configured endpoint.
    ///
    /// Malformed URLs are reported as [`ConnectError::InvalidEndpoint`], every
    /// other failure as [`ConnectError::Transport`].
    pub(crate) fn do_connect<'a>(
        client: &Arc<Mutex<ClientInner>>,
        closer_read: &'a mut mpsc::Receiver<()>,
    ) -> impl Future<Output = Result<WsStream, AttemptError>> + 'a {
        let url = {
            let inner = client.lock().unwrap();
            inner.url.clone()
        };

        async move {
            let task = async {
                log::debug!("connecting to {}", &url);
                match tokio_tungstenite::connect_async(&*url).await {
                    Ok((stream, _)) => Ok(stream),
                    Err(err) => {
                        log::debug!("{err}");
                        let err = match err {
                            tokio_tungstenite::tungstenite::Error::Url(err) => {
                                ConnectError::InvalidEndpoint(err.to_string())
                            }
                            tokio_tungstenite::tungstenite::Error::HttpFormat(err) => {
                                ConnectError::InvalidEndpoint(err.to_string())
                            }
                            err => ConnectError::Transport(err.to_string()),
                        };
                        Err(AttemptError::Failed(err))
                    }
                }
            };

            tokio::select! {
                biased;
                _ = closer_read.recv() => {
                    log::debug!("connect interrupted by user");
                    Err(AttemptError::Interrupted)
                }
                result = task => result
            }
        }
    }

    /// Fails with `Interrupted` if the client moved on from `generation`
    /// or left `expected`.
    pub(crate) fn do_check_state(
        client: &Arc<Mutex<ClientInner>>,
        generation: u64,
        expected: State,
    ) -> Result<(), AttemptError> {
        let inner = client.lock().unwrap();
        if !inner.is_current(generation, expected) {
            return Err(AttemptError::Interrupted);
        }
        Ok(())
    }
}
