//! Client implementation for connecting to a STOMP broker.
//!
//! This module provides the realtime subscription client: it connects to the
//! broker over a WebSocket, subscribes to the configured topics scoped to the
//! locally stored identity, and forwards every inbound message to one
//! handler.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_stomp_notify::client::{Client, State};
//! use tokio_stomp_notify::config::Config;
//! use tokio_stomp_notify::identity::{FileStore, IdentitySource};
//!
//! # async fn run() {
//! let identity = IdentitySource::store(Arc::new(FileStore::new("storage.json")));
//! let client = Client::new("ws://localhost:8080/ws", Config::new().with_identity(identity));
//!
//! client.on_message(|message| {
//!     println!("{} on {}: {:?}", message.kind, message.destination, message.payload);
//! });
//!
//! if client.connect().await.is_ok() {
//!     assert_eq!(client.state(), State::Connected);
//!     let _ = client.send(b"hello".to_vec());
//! }
//!
//! client.disconnect().await;
//! # }
//! ```

pub mod connection;
pub mod errors;
pub mod handshake;
pub mod inner;
pub mod subscription_handler;
pub mod types;

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::events::{ConnectedEvent, InboundMessage};
use crate::protocol::{Command, Frame, headers};
use crate::subscription::SubscriptionRegistry;
use crate::utils::normalize_endpoint;

pub use errors::{ConnectError, FutureResult, SendError};
use inner::ClientInner;
pub use types::{ConnectionInfo, State, Transport};

/// Realtime subscription client.
///
/// A `Client` owns at most one connection at a time. It is deliberately not
/// `Clone`: share it behind an `Arc` if several components need it.
/// Dropping the client closes its connection.
///
/// Callbacks other than the message handler run while the client's
/// internal lock is held and must not call back into the client.
pub struct Client(pub(crate) Arc<Mutex<ClientInner>>);

impl Client {
    /// Creates a new client instance.
    ///
    /// `http://` and `https://` endpoints are rewritten to `ws://` and
    /// `wss://`. Must be called within a tokio runtime unless
    /// [`Config::with_runtime`] is used.
    pub fn new(url: &str, config: Config) -> Self {
        let rt = config
            .runtime
            .unwrap_or_else(tokio::runtime::Handle::current);

        Self(Arc::new(Mutex::new(ClientInner {
            rt,
            url: normalize_endpoint(url).into(),
            state: State::Disconnected,
            identity_source: config.identity,
            topics: config.topics,
            payload_format: config.payload_format,
            send_destination: config.send_destination,
            host: config.host,
            connect_headers: config.connect_headers,
            heartbeat: config.heartbeat,
            connect_timeout: config.connect_timeout,
            reconnect_strategy: config.reconnect_strategy,
            generation: 0,
            attempt: 0,
            identity: None,
            last_error: None,
            closer_write: None,
            outbound: None,
            subscriptions: SubscriptionRegistry::default(),
            on_connecting: None,
            on_connected: None,
            on_disconnected: None,
            on_error: None,
            on_message: None,
            on_connected_ch: Vec::new(),
            on_disconnected_ch: Vec::new(),
            active_tasks: 0,
        })))
    }

    /// Initiates a connection to the broker.
    ///
    /// The returned future resolves once the client is `Connected` and the
    /// topics have been subscribed, or with the error that moved the client
    /// to `Failed`. With a reconnect strategy the future keeps waiting across
    /// retries. If a connection is already established or in progress, the
    /// call joins it.
    pub fn connect(
        &self,
    ) -> FutureResult<impl std::future::Future<Output = Result<(), ConnectError>> + use<>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.0.lock().unwrap();
        match inner.state {
            State::Disconnected | State::Failed => {
                inner.on_connected_ch.push(tx);
                inner.move_to_connecting(self.0.clone());
            }
            State::Connecting => inner.on_connected_ch.push(tx),
            State::Connected => {
                let _ = tx.send(Ok(()));
            }
        }
        FutureResult(async {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Interrupted),
            }
        })
    }

    /// Closes the connection.
    ///
    /// Idempotent: on a `Disconnected` client this is a no-op, on a `Failed`
    /// client it only resets the state to `Disconnected`. The returned future
    /// resolves when the socket has been closed.
    pub fn disconnect(&self) -> FutureResult<impl std::future::Future<Output = ()> + use<>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.0.lock().unwrap();
        match inner.state {
            State::Disconnected => {
                let _ = tx.send(());
            }
            State::Failed => {
                inner.move_to_disconnected();
                let _ = tx.send(());
            }
            State::Connecting | State::Connected => {
                let generation = inner.generation;
                inner.on_disconnected_ch.push((generation, tx));
                inner.move_to_disconnected();
            }
        }
        FutureResult(async {
            let _ = rx.await;
        })
    }

    /// Sends `payload` to the configured send destination.
    ///
    /// Nothing is queued: when the client is not connected the payload is
    /// dropped, a single warning is logged and [`SendError::NotConnected`]
    /// is returned.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), SendError> {
        self.send_frame(payload.into(), None)
    }

    /// Serializes `value` as JSON and sends it like [`Client::send`].
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SendError> {
        let body = crate::utils::encode_json(value)?;
        self.send_frame(body, Some("application/json"))
    }

    fn send_frame(&self, body: Vec<u8>, content_type: Option<&str>) -> Result<(), SendError> {
        let inner = self.0.lock().unwrap();
        let outbound = match (inner.state, inner.outbound.as_ref()) {
            (State::Connected, Some(outbound)) => outbound,
            (state, _) => {
                log::warn!(
                    "dropping message for {}: client is {:?}",
                    inner.send_destination,
                    state
                );
                return Err(SendError::NotConnected);
            }
        };

        let mut frame = Frame::new(Command::Send)
            .with_header(headers::DESTINATION, inner.send_destination.clone());
        if let Some(content_type) = content_type {
            frame = frame.with_header(headers::CONTENT_TYPE, content_type);
        }
        let frame = frame.with_body(body);

        outbound.send(frame).map_err(|_| {
            log::warn!("dropping message for {}: connection closing", inner.send_destination);
            SendError::NotConnected
        })
    }

    /// Sets the single handler for all inbound messages, replacing any
    /// previous one.
    pub fn on_message(&self, func: impl FnMut(InboundMessage) + Send + 'static) {
        self.0.lock().unwrap().on_message = Some(Box::new(func));
    }

    /// Sets a callback for when the client starts connecting (including
    /// reconnects).
    pub fn on_connecting(&self, func: impl FnMut() + Send + 'static) {
        self.0.lock().unwrap().on_connecting = Some(Box::new(func));
    }

    /// Sets a callback for when the broker accepted the connection.
    ///
    /// Runs before any topic is subscribed, so before any message arrives.
    pub fn on_connected(&self, func: impl FnMut(ConnectedEvent) + Send + 'static) {
        self.0.lock().unwrap().on_connected = Some(Box::new(func));
    }

    /// Sets a callback for when the client is torn down.
    pub fn on_disconnected(&self, func: impl FnMut() + Send + 'static) {
        self.0.lock().unwrap().on_disconnected = Some(Box::new(func));
    }

    /// Sets a callback for connection failures, broker errors and
    /// undecodable messages.
    pub fn on_error(&self, func: impl FnMut(anyhow::Error) + Send + 'static) {
        self.0.lock().unwrap().on_error = Some(Box::new(func));
    }

    /// Returns the current connection state.
    pub fn state(&self) -> State {
        self.0.lock().unwrap().state
    }

    /// Returns a snapshot of the current connection.
    pub fn connection(&self) -> ConnectionInfo {
        let inner = self.0.lock().unwrap();
        ConnectionInfo {
            endpoint: inner.url.to_string(),
            transport: Transport::WebSocket,
            state: inner.state,
            attempt: inner.attempt,
            identity: inner.identity.clone(),
            last_error: inner.last_error.clone(),
        }
    }

    /// Destinations subscribed on the current connection.
    pub fn subscriptions(&self) -> Vec<String> {
        self.0.lock().unwrap().subscriptions.destinations()
    }

    /// Identity resolved for the current connection.
    pub fn identity(&self) -> Option<String> {
        self.0.lock().unwrap().identity.clone()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let Ok(mut inner) = self.0.lock() else {
            return;
        };
        if inner.state != State::Disconnected {
            inner.move_to_disconnected();
        }
    }
}
