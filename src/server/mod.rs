//! # Server Module
//!
//! A small in-process STOMP broker. It speaks enough of STOMP 1.2 over
//! WebSocket to exercise the client end to end: CONNECT negotiation with
//! heart-beats, topic subscriptions, fan-out of SEND frames to `/topic/`
//! destinations and application destinations routed to async handlers.
//!
//! ## Example
//!
//! ```rust
//! use tokio_stomp_notify::server::{Broker, types::Publication};
//!
//! let mut broker = Broker::new();
//!
//! broker.on_connect(|ctx| async move {
//!     match ctx.headers.get("login") {
//!         Some(_) => Ok(()),
//!         None => Err("login required".to_string()),
//!     }
//! });
//!
//! broker
//!     .add_app_destination("/app/chat/{room}", |ctx, body| async move {
//!         let room = ctx.params.get("room").cloned().unwrap_or_default();
//!         Ok(vec![Publication::new(format!("/topic/chat/{}", room), body)])
//!     })
//!     .unwrap();
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::{Sink, Stream};
use matchit::{InsertError, Router};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::server::callbacks::{AppDestinationFn, ConnectFnWrapper, OnDisconnectFn};
use crate::server::session::SessionRegistry;
use crate::server::types::{ConnectContext, Publication, SendContext, ServeParams, SessionId};
use crate::server::websocket::serve_websocket;

pub mod callbacks;
pub mod session;
pub mod types;
mod websocket;

pub use session::{SessionState, TOPIC_PREFIX};

/// In-process STOMP broker
///
/// Cloning is cheap; clones share handlers, sessions and subscriptions, so
/// one clone can be moved into an accept loop while another publishes.
#[derive(Default, Clone)]
pub struct Broker {
    on_connect: ConnectFnWrapper,
    on_disconnect: Option<OnDisconnectFn>,
    app_destinations: Arc<Mutex<Router<AppDestinationFn>>>,
    registry: Arc<Mutex<SessionRegistry>>,
}

impl Broker {
    /// Creates a broker that accepts every connection and has no
    /// application destinations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the handler deciding whether a CONNECT is accepted
    ///
    /// An `Err(message)` is sent to the client as an ERROR frame and the
    /// connection is closed.
    pub fn on_connect<Fut>(&mut self, f: impl Fn(ConnectContext) -> Fut + Send + Sync + 'static)
    where
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.on_connect = ConnectFnWrapper(Arc::new(move |ctx: ConnectContext| {
            Box::pin(f(ctx)) as Pin<Box<dyn Future<Output = Result<(), String>> + Send>>
        }));
    }

    /// Sets the handler called when a connected session ends
    pub fn on_disconnect(&mut self, f: impl Fn(SessionId) + Send + Sync + 'static) {
        self.on_disconnect = Some(Arc::new(f));
    }

    /// Routes SEND frames for `pattern` to `f`
    ///
    /// Patterns use `{name}` segments; captured values are passed in
    /// [`SendContext::params`]. Publications returned by the handler are
    /// delivered to topic subscribers.
    pub fn add_app_destination<Fut>(
        &self,
        pattern: &str,
        f: impl Fn(SendContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    ) -> Result<(), InsertError>
    where
        Fut: Future<Output = Result<Vec<Publication>, String>> + Send + 'static,
    {
        let wrap_f: AppDestinationFn = Arc::new(move |ctx: SendContext, body: Vec<u8>| {
            Box::pin(f(ctx, body))
                as Pin<Box<dyn Future<Output = Result<Vec<Publication>, String>> + Send>>
        });
        self.app_destinations
            .lock()
            .unwrap()
            .insert(pattern.to_string(), wrap_f)
    }

    /// Delivers `publication` to every matching subscription
    ///
    /// Returns how many subscriptions it was queued for.
    ///
    /// ```rust
    /// use tokio_stomp_notify::server::{Broker, types::Publication};
    ///
    /// let broker = Broker::new();
    /// assert_eq!(broker.publish(Publication::new("/topic/interaction", "ping")), 0);
    /// ```
    pub fn publish(&self, publication: Publication) -> usize {
        self.registry.lock().unwrap().publish(&publication)
    }

    /// Destinations currently subscribed, sorted, one entry per subscription
    pub fn subscriptions(&self) -> Vec<String> {
        self.registry.lock().unwrap().destinations()
    }

    /// Number of connected sessions
    pub fn session_count(&self) -> usize {
        self.registry.lock().unwrap().session_count()
    }

    /// Closes every connected session without sending an ERROR frame
    pub fn disconnect_all(&self) {
        self.registry.lock().unwrap().close_all("broker shutdown");
    }

    /// Serves one accepted WebSocket connection with default parameters
    pub async fn serve<S>(&self, stream: S)
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message> + Send + Unpin + 'static,
    {
        self.serve_with_params(stream, ServeParams::default()).await;
    }

    /// Serves one accepted WebSocket connection
    ///
    /// ```rust,no_run
    /// use std::time::Duration;
    /// use tokio_stomp_notify::server::{Broker, types::ServeParams};
    ///
    /// # async fn run() -> std::io::Result<()> {
    /// let broker = Broker::new();
    /// let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
    /// loop {
    ///     let (tcp, _) = listener.accept().await?;
    ///     let broker = broker.clone();
    ///     tokio::spawn(async move {
    ///         if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
    ///             let params = ServeParams::default().with_heartbeat(Duration::from_secs(10));
    ///             broker.serve_with_params(ws, params).await;
    ///         }
    ///     });
    /// }
    /// # }
    /// ```
    pub async fn serve_with_params<S>(&self, stream: S, params: ServeParams)
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message> + Send + Unpin + 'static,
    {
        serve_websocket(
            stream,
            params,
            self.on_connect.0.clone(),
            self.on_disconnect.clone(),
            self.app_destinations.clone(),
            self.registry.clone(),
        )
        .await;
    }
}
