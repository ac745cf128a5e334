//! Internal client implementation and connection lifecycle management.
//!
//! `ClientInner` holds all mutable client state behind the client's mutex.
//! The connection cycle runs as one background task per connection
//! generation: it opens the socket, performs the handshake, subscribes the
//! topics, drives the session and decides what happens when the link ends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::client::types::{AttemptError, LinkEnd, State};
use crate::config::{Heartbeat, PayloadFormat, ReconnectStrategy};
use crate::errors::ConnectError;
use crate::events::{ConnectedEvent, InboundMessage};
use crate::identity::IdentitySource;
use crate::protocol::{Command, Frame, headers, parse_heartbeat};
use crate::subscription::{SubscriptionRegistry, TopicSet};

use super::connection::ConnectionManager;
use super::handshake::HandshakeManager;
use super::subscription_handler::SubscriptionHandler;

pub(crate) type Callback = Box<dyn FnMut() + Send + 'static>;

pub(crate) struct ClientInner {
    /// Tokio runtime handle for spawning tasks
    pub(crate) rt: Handle,
    /// Broker endpoint
    pub(crate) url: Arc<str>,
    pub(crate) state: State,
    pub(crate) identity_source: IdentitySource,
    pub(crate) topics: TopicSet,
    pub(crate) payload_format: PayloadFormat,
    pub(crate) send_destination: String,
    pub(crate) host: Option<String>,
    pub(crate) connect_headers: Vec<(String, String)>,
    pub(crate) heartbeat: Heartbeat,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) reconnect_strategy: Arc<dyn ReconnectStrategy>,
    /// Bumped for every new connection; stale tasks compare against it
    pub(crate) generation: u64,
    /// Reconnect attempts since the last successful connection
    pub(crate) attempt: u32,
    /// Identity resolved for the current connection
    pub(crate) identity: Option<String>,
    pub(crate) last_error: Option<String>,
    /// Dropping this interrupts the current attempt or closes the session
    pub(crate) closer_write: Option<mpsc::Sender<()>>,
    /// Frames for the writer task; only set while connected
    pub(crate) outbound: Option<mpsc::UnboundedSender<Frame>>,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) on_connecting: Option<Callback>,
    pub(crate) on_connected: Option<Box<dyn FnMut(ConnectedEvent) + Send + 'static>>,
    pub(crate) on_disconnected: Option<Callback>,
    pub(crate) on_error: Option<Box<dyn FnMut(anyhow::Error) + Send + 'static>>,
    pub(crate) on_message: Option<Box<dyn FnMut(InboundMessage) + Send + 'static>>,
    /// `connect()` callers waiting for the outcome
    pub(crate) on_connected_ch: Vec<oneshot::Sender<Result<(), ConnectError>>>,
    /// `disconnect()` callers waiting for the cycle of a generation to end
    pub(crate) on_disconnected_ch: Vec<(u64, oneshot::Sender<()>)>,
    /// Number of running connection cycles
    pub(crate) active_tasks: usize,
}

impl ClientInner {
    pub(crate) fn is_current(&self, generation: u64, state: State) -> bool {
        self.generation == generation && self.state == state
    }

    /// Starts a new connection from `Disconnected` or `Failed`.
    pub(crate) fn move_to_connecting(&mut self, outer: Arc<Mutex<Self>>) {
        debug_assert!(matches!(self.state, State::Disconnected | State::Failed));
        self.generation += 1;
        self.attempt = 0;
        self.last_error = None;
        self.identity = self.identity_source.resolve();
        match self.identity {
            Some(ref identity) => log::debug!("using identity {}", identity),
            None => log::warn!("no identity available, per-user topics will be skipped"),
        }
        self._set_state(State::Connecting);
        self.start_connecting(outer);
    }

    /// Moves to `Connected`, wakes `connect()` callers and subscribes topics.
    pub(crate) fn move_to_connected(
        &mut self,
        outbound: mpsc::UnboundedSender<Frame>,
        connected: &Frame,
    ) {
        assert_eq!(self.state, State::Connecting);
        self.attempt = 0;
        self.outbound = Some(outbound);
        self._set_state(State::Connected);
        log::info!("connected to {}", self.url);

        for ch in self.on_connected_ch.drain(..) {
            let _ = ch.send(Ok(()));
        }

        let event = ConnectedEvent {
            version: connected
                .header(headers::VERSION)
                .unwrap_or("1.0")
                .to_string(),
            session: connected.header(headers::SESSION).map(str::to_string),
            server: connected.header(headers::SERVER).map(str::to_string),
            identity: self.identity.clone(),
        };
        if let Some(ref mut on_connected) = self.on_connected {
            on_connected(event);
        }

        SubscriptionHandler::subscribe_all(self);
    }

    /// Explicit teardown. Sends DISCONNECT first when connected.
    pub(crate) fn move_to_disconnected(&mut self) {
        assert_ne!(self.state, State::Disconnected);
        if self.state == State::Connected {
            if let Some(ref outbound) = self.outbound {
                let _ = outbound.send(Frame::new(Command::Disconnect));
            }
        }
        self.release_connection();
        for ch in self.on_connected_ch.drain(..) {
            let _ = ch.send(Err(ConnectError::Interrupted));
        }
        self._set_state(State::Disconnected);
        log::info!("disconnected from {}", self.url);
    }

    /// The connection ended for good without being asked to.
    pub(crate) fn move_to_failed(&mut self, err: ConnectError) {
        self.release_connection();
        self.last_error = Some(err.to_string());
        for ch in self.on_connected_ch.drain(..) {
            let _ = ch.send(Err(err.clone()));
        }
        self._set_state(State::Failed);
    }

    /// Drops the session handles; subscriptions die with the connection.
    fn release_connection(&mut self) {
        self.closer_write = None;
        self.outbound = None;
        self.subscriptions.clear();
    }

    pub(crate) fn report_error(&mut self, err: anyhow::Error) {
        if let Some(ref mut on_error) = self.on_error {
            on_error(err);
        }
    }

    /// Asks the reconnect strategy whether to try again after `err`.
    fn next_delay(&mut self, err: &ConnectError) -> Option<Duration> {
        if !err.is_retryable() {
            return None;
        }
        self.attempt += 1;
        let delay = self
            .reconnect_strategy
            .time_before_next_attempt(self.attempt);
        match delay {
            Some(delay) => log::debug!("reconnect attempt {} in {:?}", self.attempt, delay),
            None => log::debug!("giving up after {} attempts", self.attempt - 1),
        }
        delay
    }

    /// Runs connection attempts, then the session, until the connection of
    /// `generation` is closed, interrupted or fails for good.
    async fn do_connection_cycle(client: Arc<Mutex<Self>>, generation: u64) {
        let mut delay = Duration::ZERO;

        loop {
            let (closer_write, mut closer_read) = mpsc::channel::<()>(1);
            {
                let mut inner = client.lock().unwrap();
                if !inner.is_current(generation, State::Connecting) {
                    break;
                }
                inner.closer_write = Some(closer_write);
            }

            let result = async {
                ConnectionManager::do_delay(&mut closer_read, delay).await?;
                ConnectionManager::do_check_state(&client, generation, State::Connecting)?;
                let stream = ConnectionManager::do_connect(&client, &mut closer_read).await?;
                ConnectionManager::do_check_state(&client, generation, State::Connecting)?;
                HandshakeManager::do_handshake(&client, &mut closer_read, stream).await
            }
            .await;

            let (stream, connected) = match result {
                Ok(established) => established,
                Err(AttemptError::Interrupted) => break,
                Err(AttemptError::Failed(err)) => {
                    let mut inner = client.lock().unwrap();
                    if !inner.is_current(generation, State::Connecting) {
                        break;
                    }
                    log::error!("connection to {} failed: {}", inner.url, err);
                    inner.report_error(anyhow!(err.clone()));
                    match inner.next_delay(&err) {
                        Some(next) => {
                            delay = next;
                            continue;
                        }
                        None => {
                            inner.move_to_failed(err);
                            break;
                        }
                    }
                }
            };

            let (outbound_write, outbound_read) = mpsc::unbounded_channel();
            let (rt, heartbeat) = {
                let mut inner = client.lock().unwrap();
                if !inner.is_current(generation, State::Connecting) {
                    break;
                }
                let server_heartbeat = connected
                    .header(headers::HEART_BEAT)
                    .and_then(parse_heartbeat)
                    .unwrap_or((0, 0));
                let heartbeat = inner.heartbeat.negotiate(server_heartbeat);
                inner.move_to_connected(outbound_write, &connected);
                (inner.rt.clone(), heartbeat)
            };

            let client1 = client.clone();
            let client2 = client.clone();
            let end = crate::client_handler::websocket_handler(
                rt,
                stream,
                outbound_read,
                closer_read,
                heartbeat,
                move |frame| SubscriptionHandler::dispatch(&client1, generation, frame),
                move |err| {
                    let mut inner = client2.lock().unwrap();
                    if inner.generation == generation {
                        inner.report_error(err);
                    }
                },
            )
            .await;

            let mut inner = client.lock().unwrap();
            if !inner.is_current(generation, State::Connected) {
                break;
            }
            let err = match end {
                LinkEnd::Closed => break,
                LinkEnd::Lost(reason) => ConnectError::Transport(reason),
                LinkEnd::Aborted(reason) => ConnectError::Aborted(reason),
            };
            log::warn!("connection to {} lost: {}", inner.url, err);
            inner.report_error(anyhow!("connection lost: {}", err));
            match inner.next_delay(&err) {
                Some(next) => {
                    delay = next;
                    inner.release_connection();
                    inner._set_state(State::Connecting);
                }
                None => {
                    inner.move_to_failed(err);
                    break;
                }
            }
        }

        let mut inner = client.lock().unwrap();
        let (done, pending): (Vec<_>, Vec<_>) = inner
            .on_disconnected_ch
            .drain(..)
            .partition(|(g, _)| *g <= generation);
        inner.on_disconnected_ch = pending;
        for (_, ch) in done {
            let _ = ch.send(());
        }
    }

    fn start_connecting(&mut self, client: Arc<Mutex<Self>>) {
        self.active_tasks += 1;
        let generation = self.generation;

        self.rt.spawn(async move {
            Self::do_connection_cycle(client.clone(), generation).await;
            let mut inner = client.lock().unwrap();
            inner.active_tasks -= 1;
        });
    }

    /// Updates the client state and triggers the matching callback.
    pub(crate) fn _set_state(&mut self, state: State) {
        log::debug!("state: {:?} -> {:?}", self.state, state);
        self.state = state;

        match state {
            State::Disconnected => {
                if let Some(ref mut on_disconnected) = self.on_disconnected {
                    on_disconnected();
                }
            }
            State::Connecting => {
                if let Some(ref mut on_connecting) = self.on_connecting {
                    on_connecting();
                }
            }
            State::Connected | State::Failed => {}
        }
    }
}
