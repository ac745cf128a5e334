//! # Session Module
//!
//! Per-connection STOMP session handling and the registry of live sessions
//! shared by every connection of a broker.
//!
//! ## Session Lifecycle
//!
//! 1. **Initial**: the socket is open, only CONNECT or STOMP is accepted
//! 2. **Connected**: SUBSCRIBE, UNSUBSCRIBE, SEND and DISCONNECT are served
//!
//! Protocol violations are answered with an ERROR frame, after which the
//! session is closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use matchit::Router;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::protocol::{Command, Frame, headers, parse_heartbeat};
use crate::server::callbacks::{AppDestinationFn, OnConnectFn, OnDisconnectFn};
use crate::server::types::{ConnectContext, Publication, SendContext, ServeParams, SessionId};

/// Destinations with this prefix are delivered straight to subscribers.
pub const TOPIC_PREFIX: &str = "/topic/";

const SERVER_NAME: &str = concat!("tokio-stomp-notify/", env!("CARGO_PKG_VERSION"));

/// Current state of a broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket open, waiting for CONNECT
    Initial,
    /// CONNECTED was sent
    Connected,
}

/// Instructions for the writer task of a connection
#[derive(Debug)]
pub(crate) enum Outgoing {
    Frame(Frame),
    /// Start sending heart-beats at this interval
    Heartbeat(Duration),
    /// Flush what is queued, then close the socket
    Close(String),
}

struct SessionEntry {
    outbound: mpsc::UnboundedSender<Outgoing>,
    /// Subscription id to destination
    subscriptions: HashMap<String, String>,
}

/// Live sessions of a broker and their subscriptions
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: HashMap<SessionId, SessionEntry>,
    next_message_id: u64,
}

impl SessionRegistry {
    fn register(&mut self, session_id: SessionId, outbound: mpsc::UnboundedSender<Outgoing>) {
        self.sessions.insert(
            session_id,
            SessionEntry {
                outbound,
                subscriptions: HashMap::new(),
            },
        );
    }

    fn remove(&mut self, session_id: SessionId) {
        self.sessions.remove(&session_id);
    }

    /// Returns `false` if the id is already used by this session.
    fn subscribe(&mut self, session_id: SessionId, id: &str, destination: &str) -> bool {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        if entry.subscriptions.contains_key(id) {
            return false;
        }
        entry
            .subscriptions
            .insert(id.to_string(), destination.to_string());
        true
    }

    fn unsubscribe(&mut self, session_id: SessionId, id: &str) -> bool {
        self.sessions
            .get_mut(&session_id)
            .is_some_and(|entry| entry.subscriptions.remove(id).is_some())
    }

    /// Sends a MESSAGE frame to every subscription of `publication.destination`.
    ///
    /// Returns the number of subscriptions the message was queued for.
    pub(crate) fn publish(&mut self, publication: &Publication) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.values() {
            for (id, destination) in &entry.subscriptions {
                if *destination != publication.destination {
                    continue;
                }
                self.next_message_id += 1;
                let mut frame = Frame::new(Command::Message)
                    .with_header(headers::DESTINATION, destination.clone())
                    .with_header(headers::SUBSCRIPTION, id.clone())
                    .with_header(headers::MESSAGE_ID, self.next_message_id.to_string());
                if let Some(ref content_type) = publication.content_type {
                    frame = frame.with_header(headers::CONTENT_TYPE, content_type.clone());
                }
                let frame = frame.with_body(publication.body.clone());
                if entry.outbound.send(Outgoing::Frame(frame)).is_ok() {
                    delivered += 1;
                }
            }
        }
        log::trace!(
            "published to {}: {} subscriber(s)",
            publication.destination,
            delivered
        );
        delivered
    }

    /// Subscribed destinations across all sessions, sorted, with duplicates.
    pub(crate) fn destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self
            .sessions
            .values()
            .flat_map(|entry| entry.subscriptions.values().cloned())
            .collect();
        destinations.sort();
        destinations
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn close_all(&mut self, reason: &str) {
        for entry in self.sessions.values() {
            let _ = entry.outbound.send(Outgoing::Close(reason.to_string()));
        }
    }
}

/// Handler for a single broker connection
pub(crate) struct ServerSession {
    session_id: SessionId,
    params: ServeParams,
    state: SessionState,
    on_connect: OnConnectFn,
    on_disconnect: Option<OnDisconnectFn>,
    app_destinations: Arc<Mutex<Router<AppDestinationFn>>>,
    registry: Arc<Mutex<SessionRegistry>>,
    /// Application handlers still running
    tasks: JoinSet<()>,
    outbound: mpsc::UnboundedSender<Outgoing>,
}

impl ServerSession {
    pub(crate) fn new(
        params: ServeParams,
        outbound: mpsc::UnboundedSender<Outgoing>,
        on_connect: OnConnectFn,
        on_disconnect: Option<OnDisconnectFn>,
        app_destinations: Arc<Mutex<Router<AppDestinationFn>>>,
        registry: Arc<Mutex<SessionRegistry>>,
    ) -> Self {
        Self {
            session_id: params.session_id.unwrap_or_default(),
            params,
            state: SessionState::Initial,
            on_connect,
            on_disconnect,
            app_destinations,
            registry,
            tasks: JoinSet::new(),
            outbound,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) async fn process_frame(&mut self, frame: Frame) {
        match self.state {
            SessionState::Initial => match frame.command {
                Command::Connect | Command::Stomp => self.handle_connect(frame).await,
                command => {
                    log::debug!("expected CONNECT, got {}", command);
                    self.fail("expected CONNECT");
                }
            },
            SessionState::Connected => match frame.command {
                Command::Connect | Command::Stomp => {
                    log::debug!("session {} already connected", self.session_id);
                    self.fail("already connected");
                }
                Command::Subscribe => self.handle_subscribe(&frame),
                Command::Unsubscribe => self.handle_unsubscribe(&frame),
                Command::Send => self.handle_send(frame),
                Command::Disconnect => {
                    self.send_receipt(&frame);
                    let _ = self.outbound.send(Outgoing::Close("client disconnect".into()));
                }
                command => log::debug!("ignoring {} frame", command),
            },
        }
    }

    async fn handle_connect(&mut self, frame: Frame) {
        let ctx = ConnectContext {
            session_id: self.session_id,
            headers: frame.headers.iter().cloned().rev().collect(),
        };
        if let Err(message) = (self.on_connect)(ctx).await {
            log::debug!("connection rejected: {}", message);
            self.fail(&message);
            return;
        }

        let version = negotiate_version(frame.header(headers::ACCEPT_VERSION));
        let offered = self
            .params
            .heartbeat_interval
            .map_or(0, |interval| u32::try_from(interval.as_millis()).unwrap_or(u32::MAX));
        let (_, client_wants) = frame
            .header(headers::HEART_BEAT)
            .and_then(parse_heartbeat)
            .unwrap_or((0, 0));

        self.registry
            .lock()
            .unwrap()
            .register(self.session_id, self.outbound.clone());
        self.state = SessionState::Connected;

        let connected = Frame::new(Command::Connected)
            .with_header(headers::VERSION, version)
            .with_header(headers::SESSION, self.session_id.to_string())
            .with_header(headers::SERVER, SERVER_NAME)
            .with_header(headers::HEART_BEAT, format!("{},0", offered));
        let _ = self.outbound.send(Outgoing::Frame(connected));

        if offered != 0 && client_wants != 0 {
            let interval = Duration::from_millis(u64::from(offered.max(client_wants)));
            let _ = self.outbound.send(Outgoing::Heartbeat(interval));
        }
        log::debug!("session {} connected, version={}", self.session_id, version);
    }

    fn handle_subscribe(&mut self, frame: &Frame) {
        let (Some(id), Some(destination)) =
            (frame.header(headers::ID), frame.header(headers::DESTINATION))
        else {
            self.fail("SUBSCRIBE requires id and destination");
            return;
        };
        let added = self
            .registry
            .lock()
            .unwrap()
            .subscribe(self.session_id, id, destination);
        if !added {
            self.fail(&format!("subscription id {} already in use", id));
            return;
        }
        log::debug!("session {} subscribed to {} as {}", self.session_id, destination, id);
        self.send_receipt(frame);
    }

    fn handle_unsubscribe(&mut self, frame: &Frame) {
        let Some(id) = frame.header(headers::ID) else {
            self.fail("UNSUBSCRIBE requires id");
            return;
        };
        if !self.registry.lock().unwrap().unsubscribe(self.session_id, id) {
            log::debug!("unknown subscription {}", id);
        }
        self.send_receipt(frame);
    }

    fn handle_send(&mut self, frame: Frame) {
        let Some(destination) = frame.header(headers::DESTINATION).map(str::to_string) else {
            self.fail("SEND requires destination");
            return;
        };
        let content_type = frame.header(headers::CONTENT_TYPE).map(str::to_string);
        let receipt = receipt_for(&frame);

        if destination.starts_with(TOPIC_PREFIX) {
            let publication = Publication {
                destination,
                body: frame.body,
                content_type,
            };
            self.registry.lock().unwrap().publish(&publication);
            if let Some(receipt) = receipt {
                let _ = self.outbound.send(Outgoing::Frame(receipt));
            }
            return;
        }

        let Some((params, f)) = ({
            let routes = self.app_destinations.lock().unwrap();
            match routes.at(&destination) {
                Ok(match_) => {
                    let params: HashMap<String, String> = match_
                        .params
                        .iter()
                        .map(|(k, v)| (k.to_owned(), v.to_owned()))
                        .collect();
                    Some((params, match_.value.clone()))
                }
                Err(_err) => None,
            }
        }) else {
            log::debug!("no handler for {}", destination);
            let _ = self.outbound.send(Outgoing::Frame(error_frame(&format!(
                "unknown destination {}",
                destination
            ))));
            return;
        };

        let ctx = SendContext {
            session_id: self.session_id,
            destination,
            params,
            content_type,
        };
        let registry = self.registry.clone();
        let outbound = self.outbound.clone();
        self.tasks.spawn(async move {
            match f(ctx, frame.body).await {
                Ok(publications) => {
                    let mut registry = registry.lock().unwrap();
                    for publication in &publications {
                        registry.publish(publication);
                    }
                    if let Some(receipt) = receipt {
                        let _ = outbound.send(Outgoing::Frame(receipt));
                    }
                }
                Err(message) => {
                    log::debug!("application handler failed: {}", message);
                    let _ = outbound.send(Outgoing::Frame(error_frame(&message)));
                }
            }
        });
    }

    fn send_receipt(&self, frame: &Frame) {
        if let Some(receipt) = receipt_for(frame) {
            let _ = self.outbound.send(Outgoing::Frame(receipt));
        }
    }

    /// Sends an ERROR frame and closes the session.
    pub(crate) fn fail(&self, message: &str) {
        let _ = self.outbound.send(Outgoing::Frame(error_frame(message)));
        let _ = self.outbound.send(Outgoing::Close(message.to_string()));
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if self.state == SessionState::Connected {
            self.registry.lock().unwrap().remove(self.session_id);
            if let Some(on_disconnect) = &self.on_disconnect {
                on_disconnect(self.session_id);
            }
        }
    }
}

fn negotiate_version(accept_version: Option<&str>) -> &'static str {
    let Some(accepted) = accept_version else {
        return "1.0";
    };
    let accepted: Vec<&str> = accepted.split(',').map(str::trim).collect();
    ["1.2", "1.1"]
        .into_iter()
        .find(|version| accepted.contains(version))
        .unwrap_or("1.0")
}

fn receipt_for(frame: &Frame) -> Option<Frame> {
    frame
        .header(headers::RECEIPT)
        .map(|receipt| Frame::new(Command::Receipt).with_header(headers::RECEIPT_ID, receipt))
}

fn error_frame(message: &str) -> Frame {
    Frame::new(Command::Error).with_header(headers::MESSAGE, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_session() -> (
        ServerSession,
        mpsc::UnboundedReceiver<Outgoing>,
        Arc<Mutex<SessionRegistry>>,
    ) {
        session_with(ServeParams::default())
    }

    fn session_with(
        params: ServeParams,
    ) -> (
        ServerSession,
        mpsc::UnboundedReceiver<Outgoing>,
        Arc<Mutex<SessionRegistry>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Mutex::new(SessionRegistry::default()));
        let session = ServerSession::new(
            params,
            tx,
            crate::server::callbacks::ConnectFnWrapper::default().0,
            None,
            Arc::new(Mutex::new(Router::new())),
            registry.clone(),
        );
        (session, rx, registry)
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Frame {
        match rx.try_recv() {
            Ok(Outgoing::Frame(frame)) => frame,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn picks_highest_common_version() {
        assert_eq!(negotiate_version(Some("1.0,1.1,1.2")), "1.2");
        assert_eq!(negotiate_version(Some("1.1")), "1.1");
        assert_eq!(negotiate_version(None), "1.0");
    }

    #[tokio::test]
    async fn connect_then_subscribe_and_publish() {
        let (mut session, mut rx, registry) = connected_session();

        session
            .process_frame(
                Frame::new(Command::Connect)
                    .with_header(headers::ACCEPT_VERSION, "1.2")
                    .with_header(headers::HEART_BEAT, "10000,10000"),
            )
            .await;
        assert_eq!(session.state(), SessionState::Connected);
        let connected = next_frame(&mut rx);
        assert_eq!(connected.command, Command::Connected);
        assert_eq!(connected.header(headers::VERSION), Some("1.2"));
        assert_eq!(connected.header(headers::HEART_BEAT), Some("0,0"));

        session
            .process_frame(
                Frame::new(Command::Subscribe)
                    .with_header(headers::ID, "sub-1")
                    .with_header(headers::DESTINATION, "/topic/interaction"),
            )
            .await;
        assert_eq!(registry.lock().unwrap().destinations(), vec!["/topic/interaction"]);

        let delivered = registry
            .lock()
            .unwrap()
            .publish(&Publication::new("/topic/interaction", "hi"));
        assert_eq!(delivered, 1);
        let message = next_frame(&mut rx);
        assert_eq!(message.command, Command::Message);
        assert_eq!(message.header(headers::SUBSCRIPTION), Some("sub-1"));
        assert_eq!(message.body, b"hi");

        drop(session);
        assert_eq!(registry.lock().unwrap().session_count(), 0);
    }

    #[tokio::test]
    async fn oversized_heartbeat_interval_saturates() {
        let params = ServeParams::default().with_heartbeat(Duration::from_secs(60 * 24 * 3600));
        let (mut session, mut rx, _registry) = session_with(params);

        session
            .process_frame(Frame::new(Command::Connect).with_header(headers::HEART_BEAT, "0,1000"))
            .await;

        let connected = next_frame(&mut rx);
        assert_eq!(
            connected.header(headers::HEART_BEAT),
            Some(format!("{},0", u32::MAX).as_str())
        );
        match rx.try_recv() {
            Ok(Outgoing::Heartbeat(interval)) => {
                assert_eq!(interval, Duration::from_millis(u64::from(u32::MAX)))
            }
            other => panic!("expected heart-beat interval, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn frames_before_connect_close_the_session() {
        let (mut session, mut rx, _registry) = connected_session();

        session
            .process_frame(Frame::new(Command::Send).with_header(headers::DESTINATION, "/app/chat"))
            .await;

        assert_eq!(next_frame(&mut rx).command, Command::Error);
        assert!(matches!(rx.try_recv(), Ok(Outgoing::Close(_))));
        assert_eq!(session.state(), SessionState::Initial);
    }

    #[tokio::test]
    async fn duplicate_subscription_id_is_an_error() {
        let (mut session, mut rx, _registry) = connected_session();
        session.process_frame(Frame::new(Command::Connect)).await;
        let _ = next_frame(&mut rx);

        let subscribe = Frame::new(Command::Subscribe)
            .with_header(headers::ID, "0")
            .with_header(headers::DESTINATION, "/topic/a");
        session.process_frame(subscribe.clone()).await;
        session.process_frame(subscribe).await;

        let error = next_frame(&mut rx);
        assert_eq!(error.command, Command::Error);
        assert_eq!(error.header(headers::MESSAGE), Some("subscription id 0 already in use"));
    }

    #[tokio::test]
    async fn disconnect_is_acknowledged_with_receipt() {
        let (mut session, mut rx, _registry) = connected_session();
        session.process_frame(Frame::new(Command::Connect)).await;
        let _ = next_frame(&mut rx);

        session
            .process_frame(Frame::new(Command::Disconnect).with_header(headers::RECEIPT, "77"))
            .await;

        let receipt = next_frame(&mut rx);
        assert_eq!(receipt.command, Command::Receipt);
        assert_eq!(receipt.header(headers::RECEIPT_ID), Some("77"));
        assert!(matches!(rx.try_recv(), Ok(Outgoing::Close(_))));
    }
}
