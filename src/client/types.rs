//! Client types and state management.

use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::errors::ConnectError;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Represents the current connection state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No connection; initial state and the state after `disconnect`
    Disconnected,
    /// A connection attempt (or reconnect delay) is in progress
    Connecting,
    /// CONNECTED received, topics subscribed
    Connected,
    /// The last connection attempt failed or the link dropped and no
    /// reconnect is scheduled
    Failed,
}

/// Transport used to reach the broker. There is only one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    WebSocket,
}

/// Snapshot of the client's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub endpoint: String,
    pub transport: Transport,
    pub state: State,
    /// Reconnect attempts made since the last successful connection
    pub attempt: u32,
    /// Identity resolved for the current connection
    pub identity: Option<String>,
    /// Detail of the error that moved the client to `Failed`
    pub last_error: Option<String>,
}

/// Why a single connection attempt stopped.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// `disconnect` was called or the client was dropped
    Interrupted,
    Failed(ConnectError),
}

impl From<ConnectError> for AttemptError {
    fn from(err: ConnectError) -> Self {
        AttemptError::Failed(err)
    }
}

/// How an established link ended.
#[derive(Debug)]
pub(crate) enum LinkEnd {
    /// Closed on request
    Closed,
    /// Dropped by the broker, the network or heart-beat timeout
    Lost(String),
    /// A connection task panicked; never retried
    Aborted(String),
}
