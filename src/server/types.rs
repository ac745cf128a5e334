//! # Types Module
//!
//! Session identifiers, per-connection parameters and the contexts passed to
//! broker handlers.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use uuid::Uuid;

/// Unique identifier for a broker session
///
/// ## Example
///
/// ```rust
/// use tokio_stomp_notify::server::types::SessionId;
///
/// let id = SessionId::new();
/// assert_ne!(id, SessionId::new());
/// assert!(id.to_string().contains('-'));
/// ```
#[derive(Debug, Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

/// Per-connection parameters
///
/// ```rust
/// use std::time::Duration;
/// use tokio_stomp_notify::server::types::ServeParams;
///
/// let params = ServeParams::default().with_heartbeat(Duration::from_millis(500));
/// assert_eq!(params.heartbeat_interval, Some(Duration::from_millis(500)));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ServeParams {
    /// Session id to use; a random one when `None`
    pub session_id: Option<SessionId>,

    /// How often the broker offers to send heart-beats; `None` disables them
    pub heartbeat_interval: Option<Duration>,
}

impl ServeParams {
    pub fn with_session_id(self, session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..self
        }
    }

    pub fn with_heartbeat(self, interval: Duration) -> Self {
        Self {
            heartbeat_interval: Some(interval),
            ..self
        }
    }
}

/// Context for CONNECT frames
#[derive(Debug, Clone)]
pub struct ConnectContext {
    pub session_id: SessionId,
    /// All CONNECT headers, e.g. `login`, `passcode`, `host`
    pub headers: HashMap<String, String>,
}

/// Context for SEND frames routed to an application destination
#[derive(Debug, Clone)]
pub struct SendContext {
    pub session_id: SessionId,
    pub destination: String,
    /// Parameters captured by the destination pattern
    pub params: HashMap<String, String>,
    pub content_type: Option<String>,
}

/// A message the broker should deliver to topic subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub destination: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl Publication {
    pub fn new(destination: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Publication {
            destination: destination.into(),
            body: body.into(),
            content_type: None,
        }
    }

    pub fn json(destination: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Publication {
            content_type: Some("application/json".into()),
            ..Self::new(destination, body)
        }
    }
}
