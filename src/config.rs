//! # Configuration Module
//!
//! Configuration types for the notification client.
//!
//! ## Core Types
//!
//! - **Config**: Main configuration struct for client connections
//! - **PayloadFormat**: How inbound bodies are handed to the message handler
//! - **Heartbeat**: STOMP heart-beat intervals offered to the broker
//! - **ReconnectStrategy**: Trait for reconnection behavior
//! - **NoReconnect**, **FixedDelay**, **BackoffReconnect**: bundled strategies

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::identity::IdentitySource;
use crate::subscription::TopicSet;

/// Default broker endpoint.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/ws";

/// Default application destination for outbound chat messages.
pub const DEFAULT_SEND_DESTINATION: &str = "/app/chat";

/// How inbound message bodies are delivered.
///
/// ## Example
///
/// ```rust
/// use tokio_stomp_notify::config::{Config, PayloadFormat};
///
/// assert_eq!(Config::new().payload_format, PayloadFormat::Raw);
/// assert_eq!(Config::new().use_json().payload_format, PayloadFormat::Json);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    /// Body is forwarded untouched
    #[default]
    Raw,

    /// Body is parsed as JSON before it is forwarded; bodies that fail to
    /// parse are reported through the error callback and dropped
    Json,
}

/// STOMP heart-beat intervals, both in milliseconds; zero disables a
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// How often this client can send heart-beats
    pub outgoing: u32,
    /// How often this client wants to receive heart-beats
    pub incoming: u32,
}

impl Heartbeat {
    pub const DISABLED: Heartbeat = Heartbeat {
        outgoing: 0,
        incoming: 0,
    };

    pub fn header_value(&self) -> String {
        format!("{},{}", self.outgoing, self.incoming)
    }

    /// Negotiates with the broker's `heart-beat` header and returns
    /// `(send interval, receive interval)`; `None` means disabled.
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use tokio_stomp_notify::config::Heartbeat;
    ///
    /// let ours = Heartbeat { outgoing: 10_000, incoming: 10_000 };
    /// let (send, recv) = ours.negotiate((0, 5_000));
    /// assert_eq!(send, Some(Duration::from_millis(10_000)));
    /// assert_eq!(recv, None);
    /// ```
    pub fn negotiate(&self, server: (u32, u32)) -> (Option<Duration>, Option<Duration>) {
        let (sx, sy) = server;
        let send = (self.outgoing != 0 && sy != 0).then(|| self.outgoing.max(sy));
        let recv = (self.incoming != 0 && sx != 0).then(|| self.incoming.max(sx));
        (
            send.map(|ms| Duration::from_millis(ms.into())),
            recv.map(|ms| Duration::from_millis(ms.into())),
        )
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Heartbeat {
            outgoing: 10_000,
            incoming: 10_000,
        }
    }
}

/// Main configuration struct for client connections
///
/// ## Example
///
/// ```rust
/// use tokio_stomp_notify::config::{Config, FixedDelay};
/// use tokio_stomp_notify::identity::IdentitySource;
/// use tokio_stomp_notify::subscription::TopicSet;
/// use std::time::Duration;
///
/// let config = Config::new()
///     .with_identity(IdentitySource::Fixed("42".into()))
///     .with_topics(TopicSet::messages())
///     .with_send_destination("/app/chat.send")
///     .with_reconnect_strategy(FixedDelay::new(Duration::from_secs(5)))
///     .use_json();
/// assert_eq!(config.send_destination, "/app/chat.send");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the identity scoping per-user topics comes from
    pub identity: IdentitySource,

    /// Topics subscribed on every connection
    pub topics: TopicSet,

    /// How inbound bodies are delivered
    pub payload_format: PayloadFormat,

    /// Destination used by `Client::send`
    pub send_destination: String,

    /// Value of the CONNECT `host` header; defaults to the endpoint host
    pub host: Option<String>,

    /// Extra CONNECT headers such as `login`/`passcode`
    pub connect_headers: Vec<(String, String)>,

    /// Heart-beat intervals offered to the broker
    pub heartbeat: Heartbeat,

    /// Maximum time from socket open to CONNECTED; `None` waits forever
    pub connect_timeout: Option<Duration>,

    /// Optional custom tokio runtime handle
    pub runtime: Option<Handle>,

    /// What to do after a failed attempt or a lost connection
    pub reconnect_strategy: Arc<dyn ReconnectStrategy>,
}

impl Default for Config {
    /// Defaults:
    /// - No identity
    /// - Chat, interaction and notification topics
    /// - Raw payloads
    /// - `/app/chat` send destination
    /// - 10 s heart-beats both ways
    /// - No connect timeout
    /// - No reconnection
    fn default() -> Self {
        Config {
            identity: IdentitySource::None,
            topics: TopicSet::default(),
            payload_format: PayloadFormat::Raw,
            send_destination: DEFAULT_SEND_DESTINATION.to_string(),
            host: None,
            connect_headers: Vec::new(),
            heartbeat: Heartbeat::default(),
            connect_timeout: None,
            runtime: None,
            reconnect_strategy: Arc::new(NoReconnect),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, identity: IdentitySource) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_topics(mut self, topics: TopicSet) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_payload_format(mut self, format: PayloadFormat) -> Self {
        self.payload_format = format;
        self
    }

    /// Shorthand for `with_payload_format(PayloadFormat::Json)`.
    pub fn use_json(self) -> Self {
        self.with_payload_format(PayloadFormat::Json)
    }

    /// Shorthand for `with_payload_format(PayloadFormat::Raw)`.
    pub fn use_raw(self) -> Self {
        self.with_payload_format(PayloadFormat::Raw)
    }

    pub fn with_send_destination(mut self, destination: impl Into<String>) -> Self {
        self.send_destination = destination.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Adds a header to the CONNECT frame.
    ///
    /// ```rust
    /// use tokio_stomp_notify::config::Config;
    ///
    /// let config = Config::new()
    ///     .with_header("login", "guest")
    ///     .with_header("passcode", "guest");
    /// assert_eq!(config.connect_headers.len(), 2);
    /// ```
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.connect_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_reconnect_strategy(mut self, strategy: impl ReconnectStrategy) -> Self {
        self.reconnect_strategy = Arc::new(strategy);
        self
    }
}

/// Trait for implementing reconnection strategies
///
/// ## Example
///
/// ```rust
/// use tokio_stomp_notify::config::ReconnectStrategy;
/// use std::time::Duration;
///
/// #[derive(Debug)]
/// struct LinearReconnect {
///     base_delay: Duration,
/// }
///
/// impl ReconnectStrategy for LinearReconnect {
///     fn time_before_next_attempt(&self, attempt: u32) -> Option<Duration> {
///         (attempt <= 5).then(|| self.base_delay * attempt)
///     }
/// }
/// ```
pub trait ReconnectStrategy: std::fmt::Debug + Send + Sync + 'static {
    /// Delay before reconnect attempt number `attempt` (1-based), or `None`
    /// to give up and leave the connection failed.
    fn time_before_next_attempt(&self, attempt: u32) -> Option<Duration>;
}

/// Never reconnect; a failed connection stays failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReconnect;

impl ReconnectStrategy for NoReconnect {
    fn time_before_next_attempt(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Reconnect after the same delay every time.
///
/// ```rust
/// use tokio_stomp_notify::config::{FixedDelay, ReconnectStrategy};
/// use std::time::Duration;
///
/// let strategy = FixedDelay::new(Duration::from_secs(5)).with_max_attempts(2);
/// assert_eq!(strategy.time_before_next_attempt(1), Some(Duration::from_secs(5)));
/// assert_eq!(strategy.time_before_next_attempt(2), Some(Duration::from_secs(5)));
/// assert_eq!(strategy.time_before_next_attempt(3), None);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    pub delay: Duration,
    /// Unlimited when `None`
    pub max_attempts: Option<u32>,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        FixedDelay {
            delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl Default for FixedDelay {
    /// 5 seconds, unlimited attempts.
    fn default() -> Self {
        FixedDelay::new(Duration::from_secs(5))
    }
}

impl ReconnectStrategy for FixedDelay {
    fn time_before_next_attempt(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(self.delay),
        }
    }
}

/// Exponential backoff reconnection strategy
///
/// The delay is `min_delay * factor^attempt`, clamped between `min_delay`
/// and `max_delay`.
///
/// ```rust
/// use tokio_stomp_notify::config::{BackoffReconnect, ReconnectStrategy};
/// use std::time::Duration;
///
/// let strategy = BackoffReconnect {
///     factor: 2.0,
///     min_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(1),
///     max_attempts: None,
/// };
///
/// let delay1 = strategy.time_before_next_attempt(1).unwrap();
/// let delay2 = strategy.time_before_next_attempt(2).unwrap();
/// let delay3 = strategy.time_before_next_attempt(3).unwrap();
///
/// assert!(delay1 < delay2);
/// assert!(delay2 < delay3);
/// assert_eq!(strategy.time_before_next_attempt(30), Some(Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct BackoffReconnect {
    pub factor: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Unlimited when `None`
    pub max_attempts: Option<u32>,
}

impl ReconnectStrategy for BackoffReconnect {
    fn time_before_next_attempt(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        if self.min_delay > self.max_delay {
            return Some(self.max_delay);
        }

        let time = self.min_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let time = time.clamp(self.min_delay.as_secs_f64(), self.max_delay.as_secs_f64());
        Some(Duration::from_secs_f64(time))
    }
}

impl Default for BackoffReconnect {
    /// factor 2.0, 200 ms to 20 s, unlimited attempts.
    fn default() -> Self {
        BackoffReconnect {
            factor: 2.0,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(20),
            max_attempts: None,
        }
    }
}
