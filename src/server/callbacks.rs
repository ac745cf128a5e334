//! # Callbacks Module
//!
//! Handler types used by the broker.
//!
//! - **OnConnectFn**: accepts or rejects CONNECT frames
//! - **OnDisconnectFn**: observes session teardown
//! - **AppDestinationFn**: handles SEND frames to application destinations

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::server::types::{ConnectContext, Publication, SendContext, SessionId};

/// Decides whether a CONNECT is accepted
///
/// Returning `Err(message)` answers with an ERROR frame carrying `message`
/// and closes the session.
pub type OnConnectFn = Arc<
    dyn Fn(ConnectContext) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>>
        + Send
        + Sync,
>;

/// Called once when a session ends
pub type OnDisconnectFn = Arc<dyn Fn(SessionId) + Send + Sync>;

/// Handles a SEND to an application destination
///
/// The returned publications are delivered to topic subscribers. An error
/// is reported to the sender as an ERROR frame; the session stays open.
pub type AppDestinationFn = Arc<
    dyn Fn(SendContext, Vec<u8>) -> Pin<Box<dyn Future<Output = Result<Vec<Publication>, String>> + Send>>
        + Send
        + Sync,
>;

/// Wrapper that accepts every connection unless a handler is set
#[derive(Clone)]
pub(crate) struct ConnectFnWrapper(pub(crate) OnConnectFn);

impl Default for ConnectFnWrapper {
    fn default() -> Self {
        fn accept_all(
            _ctx: ConnectContext,
        ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> {
            Box::pin(async { Ok(()) })
        }

        Self(Arc::new(accept_all))
    }
}
