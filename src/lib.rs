//! Realtime notification client over STOMP/WebSocket.
//!
//! [`client::Client`] connects to a STOMP broker, subscribes to a set of
//! topics scoped to the locally stored identity and hands every inbound
//! message to a single handler. [`server::Broker`] is a small in-process
//! broker used by the tests and demos.

pub mod client;
mod client_handler;
pub mod config;
pub mod errors;
pub mod events;
pub mod identity;
pub mod protocol;
pub mod server;
pub mod subscription;
pub mod utils;

// Broker::serve requires tungstenite::Message, so we should
// re-export it to make sure user has the same version.
pub use tokio_tungstenite::tungstenite;
