use thiserror::Error;

/// Why a connection attempt did not reach the `Connected` state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("broker rejected the connection: {0}")]
    Rejected(String),
    #[error("no CONNECTED frame within {0:?}")]
    Timeout(std::time::Duration),
    #[error("connection closed during handshake")]
    Closed,
    #[error("connection attempt interrupted by disconnect")]
    Interrupted,
    #[error("connection aborted: {0}")]
    Aborted(String),
}

impl ConnectError {
    /// Whether another attempt could succeed without a configuration change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectError::Transport(_) | ConnectError::Timeout(_) | ConnectError::Closed
        )
    }
}

/// Returned by `Client::send` when nothing was written.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("failed to read identity store: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity store is not a JSON object: {0}")]
    Format(#[from] serde_json::Error),
}
