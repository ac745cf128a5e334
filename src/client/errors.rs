//! Client result handling.

use std::future::Future;
use std::future::IntoFuture;

pub use crate::errors::{ConnectError, SendError};

/// A wrapper around futures that can be polled to get results.
///
/// This is a regular future which you can poll to get result,
/// but it's totally fine to drop it if you don't need results:
/// the operation has already been started when the `FutureResult`
/// is returned.
///
/// ```rust,no_run
/// use tokio_stomp_notify::client::Client;
/// use tokio_stomp_notify::config::Config;
///
/// # async fn run() {
/// let client = Client::new("ws://localhost:8080/ws", Config::new());
///
/// // fire and forget
/// let _ = client.connect();
///
/// // or wait for the outcome
/// let result = client.connect().await;
/// # }
/// ```
pub struct FutureResult<T>(pub(crate) T);

impl<T, R> IntoFuture for FutureResult<T>
where
    T: Future<Output = R>,
{
    type Output = R;
    type IntoFuture = T;

    fn into_future(self) -> Self::IntoFuture {
        self.0
    }
}
