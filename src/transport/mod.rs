use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;

use futures_util::{Sink, Stream};

use crate::core::{Frame, SyncError, SyncResult};

pub mod fallback;
pub mod polling;
pub mod tungstenite;

pub use fallback::FallbackTransport;
pub use polling::PollingTransport;
pub use tungstenite::TungsteniteTransport;

pub type TransportConnectFuture<R, W> = Pin<Box<dyn Future<Output = SyncResult<(R, W)>> + Send>>;

/// Transport boundary for channel IO.
///
/// The IO loop lives outside the connection manager actor; transports only turn a URL into a
/// frame stream and a frame sink, so websocket, long-polling and in-memory implementations are
/// interchangeable.
pub trait Transport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = SyncResult<Frame>> + Send + Unpin + 'static;
    type Writer: Sink<Frame, Error = SyncError> + Send + Unpin + 'static;

    fn connect(&self, url: String) -> TransportConnectFuture<Self::Reader, Self::Writer>;

    fn name(&self) -> &'static str;
}

pub(crate) fn transport_error(context: &'static str, err: impl ToString) -> SyncError {
    SyncError::TransportError {
        context,
        error: err.to_string(),
    }
}

/// rustls 0.23 needs a process-level CryptoProvider when more than one backend is compiled in.
pub(crate) fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // Err means another component installed one first.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
