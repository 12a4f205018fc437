use futures_util::future::Either;
use tracing::warn;

use super::{PollingTransport, Transport, TransportConnectFuture, TungsteniteTransport};

/// Try `primary` first and fall back to `secondary` when it cannot connect.
///
/// The default pairing is websocket first, engine.io long-polling second.
#[derive(Clone)]
pub struct FallbackTransport<P = TungsteniteTransport, S = PollingTransport> {
    primary: P,
    secondary: S,
}

impl<P, S> FallbackTransport<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

impl Default for FallbackTransport {
    fn default() -> Self {
        Self::new(TungsteniteTransport::default(), PollingTransport::default())
    }
}

impl<P, S> Transport for FallbackTransport<P, S>
where
    P: Transport,
    S: Transport,
{
    type Reader = Either<P::Reader, S::Reader>;
    type Writer = Either<P::Writer, S::Writer>;

    fn connect(&self, url: String) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        let primary = self.primary.clone();
        let secondary = self.secondary.clone();
        Box::pin(async move {
            match primary.connect(url.clone()).await {
                Ok((reader, writer)) => Ok((Either::Left(reader), Either::Left(writer))),
                Err(err) => {
                    warn!(
                        primary = primary.name(),
                        secondary = secondary.name(),
                        error = %err,
                        "primary transport failed, falling back"
                    );
                    let (reader, writer) = secondary.connect(url).await?;
                    Ok((Either::Right(reader), Either::Right(writer)))
                }
            }
        })
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}
