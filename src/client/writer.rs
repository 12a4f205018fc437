use futures_util::{Sink, SinkExt};
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage};
use tokio::sync::watch;
use tracing::debug;

use crate::core::{Frame, SyncError, SyncResult};

/// Called once with the first write error.
pub type WriteFailureHook = Box<dyn FnOnce(SyncError) + Send>;

/// Owns the transport sink and serializes writes for one connection.
///
/// Writes are fire-and-forget from the manager's point of view; the first failure is reported
/// through the failure hook and stops the writer.
pub struct FrameWriter<W>
where
    W: Sink<Frame, Error = SyncError> + Send + Unpin + 'static,
{
    writer: W,
    shutdown_rx: watch::Receiver<bool>,
    on_failure: Option<WriteFailureHook>,
}

impl<W> FrameWriter<W>
where
    W: Sink<Frame, Error = SyncError> + Send + Unpin + 'static,
{
    pub fn new(writer: W, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            writer,
            shutdown_rx,
            on_failure: None,
        }
    }

    pub fn with_failure_hook(mut self, hook: WriteFailureHook) -> Self {
        self.on_failure = Some(hook);
        self
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if *self.shutdown_rx.borrow() {
            return Err(SyncError::NotConnected);
        }
        Ok(())
    }

    fn report(&mut self, result: SyncResult<()>) -> SyncResult<()> {
        if let Err(err) = &result
            && let Some(hook) = self.on_failure.take()
        {
            hook(err.clone());
        }
        result
    }
}

impl<W> Actor for FrameWriter<W>
where
    W: Sink<Frame, Error = SyncError> + Send + Unpin + 'static,
{
    type Args = Self;
    type Error = SyncError;

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::warn!(error = ?err, "frame writer stopped");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

/// Write one frame and flush.
pub struct WriteFrame {
    pub frame: Frame,
}

impl<W> KameoMessage<WriteFrame> for FrameWriter<W>
where
    W: Sink<Frame, Error = SyncError> + Send + Unpin + 'static,
{
    type Reply = SyncResult<()>;

    async fn handle(
        &mut self,
        msg: WriteFrame,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.ensure_running()?;
        debug!(target: "fleet-sync-writer", "sending frame to wire");
        let result = self.writer.send(msg.frame).await;
        self.report(result)
    }
}

/// Write several frames with a single flush, preserving order.
pub struct WriteBatch {
    pub frames: Vec<Frame>,
}

impl<W> KameoMessage<WriteBatch> for FrameWriter<W>
where
    W: Sink<Frame, Error = SyncError> + Send + Unpin + 'static,
{
    type Reply = SyncResult<()>;

    async fn handle(
        &mut self,
        msg: WriteBatch,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.ensure_running()?;
        let mut result = Ok(());
        for frame in msg.frames {
            result = self.writer.feed(frame).await;
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            result = self.writer.flush().await;
        }
        self.report(result)
    }
}

/// Write the goodbye frames, then close the sink. Errors are irrelevant at this point.
pub struct CloseWriter {
    pub frames: Vec<Frame>,
}

impl<W> KameoMessage<CloseWriter> for FrameWriter<W>
where
    W: Sink<Frame, Error = SyncError> + Send + Unpin + 'static,
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: CloseWriter,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        for frame in msg.frames {
            if self.writer.feed(frame).await.is_err() {
                break;
            }
        }
        let _ = self.writer.flush().await;
        let _ = self.writer.close().await;
    }
}
