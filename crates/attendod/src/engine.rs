use attendo_core::{
    BiometricTemplate, CoreError, Descriptor, Frame, FrameOutcome, Orchestrator, PersistenceSink,
    TrackId,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the feed loop to the engine thread.
enum EngineRequest {
    Recognize {
        frame: Frame,
        reply: oneshot::Sender<Result<FrameOutcome, CoreError>>,
    },
    ResetLiveness {
        track_id: TrackId,
        reply: oneshot::Sender<()>,
    },
    Enroll {
        identity: String,
        descriptor: Descriptor,
        sample_count: usize,
        reply: oneshot::Sender<Result<BiometricTemplate, CoreError>>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Classify one frame.
    pub async fn recognize(&self, frame: Frame) -> Result<FrameOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Recognize {
            frame,
            reply: reply_tx,
        })
        .await?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn reset_liveness(&self, track_id: TrackId) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::ResetLiveness {
            track_id,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Add or replace a template in the live gallery.
    pub async fn enroll(
        &self,
        identity: String,
        descriptor: Descriptor,
        sample_count: usize,
    ) -> Result<BiometricTemplate, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Enroll {
            identity,
            descriptor,
            sample_count,
            reply: reply_tx,
        })
        .await?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Hand every buffered attendance event to the writer, waiting for queue
    /// space, then stop the engine thread. Returns the number of events the
    /// writer could not take because it had already stopped.
    pub async fn shutdown(&self) -> Result<usize, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Shutdown { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the orchestrator on a dedicated OS thread.
///
/// Frames are processed strictly in arrival order. The thread exits after a
/// shutdown request or once every handle is dropped; either way the
/// persistence buffer is drained first and the orchestrator (with its sink)
/// is dropped, which lets the writer task drain and finish.
pub fn spawn_engine<S>(mut orchestrator: Orchestrator<S>) -> Result<EngineHandle, EngineError>
where
    S: PersistenceSink + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("attendo-engine".into())
        .spawn(move || {
            tracing::info!(
                templates = orchestrator.templates().len(),
                "engine thread started"
            );
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { frame, reply } => {
                        let _ = reply.send(orchestrator.recognize_frame(&frame));
                    }
                    EngineRequest::ResetLiveness { track_id, reply } => {
                        orchestrator.reset_liveness(track_id);
                        let _ = reply.send(());
                    }
                    EngineRequest::Enroll {
                        identity,
                        descriptor,
                        sample_count,
                        reply,
                    } => {
                        let _ = reply.send(orchestrator.enroll_averaged(
                            &identity,
                            descriptor,
                            sample_count,
                        ));
                    }
                    EngineRequest::Shutdown { reply } => {
                        let _ = reply.send(orchestrator.drain());
                        tracing::info!("engine thread exiting");
                        return;
                    }
                }
            }
            let undelivered = orchestrator.drain();
            tracing::info!(undelivered, "engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
