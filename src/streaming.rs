//! Per-device streaming tasks.
//!
//! Each streaming device gets one task that loops capture → transform →
//! encode → send → sleep until its [`CancellationToken`] fires, the device
//! stops streaming, or the connection's outbound queue closes.
//!
//! Frames and control replies share one FIFO queue per connection. A task
//! checks its token immediately before queueing a frame, and the dispatcher
//! waits for the task to exit before it queues the stop-stream reply, so no
//! frame for a device can follow that reply on the wire.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::camera::CameraDevice;
use crate::pipeline::{self, ProcessingOptions};

/// One message for the connection writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// JSON control reply.
    Text(String),
    /// Encoded frame.
    Frame(Vec<u8>),
}

/// Loop timing and encode settings.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Delay between iterations.
    pub frame_interval: Duration,
    /// JPEG quality.
    pub jpeg_quality: u8,
}

/// Counters reported when a stream ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    /// Frames queued for the client.
    pub frames_sent: u64,
    /// Frames captured but not delivered (encode failure or full queue).
    pub frames_dropped: u64,
    /// Iterations where the device returned no frame.
    pub captures_missed: u64,
}

/// Owner side of a running streaming task.
///
/// Dropping the handle cancels the task without waiting for it.
pub struct StreamHandle {
    index: u32,
    token: CancellationToken,
    processing: watch::Sender<ProcessingOptions>,
    task: JoinHandle<StreamStats>,
    _cancel_on_drop: DropGuard,
}

impl StreamHandle {
    /// Spawns the streaming loop for `camera`.
    ///
    /// `parent` is the connection's token; cancelling it stops every stream
    /// spawned from it.
    pub fn spawn(
        index: u32,
        camera: Arc<dyn CameraDevice>,
        outbound: mpsc::Sender<Outbound>,
        settings: StreamSettings,
        processing: ProcessingOptions,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let (processing_tx, processing_rx) = watch::channel(processing);
        let task = tokio::spawn(run(
            index,
            camera,
            outbound,
            settings,
            processing_rx,
            token.clone(),
        ));
        Self {
            index,
            _cancel_on_drop: token.clone().drop_guard(),
            token,
            processing: processing_tx,
            task,
        }
    }

    /// Replaces the transform applied to subsequent frames.
    pub fn set_processing(&self, options: ProcessingOptions) {
        self.processing.send_replace(options);
    }

    /// Current transform.
    pub fn processing(&self) -> ProcessingOptions {
        self.processing.borrow().clone()
    }

    /// Whether the task has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the task and waits up to `grace` for it to exit, aborting it
    /// after that.
    pub async fn stop(self, grace: Duration) -> StreamStats {
        let StreamHandle {
            index,
            token,
            mut task,
            ..
        } = self;
        token.cancel();
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(stats)) => {
                info!(
                    index,
                    sent = stats.frames_sent,
                    dropped = stats.frames_dropped,
                    missed = stats.captures_missed,
                    "Stream stopped"
                );
                stats
            }
            Ok(Err(e)) => {
                warn!(index, "Streaming task failed: {e}");
                StreamStats::default()
            }
            Err(_) => {
                warn!(index, ?grace, "Streaming task did not stop in time, aborting");
                task.abort();
                StreamStats::default()
            }
        }
    }
}

async fn run(
    index: u32,
    camera: Arc<dyn CameraDevice>,
    outbound: mpsc::Sender<Outbound>,
    settings: StreamSettings,
    processing: watch::Receiver<ProcessingOptions>,
    token: CancellationToken,
) -> StreamStats {
    let mut stats = StreamStats::default();
    debug!(index, ?settings, "Streaming task started");

    loop {
        if token.is_cancelled() || !camera.is_streaming() {
            break;
        }

        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            frame = camera.capture_frame() => frame,
        };

        match frame {
            Some(image) => {
                let options = processing.borrow().clone();
                let quality = settings.jpeg_quality;
                let encoded = tokio::task::spawn_blocking(move || {
                    let image = pipeline::apply(image, &options);
                    pipeline::encode_jpeg(&image, quality)
                })
                .await;

                match encoded {
                    Ok(Ok(bytes)) => {
                        if token.is_cancelled() {
                            break;
                        }
                        match outbound.try_send(Outbound::Frame(bytes)) {
                            Ok(()) => stats.frames_sent += 1,
                            Err(TrySendError::Full(_)) => stats.frames_dropped += 1,
                            Err(TrySendError::Closed(_)) => {
                                debug!(index, "Outbound queue closed");
                                break;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(index, "Dropping frame: {e}");
                        stats.frames_dropped += 1;
                    }
                    Err(e) => {
                        warn!(index, "Encode task failed: {e}");
                        stats.frames_dropped += 1;
                    }
                }
            }
            None => stats.captures_missed += 1,
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(settings.frame_interval) => {}
        }
    }

    debug!(index, ?stats, "Streaming task exiting");
    stats
}
