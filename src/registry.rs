//! Session bookkeeping.
//!
//! A [`SessionRegistry`] is owned by one connection's dispatcher and maps a
//! device index to its [`DeviceSession`]; nothing else touches it, so it
//! needs no locking. Hardware exclusivity across connections comes from
//! [`DeviceClaims`], the one piece of process-wide state: a session can only
//! exist while it holds the claim for its `(family, index)`.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::camera::{CameraDevice, CameraFamily, CameraResult};
use crate::streaming::{StreamHandle, StreamStats};

type ClaimKey = (CameraFamily, u32);

/// Process-wide set of devices currently owned by some session.
#[derive(Debug, Clone, Default)]
pub struct DeviceClaims {
    held: Arc<Mutex<HashSet<ClaimKey>>>,
}

impl DeviceClaims {
    /// Empty claim set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `(family, index)`, or `None` if someone else holds it.
    pub fn try_claim(&self, family: CameraFamily, index: u32) -> Option<DeviceClaim> {
        if self.held.lock().insert((family, index)) {
            Some(DeviceClaim {
                key: (family, index),
                held: Arc::clone(&self.held),
            })
        } else {
            None
        }
    }

    /// Whether `(family, index)` is currently claimed.
    pub fn is_claimed(&self, family: CameraFamily, index: u32) -> bool {
        self.held.lock().contains(&(family, index))
    }

    /// Number of claimed devices.
    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    /// Whether no device is claimed.
    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }
}

/// Exclusive ownership of one device; released on drop.
#[derive(Debug)]
pub struct DeviceClaim {
    key: ClaimKey,
    held: Arc<Mutex<HashSet<ClaimKey>>>,
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}

/// Live state for one connected device.
///
/// Exists only while the device is connected; `is_streaming` implies that.
pub struct DeviceSession {
    index: u32,
    camera: Arc<dyn CameraDevice>,
    stream: Option<StreamHandle>,
    last_stream_resolution: Option<(u32, u32)>,
    _claim: DeviceClaim,
}

impl DeviceSession {
    /// Wraps a connected device and its claim.
    pub fn new(index: u32, camera: Arc<dyn CameraDevice>, claim: DeviceClaim) -> Self {
        Self {
            index,
            camera,
            stream: None,
            last_stream_resolution: None,
            _claim: claim,
        }
    }

    /// The device.
    pub fn camera(&self) -> &Arc<dyn CameraDevice> {
        &self.camera
    }

    /// Whether the hardware handle is open.
    pub fn is_connected(&self) -> bool {
        self.camera.is_connected()
    }

    /// Whether a streaming task is attached and the device is acquiring.
    pub fn is_streaming(&self) -> bool {
        self.stream.is_some() && self.camera.is_streaming()
    }

    /// Resolution requested by the last start-stream, if both were given.
    pub fn last_stream_resolution(&self) -> Option<(u32, u32)> {
        self.last_stream_resolution
    }

    /// Records the requested resolution of a newly started stream.
    pub fn set_last_stream_resolution(&mut self, resolution: Option<(u32, u32)>) {
        self.last_stream_resolution = resolution;
    }

    /// Attached streaming task.
    pub fn stream(&self) -> Option<&StreamHandle> {
        self.stream.as_ref()
    }

    /// Attaches a streaming task, replacing (and cancelling) any previous one.
    pub fn attach_stream(&mut self, handle: StreamHandle) {
        self.stream = Some(handle);
    }

    /// Stops the streaming task (if any) and acquisition.
    pub async fn stop_streaming(&mut self, grace: Duration) -> CameraResult<StreamStats> {
        let stats = match self.stream.take() {
            Some(handle) => handle.stop(grace).await,
            None => StreamStats::default(),
        };
        self.camera.stop_stream().await?;
        Ok(stats)
    }

    /// Stops streaming, disconnects and releases the claim.
    ///
    /// Both steps are attempted even if the first fails.
    pub async fn teardown(mut self, grace: Duration) -> CameraResult<()> {
        let stopped = self.stop_streaming(grace).await;
        let disconnected = self.camera.disconnect().await;
        if let Err(e) = &stopped {
            warn!(index = self.index, "Stopping stream during teardown failed: {e}");
        }
        if let Err(e) = &disconnected {
            warn!(index = self.index, "Disconnect during teardown failed: {e}");
        }
        debug!(index = self.index, "Session torn down");
        stopped.and(disconnected)
    }
}

/// Sessions of one connection, keyed by device index.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<u32, DeviceSession>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session. Returns it back if the index is already taken.
    pub fn insert(&mut self, session: DeviceSession) -> Result<(), DeviceSession> {
        if self.sessions.contains_key(&session.index) {
            return Err(session);
        }
        self.sessions.insert(session.index, session);
        Ok(())
    }

    /// Whether a session exists for `index`.
    pub fn contains(&self, index: u32) -> bool {
        self.sessions.contains_key(&index)
    }

    /// Session for `index`.
    pub fn get(&self, index: u32) -> Option<&DeviceSession> {
        self.sessions.get(&index)
    }

    /// Mutable session for `index`.
    pub fn get_mut(&mut self, index: u32) -> Option<&mut DeviceSession> {
        self.sessions.get_mut(&index)
    }

    /// Removes and returns the session for `index`.
    pub fn remove(&mut self, index: u32) -> Option<DeviceSession> {
        self.sessions.remove(&index)
    }

    /// Removes every session.
    pub fn drain(&mut self) -> Vec<DeviceSession> {
        std::mem::take(&mut self.sessions).into_values().collect()
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions with a running stream.
    pub fn streaming_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_streaming()).count()
    }
}
