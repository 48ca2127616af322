//! Audio port contracts
//!
//! The telephony engine drives both directions from its own media clock:
//! it *pulls* mic audio from a [`FrameSource`] and *pushes* call audio into
//! a [`FrameSink`]. Both adapters share the [`AudioPort`] surface.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::geometry::FrameGeometry;

/// Adapter lifecycle: `idle -> starting -> running -> stopped`, `running -> failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Idle,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Idle => write!(f, "idle"),
            PortState::Starting => write!(f, "starting"),
            PortState::Running => write!(f, "running"),
            PortState::Stopped => write!(f, "stopped"),
            PortState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    /// External decoder -> call ("mic")
    Capture,
    /// Call -> external encoder ("speaker")
    Playback,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Capture => write!(f, "mic"),
            PortDirection::Playback => write!(f, "spk"),
        }
    }
}

/// Surface shared by capture and playback adapters
pub trait AudioPort: Send + Sync {
    fn direction(&self) -> PortDirection;

    fn geometry(&self) -> FrameGeometry;

    fn state(&self) -> PortState;

    /// Most recent exit diagnostic of the backing process
    fn last_error(&self) -> Option<String>;

    /// Idempotent teardown
    fn stop(&self);
}

/// Pull contract: always answers with exactly the requested number of bytes
pub trait FrameSource: AudioPort {
    /// `0` requests the configured frame length
    fn request_frame(&self, requested_length: usize) -> Bytes;
}

/// Push contract: accepts one frame per media clock tick without blocking
pub trait FrameSink: AudioPort {
    fn deliver_frame(&self, frame: &[u8]);
}

/// The telephony engine's audio handle for one call
pub trait CallAudioEndpoint: Send + Sync {
    /// Start pushing call audio into `sink`
    fn attach_playback(&self, sink: Arc<dyn FrameSink>) -> Result<()>;

    /// Start pulling call audio from `source`
    fn attach_capture(&self, source: Arc<dyn FrameSource>) -> Result<()>;

    /// Release both ports; must tolerate ports that were never attached
    fn detach_all(&self);
}

/// State plus last diagnostic, shared between the audio thread and control paths
#[derive(Debug)]
pub(crate) struct PortStatus {
    label: String,
    inner: Mutex<(PortState, Option<String>)>,
}

impl PortStatus {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            inner: Mutex::new((PortState::Idle, None)),
        }
    }

    pub(crate) fn state(&self) -> PortState {
        self.inner.lock().0
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.inner.lock().1.clone()
    }

    /// Move `from -> to` only if the port is still in `from`
    pub(crate) fn advance(&self, from: PortState, to: PortState) -> bool {
        let mut inner = self.inner.lock();
        if inner.0 != from {
            return false;
        }
        inner.0 = to;
        true
    }

    /// Record a diagnostic without changing state
    pub(crate) fn record_error(&self, message: impl Into<String>) {
        self.inner.lock().1 = Some(message.into());
    }

    /// `starting|running -> failed`; returns false if the port was not live
    pub(crate) fn fail(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut inner = self.inner.lock();
        match inner.0 {
            PortState::Starting | PortState::Running => {
                warn!(port = %self.label, "Port failed: {}", message);
                inner.0 = PortState::Failed;
                inner.1 = Some(message);
                true
            }
            _ => false,
        }
    }

    /// Move to `stopped`; returns the state it left
    pub(crate) fn stop(&self) -> PortState {
        let mut inner = self.inner.lock();
        let previous = inner.0;
        inner.0 = PortState::Stopped;
        previous
    }
}
