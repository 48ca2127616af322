//! Per-call bridge session
//!
//! A [`BridgeSession`] owns both adapters for one call and enforces the
//! startup order: the speaker path must come up (it is the reason the
//! bridge exists), the mic path may fail and leave the call speaker-only.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::capture::{CaptureAdapter, CaptureStats};
use crate::config::{BridgeConfig, HandoffTransport};
use crate::error::{BridgeError, Result};
use crate::gate::remove_fifo;
use crate::playback::{PlaybackAdapter, PlaybackStats};
use crate::port::{AudioPort, CallAudioEndpoint, FrameSink, FrameSource, PortState};

/// Call identifier assigned by the telephony engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u32> for CallId {
    fn from(id: u32) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Active { mic_ready: bool },
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Active { mic_ready: true } => write!(f, "active"),
            SessionState::Active { mic_ready: false } => write!(f, "active (speaker only)"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of a session for logs and tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub call_id: CallId,
    pub state: SessionState,
    pub playback_state: PortState,
    pub capture_state: PortState,
    pub playback: PlaybackStats,
    pub capture: CaptureStats,
    pub playback_error: Option<String>,
    pub capture_error: Option<String>,
}

/// Both audio directions of one call
pub struct BridgeSession {
    call_id: CallId,
    endpoint: Arc<dyn CallAudioEndpoint>,
    playback: Arc<PlaybackAdapter>,
    capture: Arc<CaptureAdapter>,
    speaker_fifo: Option<PathBuf>,
    mic_fifo: Option<PathBuf>,
    state: Mutex<SessionState>,
}

impl BridgeSession {
    pub fn new(call_id: CallId, config: &BridgeConfig, endpoint: Arc<dyn CallAudioEndpoint>) -> Self {
        let id = call_id.as_str();
        let spk_fifo = match config.playback.transport {
            HandoffTransport::Fifo => Some(config.speaker_fifo(id)),
            HandoffTransport::Pipe => None,
        };
        let mic_fifo = match config.capture.transport {
            HandoffTransport::Fifo => Some(config.mic_fifo(id)),
            HandoffTransport::Pipe => None,
        };
        Self {
            playback: Arc::new(PlaybackAdapter::new(
                id,
                config.playback.clone(),
                spk_fifo.clone(),
                config.stop_policy,
            )),
            capture: Arc::new(CaptureAdapter::new(
                id,
                config.capture.clone(),
                mic_fifo.clone(),
                config.stop_policy,
            )),
            call_id,
            endpoint,
            speaker_fifo: spk_fifo,
            mic_fifo,
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Whether the inbound path came up; false until started
    pub fn mic_ready(&self) -> bool {
        matches!(self.state(), SessionState::Active { mic_ready: true })
    }

    pub fn playback(&self) -> &Arc<PlaybackAdapter> {
        &self.playback
    }

    pub fn capture(&self) -> &Arc<CaptureAdapter> {
        &self.capture
    }

    /// Bring up the speaker path, then the mic path
    ///
    /// Returns whether the mic path is live. A speaker failure is returned
    /// as an error after everything acquired so far has been released.
    pub fn start(&self) -> Result<bool> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Idle {
                return Err(BridgeError::invalid_state(format!(
                    "session {} cannot start from {}",
                    self.call_id, *state
                )));
            }
            *state = SessionState::Starting;
        }

        if let Err(e) = self.start_playback() {
            error!(call_id = %self.call_id, "Speaker path failed, dropping bridge: {}", e);
            *self.state.lock() = SessionState::Stopped;
            self.teardown();
            return Err(e);
        }

        let mic_ready = match self.start_capture() {
            Ok(()) => true,
            Err(e) => {
                warn!(call_id = %self.call_id, "Mic path unavailable, continuing speaker-only: {}", e);
                self.capture.stop();
                if let Some(path) = &self.mic_fifo {
                    remove_fifo(path);
                }
                false
            }
        };

        {
            let mut state = self.state.lock();
            if *state == SessionState::Stopped {
                // stop() ran while we were starting
                drop(state);
                self.teardown();
                return Err(BridgeError::invalid_state(format!(
                    "session {} stopped during start",
                    self.call_id
                )));
            }
            *state = SessionState::Active { mic_ready };
        }

        info!(call_id = %self.call_id, mic_ready, "Bridge session active");
        Ok(mic_ready)
    }

    fn start_playback(&self) -> Result<()> {
        self.playback.start()?;
        let sink: Arc<dyn FrameSink> = self.playback.clone();
        self.endpoint.attach_playback(sink)
    }

    fn start_capture(&self) -> Result<()> {
        self.capture.start()?;
        let source: Arc<dyn FrameSource> = self.capture.clone();
        self.endpoint.attach_capture(source)
    }

    /// Stop both directions; idempotent and safe in every state
    pub fn stop(&self) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, SessionState::Stopped)
        };
        match previous {
            SessionState::Stopped => {}
            // start() observes the new state and tears down itself
            SessionState::Starting => {
                info!(call_id = %self.call_id, "Stop requested during start");
            }
            _ => {
                self.teardown();
                info!(call_id = %self.call_id, "Bridge session stopped (was {})", previous);
            }
        }
    }

    fn teardown(&self) {
        self.endpoint.detach_all();
        self.capture.stop();
        self.playback.stop();
        for path in self.speaker_fifo.iter().chain(self.mic_fifo.iter()) {
            remove_fifo(path);
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            call_id: self.call_id.clone(),
            state: self.state(),
            playback_state: self.playback.state(),
            capture_state: self.capture.state(),
            playback: self.playback.stats(),
            capture: self.capture.stats(),
            playback_error: self.playback.last_error(),
            capture_error: self.capture.last_error(),
        }
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        if self.state() != SessionState::Stopped {
            warn!(call_id = %self.call_id, "Session dropped while {}, stopping", self.state());
            self.stop();
        }
    }
}

impl fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeSession")
            .field("call_id", &self.call_id)
            .field("state", &self.state())
            .finish()
    }
}
