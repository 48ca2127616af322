//! Shared helpers for the bridge integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal;
use nix::unistd::Pid;
use parking_lot::Mutex;
use siprtsp_media_bridge::{
    BridgeError, CallAudioEndpoint, CommandSpec, FrameGeometry, FrameSink, FrameSource, Result,
    StopPolicy,
};

/// Mono 16-bit 8 kHz, 20 ms: 320-byte frames
pub fn narrowband() -> FrameGeometry {
    FrameGeometry::mono_16bit(8000)
}

pub fn sh(label: &str, script: &str) -> CommandSpec {
    CommandSpec::new(label, "sh").with_args(["-c", script])
}

pub fn quick_stop() -> StopPolicy {
    StopPolicy {
        grace: Duration::from_millis(500),
        kill_grace: Duration::from_millis(500),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("siprtsp_media_bridge=debug")
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every 10 ms until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

pub fn pid_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Pid a test script recorded with `echo $$ > file`
pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEvent {
    AttachPlayback,
    AttachCapture,
    DetachAll,
}

/// Telephony endpoint double that records every attach/detach
#[derive(Default)]
pub struct RecordingEndpoint {
    events: Mutex<Vec<EndpointEvent>>,
    playback: Mutex<Option<Arc<dyn FrameSink>>>,
    capture: Mutex<Option<Arc<dyn FrameSource>>>,
    refuse_playback: bool,
    refuse_capture: bool,
}

impl RecordingEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refusing_playback() -> Arc<Self> {
        Arc::new(Self {
            refuse_playback: true,
            ..Self::default()
        })
    }

    pub fn refusing_capture() -> Arc<Self> {
        Arc::new(Self {
            refuse_capture: true,
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<EndpointEvent> {
        self.events.lock().clone()
    }

    pub fn playback(&self) -> Option<Arc<dyn FrameSink>> {
        self.playback.lock().clone()
    }

    pub fn capture(&self) -> Option<Arc<dyn FrameSource>> {
        self.capture.lock().clone()
    }
}

impl CallAudioEndpoint for RecordingEndpoint {
    fn attach_playback(&self, sink: Arc<dyn FrameSink>) -> Result<()> {
        if self.refuse_playback {
            return Err(BridgeError::endpoint("conference slot unavailable"));
        }
        self.events.lock().push(EndpointEvent::AttachPlayback);
        *self.playback.lock() = Some(sink);
        Ok(())
    }

    fn attach_capture(&self, source: Arc<dyn FrameSource>) -> Result<()> {
        if self.refuse_capture {
            return Err(BridgeError::endpoint("conference slot unavailable"));
        }
        self.events.lock().push(EndpointEvent::AttachCapture);
        *self.capture.lock() = Some(source);
        Ok(())
    }

    fn detach_all(&self) {
        self.events.lock().push(EndpointEvent::DetachAll);
        self.playback.lock().take();
        self.capture.lock().take();
    }
}
