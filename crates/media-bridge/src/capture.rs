//! Capture adapter ("mic" direction)
//!
//! Serves fixed-size frames to the telephony engine's pull callback from a
//! [`PcmRing`] that a background thread keeps filled from the decoder's
//! output stream. Every read of the stream happens under the ring lock,
//! so bytes reach the caller in exactly the order the decoder wrote them.
//!
//! ```text
//! ffmpeg mic --stdout/FIFO--> reader thread --> PcmRing --> request_frame()
//!                                                   ^             |
//!                                                   +-- one more --+
//!                                                     non-blocking read
//! ```

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::buffer::PcmRing;
use crate::config::{CaptureConfig, HandoffTransport, StopPolicy};
use crate::error::{BridgeError, Result};
use crate::gate::{ensure_fifo, poll_readable, set_nonblocking, ReadinessGate};
use crate::geometry::FrameGeometry;
use crate::port::{AudioPort, FrameSource, PortDirection, PortState, PortStatus};
use crate::process::{ManagedProcess, StdioWiring};

/// Largest single read from the decoder stream
const READ_CHUNK: usize = 4096;

/// Longest the reader thread blocks before re-checking its stop flag
const READER_POLL: Duration = Duration::from_millis(50);

/// Counter snapshot for one capture adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    pub frames_served: u64,
    /// Frames that needed any zero-fill
    pub underrun_frames: u64,
    pub zero_filled_bytes: u64,
    pub bytes_received: u64,
    /// Bytes discarded by the ring's drop-oldest policy
    pub dropped_bytes: u64,
}

#[derive(Debug, Default)]
struct CaptureCounters {
    frames_served: AtomicU64,
    underrun_frames: AtomicU64,
    zero_filled_bytes: AtomicU64,
    bytes_received: AtomicU64,
    dropped_bytes: AtomicU64,
}

impl CaptureCounters {
    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames_served: self.frames_served.load(Ordering::Relaxed),
            underrun_frames: self.underrun_frames.load(Ordering::Relaxed),
            zero_filled_bytes: self.zero_filled_bytes.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Result of one non-blocking read attempt
enum Fill {
    Read,
    Empty,
    Closed,
}

struct RingState {
    ring: PcmRing,
    scratch: Vec<u8>,
    eof: bool,
}

/// Stream handle plus ring, shared with the reader thread
struct CaptureStream {
    label: String,
    source: File,
    state: Mutex<RingState>,
    running: AtomicBool,
    counters: Arc<CaptureCounters>,
}

impl CaptureStream {
    /// One non-blocking read into the ring; caller holds the ring lock
    fn fill(&self, state: &mut RingState) -> Fill {
        if state.eof {
            return Fill::Closed;
        }
        match (&self.source).read(&mut state.scratch) {
            Ok(0) => {
                debug!(port = %self.label, "Capture stream reached end of stream");
                state.eof = true;
                Fill::Closed
            }
            Ok(n) => {
                let dropped = state.ring.push(&state.scratch[..n]);
                self.counters
                    .bytes_received
                    .fetch_add(n as u64, Ordering::Relaxed);
                if dropped > 0 {
                    self.counters
                        .dropped_bytes
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                }
                Fill::Read
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                Fill::Empty
            }
            Err(e) => {
                warn!(port = %self.label, "Capture stream read failed: {}", e);
                state.eof = true;
                Fill::Closed
            }
        }
    }

    fn run_reader(&self) {
        while self.running.load(Ordering::Acquire) {
            match poll_readable(&self.source, READER_POLL) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    warn!(port = %self.label, "Capture stream poll failed: {}", e);
                    break;
                }
            }

            let mut state = self.state.lock();
            if let Fill::Closed = self.fill(&mut state) {
                break;
            }
        }
        trace!(port = %self.label, "Capture reader exiting");
    }
}

/// Pull-side adapter between the telephony clock and a decoder process
pub struct CaptureAdapter {
    call_id: String,
    label: String,
    config: CaptureConfig,
    fifo_path: Option<PathBuf>,
    stop_policy: StopPolicy,
    status: PortStatus,
    counters: Arc<CaptureCounters>,
    stream: Mutex<Option<Arc<CaptureStream>>>,
    process: Mutex<Option<ManagedProcess>>,
    gate: Mutex<Option<ReadinessGate>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureAdapter {
    /// `fifo_path` is required for [`HandoffTransport::Fifo`]
    pub fn new(
        call_id: impl Into<String>,
        config: CaptureConfig,
        fifo_path: Option<PathBuf>,
        stop_policy: StopPolicy,
    ) -> Self {
        let call_id = call_id.into();
        let label = format!("mic {}", call_id);
        Self {
            status: PortStatus::new(label.clone()),
            call_id,
            label,
            config,
            fifo_path,
            stop_policy,
            counters: Arc::new(CaptureCounters::default()),
            stream: Mutex::new(None),
            process: Mutex::new(None),
            gate: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    /// Pid of the backing process while it is owned by the adapter
    pub fn pid(&self) -> Option<u32> {
        self.process.lock().as_ref().map(ManagedProcess::pid)
    }

    /// Bytes currently buffered and not yet served
    pub fn buffered(&self) -> usize {
        self.stream
            .lock()
            .as_ref()
            .map_or(0, |stream| stream.state.lock().ring.len())
    }

    /// Launch the decoder and the background reader
    ///
    /// On error the adapter is left `failed`; call [`stop`](AudioPort::stop)
    /// to release whatever was acquired.
    pub fn start(&self) -> Result<()> {
        if !self.status.advance(PortState::Idle, PortState::Starting) {
            return Err(BridgeError::invalid_state(format!(
                "{} cannot start from {}",
                self.label,
                self.status.state()
            )));
        }

        match self.start_inner() {
            Ok(()) if self.status.advance(PortState::Starting, PortState::Running) => {
                info!(call_id = %self.call_id, "Capture path running ({} bytes/frame)", self.config.geometry.frame_bytes());
                Ok(())
            }
            Ok(()) => {
                // stop() ran while we were starting
                self.release();
                Err(BridgeError::invalid_state(format!("{} stopped during start", self.label)))
            }
            Err(e) => {
                if !self.status.fail(e.to_string()) {
                    self.release();
                }
                Err(e)
            }
        }
    }

    fn start_inner(&self) -> Result<()> {
        let command = self
            .config
            .command
            .render(&self.call_id, self.fifo_path.as_deref());

        let source = match self.config.transport {
            HandoffTransport::Pipe => {
                let mut process = ManagedProcess::spawn(&command, StdioWiring::OUTPUT)?;
                let stdout = process.take_stdout();
                *self.process.lock() = Some(process);
                let stdout = stdout
                    .ok_or_else(|| BridgeError::stream_wiring(format!("{}: stdout not piped", command.label)))?;
                File::from(OwnedFd::from(stdout))
            }
            HandoffTransport::Fifo => {
                let path = self.fifo_path.clone().ok_or_else(|| {
                    BridgeError::invalid_config(format!("{}: FIFO transport needs a FIFO path", self.label))
                })?;
                ensure_fifo(&path)?;
                *self.gate.lock() = Some(ReadinessGate::open_guard(&path)?);

                let process = ManagedProcess::spawn(&command, StdioWiring::NONE)?;
                *self.process.lock() = Some(process);

                let mut gate = self.gate.lock();
                let gate = gate
                    .as_mut()
                    .ok_or_else(|| BridgeError::invalid_state("FIFO guard released during start"))?;
                gate.wait_readable(self.config.ready_timeout, self.process.lock().as_mut())?;
                gate.take_reader()
                    .ok_or_else(|| BridgeError::invalid_state("FIFO guard released during start"))?
            }
        };
        set_nonblocking(&source)?;

        if !self.config.settle_delay.is_zero() {
            debug!(call_id = %self.call_id, "Settling capture stream for {:?}", self.config.settle_delay);
            thread::sleep(self.config.settle_delay);
        }

        let stride = self.config.geometry.channel_stride();
        let stream = Arc::new(CaptureStream {
            label: self.label.clone(),
            source,
            state: Mutex::new(RingState {
                ring: PcmRing::new(self.config.ring_capacity_bytes(), stride),
                scratch: vec![0u8; READ_CHUNK],
                eof: false,
            }),
            running: AtomicBool::new(true),
            counters: self.counters.clone(),
        });

        let worker = stream.clone();
        let handle = thread::Builder::new()
            .name(format!("capture-{}", self.call_id))
            .spawn(move || worker.run_reader())?;

        // Stream first: release() clears its running flag before joining
        *self.stream.lock() = Some(stream);
        *self.reader.lock() = Some(handle);
        Ok(())
    }

    /// Stop the reader and the decoder
    ///
    /// Returns the decoder's exit report if it had exited on its own.
    fn release(&self) -> Option<String> {
        if let Some(stream) = self.stream.lock().take() {
            stream.running.store(false, Ordering::Release);
        }
        if let Some(handle) = self.reader.lock().take() {
            if handle.join().is_err() {
                warn!(call_id = %self.call_id, "Capture reader panicked");
            }
        }
        if let Some(mut gate) = self.gate.lock().take() {
            gate.close_guard();
        }
        let mut process = self.process.lock().take()?;
        let exited_early = process.poll().is_some();
        process.stop(self.stop_policy);
        if exited_early {
            process.exit_report()
        } else {
            None
        }
    }

    /// Move to `failed` if the decoder has exited; never blocks
    fn check_producer(&self) {
        let Some(mut process) = self.process.try_lock() else {
            return;
        };
        let Some(process) = process.as_mut() else {
            return;
        };
        if let Some(report) = process.exit_report_now() {
            self.status.fail(report);
        }
    }
}

impl AudioPort for CaptureAdapter {
    fn direction(&self) -> PortDirection {
        PortDirection::Capture
    }

    fn geometry(&self) -> FrameGeometry {
        self.config.geometry
    }

    fn state(&self) -> PortState {
        self.status.state()
    }

    fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    fn stop(&self) {
        let previous = self.status.stop();
        if previous == PortState::Stopped {
            return;
        }

        // A decoder we terminated ourselves says nothing about the failure
        if let Some(report) = self.release() {
            if previous == PortState::Failed {
                self.status.record_error(report);
            }
        }

        let stats = self.stats();
        info!(
            call_id = %self.call_id,
            frames = stats.frames_served,
            underruns = stats.underrun_frames,
            dropped = stats.dropped_bytes,
            "Capture path stopped (was {})",
            previous
        );
    }
}

impl FrameSource for CaptureAdapter {
    fn request_frame(&self, requested_length: usize) -> Bytes {
        let len = if requested_length == 0 {
            self.config.geometry.frame_bytes()
        } else {
            requested_length
        };
        let mut frame = BytesMut::zeroed(len);

        if self.status.state() == PortState::Running {
            self.check_producer();
        }

        let stream = self.stream.lock().clone();
        let filled = match stream {
            Some(stream) => {
                let mut state = stream.state.lock();
                let mut filled = state.ring.pop_into(&mut frame);
                if filled < len {
                    if let Fill::Read = stream.fill(&mut state) {
                        filled += state.ring.pop_into(&mut frame[filled..]);
                    }
                }
                filled
            }
            None => 0,
        };

        self.counters.frames_served.fetch_add(1, Ordering::Relaxed);
        if filled < len {
            self.counters.underrun_frames.fetch_add(1, Ordering::Relaxed);
            self.counters
                .zero_filled_bytes
                .fetch_add((len - filled) as u64, Ordering::Relaxed);
        }
        frame.freeze()
    }
}

impl Drop for CaptureAdapter {
    fn drop(&mut self) {
        if self.status.state() != PortState::Stopped {
            self.stop();
        }
    }
}

impl std::fmt::Debug for CaptureAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureAdapter")
            .field("call_id", &self.call_id)
            .field("state", &self.status.state())
            .field("transport", &self.config.transport)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandSpec;

    fn pipe_config(script: &str) -> CaptureConfig {
        CaptureConfig::new(
            FrameGeometry::mono_16bit(8000),
            CommandSpec::new("stub mic {call_id}", "sh").with_args(["-c", script]),
        )
    }

    #[test]
    fn test_request_before_start_is_silence() {
        let adapter = CaptureAdapter::new("1", pipe_config("exit 0"), None, StopPolicy::default());
        let frame = adapter.request_frame(0);
        assert_eq!(frame.len(), 320);
        assert!(frame.iter().all(|&b| b == 0));
        assert_eq!(adapter.stats().underrun_frames, 1);
    }

    #[test]
    fn test_start_twice_is_invalid() {
        let adapter = CaptureAdapter::new("2", pipe_config("exec sleep 5"), None, StopPolicy::default());
        adapter.start().unwrap();
        assert!(matches!(adapter.start(), Err(BridgeError::InvalidState(_))));
        adapter.stop();
        assert_eq!(adapter.state(), PortState::Stopped);
    }

    #[test]
    fn test_fifo_transport_requires_path() {
        let config = pipe_config("exit 0").with_transport(HandoffTransport::Fifo);
        let adapter = CaptureAdapter::new("3", config, None, StopPolicy::default());
        assert!(matches!(adapter.start(), Err(BridgeError::InvalidConfig(_))));
        assert_eq!(adapter.state(), PortState::Failed);
        adapter.stop();
    }
}
