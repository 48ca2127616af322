//! Playback adapter ("speaker" direction)
//!
//! Accepts one frame per media clock tick from the telephony engine and
//! writes it to the encoder's input stream without ever blocking: the
//! stream is non-blocking, a partial write leaves a pending tail that is
//! flushed before anything newer, and frames that cannot be accepted are
//! dropped whole.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::config::{HandoffTransport, PlaybackConfig, StopPolicy};
use crate::error::{BridgeError, Result};
use crate::gate::{ensure_fifo, open_fifo_writer, set_nonblocking};
use crate::geometry::FrameGeometry;
use crate::port::{AudioPort, FrameSink, PortDirection, PortState, PortStatus};
use crate::process::{ManagedProcess, StdioWiring};

/// Counter snapshot for one playback adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackStats {
    pub frames_written: u64,
    /// Frames dropped by backpressure or because the port was not running
    pub frames_dropped: u64,
    pub bytes_written: u64,
    pub partial_writes: u64,
}

#[derive(Debug, Default)]
struct PlaybackCounters {
    frames_written: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_written: AtomicU64,
    partial_writes: AtomicU64,
}

impl PlaybackCounters {
    fn snapshot(&self) -> PlaybackStats {
        PlaybackStats {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            partial_writes: self.partial_writes.load(Ordering::Relaxed),
        }
    }

    fn drop_frame(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Encoder input plus any unwritten tail of the last frame
struct SinkStream {
    output: File,
    pending: Vec<u8>,
}

impl SinkStream {
    /// Write as much of `bytes` as the stream accepts right now
    ///
    /// Any error other than would-block means the encoder input is gone.
    fn write_some(&self, bytes: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < bytes.len() {
            match (&self.output).write(&bytes[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

/// Push-side adapter between the telephony clock and an encoder process
pub struct PlaybackAdapter {
    call_id: String,
    label: String,
    config: PlaybackConfig,
    fifo_path: Option<PathBuf>,
    stop_policy: StopPolicy,
    status: PortStatus,
    counters: PlaybackCounters,
    sink: Mutex<Option<SinkStream>>,
    process: Mutex<Option<ManagedProcess>>,
}

impl PlaybackAdapter {
    /// `fifo_path` is required for [`HandoffTransport::Fifo`]
    pub fn new(
        call_id: impl Into<String>,
        config: PlaybackConfig,
        fifo_path: Option<PathBuf>,
        stop_policy: StopPolicy,
    ) -> Self {
        let call_id = call_id.into();
        let label = format!("spk {}", call_id);
        Self {
            status: PortStatus::new(label.clone()),
            call_id,
            label,
            config,
            fifo_path,
            stop_policy,
            counters: PlaybackCounters::default(),
            sink: Mutex::new(None),
            process: Mutex::new(None),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn stats(&self) -> PlaybackStats {
        self.counters.snapshot()
    }

    /// Pid of the backing process while it is owned by the adapter
    pub fn pid(&self) -> Option<u32> {
        self.process.lock().as_ref().map(ManagedProcess::pid)
    }

    /// Bytes of a partially written frame still waiting for the encoder
    pub fn pending(&self) -> usize {
        self.sink.lock().as_ref().map_or(0, |sink| sink.pending.len())
    }

    /// Launch the encoder and wire its input
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
                info!(call_id = %self.call_id, "Playback path running ({} bytes/frame)", self.config.geometry.frame_bytes());
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

        let output = match self.config.transport {
            HandoffTransport::Pipe => {
                let mut process = ManagedProcess::spawn(&command, StdioWiring::INPUT)?;
                let stdin = process.take_stdin();
                *self.process.lock() = Some(process);
                let stdin = stdin
                    .ok_or_else(|| BridgeError::stream_wiring(format!("{}: stdin not piped", command.label)))?;
                File::from(OwnedFd::from(stdin))
            }
            HandoffTransport::Fifo => {
                let path = self.fifo_path.clone().ok_or_else(|| {
                    BridgeError::invalid_config(format!("{}: FIFO transport needs a FIFO path", self.label))
                })?;
                ensure_fifo(&path)?;
                let process = ManagedProcess::spawn(&command, StdioWiring::NONE)?;
                let mut guard = self.process.lock();
                let process = guard.insert(process);
                open_fifo_writer(&path, self.config.ready_timeout, Some(process))?
            }
        };
        set_nonblocking(&output)?;

        *self.sink.lock() = Some(SinkStream {
            output,
            pending: Vec::new(),
        });
        Ok(())
    }

    /// Close the encoder input, then stop the encoder
    ///
    /// Returns the encoder's exit report if it had exited on its own.
    fn release(&self) -> Option<String> {
        // Checked before EOF is sent, which ends a healthy encoder too
        let exited_early = self
            .process
            .lock()
            .as_mut()
            .map_or(false, |process| process.poll().is_some());

        if let Some(sink) = self.sink.lock().take() {
            if !sink.pending.is_empty() {
                debug!(call_id = %self.call_id, "Discarding {} pending bytes", sink.pending.len());
            }
        }
        let mut process = self.process.lock().take()?;
        process.stop(self.stop_policy);
        if exited_early {
            process.exit_report()
        } else {
            None
        }
    }

    /// Fail the port with the encoder's exit report if it has exited; never blocks
    fn consumer_exited(&self) -> bool {
        let Some(mut process) = self.process.try_lock() else {
            return false;
        };
        let Some(process) = process.as_mut() else {
            return false;
        };
        match process.exit_report_now() {
            Some(report) => {
                self.status.fail(report);
                true
            }
            None => false,
        }
    }

    fn fail_broken_pipe(&self, error: io::Error) {
        let mut message = BridgeError::BrokenPipe(self.label.clone()).to_string();
        if let Some(mut process) = self.process.try_lock() {
            if let Some(report) = process.as_mut().and_then(ManagedProcess::exit_report_now) {
                message = format!("{} ({})", message, report);
            } else if let Some(process) = process.as_ref() {
                let diagnostics = process.diagnostics().snapshot();
                if !diagnostics.is_empty() {
                    message = format!("{}: {}", message, diagnostics);
                }
            }
        }
        debug!(call_id = %self.call_id, "Encoder input closed: {}", error);
        self.status.fail(message);
    }
}

impl AudioPort for PlaybackAdapter {
    fn direction(&self) -> PortDirection {
        PortDirection::Playback
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

        // An encoder we terminated ourselves says nothing about the failure
        if let Some(report) = self.release() {
            if previous == PortState::Failed {
                self.status.record_error(report);
            }
        }

        let stats = self.stats();
        info!(
            call_id = %self.call_id,
            frames = stats.frames_written,
            dropped = stats.frames_dropped,
            "Playback path stopped (was {})",
            previous
        );
    }
}

impl FrameSink for PlaybackAdapter {
    fn deliver_frame(&self, frame: &[u8]) {
        if frame.is_empty() {
            return;
        }
        if self.status.state() != PortState::Running || self.consumer_exited() {
            self.counters.drop_frame();
            return;
        }

        let mut guard = self.sink.lock();
        let Some(sink) = guard.as_mut() else {
            self.counters.drop_frame();
            return;
        };

        if !sink.pending.is_empty() {
            match sink.write_some(&sink.pending) {
                Ok(n) => {
                    sink.pending.drain(..n);
                    self.counters.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    *guard = None;
                    drop(guard);
                    self.fail_broken_pipe(e);
                    self.counters.drop_frame();
                    return;
                }
            }
            if !sink.pending.is_empty() {
                trace!(call_id = %self.call_id, "Encoder backpressure, dropping frame");
                self.counters.drop_frame();
                return;
            }
        }

        match sink.write_some(frame) {
            Ok(0) => {
                trace!(call_id = %self.call_id, "Encoder backpressure, dropping frame");
                self.counters.drop_frame();
            }
            Ok(n) => {
                if n < frame.len() {
                    sink.pending.extend_from_slice(&frame[n..]);
                    self.counters.partial_writes.fetch_add(1, Ordering::Relaxed);
                }
                self.counters.frames_written.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                *guard = None;
                drop(guard);
                self.fail_broken_pipe(e);
                self.counters.drop_frame();
            }
        }
    }
}

impl Drop for PlaybackAdapter {
    fn drop(&mut self) {
        if self.status.state() != PortState::Stopped {
            self.stop();
        }
    }
}

impl std::fmt::Debug for PlaybackAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackAdapter")
            .field("call_id", &self.call_id)
            .field("state", &self.status.state())
            .field("transport", &self.config.transport)
            .finish()
    }
}
