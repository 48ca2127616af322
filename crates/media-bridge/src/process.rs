//! Managed subprocess supervision
//!
//! [`ManagedProcess`] owns one external byte-stream process: it wires the
//! requested standard streams, keeps a bounded tail of the process's
//! stderr on a background thread, and tears the process down with a
//! SIGTERM -> SIGKILL escalation that always reaps (or logs) the child.

use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{CommandSpec, StopPolicy};
use crate::error::{BridgeError, Result};

/// Bytes of stderr retained per process
const DIAGNOSTIC_TAIL_BYTES: usize = 8 * 1024;

/// Poll period while waiting for a process to exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long an exited process's stderr reader may take to hit EOF
const DIAGNOSTIC_SETTLE: Duration = Duration::from_millis(250);

/// Escalation used when a process is dropped without an explicit stop
const DROP_POLICY: StopPolicy = StopPolicy {
    grace: Duration::from_millis(500),
    kill_grace: Duration::from_millis(500),
};

/// Which of stdin/stdout are piped; stderr is always captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StdioWiring {
    pub stdin: bool,
    pub stdout: bool,
}

impl StdioWiring {
    /// Neither stdin nor stdout (FIFO handoff)
    pub const NONE: StdioWiring = StdioWiring {
        stdin: false,
        stdout: false,
    };

    /// Piped stdin, for encoders fed by the bridge
    pub const INPUT: StdioWiring = StdioWiring {
        stdin: true,
        stdout: false,
    };

    /// Piped stdout, for decoders drained by the bridge
    pub const OUTPUT: StdioWiring = StdioWiring {
        stdin: false,
        stdout: true,
    };
}

/// Bounded, shareable tail of a process's diagnostic output
#[derive(Debug, Clone, Default)]
pub struct DiagnosticLog {
    tail: Arc<Mutex<String>>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&self, line: &str) {
        let mut tail = self.tail.lock();
        if !tail.is_empty() {
            tail.push('\n');
        }
        tail.push_str(line);

        if tail.len() > DIAGNOSTIC_TAIL_BYTES {
            let mut cut = tail.len() - DIAGNOSTIC_TAIL_BYTES;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }

    /// Current tail, trimmed
    pub fn snapshot(&self) -> String {
        self.tail.lock().trim().to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.tail.lock().trim().is_empty()
    }
}

/// One supervised external process
#[derive(Debug)]
pub struct ManagedProcess {
    label: String,
    pid: u32,
    child: Child,
    exit_status: Option<ExitStatus>,
    diagnostics: DiagnosticLog,
    stderr_reader: Option<JoinHandle<()>>,
    stopped: bool,
}

impl ManagedProcess {
    /// Spawn `spec` with the requested stream wiring
    pub fn spawn(spec: &CommandSpec, wiring: StdioWiring) -> Result<Self> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if wiring.stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(if wiring.stdout { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| BridgeError::Spawn {
            label: spec.label.clone(),
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        let diagnostics = DiagnosticLog::new();
        let stderr_reader = match child.stderr.take() {
            Some(stderr) => match spawn_stderr_reader(&spec.label, stderr, diagnostics.clone()) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e.into());
                }
            },
            None => None,
        };

        info!(process = %spec.label, pid, "Spawned: {}", spec.command_line());

        Ok(Self {
            label: spec.label.clone(),
            pid,
            child,
            exit_status: None,
            diagnostics,
            stderr_reader,
            stopped: false,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Exit status if the process has already been observed to exit
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Handle on the diagnostic tail that outlives this process
    pub fn diagnostics(&self) -> DiagnosticLog {
        self.diagnostics.clone()
    }

    /// Non-blocking exit check; `None` while running
    pub fn poll(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_some() {
            return self.exit_status;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(process = %self.label, pid = self.pid, "Exited with {}", status);
                self.exit_status = Some(status);
                self.exit_status
            }
            Ok(None) => None,
            Err(e) => {
                warn!(process = %self.label, pid = self.pid, "try_wait failed: {}", e);
                None
            }
        }
    }

    /// Captured stderr text, empty if nothing was captured
    ///
    /// Once the process has exited this gives the stderr reader a short,
    /// bounded chance to reach end-of-stream so the final lines are included.
    pub fn drain_diagnostics(&mut self) -> String {
        if self.poll().is_some() {
            self.settle_stderr_reader(DIAGNOSTIC_SETTLE);
        }
        self.diagnostics.snapshot()
    }

    /// Describe the exit for errors and `last_error` reporting
    pub fn exit_report(&mut self) -> Option<String> {
        let status = self.poll()?;
        let diagnostics = self.drain_diagnostics();
        Some(if diagnostics.is_empty() {
            format!("{} exited with {}", self.label, status)
        } else {
            format!("{} exited with {}: {}", self.label, status, diagnostics)
        })
    }

    /// Like [`exit_report`](Self::exit_report) but never waits on the stderr reader
    ///
    /// Safe to call from a real-time thread; lines still in flight are missed.
    pub fn exit_report_now(&mut self) -> Option<String> {
        let status = self.poll()?;
        let diagnostics = self.diagnostics.snapshot();
        Some(if diagnostics.is_empty() {
            format!("{} exited with {}", self.label, status)
        } else {
            format!("{} exited with {}: {}", self.label, status, diagnostics)
        })
    }

    /// Build a `ProducerExited` error from an observed exit
    pub fn exited_error(&mut self) -> Option<BridgeError> {
        let status = self.poll()?;
        Some(BridgeError::ProducerExited {
            label: self.label.clone(),
            status: status.to_string(),
            diagnostics: self.drain_diagnostics(),
        })
    }

    /// Terminate the process: SIGTERM, bounded wait, SIGKILL, bounded wait
    ///
    /// Idempotent. Never fails; a process that cannot be reaped is logged.
    pub fn stop(&mut self, policy: StopPolicy) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        // Close our ends first so a reader blocked on stdin sees EOF
        drop(self.child.stdin.take());
        drop(self.child.stdout.take());

        if self.poll().is_none() {
            debug!(process = %self.label, pid = self.pid, "Sending SIGTERM");
            if let Err(e) = signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
                debug!(process = %self.label, "SIGTERM failed: {}", e);
            }

            if self.wait_for_exit(policy.grace).is_none() {
                warn!(
                    process = %self.label,
                    pid = self.pid,
                    "Still running after {:?}, sending SIGKILL",
                    policy.grace
                );
                if let Err(e) = self.child.kill() {
                    warn!(process = %self.label, "SIGKILL failed: {}", e);
                }
                if self.wait_for_exit(policy.kill_grace).is_none() {
                    error!(
                        process = %self.label,
                        pid = self.pid,
                        "Kill timeout: process not reaped after {:?}",
                        policy.kill_grace
                    );
                }
            }
        }

        self.settle_stderr_reader(DIAGNOSTIC_SETTLE);
        match self.exit_status {
            Some(status) => info!(process = %self.label, pid = self.pid, "Stopped ({})", status),
            None => info!(process = %self.label, pid = self.pid, "Stopped (unreaped)"),
        }
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.poll() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Join the stderr reader if it finishes within `timeout`, else leave it detached
    fn settle_stderr_reader(&mut self, timeout: Duration) {
        let Some(handle) = self.stderr_reader.take() else {
            return;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else if self.stopped {
            // A grandchild may still hold stderr open; the thread ends with it
            debug!(process = %self.label, "Detaching stderr reader");
        } else {
            self.stderr_reader = Some(handle);
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if !self.stopped {
            warn!(process = %self.label, pid = self.pid, "Dropped without stop, terminating");
            self.stop(DROP_POLICY);
        }
    }
}

fn spawn_stderr_reader(
    label: &str,
    stderr: ChildStderr,
    diagnostics: DiagnosticLog,
) -> std::io::Result<JoinHandle<()>> {
    let label = label.to_string();
    thread::Builder::new()
        .name(format!("stderr-{}", label))
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        let text = text.trim_end();
                        if !text.is_empty() {
                            debug!(process = %label, "{}", text);
                            diagnostics.push_line(text);
                        }
                    }
                    Err(e) => {
                        debug!(process = %label, "stderr read failed: {}", e);
                        break;
                    }
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(label: &str, script: &str) -> CommandSpec {
        CommandSpec::new(label, "sh").with_args(["-c", script])
    }

    fn quick_policy() -> StopPolicy {
        StopPolicy {
            grace: Duration::from_millis(500),
            kill_grace: Duration::from_millis(500),
        }
    }

    fn is_alive(pid: u32) -> bool {
        signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[test]
    fn test_spawn_missing_binary_is_spawn_error() {
        let spec = CommandSpec::new("ghost", "/nonexistent/definitely-not-ffmpeg");
        let err = ManagedProcess::spawn(&spec, StdioWiring::NONE).unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }

    #[test]
    fn test_poll_and_exit_report_capture_stderr() {
        let spec = sh("failing", "echo 'rtsp: connection refused' >&2; exit 3");
        let mut process = ManagedProcess::spawn(&spec, StdioWiring::NONE).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while process.poll().is_none() {
            assert!(Instant::now() < deadline, "process never exited");
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(process.exit_status().unwrap().code(), Some(3));
        let report = process.exit_report().unwrap();
        assert!(report.contains("failing exited with"));
        assert!(report.contains("connection refused"));
        process.stop(quick_policy());
    }

    #[test]
    fn test_stop_terminates_and_reaps() {
        let mut process = ManagedProcess::spawn(&sh("sleeper", "exec sleep 30"), StdioWiring::NONE).unwrap();
        let pid = process.pid();
        assert!(process.poll().is_none());

        process.stop(quick_policy());
        assert!(process.is_stopped());
        assert!(process.exit_status().is_some());
        assert!(!is_alive(pid), "child should be reaped");

        // Second stop is a no-op
        process.stop(quick_policy());
        assert!(process.is_stopped());
    }

    #[test]
    fn test_stop_escalates_to_kill() {
        let spec = sh("stubborn", "trap '' TERM; while :; do sleep 0.05; done");
        let mut process = ManagedProcess::spawn(&spec, StdioWiring::NONE).unwrap();
        let pid = process.pid();
        // Give the shell a moment to install its trap
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        process.stop(StopPolicy {
            grace: Duration::from_millis(200),
            kill_grace: Duration::from_secs(2),
        });

        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!is_alive(pid));
        let status = process.exit_status().unwrap();
        assert_eq!(status.code(), None, "killed by signal");
    }

    #[test]
    fn test_stop_closes_stdin_before_terminating() {
        let mut process = ManagedProcess::spawn(&CommandSpec::new("cat", "cat"), StdioWiring::INPUT).unwrap();
        assert!(process.take_stdin().is_some());
        assert!(process.take_stdin().is_none());
        process.stop(quick_policy());
        assert!(process.exit_status().is_some());
    }

    #[test]
    fn test_diagnostic_tail_is_bounded() {
        let log = DiagnosticLog::new();
        let line = "x".repeat(1000);
        for _ in 0..20 {
            log.push_line(&line);
        }
        log.push_line("last line");
        let snapshot = log.snapshot();
        assert!(snapshot.len() <= DIAGNOSTIC_TAIL_BYTES);
        assert!(snapshot.ends_with("last line"));
    }
}
