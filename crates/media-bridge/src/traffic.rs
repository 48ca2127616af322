//! Optional packet-capture monitor
//!
//! Runs an operator-supplied capture command (tshark, tcpdump, ...) under
//! the same supervision as the audio pipelines and forwards its output to
//! the log. It has no influence on call handling.

use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{CommandSpec, StopPolicy};
use crate::error::{BridgeError, Result};
use crate::process::{ManagedProcess, StdioWiring};

pub struct TrafficMonitor {
    label: String,
    stop_policy: StopPolicy,
    process: Mutex<Option<ManagedProcess>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    lines: Arc<AtomicU64>,
}

impl TrafficMonitor {
    /// Split a whitespace-separated command line; `None` when blank
    pub fn command_from_line(line: &str) -> Option<CommandSpec> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(CommandSpec::new("traffic", program).with_args(parts))
    }

    pub fn start(command: &CommandSpec, stop_policy: StopPolicy) -> Result<Self> {
        command.validate()?;
        let mut process = ManagedProcess::spawn(command, StdioWiring::OUTPUT)?;
        let Some(stdout) = process.take_stdout() else {
            process.stop(stop_policy);
            return Err(BridgeError::stream_wiring(format!(
                "{}: stdout not piped",
                command.label
            )));
        };

        let lines = Arc::new(AtomicU64::new(0));
        let counter = lines.clone();
        let label = command.label.clone();
        let spawned = thread::Builder::new()
            .name(format!("traffic-{}", label))
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    match line {
                        Ok(line) => {
                            counter.fetch_add(1, Ordering::Relaxed);
                            info!(target: "traffic", monitor = %label, "{}", line);
                        }
                        Err(e) => {
                            debug!(monitor = %label, "Traffic output read failed: {}", e);
                            break;
                        }
                    }
                }
            });
        let reader = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                process.stop(stop_policy);
                return Err(e.into());
            }
        };

        info!(monitor = %command.label, "Traffic monitor started");
        Ok(Self {
            label: command.label.clone(),
            stop_policy,
            process: Mutex::new(Some(process)),
            reader: Mutex::new(Some(reader)),
            lines,
        })
    }

    pub fn lines_seen(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.process
            .lock()
            .as_mut()
            .map_or(false, |process| process.poll().is_none())
    }

    /// Idempotent
    pub fn stop(&self) {
        let Some(mut process) = self.process.lock().take() else {
            return;
        };
        if let Some(report) = process.exit_report() {
            warn!(monitor = %self.label, "Traffic monitor had already exited: {}", report);
        }
        process.stop(self.stop_policy);

        if let Some(reader) = self.reader.lock().take() {
            // stdout closes with the process; a lingering grandchild keeps the thread detached
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
        info!(monitor = %self.label, lines = self.lines_seen(), "Traffic monitor stopped");
    }
}

impl Drop for TrafficMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_command_from_line() {
        let spec = TrafficMonitor::command_from_line("  tcpdump -l -n udp port 5060 ").unwrap();
        assert_eq!(spec.program, "tcpdump");
        assert_eq!(spec.args, ["-l", "-n", "udp", "port", "5060"]);
        assert!(TrafficMonitor::command_from_line("   ").is_none());
    }

    #[test]
    fn test_forwards_output_lines() {
        let spec = CommandSpec::new("traffic", "sh")
            .with_args(["-c", "printf 'INVITE\\n100 Trying\\n200 OK\\n'; exec sleep 5"]);
        let monitor = TrafficMonitor::start(&spec, StopPolicy::default()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.lines_seen() < 3 {
            assert!(Instant::now() < deadline, "lines never arrived");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(monitor.is_running());

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
