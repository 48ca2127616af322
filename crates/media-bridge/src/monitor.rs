//! ACK timeout monitor
//!
//! Tracks signaling milestones per call and warns once when a call that
//! sent a provisional response never sees its final ACK. Purely
//! observational: it never touches call or audio state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::session::CallId;

/// Signaling events worth timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    InviteReceived,
    ProvisionalSent,
    AckReceived,
}

/// First observation time of each milestone for one call
#[derive(Debug, Clone, Default)]
pub struct DiagnosticEntry {
    pub invite_at: Option<Instant>,
    pub provisional_at: Option<Instant>,
    pub ack_at: Option<Instant>,
    pub reported: bool,
}

impl DiagnosticEntry {
    fn observe(&mut self, milestone: Milestone, at: Instant) {
        let slot = match milestone {
            Milestone::InviteReceived => &mut self.invite_at,
            Milestone::ProvisionalSent => &mut self.provisional_at,
            Milestone::AckReceived => &mut self.ack_at,
        };
        // Retransmissions keep the first timestamp
        slot.get_or_insert(at);
    }

    /// Time since the provisional response if the ACK is overdue
    fn overdue(&self, now: Instant, timeout: Duration) -> Option<Duration> {
        if self.reported || self.ack_at.is_some() {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.provisional_at?);
        (elapsed >= timeout).then_some(elapsed)
    }
}

/// Raised once per call whose ACK did not arrive in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckTimeoutWarning {
    pub call_id: CallId,
    pub elapsed: Duration,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct AckTimeoutMonitor {
    timeout: Duration,
    scan_interval: Duration,
    entries: Arc<Mutex<HashMap<CallId, DiagnosticEntry>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AckTimeoutMonitor {
    pub fn new(timeout: Duration, scan_interval: Duration) -> Self {
        Self {
            timeout,
            scan_interval,
            entries: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a milestone, creating the entry on first sight of the call
    pub fn record(&self, call_id: &CallId, milestone: Milestone) {
        self.record_at(call_id, milestone, Instant::now());
    }

    pub fn record_at(&self, call_id: &CallId, milestone: Milestone, at: Instant) {
        debug!(call_id = %call_id, ?milestone, "Signaling milestone");
        self.entries
            .lock()
            .entry(call_id.clone())
            .or_default()
            .observe(milestone, at);
    }

    pub fn remove(&self, call_id: &CallId) {
        self.entries.lock().remove(call_id);
    }

    pub fn entry(&self, call_id: &CallId) -> Option<DiagnosticEntry> {
        self.entries.lock().get(call_id).cloned()
    }

    pub fn tracked(&self) -> usize {
        self.entries.lock().len()
    }

    /// One pass over all entries as of `now`
    pub fn scan_at(&self, now: Instant) -> Vec<AckTimeoutWarning> {
        scan(&self.entries, self.timeout, now)
    }

    /// Start the periodic scan on the current tokio runtime
    ///
    /// Warnings are logged and also published on the returned channel.
    pub fn spawn(&self) -> Result<mpsc::UnboundedReceiver<AckTimeoutWarning>> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| BridgeError::invalid_state("ACK monitor needs a tokio runtime"))?;

        let mut task = self.task.lock();
        if task.is_some() {
            return Err(BridgeError::invalid_state("ACK monitor already running"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let entries = self.entries.clone();
        let timeout = self.timeout;
        let period = self.scan_interval;

        *task = Some(handle.spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                for warning in scan(&entries, timeout, Instant::now()) {
                    // Receiver may be gone; the log line is the primary output
                    let _ = tx.send(warning);
                }
            }
        }));
        debug!(?timeout, ?period, "ACK timeout monitor started");
        Ok(rx)
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().map_or(false, |task| !task.is_finished())
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("ACK timeout monitor stopped");
        }
    }
}

impl Drop for AckTimeoutMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scan(
    entries: &Mutex<HashMap<CallId, DiagnosticEntry>>,
    timeout: Duration,
    now: Instant,
) -> Vec<AckTimeoutWarning> {
    let mut entries = entries.lock();
    let mut warnings = Vec::new();
    for (call_id, entry) in entries.iter_mut() {
        if let Some(elapsed) = entry.overdue(now, timeout) {
            entry.reported = true;
            warn!(
                call_id = %call_id,
                elapsed_secs = elapsed.as_secs_f64(),
                "No ACK {:.1}s after provisional response (timeout {:?})",
                elapsed.as_secs_f64(),
                timeout
            );
            warnings.push(AckTimeoutWarning {
                call_id: call_id.clone(),
                elapsed,
                timeout,
            });
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> AckTimeoutMonitor {
        AckTimeoutMonitor::new(Duration::from_secs(32), Duration::from_secs(1))
    }

    #[test]
    fn test_scan_reports_once() {
        let monitor = monitor();
        let call = CallId::from(1u32);
        let t0 = Instant::now();
        monitor.record_at(&call, Milestone::InviteReceived, t0);
        monitor.record_at(&call, Milestone::ProvisionalSent, t0);

        assert!(monitor.scan_at(t0 + Duration::from_secs(31)).is_empty());

        let warnings = monitor.scan_at(t0 + Duration::from_secs(33));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].call_id, call);
        assert_eq!(warnings[0].elapsed, Duration::from_secs(33));

        assert!(monitor.scan_at(t0 + Duration::from_secs(60)).is_empty());
        assert!(monitor.entry(&call).unwrap().reported);
    }

    #[test]
    fn test_ack_or_missing_provisional_is_quiet() {
        let monitor = monitor();
        let t0 = Instant::now();

        let acked = CallId::from("acked");
        monitor.record_at(&acked, Milestone::ProvisionalSent, t0);
        monitor.record_at(&acked, Milestone::AckReceived, t0 + Duration::from_secs(1));

        let invite_only = CallId::from("invite-only");
        monitor.record_at(&invite_only, Milestone::InviteReceived, t0);

        assert!(monitor.scan_at(t0 + Duration::from_secs(120)).is_empty());
        assert_eq!(monitor.tracked(), 2);

        monitor.remove(&acked);
        monitor.remove(&invite_only);
        assert_eq!(monitor.tracked(), 0);
    }

    #[test]
    fn test_retransmitted_provisional_keeps_first_timestamp() {
        let monitor = monitor();
        let call = CallId::from("retx");
        let t0 = Instant::now();
        monitor.record_at(&call, Milestone::ProvisionalSent, t0);
        monitor.record_at(&call, Milestone::ProvisionalSent, t0 + Duration::from_secs(20));
        assert_eq!(monitor.scan_at(t0 + Duration::from_secs(32)).len(), 1);
    }

    #[test]
    fn test_spawn_without_runtime_fails() {
        let monitor = monitor();
        assert!(matches!(monitor.spawn(), Err(BridgeError::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_scan_emits_single_warning() {
        let monitor = monitor();
        let mut warnings = monitor.spawn().unwrap();
        assert!(monitor.is_running());

        let call = CallId::from(9u32);
        monitor.record(&call, Milestone::InviteReceived);
        monitor.record(&call, Milestone::ProvisionalSent);

        time::sleep(Duration::from_secs(31)).await;
        assert!(warnings.try_recv().is_err());

        let warning = time::timeout(Duration::from_secs(3), warnings.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(warning.call_id, call);
        assert!(warning.elapsed >= Duration::from_secs(32));

        time::sleep(Duration::from_secs(60)).await;
        assert!(warnings.try_recv().is_err());

        monitor.shutdown();
        assert!(!monitor.is_running());
    }
}
