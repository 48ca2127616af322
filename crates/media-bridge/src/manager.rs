//! Call registry and event entry points
//!
//! [`BridgeManager`] is the one owner of the mapping from call identity to
//! [`BridgeSession`]. The telephony engine reports call lifecycle and
//! signaling milestones here; everything else hangs off those events.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::monitor::{AckTimeoutMonitor, AckTimeoutWarning, Milestone};
use crate::port::CallAudioEndpoint;
use crate::session::{BridgeSession, CallId, SessionSnapshot};

pub struct BridgeManager {
    config: BridgeConfig,
    sessions: DashMap<CallId, Arc<BridgeSession>>,
    monitor: AckTimeoutMonitor,
}

impl BridgeManager {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let monitor = AckTimeoutMonitor::new(config.ack_timeout, config.ack_scan_interval);
        Ok(Self {
            config,
            sessions: DashMap::new(),
            monitor,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn monitor(&self) -> &AckTimeoutMonitor {
        &self.monitor
    }

    /// Start the ACK timeout scan on the current tokio runtime
    pub fn start_monitor(&self) -> Result<mpsc::UnboundedReceiver<AckTimeoutWarning>> {
        self.monitor.spawn()
    }

    /// Call answered: bring up its bridge session
    ///
    /// Returns whether the mic path came up. A second confirmation for a
    /// live call is rejected without touching the running session.
    pub fn on_call_confirmed(
        &self,
        call_id: impl Into<CallId>,
        endpoint: Arc<dyn CallAudioEndpoint>,
    ) -> Result<bool> {
        let call_id = call_id.into();
        let session = match self.sessions.entry(call_id.clone()) {
            Entry::Occupied(_) => {
                warn!(call_id = %call_id, "Duplicate call confirmation ignored");
                return Err(BridgeError::SessionExists(call_id.to_string()));
            }
            Entry::Vacant(slot) => {
                let session = Arc::new(BridgeSession::new(call_id.clone(), &self.config, endpoint));
                slot.insert(session.clone());
                session
            }
        };

        // Startup blocks on process readiness; the map shard is not held
        match session.start() {
            Ok(mic_ready) => {
                info!(call_id = %call_id, mic_ready, active = self.sessions.len(), "Call bridged");
                Ok(mic_ready)
            }
            Err(e) => {
                error!(call_id = %call_id, "Failed to bridge call: {}", e);
                self.sessions
                    .remove_if(&call_id, |_, current| Arc::ptr_eq(current, &session));
                Err(e)
            }
        }
    }

    /// Call ended: tear down its session and diagnostics
    pub fn on_call_disconnected(&self, call_id: impl Into<CallId>) {
        let call_id = call_id.into();
        self.monitor.remove(&call_id);
        match self.sessions.remove(&call_id) {
            Some((_, session)) => {
                session.stop();
                info!(call_id = %call_id, active = self.sessions.len(), "Call unbridged");
            }
            None => debug!(call_id = %call_id, "Disconnect for unknown call"),
        }
    }

    pub fn on_invite_received(&self, call_id: impl Into<CallId>) {
        self.monitor.record(&call_id.into(), Milestone::InviteReceived);
    }

    pub fn on_provisional_sent(&self, call_id: impl Into<CallId>) {
        self.monitor.record(&call_id.into(), Milestone::ProvisionalSent);
    }

    pub fn on_ack_received(&self, call_id: impl Into<CallId>) {
        self.monitor.record(&call_id.into(), Milestone::AckReceived);
    }

    pub fn session(&self, call_id: &CallId) -> Option<Arc<BridgeSession>> {
        self.sessions.get(call_id).map(|entry| entry.value().clone())
    }

    pub fn active_calls(&self) -> Vec<CallId> {
        let mut calls: Vec<CallId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        calls.sort();
        calls
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|entry| entry.value().snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stop every session and the monitor
    pub fn shutdown(&self) {
        let calls: Vec<CallId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        info!(sessions = calls.len(), "Shutting down bridge manager");
        for call_id in calls {
            self.on_call_disconnected(call_id);
        }
        self.monitor.shutdown();
    }
}

impl Drop for BridgeManager {
    fn drop(&mut self) {
        if !self.sessions.is_empty() {
            self.shutdown();
        }
    }
}
