//! Loopback command - clocked stand-in for the telephony engine
//!
//! Confirms one synthetic call, then on every frame tick pulls a mic frame
//! and pushes it to the speaker path, the way the engine's conference
//! bridge would. Signaling milestones are reported so the ACK monitor runs
//! exactly as in production.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use siprtsp_media_bridge::{
    BridgeConfig, BridgeManager, CallAudioEndpoint, FrameSink, FrameSource, TrafficMonitor,
};

/// Endpoint double wired to a local media clock
struct LoopbackEndpoint {
    sink: Mutex<Option<Arc<dyn FrameSink>>>,
    source: Mutex<Option<Arc<dyn FrameSource>>>,
    silence: Bytes,
}

impl LoopbackEndpoint {
    fn new(frame_bytes: usize) -> Self {
        Self {
            sink: Mutex::new(None),
            source: Mutex::new(None),
            silence: Bytes::from(vec![0u8; frame_bytes]),
        }
    }

    /// One media clock tick: mic -> speaker, silence when the mic is down
    fn tick(&self) {
        let Some(sink) = self.sink.lock().clone() else {
            return;
        };
        let frame = match self.source.lock().clone() {
            Some(source) => source.request_frame(self.silence.len()),
            None => self.silence.clone(),
        };
        sink.deliver_frame(&frame);
    }
}

impl CallAudioEndpoint for LoopbackEndpoint {
    fn attach_playback(&self, sink: Arc<dyn FrameSink>) -> siprtsp_media_bridge::Result<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn attach_capture(&self, source: Arc<dyn FrameSource>) -> siprtsp_media_bridge::Result<()> {
        *self.source.lock() = Some(source);
        Ok(())
    }

    fn detach_all(&self) {
        self.sink.lock().take();
        self.source.lock().take();
    }
}

pub async fn execute(
    config: BridgeConfig,
    duration: Duration,
    call_id: String,
    traffic_cmd: Option<String>,
) -> Result<()> {
    let stop_policy = config.stop_policy;
    let frame_period = config.playback.geometry.frame_duration;
    let endpoint = Arc::new(LoopbackEndpoint::new(config.playback.geometry.frame_bytes()));
    let manager = Arc::new(BridgeManager::new(config)?);
    let mut warnings = manager.start_monitor()?;

    let traffic = match traffic_cmd.as_deref().and_then(TrafficMonitor::command_from_line) {
        Some(command) => Some(TrafficMonitor::start(&command, stop_policy)?),
        None => None,
    };

    info!(call_id = %call_id, "📞 Incoming call");
    manager.on_invite_received(call_id.as_str());
    manager.on_provisional_sent(call_id.as_str());

    let confirm = {
        let manager = manager.clone();
        let endpoint: Arc<dyn CallAudioEndpoint> = endpoint.clone();
        let call_id = call_id.clone();
        tokio::task::spawn_blocking(move || manager.on_call_confirmed(call_id, endpoint))
    };
    let mic_ready = confirm.await.context("confirm task failed")??;
    manager.on_ack_received(call_id.as_str());
    info!(call_id = %call_id, mic_ready, "✅ Call bridged, looping audio for {:?}", duration);

    let mut ticker = tokio::time::interval(frame_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Interrupted");
                break;
            }
            Some(warning) = warnings.recv() => {
                warn!(call_id = %warning.call_id, "ACK overdue by {:?}", warning.elapsed);
            }
            _ = ticker.tick() => endpoint.tick(),
        }
    }

    for snapshot in manager.snapshots() {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    let teardown = {
        let manager = manager.clone();
        tokio::task::spawn_blocking(move || {
            manager.on_call_disconnected(call_id);
            manager.shutdown();
            if let Some(traffic) = traffic {
                traffic.stop();
            }
        })
    };
    teardown.await.context("teardown task failed")?;
    info!("👋 Loopback finished");
    Ok(())
}
