//! # SIP-to-RTSP Media Bridge
//!
//! Real-time audio bridge between a telephony engine's fixed-cadence audio
//! ports and external ffmpeg byte-stream pipelines.
//!
//! The telephony engine owns the media clock. Every 10-20 ms it pulls one
//! frame of mic audio from a [`CaptureAdapter`] and pushes one frame of call
//! audio into a [`PlaybackAdapter`]. Neither call may stall on the external
//! process: underruns become silence, backpressure becomes dropped frames,
//! and a crashed pipeline moves its adapter to [`PortState::Failed`].
//!
//! ## Components
//!
//! - [`ManagedProcess`]: spawn, supervise and tear down one subprocess
//! - [`ReadinessGate`]: FIFO guard that avoids the "no writer yet" race
//! - [`CaptureAdapter`] / [`PlaybackAdapter`]: the pull and push contracts
//! - [`BridgeSession`]: both directions of one call, speaker first
//! - [`BridgeManager`]: call registry and event entry points
//! - [`AckTimeoutMonitor`]: warns when a call never sees its ACK
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use siprtsp_media_bridge::{BridgeConfig, BridgeManager, CallAudioEndpoint};
//!
//! fn bridge(endpoint: Arc<dyn CallAudioEndpoint>) -> siprtsp_media_bridge::Result<()> {
//!     let manager = BridgeManager::new(BridgeConfig::from_env()?)?;
//!     let mic_ready = manager.on_call_confirmed(1u32, endpoint)?;
//!     println!("mic path up: {}", mic_ready);
//!     manager.on_call_disconnected(1u32);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod capture;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod gate;
pub mod geometry;
pub mod manager;
pub mod monitor;
pub mod playback;
pub mod port;
pub mod process;
pub mod session;
pub mod traffic;

pub use buffer::PcmRing;
pub use capture::{CaptureAdapter, CaptureStats};
pub use config::{BridgeConfig, CaptureConfig, CommandSpec, HandoffTransport, PlaybackConfig, StopPolicy};
pub use error::{BridgeError, Result};
pub use ffmpeg::{FfmpegSettings, RtspEndpoints};
pub use gate::{ensure_fifo, open_fifo_writer, remove_fifo, ReadinessGate};
pub use geometry::FrameGeometry;
pub use manager::BridgeManager;
pub use monitor::{AckTimeoutMonitor, AckTimeoutWarning, DiagnosticEntry, Milestone};
pub use playback::{PlaybackAdapter, PlaybackStats};
pub use port::{AudioPort, CallAudioEndpoint, FrameSink, FrameSource, PortDirection, PortState};
pub use process::{DiagnosticLog, ManagedProcess, StdioWiring};
pub use session::{BridgeSession, CallId, SessionSnapshot, SessionState};
pub use traffic::TrafficMonitor;
