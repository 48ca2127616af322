//! Bridge configuration
//!
//! Typed configuration for both audio directions, the per-call FIFO
//! handoff, process supervision bounds and the ACK timeout monitor.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::ffmpeg::{FfmpegSettings, RtspEndpoints};
use crate::geometry::FrameGeometry;

/// How PCM bytes are handed to or taken from the external process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffTransport {
    /// The process's stdin (playback) or stdout (capture)
    Pipe,
    /// A per-call named pipe referenced by `{fifo}` in the command line
    Fifo,
}

/// External command line with an operator-facing label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Label used in logs and diagnostics (e.g. "ffmpeg mic")
    pub label: String,
    /// Executable path or name resolved through `PATH`
    pub program: String,
    /// Arguments; `{fifo}` and `{call_id}` are substituted per call
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Substitute the per-call placeholders
    pub fn render(&self, call_id: &str, fifo: Option<&Path>) -> CommandSpec {
        let fifo = fifo.map(|p| p.display().to_string());
        let args = self
            .args
            .iter()
            .map(|arg| {
                let arg = arg.replace("{call_id}", call_id);
                match &fifo {
                    Some(path) => arg.replace("{fifo}", path),
                    None => arg,
                }
            })
            .collect();
        CommandSpec {
            label: self.label.replace("{call_id}", call_id),
            program: self.program.clone(),
            args,
        }
    }

    /// Shell-like rendering for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(BridgeError::invalid_config(format!(
                "{}: program must not be empty",
                self.label
            )));
        }
        Ok(())
    }
}

/// Inbound ("mic") direction: external decoder -> call audio
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub geometry: FrameGeometry,
    pub command: CommandSpec,
    pub transport: HandoffTransport,
    /// Bound on waiting for the decoder's first bytes (FIFO transport)
    pub ready_timeout: Duration,
    /// Pause after the stream became readable before serving frames
    pub settle_delay: Duration,
    /// Amount of audio the ring buffer may hold before dropping the oldest bytes
    pub ring_capacity: Duration,
}

impl CaptureConfig {
    pub fn new(geometry: FrameGeometry, command: CommandSpec) -> Self {
        Self {
            geometry,
            command,
            transport: HandoffTransport::Pipe,
            ready_timeout: Duration::from_secs(5),
            settle_delay: Duration::ZERO,
            ring_capacity: Duration::from_secs(2),
        }
    }

    pub fn with_transport(mut self, transport: HandoffTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_ring_capacity(mut self, capacity: Duration) -> Self {
        self.ring_capacity = capacity;
        self
    }

    /// Ring capacity in bytes, whole channel strides, never below one frame
    pub fn ring_capacity_bytes(&self) -> usize {
        let per_second = self.geometry.bytes_per_second() as u128;
        let bytes = (per_second * self.ring_capacity.as_millis() / 1000) as usize;
        self.geometry
            .align_down(bytes)
            .max(self.geometry.frame_bytes())
    }
}

/// Outbound ("speaker") direction: call audio -> external encoder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub geometry: FrameGeometry,
    pub command: CommandSpec,
    pub transport: HandoffTransport,
    /// Bound on waiting for the encoder to open the FIFO for reading
    pub ready_timeout: Duration,
}

impl PlaybackConfig {
    pub fn new(geometry: FrameGeometry, command: CommandSpec) -> Self {
        Self {
            geometry,
            command,
            transport: HandoffTransport::Pipe,
            ready_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_transport(mut self, transport: HandoffTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

/// Graceful-stop escalation bounds shared by every managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopPolicy {
    /// Wait after SIGTERM before escalating
    pub grace: Duration,
    /// Wait after SIGKILL before giving up on reaping
    pub kill_grace: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    /// Directory holding per-call FIFOs
    pub fifo_root: PathBuf,
    pub stop_policy: StopPolicy,
    /// Bound between the provisional response and the final ACK
    pub ack_timeout: Duration,
    /// Scan period of the ACK timeout monitor
    pub ack_scan_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_ffmpeg(&FfmpegSettings::default())
    }
}

impl BridgeConfig {
    /// Build the default RTSP pipelines from ffmpeg settings
    pub fn from_ffmpeg(settings: &FfmpegSettings) -> Self {
        Self {
            capture: CaptureConfig::new(settings.mic_geometry(), settings.mic_command())
                .with_transport(HandoffTransport::Fifo)
                .with_settle_delay(Duration::from_millis(100)),
            playback: PlaybackConfig::new(settings.speaker_geometry(), settings.speaker_command())
                .with_transport(HandoffTransport::Fifo),
            fifo_root: PathBuf::from("/tmp/siprtsp"),
            stop_policy: StopPolicy::default(),
            ack_timeout: Duration::from_secs(32),
            ack_scan_interval: Duration::from_secs(1),
        }
    }

    pub fn with_capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_playback(mut self, playback: PlaybackConfig) -> Self {
        self.playback = playback;
        self
    }

    pub fn with_fifo_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.fifo_root = root.into();
        self
    }

    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, falling back to the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut endpoints = RtspEndpoints::default();
        if let Some(host) = get("RTSP_HOST") {
            endpoints.host = host;
        }
        // An explicitly empty RTSP_PORT drops the port from the URL
        if let Some(port) = lookup("RTSP_PORT") {
            endpoints.port = port.trim().to_string();
        }
        if let Some(path) = get("RTSP_SPK_PATH") {
            endpoints.speaker_path = path;
        }
        if let Some(path) = get("RTSP_MIC_PATH") {
            endpoints.mic_path = path;
        }

        let mut settings = FfmpegSettings::new(endpoints);
        if let Some(bin) = get("FFMPEG_BIN") {
            settings.binary = bin;
        }
        if let Some(level) = get("FFMPEG_LOGLEVEL") {
            settings.log_level = level;
        }
        if let Some(codec) = get("FFMPEG_A_CODEC") {
            settings.audio_codec = codec;
        }
        if let Some(codec) = get("FFMPEG_V_CODEC") {
            settings.video_codec = codec;
        }
        if let Some(preset) = get("FFMPEG_V_PRESET") {
            settings.video_preset = preset;
        }
        if let Some(transport) = get("FFMPEG_SPK_TRANSPORT") {
            settings.speaker_transport = transport;
        }
        if let Some(transport) = get("FFMPEG_MIC_TRANSPORT") {
            settings.mic_transport = transport;
        }
        if let Some(rate) = get("FFMPEG_SPK_AR") {
            settings.speaker_publish_rate = parse_value("FFMPEG_SPK_AR", &rate)?;
        }
        if let Some(channels) = get("FFMPEG_SPK_AC") {
            settings.speaker_publish_channels = parse_value("FFMPEG_SPK_AC", &channels)?;
        }
        if let Some(rate) = get("FFMPEG_MIC_AR") {
            settings.mic_rate = parse_value("FFMPEG_MIC_AR", &rate)?;
        }
        if let Some(channels) = get("FFMPEG_MIC_AC") {
            settings.mic_channels = parse_value("FFMPEG_MIC_AC", &channels)?;
        }

        let mut config = Self::from_ffmpeg(&settings);
        if let Some(root) = get("RTSP_FIFO_ROOT") {
            config.fifo_root = PathBuf::from(root);
        }
        if let Some(timeout) = get("RTSP_MIC_FIFO_TIMEOUT") {
            config.capture.ready_timeout = parse_seconds("RTSP_MIC_FIFO_TIMEOUT", &timeout)?;
        }
        if let Some(delay) = get("RTSP_MIC_READY_DELAY") {
            config.capture.settle_delay = parse_seconds("RTSP_MIC_READY_DELAY", &delay)?;
        }
        if let Some(timeout) = get("ACK_TIMEOUT_SECS") {
            config.ack_timeout = parse_seconds("ACK_TIMEOUT_SECS", &timeout)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Pretty JSON rendering of the effective configuration
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| BridgeError::invalid_config(format!("cannot serialize configuration: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.capture.geometry.validate()?;
        self.playback.geometry.validate()?;
        self.capture.command.validate()?;
        self.playback.command.validate()?;
        if self.ack_scan_interval.is_zero() {
            return Err(BridgeError::invalid_config("ack scan interval must be non-zero"));
        }
        Ok(())
    }

    /// FIFO carrying call audio to the speaker encoder
    pub fn speaker_fifo(&self, call_id: &str) -> PathBuf {
        self.fifo_root.join(format!("call_{}_spk.pcm", call_id))
    }

    /// FIFO carrying decoded mic audio into the call
    pub fn mic_fifo(&self, call_id: &str) -> PathBuf {
        self.fifo_root.join(format!("call_{}_mic.pcm", call_id))
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| BridgeError::invalid_config(format!("{}: cannot parse '{}'", key, value)))
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration> {
    let secs: f64 = parse_value(key, value)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(BridgeError::invalid_config(format!(
            "{}: '{}' is not a non-negative number of seconds",
            key, value
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}
