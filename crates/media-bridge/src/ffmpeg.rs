//! Default ffmpeg pipelines
//!
//! The speaker pipeline publishes call audio (muxed with a generated video
//! track) to an RTSP server; the mic pipeline pulls an RTSP stream and
//! decodes it to raw PCM for the call.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{CommandSpec, HandoffTransport};
use crate::geometry::FrameGeometry;

/// RTSP server location and stream paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtspEndpoints {
    pub host: String,
    /// Empty string omits the port from the URL
    pub port: String,
    pub speaker_path: String,
    pub mic_path: String,
}

impl Default for RtspEndpoints {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: "8554".to_string(),
            speaker_path: "/u5004/spk".to_string(),
            mic_path: "/u5004/mic".to_string(),
        }
    }
}

impl RtspEndpoints {
    pub fn base_url(&self) -> String {
        if self.port.is_empty() {
            format!("rtsp://{}", self.host)
        } else {
            format!("rtsp://{}:{}", self.host, self.port)
        }
    }

    pub fn speaker_url(&self) -> String {
        format!("{}{}", self.base_url(), self.speaker_path)
    }

    pub fn mic_url(&self) -> String {
        format!("{}{}", self.base_url(), self.mic_path)
    }
}

/// Knobs for the generated ffmpeg command lines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegSettings {
    pub binary: String,
    pub log_level: String,
    pub endpoints: RtspEndpoints,
    /// Sample rate of call audio handed to the speaker encoder
    pub call_rate: u32,
    pub audio_codec: String,
    pub video_codec: String,
    pub video_preset: String,
    pub speaker_transport: String,
    pub mic_transport: String,
    /// Sample rate published on the speaker stream
    pub speaker_publish_rate: u32,
    /// Channels published on the speaker stream
    pub speaker_publish_channels: u16,
    /// Sample rate the mic stream is decoded to
    pub mic_rate: u32,
    /// Channels the mic stream is decoded to
    pub mic_channels: u16,
    /// Frame duration of the telephony media clock
    pub frame_duration: Duration,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self::new(RtspEndpoints::default())
    }
}

impl FfmpegSettings {
    pub fn new(endpoints: RtspEndpoints) -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            log_level: "warning".to_string(),
            endpoints,
            call_rate: 16000,
            audio_codec: "aac".to_string(),
            video_codec: "libx264".to_string(),
            video_preset: "veryfast".to_string(),
            speaker_transport: "tcp".to_string(),
            mic_transport: "tcp".to_string(),
            speaker_publish_rate: 48000,
            speaker_publish_channels: 2,
            mic_rate: 16000,
            mic_channels: 1,
            frame_duration: Duration::from_millis(20),
        }
    }

    /// PCM layout of call audio written to the speaker encoder
    pub fn speaker_geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.call_rate, 1, 16, self.frame_duration)
    }

    /// PCM layout produced by the mic decoder
    pub fn mic_geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.mic_rate, self.mic_channels, 16, self.frame_duration)
    }

    /// Speaker encoder reading from the per-call FIFO
    pub fn speaker_command(&self) -> CommandSpec {
        self.speaker_command_for(HandoffTransport::Fifo)
    }

    pub fn speaker_command_for(&self, transport: HandoffTransport) -> CommandSpec {
        let input = match transport {
            HandoffTransport::Fifo => "{fifo}",
            HandoffTransport::Pipe => "pipe:0",
        };
        let geometry = self.speaker_geometry();

        CommandSpec::new("ffmpeg spk {call_id}", self.binary.clone()).with_args([
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            self.log_level.clone(),
            "-fflags".to_string(),
            "nobuffer".to_string(),
            "-f".to_string(),
            "s16le".to_string(),
            "-ar".to_string(),
            geometry.sample_rate.to_string(),
            "-ac".to_string(),
            geometry.channels.to_string(),
            "-i".to_string(),
            input.to_string(),
            "-use_wallclock_as_timestamps".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            "color=c=pink:size=640x360:rate=15".to_string(),
            "-map".to_string(),
            "1:v:0".to_string(),
            "-map".to_string(),
            "0:a:0".to_string(),
            "-c:v".to_string(),
            self.video_codec.clone(),
            "-preset".to_string(),
            self.video_preset.clone(),
            "-tune".to_string(),
            "zerolatency".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-c:a".to_string(),
            self.audio_codec.clone(),
            "-ar".to_string(),
            self.speaker_publish_rate.to_string(),
            "-ac".to_string(),
            self.speaker_publish_channels.to_string(),
            "-f".to_string(),
            "rtsp".to_string(),
            "-rtsp_transport".to_string(),
            self.speaker_transport.clone(),
            self.endpoints.speaker_url(),
        ])
    }

    /// Mic decoder writing to the per-call FIFO
    pub fn mic_command(&self) -> CommandSpec {
        self.mic_command_for(HandoffTransport::Fifo)
    }

    pub fn mic_command_for(&self, transport: HandoffTransport) -> CommandSpec {
        let output = match transport {
            HandoffTransport::Fifo => "{fifo}",
            HandoffTransport::Pipe => "pipe:1",
        };

        CommandSpec::new("ffmpeg mic {call_id}", self.binary.clone()).with_args([
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            self.log_level.clone(),
            "-y".to_string(),
            "-rtsp_transport".to_string(),
            self.mic_transport.clone(),
            "-i".to_string(),
            self.endpoints.mic_url(),
            "-vn".to_string(),
            "-acodec".to_string(),
            "pcm_s16le".to_string(),
            "-ar".to_string(),
            self.mic_rate.to_string(),
            "-ac".to_string(),
            self.mic_channels.to_string(),
            "-f".to_string(),
            "s16le".to_string(),
            output.to_string(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_omits_empty_port() {
        let mut endpoints = RtspEndpoints::default();
        assert_eq!(endpoints.speaker_url(), "rtsp://127.0.0.1:8554/u5004/spk");
        endpoints.port.clear();
        assert_eq!(endpoints.mic_url(), "rtsp://127.0.0.1/u5004/mic");
    }

    #[test]
    fn test_mic_command_writes_raw_pcm() {
        let settings = FfmpegSettings::default();
        let fifo = settings.mic_command();
        assert_eq!(fifo.args.last().unwrap(), "{fifo}");
        assert!(fifo.args.windows(2).any(|w| w[0] == "-f" && w[1] == "s16le"));

        let pipe = settings.mic_command_for(HandoffTransport::Pipe);
        assert_eq!(pipe.args.last().unwrap(), "pipe:1");
    }

    #[test]
    fn test_speaker_command_reads_call_geometry() {
        let settings = FfmpegSettings {
            call_rate: 8000,
            ..Default::default()
        };
        let spec = settings.speaker_command_for(HandoffTransport::Pipe);
        let input = spec.args.iter().position(|a| a == "pipe:0").unwrap();
        assert_eq!(spec.args[input - 4], "8000");
        assert_eq!(spec.args.last().unwrap(), "rtsp://127.0.0.1:8554/u5004/spk");
    }
}
