//! Frame geometry
//!
//! Derives the byte length of one telephony frame from the PCM format and
//! the media clock's frame duration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// PCM layout and cadence of one audio direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
    /// Bits per sample (little-endian signed PCM)
    pub bits_per_sample: u16,
    /// Duration of one frame of the media clock
    pub frame_duration: Duration,
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self::mono_16bit(16000)
    }
}

impl FrameGeometry {
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16, frame_duration: Duration) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
            frame_duration,
        }
    }

    /// Mono 16-bit PCM with a 20 ms frame
    pub fn mono_16bit(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1, 16, Duration::from_millis(20))
    }

    pub fn with_frame_duration(mut self, frame_duration: Duration) -> Self {
        self.frame_duration = frame_duration;
        self
    }

    /// Bytes per sample of a single channel
    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    /// Bytes occupied by one sample across all channels
    pub fn channel_stride(&self) -> usize {
        usize::from(self.channels) * self.bytes_per_sample()
    }

    /// Samples per channel in one frame, rounded to the nearest sample
    pub fn samples_per_frame(&self) -> usize {
        let nanos = self.frame_duration.as_nanos();
        let scaled = u128::from(self.sample_rate) * nanos;
        ((scaled + 500_000_000) / 1_000_000_000) as usize
    }

    /// `channels * (bits / 8) * round(sample_rate * frame_duration)`
    pub fn frame_bytes(&self) -> usize {
        self.channel_stride() * self.samples_per_frame()
    }

    /// Bytes produced per second of audio
    pub fn bytes_per_second(&self) -> usize {
        self.channel_stride() * self.sample_rate as usize
    }

    /// Round `len` down to a whole number of channel strides
    pub fn align_down(&self, len: usize) -> usize {
        let stride = self.channel_stride().max(1);
        len - (len % stride)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(BridgeError::invalid_config("channel count must be at least 1"));
        }
        if self.bits_per_sample == 0 || self.bits_per_sample % 8 != 0 {
            return Err(BridgeError::invalid_config(format!(
                "bit depth {} is not a whole number of bytes",
                self.bits_per_sample
            )));
        }
        if self.sample_rate == 0 {
            return Err(BridgeError::invalid_config("sample rate must be non-zero"));
        }
        if self.frame_bytes() < self.channel_stride() {
            return Err(BridgeError::invalid_config(format!(
                "frame of {:?} at {} Hz holds no complete sample",
                self.frame_duration, self.sample_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes_for_common_rates() {
        assert_eq!(FrameGeometry::mono_16bit(8000).frame_bytes(), 320);
        assert_eq!(FrameGeometry::mono_16bit(16000).frame_bytes(), 640);

        let stereo = FrameGeometry::new(48000, 2, 16, Duration::from_millis(10));
        assert_eq!(stereo.channel_stride(), 4);
        assert_eq!(stereo.frame_bytes(), 1920);
    }

    #[test]
    fn test_samples_round_to_nearest() {
        // 44.1 kHz * 10 ms = 441 samples exactly; 22.05 kHz * 10 ms = 220.5 -> 221
        let geometry = FrameGeometry::new(22050, 1, 16, Duration::from_millis(10));
        assert_eq!(geometry.samples_per_frame(), 221);
        assert_eq!(geometry.frame_bytes(), 442);
    }

    #[test]
    fn test_validate_rejects_degenerate_geometry() {
        assert!(FrameGeometry::new(16000, 0, 16, Duration::from_millis(20)).validate().is_err());
        assert!(FrameGeometry::new(16000, 1, 12, Duration::from_millis(20)).validate().is_err());
        assert!(FrameGeometry::new(16000, 1, 16, Duration::from_micros(10)).validate().is_err());
        assert!(FrameGeometry::default().validate().is_ok());
    }

    #[test]
    fn test_align_down() {
        let stereo = FrameGeometry::new(48000, 2, 16, Duration::from_millis(20));
        assert_eq!(stereo.align_down(10), 8);
        assert_eq!(stereo.align_down(8), 8);
        assert_eq!(stereo.align_down(3), 0);
    }
}
