//! Audio capture module
//!
//! A capture session opens an input device with an explicit format, pulls a
//! fixed number of chunks, and persists them as a WAV container. Devices are
//! acquired through [`AudioDevice::open`] and released when the returned
//! [`InputStream`] is dropped, so every exit path gives the device back.

pub mod cpal_device;
pub mod session;
pub mod synthetic;

pub use session::{write_container, CaptureOutcome, CaptureSession, SessionSpec};
pub use synthetic::SyntheticDevice;

use crate::config::AudioConfig;
use crate::error::CaptureError;
use std::sync::Arc;
use std::time::Duration;

/// Device name that selects the built-in tone generator
pub const SYNTHETIC_DEVICE: &str = "synthetic";

/// Sample format a session opens the device with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub channels: u16,
    /// Hz
    pub sample_rate: u32,
    /// Bytes per sample
    pub sample_width: u16,
    /// Frames per chunk
    pub chunk_size: u32,
}

impl CaptureFormat {
    pub fn bits_per_sample(&self) -> u16 {
        self.sample_width * 8
    }

    /// Interleaved samples in one chunk
    pub fn samples_per_chunk(&self) -> usize {
        self.chunk_size as usize * self.channels as usize
    }

    /// Largest positive sample value for the configured width
    pub fn max_amplitude(&self) -> i32 {
        ((1i64 << (self.bits_per_sample() - 1)) - 1) as i32
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / self.sample_rate as f64)
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.channels == 0 || self.sample_rate == 0 || self.chunk_size == 0 {
            return Err(CaptureError::UnsupportedFormat(format!(
                "channels, sample rate and chunk size must be positive ({:?})",
                self
            )));
        }
        if !(1..=4).contains(&self.sample_width) {
            return Err(CaptureError::UnsupportedFormat(format!(
                "sample width of {} bytes",
                self.sample_width
            )));
        }
        Ok(())
    }
}

/// Number of chunks needed to cover `duration`: ceil(rate / chunk * duration)
///
/// Computed in integer nanoseconds so exact products do not round up.
pub fn chunk_count(sample_rate: u32, chunk_size: u32, duration: Duration) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    let numerator = sample_rate as u128 * duration.as_nanos();
    let denominator = chunk_size as u128 * 1_000_000_000;
    numerator.div_ceil(denominator) as u64
}

/// An opened, exclusively held input stream
///
/// Dropping it releases the underlying device.
pub trait InputStream {
    /// Block until one chunk of interleaved samples is available
    fn read_chunk(&mut self) -> std::io::Result<Vec<i32>>;
}

/// An audio input device that can be opened for one session at a time
pub trait AudioDevice: Send + Sync {
    /// Human readable device name for logs
    fn name(&self) -> String;

    /// Acquire the device and start sampling with `format`
    fn open(
        &self,
        format: &CaptureFormat,
        read_timeout: Duration,
    ) -> Result<Box<dyn InputStream>, CaptureError>;
}

/// Factory function to create the configured audio device
pub fn create_device(config: &AudioConfig) -> Arc<dyn AudioDevice> {
    if config.device.eq_ignore_ascii_case(SYNTHETIC_DEVICE) {
        tracing::info!("Using synthetic audio device (440 Hz tone)");
        Arc::new(SyntheticDevice::new().paced(true))
    } else {
        Arc::new(cpal_device::CpalDevice::new(&config.device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count_reference_scenario() {
        assert_eq!(chunk_count(44100, 1024, Duration::from_secs(5)), 216);
    }

    #[test]
    fn test_chunk_count_exact_multiple() {
        assert_eq!(chunk_count(48000, 1000, Duration::from_secs(1)), 48);
        assert_eq!(chunk_count(1000, 100, Duration::from_millis(300)), 3);
    }

    #[test]
    fn test_chunk_count_rounds_up() {
        assert_eq!(chunk_count(16000, 1024, Duration::from_millis(100)), 2);
        assert_eq!(chunk_count(16000, 1024, Duration::ZERO), 0);
    }

    #[test]
    fn test_format_helpers() {
        let format = CaptureFormat {
            channels: 7,
            sample_rate: 44100,
            sample_width: 2,
            chunk_size: 1024,
        };
        assert_eq!(format.bits_per_sample(), 16);
        assert_eq!(format.samples_per_chunk(), 7 * 1024);
        assert_eq!(format.max_amplitude(), i16::MAX as i32);
        assert!(format.validate().is_ok());

        let wide = CaptureFormat {
            sample_width: 4,
            ..format
        };
        assert_eq!(wide.max_amplitude(), i32::MAX);
    }

    #[test]
    fn test_format_rejects_bad_width() {
        let format = CaptureFormat {
            channels: 1,
            sample_rate: 16000,
            sample_width: 5,
            chunk_size: 256,
        };
        assert!(matches!(
            format.validate(),
            Err(CaptureError::UnsupportedFormat(_))
        ));
    }
}
