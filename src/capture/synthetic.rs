//! Synthetic input device
//!
//! Generates a sine tone instead of reading hardware. Used for dry runs
//! (`device = "synthetic"`) and in tests, where it also counts device
//! acquisitions and can be told to fail.

use super::{AudioDevice, CaptureFormat, InputStream};
use crate::error::CaptureError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Usage {
    in_use: AtomicBool,
    acquisitions: AtomicUsize,
    releases: AtomicUsize,
}

/// Tone generator that behaves like an exclusive-access input device
#[derive(Debug, Clone)]
pub struct SyntheticDevice {
    frequency: f32,
    paced: bool,
    chunk_delay: Duration,
    fail_after: Option<u64>,
    unavailable: bool,
    usage: Arc<Usage>,
}

impl Default for SyntheticDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevice {
    pub fn new() -> Self {
        Self {
            frequency: 440.0,
            paced: false,
            chunk_delay: Duration::ZERO,
            fail_after: None,
            unavailable: false,
            usage: Arc::new(Usage::default()),
        }
    }

    /// Deliver chunks at the real-time rate of the format
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Sleep this long before every chunk
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Fail the read after this many chunks were delivered
    pub fn fail_after(mut self, chunks: u64) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    /// Refuse to open, as if the device were missing or held elsewhere
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn in_use(&self) -> bool {
        self.usage.in_use.load(Ordering::Acquire)
    }

    pub fn acquisitions(&self) -> usize {
        self.usage.acquisitions.load(Ordering::Acquire)
    }

    pub fn releases(&self) -> usize {
        self.usage.releases.load(Ordering::Acquire)
    }
}

impl AudioDevice for SyntheticDevice {
    fn name(&self) -> String {
        format!("synthetic {:.0} Hz tone", self.frequency)
    }

    fn open(
        &self,
        format: &CaptureFormat,
        _read_timeout: Duration,
    ) -> Result<Box<dyn InputStream>, CaptureError> {
        if self.unavailable {
            return Err(CaptureError::DeviceUnavailable(self.name()));
        }
        format.validate()?;
        if self.usage.in_use.swap(true, Ordering::AcqRel) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} is already in use",
                self.name()
            )));
        }
        self.usage.acquisitions.fetch_add(1, Ordering::AcqRel);

        let delay = if self.paced {
            format.chunk_duration()
        } else {
            self.chunk_delay
        };

        Ok(Box::new(SyntheticStream {
            format: *format,
            frequency: self.frequency,
            delay,
            fail_after: self.fail_after,
            delivered: 0,
            position: 0,
            usage: self.usage.clone(),
        }))
    }
}

struct SyntheticStream {
    format: CaptureFormat,
    frequency: f32,
    delay: Duration,
    fail_after: Option<u64>,
    delivered: u64,
    /// Frames generated so far, keeps the tone continuous across chunks
    position: u64,
    usage: Arc<Usage>,
}

impl InputStream for SyntheticStream {
    fn read_chunk(&mut self) -> std::io::Result<Vec<i32>> {
        if self.fail_after.is_some_and(|limit| self.delivered >= limit) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "synthetic device stopped delivering samples",
            ));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let channels = self.format.channels as usize;
        let amplitude = self.format.max_amplitude() as f32 * 0.5;
        let rate = self.format.sample_rate as f32;
        let mut chunk = Vec::with_capacity(self.format.samples_per_chunk());

        for frame in 0..self.format.chunk_size as u64 {
            let t = (self.position + frame) as f32 / rate;
            let value = (2.0 * std::f32::consts::PI * self.frequency * t).sin();
            let sample = (value * amplitude) as i32;
            chunk.extend(std::iter::repeat(sample).take(channels));
        }

        self.position += self.format.chunk_size as u64;
        self.delivered += 1;
        Ok(chunk)
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.usage.in_use.store(false, Ordering::Release);
        self.usage.releases.fetch_add(1, Ordering::AcqRel);
    }
}
