//! cpal-based audio input device
//!
//! Uses the cpal crate for cross-platform audio input.
//! Works with PipeWire, PulseAudio, and ALSA backends.
//!
//! Note: cpal::Stream is not Send, so the stream is built and held by a
//! dedicated thread. Samples cross back over a channel and the thread is
//! told to stop (dropping the stream, which releases the device) when the
//! returned [`InputStream`] is dropped.

use super::{AudioDevice, CaptureFormat, InputStream};
use crate::error::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Messages from the stream callbacks
type StreamMessage = Result<Vec<i32>, String>;

/// An input device looked up by name on every open
pub struct CpalDevice {
    device_name: String,
}

impl CpalDevice {
    pub fn new(device_name: &str) -> Self {
        Self {
            device_name: device_name.to_string(),
        }
    }
}

/// Describe all input devices, marking the default one
pub fn list_input_devices() -> Result<Vec<String>, CaptureError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

    Ok(devices
        .filter_map(|d| d.name().ok())
        .map(|name| {
            if Some(&name) == default_name.as_ref() {
                format!("{} (default)", name)
            } else {
                name
            }
        })
        .collect())
}

/// Find an audio input device by name with flexible matching.
///
/// Matching strategy (in order):
/// 1. Exact match (case-sensitive)
/// 2. Exact match (case-insensitive)
/// 3. Substring match: device name contains the search term (case-insensitive)
fn find_audio_device(host: &cpal::Host, device_name: &str) -> Result<cpal::Device, CaptureError> {
    if device_name == "default" {
        return host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no default input device".to_string()));
    }

    let mut devices: Vec<(String, cpal::Device)> = host
        .input_devices()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?
        .filter_map(|d| d.name().ok().map(|name| (name, d)))
        .collect();

    let search_lower = device_name.to_lowercase();
    let position = devices
        .iter()
        .position(|(name, _)| name == device_name)
        .or_else(|| {
            devices
                .iter()
                .position(|(name, _)| name.to_lowercase() == search_lower)
        })
        .or_else(|| {
            devices
                .iter()
                .position(|(name, _)| name.to_lowercase().contains(&search_lower))
        });

    if let Some(index) = position {
        let (name, device) = devices.swap_remove(index);
        tracing::debug!("Found audio device: {} (searched for: {})", name, device_name);
        return Ok(device);
    }

    // No match found - provide helpful error with available devices
    let available = if devices.is_empty() {
        "No audio input devices found.".to_string()
    } else {
        format!(
            "Available devices:\n{}",
            devices
                .iter()
                .map(|(n, _)| format!("  - {}", n))
                .collect::<Vec<_>>()
                .join("\n")
        )
    };

    Err(CaptureError::DeviceNotFound {
        requested: device_name.to_string(),
        available,
    })
}

/// Pick a sample format the device supports for the requested channels and rate
fn supported_sample_format(
    device: &cpal::Device,
    format: &CaptureFormat,
) -> Result<cpal::SampleFormat, CaptureError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

    let mut matching: Vec<cpal::SampleFormat> = configs
        .filter(|c| {
            c.channels() == format.channels
                && c.min_sample_rate().0 <= format.sample_rate
                && c.max_sample_rate().0 >= format.sample_rate
        })
        .map(|c| c.sample_format())
        .collect();

    // Prefer integer formats that hold the requested width without scaling
    matching.sort_by_key(|f| match f {
        cpal::SampleFormat::I16 if format.sample_width <= 2 => 0,
        cpal::SampleFormat::I32 if format.sample_width > 2 => 0,
        cpal::SampleFormat::F32 => 1,
        _ => 2,
    });

    matching.into_iter().next().ok_or_else(|| {
        CaptureError::UnsupportedFormat(format!(
            "device does not offer {} channel(s) at {} Hz",
            format.channels, format.sample_rate
        ))
    })
}

impl AudioDevice for CpalDevice {
    fn name(&self) -> String {
        self.device_name.clone()
    }

    fn open(
        &self,
        format: &CaptureFormat,
        read_timeout: Duration,
    ) -> Result<Box<dyn InputStream>, CaptureError> {
        format.validate()?;

        let (sample_tx, sample_rx) = mpsc::channel::<StreamMessage>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<String, CaptureError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let device_name = self.device_name.clone();
        let format = *format;

        // Spawn audio capture thread
        let thread_handle = thread::spawn(move || {
            let stream = match build_and_play(&device_name, &format, sample_tx) {
                Ok((stream, name)) => {
                    let _ = ready_tx.send(Ok(name));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            tracing::debug!("Audio capture thread started");

            // Block until the owning InputStream is dropped
            let _ = stop_rx.recv();
            drop(stream);

            tracing::debug!("Audio capture thread stopped");
        });

        match ready_rx.recv() {
            Ok(Ok(name)) => {
                tracing::info!("Using audio device: {}", name);
                Ok(Box::new(CpalStream {
                    samples_per_chunk: format.samples_per_chunk(),
                    read_timeout,
                    pending: Vec::new(),
                    sample_rx,
                    stop_tx: Some(stop_tx),
                    thread_handle: Some(thread_handle),
                }))
            }
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread_handle.join();
                Err(CaptureError::DeviceUnavailable(
                    "audio capture thread exited during setup".to_string(),
                ))
            }
        }
    }
}

fn build_and_play(
    device_name: &str,
    format: &CaptureFormat,
    tx: mpsc::Sender<StreamMessage>,
) -> Result<(cpal::Stream, String), CaptureError> {
    let host = cpal::default_host();
    let device = find_audio_device(&host, device_name)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());
    let sample_format = supported_sample_format(&device, format)?;

    tracing::debug!(
        "Device config: {} Hz, {} channel(s), format: {:?}",
        format.sample_rate,
        format.channels,
        sample_format
    );

    let stream_config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let max = format.max_amplitude();

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, max, tx)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, max, tx)?,
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, max, tx)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, max, tx)?,
        other => {
            return Err(CaptureError::UnsupportedFormat(format!(
                "sample format {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| CaptureError::DeviceUnavailable(format!("Failed to start stream: {}", e)))?;

    Ok((stream, name))
}

/// Build an input stream for a specific sample type
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    max_amplitude: i32,
    tx: mpsc::Sender<StreamMessage>,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let err_tx = tx.clone();
    let scale = max_amplitude as f32;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let converted: Vec<i32> = data
                    .iter()
                    .map(|&s| {
                        let value = <f32 as cpal::FromSample<T>>::from_sample_(s);
                        (value.clamp(-1.0, 1.0) * scale).round() as i32
                    })
                    .collect();
                // Receiver may be gone while the stream shuts down
                let _ = tx.send(Ok(converted));
            },
            move |err| {
                tracing::error!("Audio stream error: {}", err);
                let _ = err_tx.send(Err(err.to_string()));
            },
            None,
        )
        .map_err(|e| CaptureError::UnsupportedFormat(e.to_string()))
}

/// Handle to a running cpal stream; dropping it stops the capture thread
struct CpalStream {
    samples_per_chunk: usize,
    read_timeout: Duration,
    /// Samples received but not yet returned in a chunk
    pending: Vec<i32>,
    sample_rx: mpsc::Receiver<StreamMessage>,
    stop_tx: Option<mpsc::Sender<()>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl InputStream for CpalStream {
    fn read_chunk(&mut self) -> std::io::Result<Vec<i32>> {
        use std::io::{Error, ErrorKind};

        while self.pending.len() < self.samples_per_chunk {
            match self.sample_rx.recv_timeout(self.read_timeout) {
                Ok(Ok(samples)) => self.pending.extend_from_slice(&samples),
                Ok(Err(reason)) => return Err(Error::new(ErrorKind::Other, reason)),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(Error::new(
                        ErrorKind::TimedOut,
                        format!("no samples within {} ms", self.read_timeout.as_millis()),
                    ))
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(Error::new(ErrorKind::BrokenPipe, "audio stream stopped"))
                }
            }
        }

        let rest = self.pending.split_off(self.samples_per_chunk);
        Ok(std::mem::replace(&mut self.pending, rest))
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        // Closing the stop channel wakes the thread, which drops the stream
        self.stop_tx.take();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}
