//! One bounded-duration capture session
//!
//! Runs on a blocking thread: acquire device → read chunks → release device
//! → write container. The phase cell is advanced at each step so the event
//! loop can see whether a new trigger may start a session.

use super::{chunk_count, AudioDevice, CaptureFormat};
use crate::error::CaptureError;
use crate::state::PhaseCell;
use chrono::{DateTime, Local};
use hound::{WavSpec, WavWriter};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Parameters of a single capture
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub id: u64,
    pub format: CaptureFormat,
    pub duration: Duration,
    pub read_timeout: Duration,
    pub output_path: PathBuf,
}

/// Result of a completed capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub path: PathBuf,
    pub chunks: u64,
    /// Frames per channel written to the container
    pub frames: u64,
}

/// A capture session, consumed by [`CaptureSession::run`]
pub struct CaptureSession {
    spec: SessionSpec,
    device: Arc<dyn AudioDevice>,
    phase: PhaseCell,
    cancel: Arc<AtomicBool>,
}

impl CaptureSession {
    /// Create a session. `phase` must already be armed by the caller.
    pub fn new(
        spec: SessionSpec,
        device: Arc<dyn AudioDevice>,
        phase: PhaseCell,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            spec,
            device,
            phase,
            cancel,
        }
    }

    /// Run to completion, leaving the phase at Done on success or Idle on failure
    pub fn run(self) -> Result<CaptureOutcome, CaptureError> {
        let result = self.capture().and_then(|chunks| self.finalize(chunks));

        match &result {
            Ok(outcome) => {
                if let Err(phase) = self.phase.finish() {
                    tracing::warn!("Session {} finished while phase was {}", self.spec.id, phase);
                }
                tracing::info!(
                    "Session {} saved {} chunk(s) to {:?}",
                    self.spec.id,
                    outcome.chunks,
                    outcome.path
                );
            }
            Err(e) => {
                let _ = self.phase.fail();
                tracing::warn!("Session {} failed: {}", self.spec.id, e);
            }
        }

        result
    }

    /// Sample all chunks. The device is released when this returns.
    fn capture(&self) -> Result<Vec<Vec<i32>>, CaptureError> {
        let format = &self.spec.format;
        format.validate()?;

        let total = chunk_count(format.sample_rate, format.chunk_size, self.spec.duration);
        let expected_len = format.samples_per_chunk();

        let mut stream = self.device.open(format, self.spec.read_timeout)?;
        if let Err(phase) = self.phase.activate() {
            tracing::warn!("Session {} activated while phase was {}", self.spec.id, phase);
        }
        tracing::info!(
            "Session {} recording {} chunk(s) from {} ({} ch, {} Hz, {}-bit)",
            self.spec.id,
            total,
            self.device.name(),
            format.channels,
            format.sample_rate,
            format.bits_per_sample()
        );

        let mut chunks = Vec::with_capacity(total as usize);
        for read in 0..total {
            if self.cancel.load(Ordering::Acquire) {
                return Err(CaptureError::Cancelled { chunks_read: read });
            }

            let chunk = stream.read_chunk().map_err(|e| CaptureError::SampleRead {
                chunks_read: read,
                reason: e.to_string(),
            })?;

            if chunk.len() != expected_len {
                return Err(CaptureError::SampleRead {
                    chunks_read: read,
                    reason: format!(
                        "short chunk: {} samples, expected {}",
                        chunk.len(),
                        expected_len
                    ),
                });
            }
            chunks.push(chunk);
        }

        drop(stream);
        tracing::debug!("Session {} released {}", self.spec.id, self.device.name());
        Ok(chunks)
    }

    fn finalize(&self, chunks: Vec<Vec<i32>>) -> Result<CaptureOutcome, CaptureError> {
        if let Err(phase) = self.phase.drain() {
            tracing::warn!("Session {} drained while phase was {}", self.spec.id, phase);
        }

        let frames = write_container(&self.spec.output_path, &self.spec.format, &chunks)?;
        Ok(CaptureOutcome {
            path: self.spec.output_path.clone(),
            chunks: chunks.len() as u64,
            frames,
        })
    }
}

/// Write chunks to a WAV file at `path`, returning frames per channel
///
/// Samples go to a temporary file in the destination directory that is
/// renamed into place once finalized. On any error the temporary file is
/// removed and nothing appears at `path`.
pub fn write_container(
    path: &Path,
    format: &CaptureFormat,
    chunks: &[Vec<i32>],
) -> Result<u64, CaptureError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| {
        CaptureError::ContainerWrite(format!("Failed to create {:?}: {}", dir, e))
    })?;

    let temp = tempfile::Builder::new()
        .prefix(".trackcap-")
        .suffix(".wav.partial")
        .tempfile_in(dir)
        .map_err(|e| CaptureError::ContainerWrite(format!("Failed to create temp file: {}", e)))?;

    let spec = WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.bits_per_sample(),
        sample_format: hound::SampleFormat::Int,
    };

    let mut samples = 0u64;
    {
        let mut writer = WavWriter::new(BufWriter::new(temp.as_file()), spec)?;
        for chunk in chunks {
            for &sample in chunk {
                writer.write_sample(sample)?;
                samples += 1;
            }
        }
        writer.finalize()?;
    }

    temp.as_file()
        .sync_all()
        .map_err(|e| CaptureError::ContainerWrite(format!("Failed to sync: {}", e)))?;
    temp.persist(path)
        .map_err(|e| CaptureError::ContainerWrite(format!("Failed to persist {:?}: {}", path, e.error)))?;

    Ok(samples / format.channels as u64)
}

/// Output path for a session, optionally suffixed with start time and id
///
/// `recordings/take.wav` becomes `recordings/take_20240102_030405_7.wav`.
pub fn session_output_path(base: &Path, suffix: bool, id: u64, now: DateTime<Local>) -> PathBuf {
    if !suffix {
        return base.to_path_buf();
    }

    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio_recording".to_string());
    let extension = base
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wav".to_string());
    let name = format!("{}_{}_{}.{}", stem, now.format("%Y%m%d_%H%M%S"), id, extension);

    base.with_file_name(name)
}
