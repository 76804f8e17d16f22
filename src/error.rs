//! Error types for trackcap
//!
//! Uses thiserror for ergonomic error definitions. Each subsystem has its
//! own family so failures can be recovered where they happen: only a closed
//! event channel ends the process, everything else returns to idle.

use thiserror::Error;

/// Top-level error type for the trackcap application
#[derive(Error, Debug)]
pub enum TrackcapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Audio capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Log writer error: {0}")]
    Log(#[from] LogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while reading events from the connected peer
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Read from peer failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Peer closed the connection in the middle of a frame ({received} of {expected} bytes)")]
    Truncated { received: usize, expected: usize },

    #[error("Event channel already reached end of stream")]
    Terminated,
}

/// Errors raised by a capture session
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio device not found: '{requested}'. {available}")]
    DeviceNotFound { requested: String, available: String },

    #[error("Unsupported capture format: {0}")]
    UnsupportedFormat(String),

    #[error("Sample read failed after {chunks_read} chunk(s): {reason}")]
    SampleRead { chunks_read: u64, reason: String },

    #[error("Failed to write audio container: {0}")]
    ContainerWrite(String),

    #[error("Capture cancelled after {chunks_read} chunk(s)")]
    Cancelled { chunks_read: u64 },
}

/// Errors raised by the correlated log writer
#[derive(Error, Debug)]
pub enum LogError {
    #[error("Log write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log writer is closed")]
    Closed,
}

/// Result type alias using TrackcapError
pub type Result<T> = std::result::Result<T, TrackcapError>;

impl From<hound::Error> for CaptureError {
    fn from(e: hound::Error) -> Self {
        CaptureError::ContainerWrite(e.to_string())
    }
}
