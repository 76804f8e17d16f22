//! Configuration loading and types for trackcap
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/trackcap/config.toml)
//! 3. Environment variables (TRACKCAP_*)
//! 4. CLI arguments (highest priority)

use crate::capture::CaptureFormat;
use crate::error::TrackcapError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# Trackcap Configuration
#
# Location: ~/.config/trackcap/config.toml
# All settings can be overridden via CLI flags

[server]
# Address the tracker client connects to
listen_addr = "127.0.0.1:12346"

# Event payload that starts a capture session (whole frame, whitespace trimmed)
trigger_token = "StartRecording"

# How the byte stream is split into events:
# - lines: one event per newline-terminated line (default)
# - length_prefixed: 4-byte big-endian length, then the payload
# - raw: one socket read is one event (legacy clients without framing)
framing = "lines"

# Largest accepted event frame in bytes
max_frame_bytes = 65536

# Keep listening for a new client after the current one disconnects
accept_reconnects = false

[audio]
# Audio input device ("default" uses system default)
device = "default"

# Capture format
channels = 7
sample_rate = 44100
sample_width = 2      # bytes per sample (1-4)
chunk_size = 1024     # frames per read

# Capture length in seconds
duration_secs = 5.0

# Give up on a chunk read after this many milliseconds
read_timeout_ms = 2000

[output]
# Audio container written per completed session
audio_path = "audio_recording.wav"

# Append _YYYYmmdd_HHMMSS_<session> so sessions never overwrite each other
timestamp_suffix = true

# Append-only CSV with one row per received event
log_path = "unity_data.csv"
"#;

/// How the inbound byte stream is split into events
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Newline-delimited frames (default)
    #[default]
    Lines,
    /// 4-byte big-endian length prefix followed by the payload
    LengthPrefixed,
    /// One read call is one event
    Raw,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Event stream listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address to listen on for the tracker client
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Event payload that starts a capture session
    #[serde(default = "default_trigger_token")]
    pub trigger_token: String,

    /// Frame boundary strategy
    #[serde(default)]
    pub framing: Framing,

    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Accept a new client after the current one disconnects
    #[serde(default)]
    pub accept_reconnects: bool,
}

/// Audio capture configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// Input device name, or "default"
    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_channels")]
    pub channels: u16,

    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Bytes per sample
    #[serde(default = "default_sample_width")]
    pub sample_width: u16,

    /// Frames per chunk read
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,

    /// Target capture duration in seconds
    #[serde(default = "default_duration_secs")]
    pub duration_secs: f64,

    /// Per-chunk read timeout in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

/// Output file configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Base path of the audio container
    #[serde(default = "default_audio_path")]
    pub audio_path: PathBuf,

    /// Suffix container names with a timestamp and session id
    #[serde(default = "default_true")]
    pub timestamp_suffix: bool,

    /// Path of the append-only event log
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
}

fn default_listen_addr() -> String {
    "127.0.0.1:12346".to_string()
}

fn default_trigger_token() -> String {
    "StartRecording".to_string()
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

fn default_device() -> String {
    "default".to_string()
}

fn default_channels() -> u16 {
    7
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_sample_width() -> u16 {
    2
}

fn default_chunk_size() -> u32 {
    1024
}

fn default_duration_secs() -> f64 {
    5.0
}

fn default_read_timeout_ms() -> u64 {
    2000
}

fn default_audio_path() -> PathBuf {
    PathBuf::from("audio_recording.wav")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("unity_data.csv")
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trigger_token: default_trigger_token(),
            framing: Framing::default(),
            max_frame_bytes: default_max_frame_bytes(),
            accept_reconnects: false,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            channels: default_channels(),
            sample_rate: default_sample_rate(),
            sample_width: default_sample_width(),
            chunk_size: default_chunk_size(),
            duration_secs: default_duration_secs(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            audio_path: default_audio_path(),
            timestamp_suffix: true,
            log_path: default_log_path(),
        }
    }
}

impl AudioConfig {
    /// The sample format a capture session opens the device with
    pub fn format(&self) -> CaptureFormat {
        CaptureFormat {
            channels: self.channels,
            sample_rate: self.sample_rate,
            sample_width: self.sample_width,
            chunk_size: self.chunk_size,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "trackcap")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject values no capture session or listener could run with
    pub fn validate(&self) -> Result<(), TrackcapError> {
        let audio = &self.audio;
        if audio.channels == 0 {
            return Err(TrackcapError::Config("audio.channels must be at least 1".into()));
        }
        if audio.sample_rate == 0 {
            return Err(TrackcapError::Config("audio.sample_rate must be positive".into()));
        }
        if audio.chunk_size == 0 {
            return Err(TrackcapError::Config("audio.chunk_size must be positive".into()));
        }
        if !(1..=4).contains(&audio.sample_width) {
            return Err(TrackcapError::Config(format!(
                "audio.sample_width must be between 1 and 4 bytes, got {}",
                audio.sample_width
            )));
        }
        if audio.read_timeout_ms == 0 {
            return Err(TrackcapError::Config(
                "audio.read_timeout_ms must be positive".into(),
            ));
        }
        if !audio.duration_secs.is_finite() || audio.duration_secs <= 0.0 {
            return Err(TrackcapError::Config(
                "audio.duration_secs must be a positive number".into(),
            ));
        }
        if self.server.trigger_token.trim().is_empty() {
            return Err(TrackcapError::Config("server.trigger_token must not be empty".into()));
        }
        if self.server.max_frame_bytes == 0 {
            return Err(TrackcapError::Config("server.max_frame_bytes must be positive".into()));
        }
        Ok(())
    }
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(path: Option<&Path>) -> Result<Config, TrackcapError> {
    // Start with defaults
    let mut config = Config::default();

    let config_path = path.map(PathBuf::from).or_else(Config::default_path);

    if let Some(ref path) = config_path {
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .map_err(|e| TrackcapError::Config(format!("Failed to read config: {}", e)))?;

            config = toml::from_str(&contents)
                .map_err(|e| TrackcapError::Config(format!("Invalid config: {}", e)))?;
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Write the commented default config to `path` unless a file is already there
///
/// Returns whether the file was created.
pub fn write_default_config(path: &Path) -> Result<bool, TrackcapError> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG)?;
    Ok(true)
}

/// Override config values from TRACKCAP_* variables
fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(addr) = var("TRACKCAP_LISTEN") {
        config.server.listen_addr = addr;
    }
    if let Some(token) = var("TRACKCAP_TRIGGER") {
        config.server.trigger_token = token;
    }
    if let Some(device) = var("TRACKCAP_DEVICE") {
        config.audio.device = device;
    }
    if let Some(path) = var("TRACKCAP_LOG_PATH") {
        config.output.log_path = PathBuf::from(path);
    }
    if let Some(path) = var("TRACKCAP_AUDIO_PATH") {
        config.output.audio_path = PathBuf::from(path);
    }
}
