// Command-line interface definitions for trackcap
//
// This module is separate so it can be used by both the binary (main.rs)
// and build.rs for generating man pages.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "trackcap")]
#[command(author, version, about = "Triggered audio capture correlated with a tracker event stream")]
#[command(long_about = "
Trackcap listens for a tracker client (for example a Unity scene streaming
positions), logs every event it sends to an append-only CSV file, and records
a fixed-length multichannel WAV file whenever the client sends the trigger
token.

USAGE:
  1. Run: trackcap (to start listening on 127.0.0.1:12346)
  2. Connect the client and stream newline-terminated events
  3. Send StartRecording (default token) to capture one session

Only one capture runs at a time; triggers during a capture are logged and
ignored.
")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Override listen address (e.g., 0.0.0.0:12346)
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Override the trigger token
    #[arg(long, value_name = "TOKEN")]
    pub trigger: Option<String>,

    /// Override audio input device ("default", "synthetic", or a device name)
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Listen for the tracker client (default if no command specified)
    Serve,

    /// Record a single capture session without waiting for a trigger
    Record {
        /// Capture length in seconds (defaults to audio.duration_secs)
        #[arg(long, value_name = "SECONDS")]
        duration: Option<f64>,

        /// Output WAV path (defaults to output.audio_path)
        #[arg(short, long, value_name = "FILE")]
        output: Option<std::path::PathBuf>,
    },

    /// List audio input devices
    Devices,

    /// Show current configuration
    Config {
        /// Write the default config file (to --config or the default path) if missing
        #[arg(long)]
        init: bool,
    },
}
