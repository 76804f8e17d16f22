//! Trackcap: triggered audio capture for tracker event streams
//!
//! This library provides the core functionality for:
//! - Reading framed events from a connected tracker client
//! - Starting exactly one bounded audio capture when the trigger token arrives
//! - Capturing multichannel audio via cpal and persisting it as WAV (hound)
//! - Logging every event with a timestamp and capture phase to an append-only CSV
//!
//! # Architecture
//!
//! ```text
//!          ┌──────────────┐
//!          │ Tracker peer │  TCP, framed events
//!          └──────────────┘
//!                 │
//!                 ▼
//!          ┌──────────────┐      trigger       ┌──────────────────┐
//!          │ Event reader │ ─────────────────▶ │   Coordinator    │
//!          │    (task)    │                    │  (phase cell)    │
//!          └──────────────┘                    └──────────────────┘
//!                 │ every event                   │ spawn_blocking
//!                 ▼                               ▼
//!          ┌──────────────┐                ┌──────────────────┐
//!          │  Event log   │ ◀── phase ──── │ Capture session  │
//!          │    (CSV)     │                │ device → WAV     │
//!          └──────────────┘                └──────────────────┘
//! ```

pub mod capture;
pub mod channel;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod log_writer;
pub mod state;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use coordinator::{Coordinator, SessionOutcome, SessionReport, TriggerOutcome};
pub use daemon::{Daemon, Pipeline};
pub use error::{Result, TrackcapError};
