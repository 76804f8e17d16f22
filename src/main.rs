//! Trackcap - triggered audio capture for tracker event streams
//!
//! Run with `trackcap` or `trackcap serve` to start listening.
//! Use `trackcap record` to capture once without a client.
//! Use `trackcap devices` to list audio inputs.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use trackcap::capture::session::session_output_path;
use trackcap::capture::{self, CaptureSession, SessionSpec};
use trackcap::cli::{Cli, Commands};
use trackcap::config::{self, Config};
use trackcap::state::PhaseCell;
use trackcap::Daemon;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("trackcap={},warn", log_level))),
        )
        .with_target(false)
        .init();

    // Load configuration
    let mut config = config::load_config(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(trigger) = cli.trigger {
        config.server.trigger_token = trigger;
    }
    if let Some(device) = cli.device {
        config.audio.device = device;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let daemon = Daemon::new(config);
            daemon.run().await?;
        }

        Commands::Record { duration, output } => {
            if let Some(secs) = duration {
                config.audio.duration_secs = secs;
            }
            record_once(&config, output).await?;
        }

        Commands::Devices => {
            list_devices()?;
        }

        Commands::Config { init } => {
            if init {
                init_config(cli.config.as_deref())?;
            } else {
                show_config(&config)?;
            }
        }
    }

    Ok(())
}

/// Run one capture session in the foreground
async fn record_once(config: &Config, output: Option<PathBuf>) -> anyhow::Result<()> {
    config.validate()?;

    let device = capture::create_device(&config.audio);
    let output_path = output.unwrap_or_else(|| {
        session_output_path(
            &config.output.audio_path,
            config.output.timestamp_suffix,
            1,
            chrono::Local::now(),
        )
    });

    let phase = PhaseCell::new();
    if let Err(current) = phase.try_arm() {
        anyhow::bail!("capture could not be armed (phase {})", current);
    }

    let spec = SessionSpec {
        id: 1,
        format: config.audio.format(),
        duration: config.audio.duration(),
        read_timeout: config.audio.read_timeout(),
        output_path,
    };

    println!(
        "Recording {:.1}s from {} ({} ch, {} Hz)...",
        config.audio.duration_secs,
        device.name(),
        config.audio.channels,
        config.audio.sample_rate
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let session = CaptureSession::new(spec, device, phase, cancel.clone());
    let task = tokio::task::spawn_blocking(move || session.run());
    tokio::pin!(task);

    let outcome = tokio::select! {
        result = &mut task => result?,
        _ = tokio::signal::ctrl_c() => {
            cancel.store(true, std::sync::atomic::Ordering::Release);
            // Give the session a moment to release the device
            match tokio::time::timeout(Duration::from_secs(5), &mut task).await {
                Ok(result) => result?,
                Err(_) => anyhow::bail!("capture did not stop within 5s"),
            }
        }
    }?;

    println!(
        "Saved {} frame(s) in {} chunk(s) to {:?}",
        outcome.frames, outcome.chunks, outcome.path
    );
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    let devices = capture::cpal_device::list_input_devices()?;
    if devices.is_empty() {
        println!("No audio input devices found.");
    } else {
        println!("Audio input devices:");
        for name in devices {
            println!("  - {}", name);
        }
    }
    println!("  - {} (built-in tone generator)", capture::SYNTHETIC_DEVICE);
    Ok(())
}

fn init_config(path: Option<&Path>) -> anyhow::Result<()> {
    let Some(path) = path.map(Path::to_path_buf).or_else(Config::default_path) else {
        anyhow::bail!("no config directory available, pass --config");
    };
    if config::write_default_config(&path)? {
        println!("Created: {:?}", path);
    } else {
        println!("Config file exists: {:?}", path);
    }
    Ok(())
}

fn show_config(config: &Config) -> anyhow::Result<()> {
    println!("# Current trackcap configuration");
    if let Some(path) = Config::default_path() {
        println!("# Default config file: {:?}", path);
    }
    println!();
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
