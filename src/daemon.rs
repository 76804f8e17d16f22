//! Daemon module - main event loop orchestration
//!
//! Accepts the tracker client, feeds its events through the coordinator
//! and into the event log, and reports capture sessions as they finish.

use crate::capture::{self, AudioDevice};
use crate::channel::{self, ChannelItem, Event, EventChannel};
use crate::config::Config;
use crate::coordinator::{Coordinator, SessionOutcome, SessionReport, TriggerOutcome};
use crate::error::{Result, TrackcapError};
use crate::log_writer::{CorrelatedLog, LogRecord};
use crate::state::Phase;
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Events buffered between the reader task and the event loop
const EVENT_BUFFER: usize = 64;

/// Why a connection loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The peer closed the stream
    PeerClosed,
    /// A shutdown signal arrived
    Shutdown,
}

/// Counters gathered until shutdown
#[derive(Debug, Default)]
pub struct PipelineSummary {
    pub events: u64,
    pub rows_committed: u64,
    pub log_failures: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    /// Most recent session report
    pub last_report: Option<SessionReport>,
}

/// Coordinator plus event log, driven one event at a time
pub struct Pipeline {
    coordinator: Coordinator,
    log: CorrelatedLog,
    reports: mpsc::UnboundedReceiver<SessionReport>,
    summary: PipelineSummary,
}

impl Pipeline {
    /// Open the event log and set up the coordinator
    pub fn new(config: &Config, device: Arc<dyn AudioDevice>) -> Result<Self> {
        let log = CorrelatedLog::open(&config.output.log_path)?;
        let (coordinator, reports) = Coordinator::new(config, device);
        Ok(Self {
            coordinator,
            log,
            reports,
            summary: PipelineSummary::default(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.coordinator.phase()
    }

    /// Run the trigger check, then append the event's row
    pub fn handle_event(&mut self, event: &Event) -> TriggerOutcome {
        self.summary.events += 1;
        let outcome = self.coordinator.observe(event);

        if matches!(outcome, TriggerOutcome::NotTrigger) && self.phase().is_busy() {
            tracing::debug!("Event {} during capture: {}", event.sequence, event.payload.render());
        }

        let phase = self.coordinator.phase();
        let (session_id, audio_path) = match self.coordinator.last_session() {
            // A failed session leaves the phase idle and its path unwritten
            Some((id, path)) if phase != Phase::Idle => (Some(id), Some(path.to_path_buf())),
            Some((id, _)) => (Some(id), None),
            None => (None, None),
        };

        let record = LogRecord {
            time: event.received_at,
            sequence: event.sequence,
            phase,
            session_status: phase.session_status(),
            session_id,
            audio_path,
            payload: event.payload.render(),
        };

        if let Err(e) = self.log.append(&record) {
            self.summary.log_failures += 1;
            tracing::warn!(
                "Event {} not yet logged ({} row(s) pending retry): {}",
                event.sequence,
                self.log.pending(),
                e
            );
        }

        outcome
    }

    fn handle_report(&mut self, report: SessionReport) {
        match &report.outcome {
            SessionOutcome::Completed(_) => self.summary.sessions_completed += 1,
            SessionOutcome::Failed(_) => self.summary.sessions_failed += 1,
        }
        match &report.outcome {
            SessionOutcome::Completed(outcome) => tracing::info!(
                "Session {} completed in {:.1}s: {} frame(s) in {:?}",
                report.session_id,
                report.elapsed.as_secs_f32(),
                outcome.frames,
                outcome.path
            ),
            SessionOutcome::Failed(e) => tracing::warn!(
                "Session {} failed after {:.1}s: {}",
                report.session_id,
                report.elapsed.as_secs_f32(),
                e
            ),
        }
        self.summary.last_report = Some(report);
    }

    /// Consume events from one peer until it disconnects or `shutdown` fires
    pub async fn run_connection<F>(
        &mut self,
        events: &mut mpsc::Receiver<ChannelItem>,
        shutdown: &mut F,
    ) -> ConnectionEnd
    where
        F: Future<Output = ()> + Unpin,
    {
        loop {
            tokio::select! {
                biased;

                _ = &mut *shutdown => return ConnectionEnd::Shutdown,

                item = events.recv() => match item {
                    Some(Ok(event)) => {
                        self.handle_event(&event);
                    }
                    Some(Err(e)) => tracing::warn!("Event channel: {}", e),
                    None => {
                        tracing::info!("Peer disconnected");
                        return ConnectionEnd::PeerClosed;
                    }
                },

                Some(report) = self.reports.recv() => self.handle_report(report),
            }
        }
    }

    /// Close the log, then wait for any running session to finish
    ///
    /// With `cancel` set the running session is stopped instead of being
    /// allowed to complete. No rows are appended after the log closes.
    pub async fn shutdown(mut self, cancel: bool) -> PipelineSummary {
        if let Err(e) = self.log.close() {
            tracing::warn!("Event log did not close cleanly: {}", e);
        }

        if cancel {
            self.coordinator.cancel();
        }
        if self.coordinator.phase().is_busy() {
            tracing::info!("Waiting for capture session to finish");
        }
        self.coordinator.wait_idle().await;

        while let Ok(report) = self.reports.try_recv() {
            self.handle_report(report);
        }

        self.summary.rows_committed = self.log.committed();
        self.summary
    }
}

/// Wait for SIGINT, or SIGTERM on unix
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down..."),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to set up SIGTERM handler: {}", e),
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Received SIGINT, shutting down...");
    }
}

/// Main daemon that owns the listener and the pipeline
pub struct Daemon {
    config: Config,
    device: Arc<dyn AudioDevice>,
}

impl Daemon {
    /// Create a daemon using the configured audio device
    pub fn new(config: Config) -> Self {
        let device = capture::create_device(&config.audio);
        Self::with_device(config, device)
    }

    pub fn with_device(config: Config, device: Arc<dyn AudioDevice>) -> Self {
        Self { config, device }
    }

    fn open_channel<R>(&self, reader: R) -> mpsc::Receiver<ChannelItem>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let server = &self.config.server;
        channel::spawn_reader(
            EventChannel::new(reader, server.framing, server.max_frame_bytes),
            EVENT_BUFFER,
        )
    }

    /// Serve a single already connected stream until it closes
    pub async fn serve_stream<R, F>(&self, reader: R, shutdown: F) -> Result<PipelineSummary>
    where
        R: AsyncRead + Unpin + Send + 'static,
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        let mut pipeline = Pipeline::new(&self.config, self.device.clone())?;
        let mut events = self.open_channel(reader);

        tokio::pin!(shutdown);
        let end = pipeline.run_connection(&mut events, &mut shutdown).await;
        Ok(pipeline.shutdown(end == ConnectionEnd::Shutdown).await)
    }

    /// Run the daemon main loop until SIGINT or SIGTERM
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting trackcap daemon");
        self.config.validate()?;

        let listener = TcpListener::bind(&self.config.server.listen_addr)
            .await
            .map_err(|e| {
                TrackcapError::Config(format!(
                    "Failed to listen on {}: {}",
                    self.config.server.listen_addr, e
                ))
            })?;

        let summary = self.serve(listener, shutdown_signal()).await?;
        tracing::info!(
            "Daemon stopped: {} event(s), {} row(s) logged, {} session(s) completed, {} failed",
            summary.events,
            summary.rows_committed,
            summary.sessions_completed,
            summary.sessions_failed
        );
        Ok(())
    }

    /// Accept tracker connections on `listener` until `shutdown` fires
    ///
    /// Without `accept_reconnects` this also returns once the first peer
    /// disconnects. The event log stays open across peers.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<PipelineSummary>
    where
        F: Future<Output = ()>,
    {
        self.config.validate()?;

        let audio = &self.config.audio;
        tracing::info!(
            "Trigger token {:?} records {:.1}s from {} ({} ch, {} Hz, {}-byte samples)",
            self.config.server.trigger_token,
            audio.duration_secs,
            self.device.name(),
            audio.channels,
            audio.sample_rate,
            audio.sample_width
        );

        let mut pipeline = Pipeline::new(&self.config, self.device.clone())?;
        let local_addr = listener.local_addr()?;

        tokio::pin!(shutdown);

        let mut cancel_session = false;
        loop {
            tracing::info!("Waiting for tracker connection on {}", local_addr);

            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(connection) => connection,
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    cancel_session = true;
                    break;
                }
            };

            tracing::info!("Connected by {}", peer);
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Failed to set TCP_NODELAY: {}", e);
            }

            let (reader, _writer) = stream.into_split();
            let mut events = self.open_channel(reader);

            match pipeline.run_connection(&mut events, &mut shutdown).await {
                ConnectionEnd::Shutdown => {
                    cancel_session = true;
                    break;
                }
                ConnectionEnd::PeerClosed if self.config.server.accept_reconnects => continue,
                ConnectionEnd::PeerClosed => break,
            }
        }

        Ok(pipeline.shutdown(cancel_session).await)
    }
}
