//! Session coordinator
//!
//! Watches events for the trigger token and starts at most one capture
//! session at a time. The session runs on a blocking thread; the event loop
//! only ever reads the shared phase, so sampling can never stall it.

use crate::capture::session::session_output_path;
use crate::capture::{AudioDevice, CaptureOutcome, CaptureSession, SessionSpec};
use crate::channel::Event;
use crate::config::{AudioConfig, Config, OutputConfig};
use crate::error::CaptureError;
use crate::state::{Phase, PhaseCell, SessionStatus};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How a finished session ended
#[derive(Debug)]
pub enum SessionOutcome {
    Completed(CaptureOutcome),
    Failed(CaptureError),
}

/// Sent by every session when it reaches a terminal state
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: u64,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub outcome: SessionOutcome,
}

impl SessionReport {
    pub fn status(&self) -> SessionStatus {
        match self.outcome {
            SessionOutcome::Completed(_) => SessionStatus::Completed,
            SessionOutcome::Failed(_) => SessionStatus::Failed,
        }
    }
}

/// What observing an event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Ordinary event data
    NotTrigger,
    /// A new session was started
    Started { session_id: u64, output_path: PathBuf },
    /// Trigger arrived while a session was still running
    Ignored(Phase),
}

struct InFlight {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owns the trigger decision and the single-session invariant
pub struct Coordinator {
    trigger_token: String,
    audio: AudioConfig,
    output: OutputConfig,
    device: Arc<dyn AudioDevice>,
    phase: PhaseCell,
    last_session: Option<(u64, PathBuf)>,
    current: Option<InFlight>,
    report_tx: mpsc::UnboundedSender<SessionReport>,
}

impl Coordinator {
    /// Create a coordinator and the receiver its session reports arrive on
    pub fn new(
        config: &Config,
        device: Arc<dyn AudioDevice>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionReport>) {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            trigger_token: config.server.trigger_token.trim().to_string(),
            audio: config.audio.clone(),
            output: config.output.clone(),
            device,
            phase: PhaseCell::new(),
            last_session: None,
            current: None,
            report_tx,
        };
        (coordinator, report_rx)
    }

    /// Current phase as seen by the event loop
    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// The whole payload, trimmed, equals the trigger token
    pub fn is_trigger(&self, event: &Event) -> bool {
        event
            .payload
            .as_text()
            .is_some_and(|text| text.trim() == self.trigger_token)
    }

    /// Id and container path of the current or most recent session
    pub fn last_session(&self) -> Option<(u64, &Path)> {
        self.last_session
            .as_ref()
            .map(|(id, path)| (*id, path.as_path()))
    }

    /// Decide whether `event` starts a session, and start it if so
    ///
    /// Must be called from within a tokio runtime.
    pub fn observe(&mut self, event: &Event) -> TriggerOutcome {
        if !self.is_trigger(event) {
            return TriggerOutcome::NotTrigger;
        }

        if let Err(phase) = self.phase.try_arm() {
            tracing::info!(
                "Trigger in event {} ignored, session still {}",
                event.sequence,
                phase
            );
            return TriggerOutcome::Ignored(phase);
        }

        let session_id = self.last_session.as_ref().map_or(1, |(id, _)| id + 1);
        let output_path = session_output_path(
            &self.output.audio_path,
            self.output.timestamp_suffix,
            session_id,
            Local::now(),
        );
        tracing::info!(
            "Trigger in event {} starts session {} -> {:?}",
            event.sequence,
            session_id,
            output_path
        );

        let spec = SessionSpec {
            id: session_id,
            format: self.audio.format(),
            duration: self.audio.duration(),
            read_timeout: self.audio.read_timeout(),
            output_path: output_path.clone(),
        };
        let cancel = Arc::new(AtomicBool::new(false));
        let session = CaptureSession::new(spec, self.device.clone(), self.phase.clone(), cancel.clone());
        let report_tx = self.report_tx.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let started_at = Local::now();
            let clock = Instant::now();
            let outcome = match session.run() {
                Ok(outcome) => SessionOutcome::Completed(outcome),
                Err(e) => SessionOutcome::Failed(e),
            };
            // Receiver is gone only during shutdown
            let _ = report_tx.send(SessionReport {
                session_id,
                started_at,
                elapsed: clock.elapsed(),
                outcome,
            });
        });

        self.last_session = Some((session_id, output_path.clone()));
        self.current = Some(InFlight { cancel, handle });

        TriggerOutcome::Started {
            session_id,
            output_path,
        }
    }

    /// Ask the running session to stop; returns false if none is running
    pub fn cancel(&self) -> bool {
        match &self.current {
            Some(in_flight) if self.phase.get().is_busy() => {
                in_flight.cancel.store(true, Ordering::Release);
                tracing::info!("Cancelling capture session");
                true
            }
            _ => false,
        }
    }

    /// Wait until the most recent session has reached a terminal state
    pub async fn wait_idle(&mut self) {
        if let Some(in_flight) = self.current.take() {
            if let Err(e) = in_flight.handle.await {
                tracing::error!("Capture task failed: {}", e);
                let _ = self.phase.fail();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticDevice;
    use crate::channel::Payload;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.audio.channels = 1;
        config.audio.sample_rate = 8000;
        config.audio.chunk_size = 800;
        config.audio.duration_secs = 0.5;
        config.output.audio_path = dir.path().join("take.wav");
        config
    }

    fn text(sequence: u64, body: &str) -> Event {
        Event::new(sequence, Payload::Text(body.to_string()))
    }

    #[tokio::test]
    async fn test_non_trigger_event() {
        let dir = TempDir::new().unwrap();
        let (mut coordinator, _reports) =
            Coordinator::new(&test_config(&dir), Arc::new(SyntheticDevice::new()));

        assert_eq!(coordinator.observe(&text(0, "1.0,2.0,3.0")), TriggerOutcome::NotTrigger);
        assert_eq!(
            coordinator.observe(&Event::new(1, Payload::Binary(b"StartRecording".to_vec()))),
            TriggerOutcome::NotTrigger
        );
        assert_eq!(coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_trigger_matches_trimmed_token_only() {
        let dir = TempDir::new().unwrap();
        let (coordinator, _reports) =
            Coordinator::new(&test_config(&dir), Arc::new(SyntheticDevice::new()));

        assert!(coordinator.is_trigger(&text(0, "StartRecording")));
        assert!(coordinator.is_trigger(&text(0, "  StartRecording\r")));
        assert!(!coordinator.is_trigger(&text(0, "StartRecording now")));
        assert!(!coordinator.is_trigger(&text(0, "startrecording")));
    }

    #[tokio::test]
    async fn test_padded_token_still_matches() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.server.trigger_token = " Go ".to_string();
        let (coordinator, _reports) = Coordinator::new(&config, Arc::new(SyntheticDevice::new()));

        assert!(coordinator.is_trigger(&text(0, "Go")));
        assert!(coordinator.is_trigger(&text(0, " Go \r")));
        assert!(!coordinator.is_trigger(&text(0, "Gone")));
    }

    #[tokio::test]
    async fn test_second_trigger_is_ignored_while_busy() {
        let dir = TempDir::new().unwrap();
        let device = Arc::new(SyntheticDevice::new().chunk_delay(Duration::from_millis(20)));
        let (mut coordinator, mut reports) = Coordinator::new(&test_config(&dir), device.clone());

        let first = coordinator.observe(&text(0, "StartRecording"));
        assert!(matches!(first, TriggerOutcome::Started { session_id: 1, .. }));
        assert!(matches!(
            coordinator.observe(&text(1, "StartRecording")),
            TriggerOutcome::Ignored(_)
        ));

        coordinator.wait_idle().await;
        let report = reports.recv().await.unwrap();
        assert_eq!(report.session_id, 1);
        assert_eq!(report.status(), SessionStatus::Completed);
        assert_eq!(coordinator.phase(), Phase::Done);
        assert_eq!(device.acquisitions(), 1);
        assert!(reports.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sequential_sessions() {
        let dir = TempDir::new().unwrap();
        let device = Arc::new(SyntheticDevice::new());
        let (mut coordinator, mut reports) = Coordinator::new(&test_config(&dir), device.clone());

        for expected_id in 1..=2 {
            match coordinator.observe(&text(0, "StartRecording")) {
                TriggerOutcome::Started { session_id, .. } => assert_eq!(session_id, expected_id),
                other => panic!("unexpected outcome: {:?}", other),
            }
            coordinator.wait_idle().await;
            let report = reports.recv().await.unwrap();
            match report.outcome {
                SessionOutcome::Completed(outcome) => {
                    assert_eq!(outcome.chunks, 5);
                    assert!(outcome.path.exists());
                }
                SessionOutcome::Failed(e) => panic!("session failed: {}", e),
            }
        }

        assert_eq!(device.releases(), 2);
        assert_eq!(coordinator.last_session().map(|(id, _)| id), Some(2));
    }

    #[tokio::test]
    async fn test_failed_session_returns_to_idle() {
        let dir = TempDir::new().unwrap();
        let device = Arc::new(SyntheticDevice::new().unavailable());
        let (mut coordinator, mut reports) = Coordinator::new(&test_config(&dir), device);

        coordinator.observe(&text(0, "StartRecording"));
        coordinator.wait_idle().await;

        let report = reports.recv().await.unwrap();
        assert_eq!(report.status(), SessionStatus::Failed);
        assert!(matches!(
            report.outcome,
            SessionOutcome::Failed(CaptureError::DeviceUnavailable(_))
        ));
        assert_eq!(coordinator.phase(), Phase::Idle);

        // Ready for another trigger
        assert!(matches!(
            coordinator.observe(&text(1, "StartRecording")),
            TriggerOutcome::Started { session_id: 2, .. }
        ));
        coordinator.wait_idle().await;
    }

    #[tokio::test]
    async fn test_cancel_in_flight_session() {
        let dir = TempDir::new().unwrap();
        let device = Arc::new(SyntheticDevice::new().chunk_delay(Duration::from_millis(50)));
        let (mut coordinator, mut reports) = Coordinator::new(&test_config(&dir), device.clone());

        assert!(!coordinator.cancel());
        coordinator.observe(&text(0, "StartRecording"));
        assert!(coordinator.cancel());
        coordinator.wait_idle().await;

        let report = reports.recv().await.unwrap();
        assert!(matches!(
            report.outcome,
            SessionOutcome::Failed(CaptureError::Cancelled { .. })
        ));
        assert!(!device.in_use());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
