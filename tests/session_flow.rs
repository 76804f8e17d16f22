//! End-to-end session tests over an in-memory connection
//!
//! A synthetic input device stands in for hardware, so these run in CI
//! without audio devices or a listening socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use trackcap::capture::{chunk_count, SyntheticDevice};
use trackcap::config::Config;
use trackcap::daemon::PipelineSummary;
use trackcap::error::CaptureError;
use trackcap::state::SessionStatus;
use trackcap::{Daemon, SessionOutcome};

/// Small format so a whole session takes well under a second
fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.audio.channels = 2;
    config.audio.sample_rate = 8000;
    config.audio.chunk_size = 400;
    config.audio.duration_secs = 0.25;
    config.output.audio_path = dir.path().join("take.wav");
    config.output.log_path = dir.path().join("events.csv");
    config
}

/// Send `input` as one peer connection, close it, and serve it to the end
async fn serve(config: Config, device: SyntheticDevice, input: &[u8]) -> PipelineSummary {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    client.write_all(input).await.unwrap();
    drop(client);

    let daemon = Daemon::with_device(config, Arc::new(device));
    daemon
        .serve_stream(server, std::future::pending())
        .await
        .unwrap()
}

/// Data rows of the event log, header excluded
fn log_rows(path: &Path) -> Vec<String> {
    let contents = std::fs::read_to_string(path).unwrap();
    let mut lines = contents.lines();
    assert_eq!(
        lines.next(),
        Some("time,sequence,phase,session_status,session_id,audio_path,payload")
    );
    lines.map(str::to_string).collect()
}

fn wav_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "wav"))
        .collect()
}

#[test]
fn default_session_reads_216_chunks() {
    let config = Config::default();
    assert_eq!(
        chunk_count(
            config.audio.sample_rate,
            config.audio.chunk_size,
            config.audio.duration()
        ),
        216
    );
}

#[tokio::test]
async fn trigger_produces_wav_matching_format() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let summary = serve(config.clone(), SyntheticDevice::new(), b"StartRecording\n").await;

    assert_eq!(summary.sessions_completed, 1);
    let report = summary.last_report.as_ref().unwrap();
    assert_eq!(report.status(), SessionStatus::Completed);
    let outcome = match &report.outcome {
        SessionOutcome::Completed(outcome) => outcome,
        SessionOutcome::Failed(e) => panic!("session failed: {}", e),
    };

    // ceil(8000 * 0.25 / 400)
    assert_eq!(outcome.chunks, 5);
    assert_eq!(outcome.frames, 5 * 400);

    let reader = hound::WavReader::open(&outcome.path).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.sample_rate, 8000);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.duration() as u64, outcome.frames);
}

#[tokio::test]
async fn back_to_back_triggers_record_once() {
    let dir = TempDir::new().unwrap();
    let device = SyntheticDevice::new().chunk_delay(Duration::from_millis(20));

    let summary = serve(
        test_config(&dir),
        device.clone(),
        b"StartRecording\nStartRecording\nStartRecording\n",
    )
    .await;

    assert_eq!(summary.sessions_completed, 1);
    assert_eq!(device.acquisitions(), 1);
    assert_eq!(wav_files(dir.path()).len(), 1);

    // Ignored triggers are still logged
    let rows = log_rows(&dir.path().join("events.csv"));
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| row.ends_with(",StartRecording")));
}

#[tokio::test]
async fn disconnect_mid_capture_lets_session_finish() {
    let dir = TempDir::new().unwrap();
    let device = SyntheticDevice::new().chunk_delay(Duration::from_millis(30));

    let summary = serve(test_config(&dir), device.clone(), b"StartRecording\n").await;

    assert_eq!(summary.events, 1);
    assert_eq!(summary.rows_committed, 1);
    assert_eq!(summary.sessions_completed, 1);
    assert_eq!(
        summary.last_report.as_ref().map(|r| r.status()),
        Some(SessionStatus::Completed)
    );
    assert!(!device.in_use());
    assert_eq!(wav_files(dir.path()).len(), 1);

    // Nothing is written once the log has been closed
    assert_eq!(log_rows(&dir.path().join("events.csv")).len(), 1);
}

#[tokio::test]
async fn read_failure_leaves_no_container() {
    let dir = TempDir::new().unwrap();
    let device = SyntheticDevice::new().fail_after(2);

    let summary = serve(test_config(&dir), device.clone(), b"StartRecording\n").await;

    assert_eq!(summary.sessions_failed, 1);
    let report = summary.last_report.as_ref().unwrap();
    assert_eq!(report.status(), SessionStatus::Failed);
    assert!(matches!(
        report.outcome,
        SessionOutcome::Failed(CaptureError::SampleRead { chunks_read: 2, .. })
    ));

    assert!(wav_files(dir.path()).is_empty());
    assert!(!device.in_use());
    assert_eq!(device.releases(), 1);
}

#[tokio::test]
async fn every_event_logged_in_arrival_order() {
    let dir = TempDir::new().unwrap();

    let summary = serve(
        test_config(&dir),
        SyntheticDevice::new(),
        b"0.1,0.2,0.3\r\nhello \"world\"\n\xff\xfe\nlast",
    )
    .await;

    assert_eq!(summary.events, 4);
    assert_eq!(summary.sessions_completed + summary.sessions_failed, 0);
    assert!(summary.last_report.is_none());

    let rows = log_rows(&dir.path().join("events.csv"));
    assert_eq!(rows.len(), 4);

    let sequences: Vec<&str> = rows
        .iter()
        .map(|row| row.split(',').nth(1).unwrap())
        .collect();
    assert_eq!(sequences, ["0", "1", "2", "3"]);

    assert!(rows[0].ends_with(",idle,idle,,,\"0.1,0.2,0.3\""));
    assert!(rows[1].ends_with(",\"hello \"\"world\"\"\""));
    // Invalid UTF-8 is logged as hex
    assert!(rows[2].ends_with(",fffe"));
    assert!(rows[3].ends_with(",last"));
}
