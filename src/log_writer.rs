//! Correlated event log
//!
//! Appends one CSV row per received event, stamped with wall-clock time and
//! the capture phase at the moment of writing. Every append is flushed and
//! synced before it returns. Failed rows stay queued and are written, in
//! order, ahead of the next record.

use crate::error::LogError;
use crate::state::{Phase, SessionStatus};
use chrono::{DateTime, Local};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Column header written once when the file is created
pub const HEADER: [&str; 7] = [
    "time",
    "sequence",
    "phase",
    "session_status",
    "session_id",
    "audio_path",
    "payload",
];

/// Rows kept for retry before the oldest is dropped
pub const MAX_PENDING: usize = 1024;

/// A byte sink that can be made durable
pub trait LogSink: Write {
    /// Persist everything written so far
    fn sync(&mut self) -> std::io::Result<()>;
}

impl LogSink for File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }
}

/// One row of the event log
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub time: DateTime<Local>,
    pub sequence: u64,
    pub phase: Phase,
    pub session_status: SessionStatus,
    /// Current or most recent capture session
    pub session_id: Option<u64>,
    /// Container of that session while it is in flight or completed
    pub audio_path: Option<PathBuf>,
    /// Event payload, or a placeholder when it could not be rendered
    pub payload: String,
}

impl LogRecord {
    /// Render as a CSV line including the trailing newline
    pub fn to_row(&self) -> String {
        let time = self.time.format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        let sequence = self.sequence.to_string();
        let session_id = self.session_id.map(|id| id.to_string()).unwrap_or_default();
        let audio_path = self
            .audio_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let fields = [
            time.as_str(),
            sequence.as_str(),
            self.phase.as_str(),
            self.session_status.as_str(),
            session_id.as_str(),
            audio_path.as_str(),
            self.payload.as_str(),
        ];
        csv_line(&fields)
    }
}

/// Quote a field when it contains a delimiter, quote or line break
fn csv_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\r', '\n']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn csv_line(fields: &[&str]) -> String {
    let mut line = fields
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

/// Append-only CSV writer
pub struct CorrelatedLog<S: LogSink = File> {
    sink: Option<S>,
    pending: VecDeque<String>,
    /// Bytes of the front pending row already accepted by the sink
    front_written: usize,
    committed: u64,
    dropped: u64,
}

impl CorrelatedLog<File> {
    /// Open `path` for appending, writing the header if the file is new or empty
    pub fn open(path: &Path) -> Result<Self, LogError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let needs_header = file.metadata()?.len() == 0;
        tracing::info!("Event log: {:?}", path);

        Self::with_sink(file, needs_header)
    }
}

impl<S: LogSink> CorrelatedLog<S> {
    /// Wrap an already opened sink
    pub fn with_sink(mut sink: S, write_header: bool) -> Result<Self, LogError> {
        if write_header {
            sink.write_all(csv_line(&HEADER).as_bytes())?;
            sink.flush()?;
            sink.sync()?;
        }

        Ok(Self {
            sink: Some(sink),
            pending: VecDeque::new(),
            front_written: 0,
            committed: 0,
            dropped: 0,
        })
    }

    /// Append a record and make it durable
    ///
    /// On failure the row is kept and retried before the next record.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), LogError> {
        if self.sink.is_none() {
            return Err(LogError::Closed);
        }

        if self.pending.len() >= MAX_PENDING {
            // A partly written front row has to be completed, drop the next one
            let victim = if self.front_written > 0 { 1 } else { 0 };
            self.pending.remove(victim);
            self.dropped += 1;
            tracing::warn!(
                "Event log retry queue full, dropped oldest row ({} dropped so far)",
                self.dropped
            );
        }
        self.pending.push_back(record.to_row());

        self.write_pending()
    }

    fn write_pending(&mut self) -> Result<(), LogError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(LogError::Closed);
        };

        while let Some(row) = self.pending.front() {
            // Resume after the bytes a failed attempt already wrote, so a row
            // is never duplicated or split around a retry
            let bytes = row.as_bytes();
            while self.front_written < bytes.len() {
                match sink.write(&bytes[self.front_written..]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "event log accepted no bytes",
                        )
                        .into())
                    }
                    Ok(n) => self.front_written += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            }

            // Fully written; a failure here retries only flush and sync
            sink.flush()?;
            sink.sync()?;
            self.pending.pop_front();
            self.front_written = 0;
            self.committed += 1;
        }
        Ok(())
    }

    /// Rows durably written
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Rows still waiting for a successful write
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_none()
    }

    /// Write any queued rows and close. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), LogError> {
        if self.sink.is_none() {
            return Ok(());
        }

        let result = self.write_pending();
        if let Err(ref e) = result {
            tracing::warn!(
                "Closing event log with {} unwritten row(s): {}",
                self.pending.len(),
                e
            );
        }
        self.sink = None;
        tracing::debug!("Event log closed after {} row(s)", self.committed);
        result
    }
}

impl<S: LogSink> Drop for CorrelatedLog<S> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn record(sequence: u64, payload: &str) -> LogRecord {
        LogRecord {
            time: Local::now(),
            sequence,
            phase: Phase::Idle,
            session_status: SessionStatus::Idle,
            session_id: None,
            audio_path: None,
            payload: payload.to_string(),
        }
    }

    /// Sink that fails while `failing` is set, after `byte_budget` bytes,
    /// or on the next `sync_failures` syncs
    #[derive(Clone, Default)]
    struct FlakySink {
        data: Arc<Mutex<Vec<u8>>>,
        failing: Arc<Mutex<bool>>,
        byte_budget: Arc<Mutex<Option<usize>>>,
        sync_failures: Arc<Mutex<u32>>,
    }

    impl FlakySink {
        fn contents(&self) -> String {
            String::from_utf8(self.data.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if *self.failing.lock().unwrap() {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            let mut budget = self.byte_budget.lock().unwrap();
            let n = match *budget {
                Some(0) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
                }
                Some(left) => {
                    let n = left.min(buf.len());
                    *budget = Some(left - n);
                    n
                }
                None => buf.len(),
            };
            self.data.lock().unwrap().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogSink for FlakySink {
        fn sync(&mut self) -> std::io::Result<()> {
            let mut failures = self.sync_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "fsync failed"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("1.0,2.0"), "\"1.0,2.0\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("a\nb"), "\"a\nb\"");
    }

    #[test]
    fn test_record_row() {
        let mut rec = record(3, "(0.1, 0.2, 0.3)");
        rec.phase = Phase::Active;
        rec.session_status = SessionStatus::Recording;
        rec.session_id = Some(2);
        rec.audio_path = Some(PathBuf::from("take_2.wav"));

        let row = rec.to_row();
        assert!(row.ends_with(",3,active,recording,2,take_2.wav,\"(0.1, 0.2, 0.3)\"\n"));
    }

    #[test]
    fn test_open_writes_header_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("events.csv");

        {
            let mut log = CorrelatedLog::open(&path).unwrap();
            log.append(&record(0, "first")).unwrap();
            log.close().unwrap();
        }
        {
            let mut log = CorrelatedLog::open(&path).unwrap();
            log.append(&record(0, "second")).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER.join(","));
        assert!(lines[1].ends_with(",first"));
        assert!(lines[2].ends_with(",second"));
    }

    #[test]
    fn test_append_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let mut log = CorrelatedLog::open(&dir.path().join("events.csv")).unwrap();
        log.close().unwrap();
        log.close().unwrap();
        assert!(log.is_closed());
        assert!(matches!(log.append(&record(0, "late")), Err(LogError::Closed)));
    }

    #[test]
    fn test_failed_rows_are_retried_in_order() {
        let sink = FlakySink::default();
        let mut log = CorrelatedLog::with_sink(sink.clone(), false).unwrap();

        log.append(&record(0, "a")).unwrap();

        *sink.failing.lock().unwrap() = true;
        assert!(log.append(&record(1, "b")).is_err());
        assert!(log.append(&record(2, "c")).is_err());
        assert_eq!(log.pending(), 2);

        *sink.failing.lock().unwrap() = false;
        log.append(&record(3, "d")).unwrap();
        assert_eq!(log.pending(), 0);
        assert_eq!(log.committed(), 4);

        let data = String::from_utf8(sink.data.lock().unwrap().clone()).unwrap();
        let payloads: Vec<&str> = data
            .lines()
            .map(|l| l.rsplit(',').next().unwrap())
            .collect();
        assert_eq!(payloads, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_sync_failure_does_not_duplicate_row() {
        let sink = FlakySink::default();
        let mut log = CorrelatedLog::with_sink(sink.clone(), false).unwrap();

        *sink.sync_failures.lock().unwrap() = 1;
        assert!(log.append(&record(0, "a")).is_err());
        assert_eq!(log.pending(), 1);

        log.append(&record(1, "b")).unwrap();
        assert_eq!(log.pending(), 0);
        assert_eq!(log.committed(), 2);

        let data = sink.contents();
        let rows: Vec<&str> = data.lines().collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].ends_with(",0,idle,idle,,,a"));
        assert!(rows[1].ends_with(",1,idle,idle,,,b"));
    }

    #[test]
    fn test_partial_write_resumes_where_it_stopped() {
        let sink = FlakySink::default();
        let mut log = CorrelatedLog::with_sink(sink.clone(), false).unwrap();

        *sink.byte_budget.lock().unwrap() = Some(10);
        assert!(log.append(&record(0, "a")).is_err());
        assert_eq!(sink.contents().len(), 10);

        *sink.byte_budget.lock().unwrap() = None;
        log.append(&record(1, "b")).unwrap();
        assert_eq!(log.committed(), 2);

        let data = sink.contents();
        let rows: Vec<&str> = data.lines().collect();
        assert_eq!(rows.len(), 2);
        for (row, expected) in rows.iter().zip([",0,idle,idle,,,a", ",1,idle,idle,,,b"]) {
            assert!(row.ends_with(expected), "corrupt row: {}", row);
            // time column is "%Y-%m-%d %H:%M:%S%.3f"
            assert_eq!(row.split(',').next().unwrap().len(), 23);
        }
    }

    #[test]
    fn test_full_queue_keeps_partly_written_front_row() {
        let sink = FlakySink::default();
        let mut log = CorrelatedLog::with_sink(sink.clone(), false).unwrap();

        *sink.byte_budget.lock().unwrap() = Some(5);
        for seq in 0..(MAX_PENDING as u64 + 1) {
            assert!(log.append(&record(seq, "x")).is_err());
        }
        assert_eq!(log.pending(), MAX_PENDING);

        *sink.byte_budget.lock().unwrap() = None;
        log.close().unwrap();

        let data = sink.contents();
        let sequences: Vec<&str> = data
            .lines()
            .map(|l| l.split(',').nth(1).unwrap())
            .collect();
        assert_eq!(sequences.len(), MAX_PENDING);
        // Row 0 was already partly on disk, so row 1 is the one dropped
        assert_eq!(sequences[0], "0");
        assert_eq!(sequences[1], "2");
    }
}
