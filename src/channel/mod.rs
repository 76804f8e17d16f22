//! Event channel module
//!
//! Reads discrete event frames from the connected tracker client and hands
//! them to the coordinator in arrival order. The read loop runs in its own
//! task and feeds a bounded mpsc channel, so the consumer can select over
//! events, session reports and shutdown without losing partial frames.

pub mod framing;

pub use framing::FrameReader;

use crate::config::Framing;
use crate::error::ChannelError;
use chrono::{DateTime, Local};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// Payload of one inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    /// Bytes that did not decode as UTF-8
    Binary(Vec<u8>),
}

impl Payload {
    /// Decode a frame, keeping the raw bytes when it is not valid UTF-8
    pub fn decode(bytes: Vec<u8>) -> Result<Self, (Self, std::str::Utf8Error)> {
        match String::from_utf8(bytes) {
            Ok(text) => Ok(Payload::Text(text)),
            Err(e) => {
                let utf8_error = e.utf8_error();
                Err((Payload::Binary(e.into_bytes()), utf8_error))
            }
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    /// Text as-is, binary as lowercase hex
    pub fn render(&self) -> String {
        match self {
            Payload::Text(text) => text.clone(),
            Payload::Binary(bytes) => bytes.iter().map(|b| format!("{:02x}", b)).collect(),
        }
    }
}

/// One inbound message from the peer
#[derive(Debug, Clone)]
pub struct Event {
    /// Arrival order on this channel, starting at 0
    pub sequence: u64,
    pub received_at: DateTime<Local>,
    pub payload: Payload,
}

impl Event {
    pub fn new(sequence: u64, payload: Payload) -> Self {
        Self {
            sequence,
            received_at: Local::now(),
            payload,
        }
    }
}

/// Source of events, ending with a single end-of-stream
#[async_trait::async_trait]
pub trait EventSource: Send {
    /// Next event, or `Ok(None)` once the peer has closed
    ///
    /// End of stream is returned exactly once; later calls fail with
    /// [`ChannelError::Terminated`].
    async fn next_event(&mut self) -> Result<Option<Event>, ChannelError>;
}

/// Event source over a framed byte stream
pub struct EventChannel<R> {
    frames: FrameReader<R>,
    next_sequence: u64,
    finished: bool,
}

impl<R: AsyncRead + Unpin + Send> EventChannel<R> {
    pub fn new(reader: R, framing: Framing, max_frame_bytes: usize) -> Self {
        Self {
            frames: FrameReader::new(reader, framing, max_frame_bytes),
            next_sequence: 0,
            finished: false,
        }
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> EventSource for EventChannel<R> {
    async fn next_event(&mut self) -> Result<Option<Event>, ChannelError> {
        if self.finished {
            return Err(ChannelError::Terminated);
        }

        let Some(frame) = self.frames.next_frame().await? else {
            self.finished = true;
            return Ok(None);
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let payload = match Payload::decode(frame) {
            Ok(payload) => payload,
            Err((payload, e)) => {
                tracing::warn!(
                    "Event {} is not valid UTF-8 ({}), keeping {} raw bytes",
                    sequence,
                    e,
                    payload.len()
                );
                payload
            }
        };

        Ok(Some(Event::new(sequence, payload)))
    }
}

/// Items delivered by [`spawn_reader`]; the channel closes at end of stream
pub type ChannelItem = Result<Event, ChannelError>;

/// Drive `source` on its own task, forwarding events in arrival order
///
/// Recoverable errors are forwarded and reading continues. The receiver
/// yields `None` after the peer closes.
pub fn spawn_reader<S>(mut source: S, capacity: usize) -> mpsc::Receiver<ChannelItem>
where
    S: EventSource + 'static,
{
    let (tx, rx) = mpsc::channel(capacity);

    tokio::spawn(async move {
        loop {
            let item = match source.next_event().await {
                Ok(Some(event)) => Ok(event),
                Ok(None) | Err(ChannelError::Terminated) => break,
                Err(e) => Err(e),
            };
            if tx.send(item).await.is_err() {
                // Consumer is gone
                break;
            }
        }
        tracing::debug!("Event reader finished");
    });

    rx
}
