//! Frame boundaries on the inbound byte stream

use crate::config::Framing;
use crate::error::ChannelError;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Splits a byte stream into frames according to a [`Framing`] strategy
pub struct FrameReader<R> {
    inner: BufReader<R>,
    framing: Framing,
    max_frame_bytes: usize,
    /// Set after EOF or an error the stream cannot recover from
    done: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, framing: Framing, max_frame_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            framing,
            max_frame_bytes,
            done: false,
        }
    }

    /// Read the next frame. `Ok(None)` means the peer closed the stream.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        if self.done {
            return Ok(None);
        }

        let result = match self.framing {
            Framing::Lines => self.next_line().await,
            Framing::LengthPrefixed => self.next_length_prefixed().await,
            Framing::Raw => self.next_raw().await,
        };

        match &result {
            Ok(None) => self.done = true,
            Err(ChannelError::Io(_))
            | Err(ChannelError::Truncated { .. })
            | Err(ChannelError::Terminated) => self.done = true,
            Err(ChannelError::FrameTooLarge { .. }) if self.framing != Framing::Lines => {
                // Without a delimiter there is no way to find the next frame
                self.done = true;
            }
            _ => {}
        }

        result
    }

    async fn next_line(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        loop {
            let mut line = Vec::new();
            let limit = self.max_frame_bytes as u64 + 1;
            let n = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut line)
                .await?;

            if n == 0 {
                return Ok(None);
            }

            if line.last() == Some(&b'\n') {
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }

            if line.len() > self.max_frame_bytes {
                let skipped = self.skip_line().await?;
                return Err(ChannelError::FrameTooLarge {
                    size: line.len() + skipped,
                    limit: self.max_frame_bytes,
                });
            }

            // Unterminated final frame before EOF
            return Ok(Some(line));
        }
    }

    /// Discard input up to and including the next newline
    async fn skip_line(&mut self) -> Result<usize, ChannelError> {
        let mut skipped = 0;
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(skipped);
            }
            if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                self.inner.consume(pos + 1);
                return Ok(skipped + pos);
            }
            let len = available.len();
            self.inner.consume(len);
            skipped += len;
        }
    }

    async fn next_length_prefixed(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut header = [0u8; 4];
        let got = self.read_full(&mut header).await?;
        if got == 0 {
            return Ok(None);
        }
        if got < header.len() {
            return Err(ChannelError::Truncated {
                received: got,
                expected: header.len(),
            });
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_bytes {
            return Err(ChannelError::FrameTooLarge {
                size: len,
                limit: self.max_frame_bytes,
            });
        }

        let mut payload = vec![0u8; len];
        let got = self.read_full(&mut payload).await?;
        if got < len {
            return Err(ChannelError::Truncated {
                received: got,
                expected: len,
            });
        }
        Ok(Some(payload))
    }

    async fn next_raw(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut buf = vec![0u8; self.max_frame_bytes];
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    /// Fill `buf` unless EOF comes first; returns the bytes read
    async fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}
