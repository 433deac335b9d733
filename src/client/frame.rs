//! Length-prefixed framing over a byte stream, plus the inbound buffer
//! watermarks that keep a fast peer from outrunning the driver.

use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 4;

/// Hard cap on a single frame; a peer declaring more is a protocol error.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    LengthInvalid { reason: String },
    #[error("frame too large: max {max_bytes} got {got_bytes}")]
    TooLarge { max_bytes: usize, got_bytes: usize },
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Read one complete frame, accumulating across short reads. Returns
    /// `None` on a clean end of stream between frames.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.reader.read(&mut header[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame header truncated",
                )
                .into());
            }
            read += n;
        }

        let length = u32::from_le_bytes(header) as usize;
        if length == 0 {
            return Err(FrameError::LengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                max_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let mut body = vec![0u8; length];
        let mut read_body = 0usize;
        while read_body < length {
            let n = self.reader.read(&mut body[read_body..])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame body truncated",
                )
                .into());
            }
            read_body += n;
        }

        Ok(Some(body))
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::LengthInvalid {
            reason: "frame length cannot be zero".to_string(),
        });
    }
    if payload.len() > max_frame_bytes {
        return Err(FrameError::TooLarge {
            max_bytes: max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::LengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BudgetError {
    #[error("inbound buffer overflow: {buffered_bytes} buffered, absolute cap {max_bytes}")]
    Overflow {
        buffered_bytes: usize,
        max_bytes: usize,
    },
    #[error("inbound buffer aborted")]
    Aborted,
}

struct BudgetState {
    buffered: usize,
    aborted: bool,
}

/// Accounting for bytes sitting between the socket reader and the driver.
///
/// The reader admits each decoded frame before handing it on: below the high
/// watermark it passes straight through, above it the reader blocks until the
/// driver drains back to the low watermark, and past the absolute cap the
/// connection is torn down.
pub struct InboundBudget {
    low: usize,
    high: usize,
    max: usize,
    state: Mutex<BudgetState>,
    drained: Condvar,
}

impl InboundBudget {
    pub fn new(low: usize, high: usize, max: usize) -> Arc<Self> {
        Arc::new(Self {
            low,
            high,
            max,
            state: Mutex::new(BudgetState {
                buffered: 0,
                aborted: false,
            }),
            drained: Condvar::new(),
        })
    }

    /// Called by the reader thread; blocks while over the high watermark.
    pub fn admit(&self, bytes: usize) -> Result<(), BudgetError> {
        let mut state = self.state.lock().expect("budget lock");
        loop {
            if state.aborted {
                return Err(BudgetError::Aborted);
            }
            if state.buffered < self.high {
                state.buffered += bytes;
                if state.buffered > self.max {
                    return Err(BudgetError::Overflow {
                        buffered_bytes: state.buffered,
                        max_bytes: self.max,
                    });
                }
                return Ok(());
            }
            state = self.drained.wait(state).expect("budget lock");
        }
    }

    /// Called by the driver once a frame has been processed (or discarded).
    pub fn release(&self, bytes: usize) {
        let mut state = self.state.lock().expect("budget lock");
        state.buffered = state.buffered.saturating_sub(bytes);
        if state.buffered <= self.low {
            self.drained.notify_all();
        }
    }

    /// Wake any blocked reader and make further admissions fail; used when
    /// the connection is torn down.
    pub fn abort(&self) {
        let mut state = self.state.lock().expect("budget lock");
        state.aborted = true;
        self.drained.notify_all();
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.state.lock().expect("budget lock").buffered
    }
}
