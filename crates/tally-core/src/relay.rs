use thiserror::Error;
use tokio::sync::mpsc;

use tally_types::StreamFrame;
use tally_wire::encode_frame;

pub const DEFAULT_BUFFER_CAPACITY: usize = 256 * 1024;

/// Append-only log of every payload the relay delivered. Once full it keeps
/// the head of the stream and remembers that the tail was cut.
#[derive(Debug, Clone)]
pub struct AccumulatedBuffer {
    text: String,
    capacity: usize,
    truncated: bool,
}

impl AccumulatedBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            text: String::new(),
            capacity,
            truncated: false,
        }
    }

    pub fn append(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        let remaining = self.capacity.saturating_sub(self.text.len());
        if chunk.len() <= remaining {
            self.text.push_str(chunk);
            return;
        }
        let mut cut = remaining;
        while cut > 0 && !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&chunk[..cut]);
        self.truncated = true;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl Default for AccumulatedBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("client disconnected")]
pub struct RelayClosed;

/// Sole writer of one session's outward stream.
pub struct FrameRelay {
    message_id: String,
    tx: mpsc::Sender<String>,
    buffer: AccumulatedBuffer,
    saw_text: bool,
    delivered: Vec<StreamFrame>,
    closed: bool,
}

impl FrameRelay {
    pub fn new(message_id: impl Into<String>, tx: mpsc::Sender<String>, buffer_capacity: usize) -> Self {
        Self {
            message_id: message_id.into(),
            tx,
            buffer: AccumulatedBuffer::with_capacity(buffer_capacity),
            saw_text: false,
            delivered: Vec::new(),
            closed: false,
        }
    }

    /// Encodes the frame once, waits for channel capacity and mirrors the
    /// delivered payload into the buffer. A frame that cannot be encoded is
    /// logged and skipped, never sent empty.
    pub async fn forward(&mut self, frame: &StreamFrame) -> Result<(), RelayClosed> {
        if self.closed {
            return Err(RelayClosed);
        }
        let payload = match encode_frame(&self.message_id, frame) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    message_id = %self.message_id,
                    kind = frame.kind(),
                    error = %err,
                    "skipping frame that failed to encode"
                );
                return Ok(());
            }
        };
        if self.tx.send(payload.clone()).await.is_err() {
            self.closed = true;
            return Err(RelayClosed);
        }
        self.buffer.append(&payload);
        self.buffer.append("\n");
        if frame.text_payload().is_some() {
            self.saw_text = true;
        }
        self.delivered.push(frame.clone());
        Ok(())
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn saw_text(&self) -> bool {
        self.saw_text
    }

    pub fn frames_sent(&self) -> usize {
        self.delivered.len()
    }

    /// Every frame the reader accepted, in delivery order. Unlike the buffer
    /// this is never truncated.
    pub fn delivered(&self) -> &[StreamFrame] {
        &self.delivered
    }

    pub fn buffer(&self) -> &AccumulatedBuffer {
        &self.buffer
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.tx.is_closed()
    }
}
