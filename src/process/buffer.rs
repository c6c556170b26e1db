//! Append-only output buffer shared between a drain task and its readers
//!
//! The drain task is the only writer. Readers either take snapshots of the
//! accumulated text or follow the chunks as they arrive. Every append bumps
//! a version on a watch channel so waiting readers never miss an update.

use std::ops::Range;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_util::stream::{self, Stream};
use tokio::sync::watch;

/// Thread-safe, append-only text buffer
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    state: RwLock<State>,
    version: watch::Sender<u64>,
}

#[derive(Default)]
struct State {
    text: String,
    /// Byte ranges of each chunk as it was appended
    chunks: Vec<Range<usize>>,
    closed: bool,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("OutputBuffer")
            .field("len", &state.text.len())
            .field("chunks", &state.chunks.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                version,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a chunk of text. Ignored once the buffer is closed.
    pub fn append(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        {
            let mut state = self.write();
            if state.closed {
                return;
            }
            let start = state.text.len();
            state.text.push_str(chunk);
            let end = state.text.len();
            state.chunks.push(start..end);
        }
        self.inner.version.send_modify(|v| *v += 1);
    }

    /// Mark the end of the stream
    pub fn close(&self) {
        self.write().closed = true;
        self.inner.version.send_modify(|v| *v += 1);
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Copy of everything appended so far
    pub fn snapshot(&self) -> String {
        self.read().text.clone()
    }

    /// Whether the accumulated text contains `needle` (case-sensitive)
    pub fn contains(&self, needle: &str) -> bool {
        self.read().text.contains(needle)
    }

    pub fn len(&self) -> usize {
        self.read().text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver that observes every append and the close
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Wait until the writer closes the stream
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        while !self.is_closed() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn chunk_at(&self, index: usize) -> ChunkRead {
        let state = self.read();
        match state.chunks.get(index) {
            Some(range) => ChunkRead::Chunk(state.text[range.clone()].to_string()),
            None if state.closed => ChunkRead::End,
            None => ChunkRead::Pending,
        }
    }

    /// Lazy sequence of chunks, from the first one ever appended.
    ///
    /// Ends when the writer closes the buffer. Chunk boundaries are whatever
    /// the OS handed the drain task, so callers searching for text should
    /// use [`OutputBuffer::contains`] on the accumulated buffer instead.
    pub fn chunks(&self) -> impl Stream<Item = String> + Send + 'static {
        let rx = self.subscribe();
        stream::unfold(
            (self.clone(), 0usize, rx),
            |(buffer, index, mut rx)| async move {
                loop {
                    match buffer.chunk_at(index) {
                        ChunkRead::Chunk(chunk) => return Some((chunk, (buffer, index + 1, rx))),
                        ChunkRead::End => return None,
                        ChunkRead::Pending => {
                            if rx.changed().await.is_err() {
                                return None;
                            }
                        }
                    }
                }
            },
        )
    }
}

enum ChunkRead {
    Chunk(String),
    Pending,
    End,
}

/// Decodes a byte stream into text without splitting multi-byte characters
/// across chunk boundaries.
#[derive(Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        // Incomplete sequence at the end: hold it back for the next read
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        text
    }

    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
