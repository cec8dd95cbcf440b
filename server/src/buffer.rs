//! Audio frame buffer.
//!
//! Chunks are kept as received and joined once, when the buffer is frozen for
//! transcription. The ceiling bounds memory for a client that never stops
//! streaming: appends past it are refused and the caller finalizes early.

/// Append refused because the chunk would exceed the buffer ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("audio buffer full: {buffered} bytes buffered, {chunk} more would exceed {max_bytes}")]
pub struct BufferFull {
    pub buffered: usize,
    pub chunk: usize,
    pub max_bytes: usize,
}

/// Ordered, bounded collection of raw audio chunks.
#[derive(Debug)]
pub struct AudioBuffer {
    chunks: Vec<Vec<u8>>,
    len: usize,
    max_bytes: usize,
}

impl AudioBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
            max_bytes,
        }
    }

    /// Append a chunk, taking ownership of its bytes.
    ///
    /// The buffer is left untouched when the chunk does not fit.
    pub fn push(&mut self, chunk: Vec<u8>) -> Result<(), BufferFull> {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.len.saturating_add(chunk.len()) > self.max_bytes {
            return Err(BufferFull {
                buffered: self.len,
                chunk: chunk.len(),
                max_bytes: self.max_bytes,
            });
        }
        self.len += chunk.len();
        self.chunks.push(chunk);
        Ok(())
    }

    /// Total buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Consume the buffer, producing one contiguous payload in arrival order.
    pub fn freeze(self) -> Vec<u8> {
        self.chunks.concat()
    }
}

#[cfg(test)]
#[path = "buffer_test.rs"]
mod tests;
