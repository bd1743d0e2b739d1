//! Bounded byte FIFO backing the stream edges of a tunnel session.
//!
//! One ring sits on each side of a [`FrameManager`](super::manager::FrameManager):
//! the application writes outbound bytes into the send ring and reads inbound
//! bytes out of the receive ring, while the manager drains and fills the
//! opposite ends. Access is single-writer, single-reader and serialized by
//! the owner; the ring itself carries no synchronization.

use thiserror::Error;

/// Errors from byte queue misuse.
///
/// Both variants indicate a caller bug: producers are expected to consult
/// [`ByteRing::free_space`] before writing, consumers [`ByteRing::len`]
/// before reading.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Write larger than the remaining free space.
    #[error("buffer overflow: {needed} bytes needed, {available} available")]
    Overflow {
        /// Bytes the write required.
        needed: usize,
        /// Free space at the time of the write.
        available: usize,
    },

    /// Read larger than the buffered length.
    #[error("buffer underflow: {requested} bytes requested, {buffered} buffered")]
    Underflow {
        /// Bytes the read required.
        requested: usize,
        /// Bytes buffered at the time of the read.
        buffered: usize,
    },
}

/// Fixed-capacity ring of bytes.
#[derive(Debug)]
pub struct ByteRing {
    buf: Box<[u8]>,
    /// Index of the oldest buffered byte.
    head: usize,
    /// Number of buffered bytes.
    len: usize,
}

impl ByteRing {
    /// Create a ring holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the ring holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remaining room in bytes.
    pub fn free_space(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Append `data`, failing without side effects if it does not fit.
    pub fn write(&mut self, data: &[u8]) -> Result<(), BufferError> {
        if data.len() > self.free_space() {
            return Err(BufferError::Overflow {
                needed: data.len(),
                available: self.free_space(),
            });
        }

        let tail = (self.head + self.len) % self.buf.len();
        let first = data.len().min(self.buf.len() - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        self.len += data.len();
        Ok(())
    }

    /// Remove exactly `out.len()` bytes into `out`, failing without side
    /// effects if fewer are buffered.
    pub fn read_into(&mut self, out: &mut [u8]) -> Result<(), BufferError> {
        if out.len() > self.len {
            return Err(BufferError::Underflow {
                requested: out.len(),
                buffered: self.len,
            });
        }

        let out_len = out.len();
        let first = out_len.min(self.buf.len() - self.head);
        out[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        out[first..].copy_from_slice(&self.buf[..out_len - first]);
        self.head = (self.head + out.len()) % self.buf.len();
        self.len -= out.len();
        Ok(())
    }
}
