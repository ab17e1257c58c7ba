//! Outgoing byte stream.
//!
//! A FIFO of owned buffers with a single drain point. The socket driver
//! copies pending bytes into its scratch buffer with [`ByteStream::get`],
//! hands them to the kernel, and only then [`ByteStream::discard`]s the
//! count the kernel actually accepted; unsent bytes stay queued and are
//! copied again on the next writable event.

use std::collections::VecDeque;

use crate::buffer::PooledBuffer;

/// FIFO queue of outbound buffers, drained by byte count.
#[derive(Default)]
pub struct ByteStream {
    queue: VecDeque<PooledBuffer>,
    /// Bytes of the head buffer already accepted by the kernel.
    head_pos: usize,
}

impl ByteStream {
    /// Create an empty stream.
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            head_pos: 0,
        }
    }

    /// Take ownership of `buf` and queue it after any pending data.
    pub fn append(&mut self, buf: PooledBuffer) {
        self.queue.push_back(buf);
    }

    /// Whether any unsent byte remains.
    pub fn has_data(&self) -> bool {
        match self.queue.front() {
            Some(head) => head.len() > self.head_pos || self.queue.len() > 1,
            None => false,
        }
    }

    /// Copy pending bytes into `dst` without consuming them.
    ///
    /// Returns the number of bytes copied. Never blocks; repeated calls
    /// return the same bytes until they are [`discard`](Self::discard)ed.
    pub fn get(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut skip = self.head_pos;
        for buf in &self.queue {
            let unread = &buf[skip.min(buf.len())..];
            skip = 0;
            if copied == dst.len() {
                break;
            }
            let n = unread.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&unread[..n]);
            copied += n;
        }
        copied
    }

    /// Mark `count` bytes as sent, releasing any buffer now fully
    /// consumed.
    pub fn discard(&mut self, mut count: usize) {
        while count > 0 {
            let Some(head) = self.queue.front() else {
                break;
            };
            let unread = head.len() - self.head_pos;
            if count < unread {
                self.head_pos += count;
                break;
            }
            count -= unread;
            self.queue.pop_front();
            self.head_pos = 0;
        }
        if self.queue.front().map_or(false, |h| h.len() == self.head_pos) {
            self.queue.pop_front();
            self.head_pos = 0;
        }
    }

    /// Release every queued buffer.
    pub fn clean(&mut self) {
        self.queue.clear();
        self.head_pos = 0;
    }
}
