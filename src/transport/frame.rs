//! Frame layer of the obfuscated-EF wire format.
//!
//! A frame is a length prefix followed by an opaque payload whose size is
//! always a multiple of four:
//!
//! ```text
//! [ L ]            payload = (L & 0x7f) * 4 bytes        (L & 0x7f < 0x7f)
//! [ L e e e ]      payload = (le32 >> 8) * 4 bytes       (L & 0x7f == 0x7f)
//! ```
//!
//! The high bit of `L` requests an ack on outbound frames; on inbound
//! frames it marks a 4-byte quick-ack control word instead of a payload.
//! Length prefixes travel inside the same continuous cipher stream as the
//! payloads, so this module only ever sees plaintext.

use crate::buffer::{BufferPool, PooledBuffer};
use crate::core::{FrameError, ACK_FLAG, LONG_FORM_MARKER, MAX_FRAME_SIZE};

/// One decoded item from the inbound stream.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameEvent<'a> {
    /// A complete frame payload, excluding the length prefix.
    Data(&'a [u8]),
    /// A quick-ack id (31 bits, top bit stripped).
    QuickAck(i32),
}

/// Append the length prefix for a `payload_len`-byte frame to `out`.
///
/// `payload_len` must be a multiple of four; this is the caller's
/// contract with the wire format.
pub fn encode_length_prefix(payload_len: usize, report_ack: bool, out: &mut Vec<u8>) {
    debug_assert_eq!(payload_len % 4, 0);
    let words = payload_len / 4;
    if words < LONG_FORM_MARKER as usize {
        let mut prefix = words as u8;
        if report_ack {
            prefix |= ACK_FLAG;
        }
        out.push(prefix);
    } else {
        let mut word = ((words as u32) << 8) | LONG_FORM_MARKER as u32;
        if report_ack {
            word |= ACK_FLAG as u32;
        }
        out.extend_from_slice(&word.to_le_bytes());
    }
}

/// Reassembles frames across arbitrarily fragmented socket reads.
///
/// Between reads, at most one partial frame is buffered. `expected_len`
/// is zero while even the length prefix is incomplete, otherwise the
/// total frame length (prefix included) being waited for.
#[derive(Default)]
pub struct FrameAssembler {
    pending: Option<PooledBuffer>,
    expected_len: usize,
}

impl FrameAssembler {
    /// Create an assembler with no buffered data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partial frame, returning its buffer to the pool.
    pub fn reset(&mut self) {
        self.pending = None;
        self.expected_len = 0;
    }

    /// Whether a partial frame is buffered.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed one decrypted chunk, invoking `sink` for every completed
    /// frame or quick-ack in wire order.
    ///
    /// Trailing bytes that do not complete a frame are stashed for the
    /// next call. An invalid length aborts parsing; the caller is
    /// expected to tear the session down.
    pub fn process<F>(
        &mut self,
        pool: &BufferPool,
        chunk: &[u8],
        mut sink: F,
    ) -> Result<(), FrameError>
    where
        F: FnMut(FrameEvent<'_>),
    {
        let owned = match self.pending.take() {
            Some(mut rest) => {
                rest.extend_from_slice(chunk);
                if self.expected_len > 0 && rest.len() < self.expected_len {
                    // Still short of a known frame boundary.
                    self.pending = Some(rest);
                    return Ok(());
                }
                self.expected_len = 0;
                Some(rest)
            }
            None => None,
        };
        let data: &[u8] = match &owned {
            Some(buf) => buf,
            None => chunk,
        };

        let mut pos = 0;
        while pos < data.len() {
            let remaining = data.len() - pos;
            let first = data[pos];

            if first & ACK_FLAG != 0 {
                if remaining < 4 {
                    self.stash(pool, &data[pos..], 0);
                    return Ok(());
                }
                let ack_id = i32::from_be_bytes([
                    data[pos],
                    data[pos + 1],
                    data[pos + 2],
                    data[pos + 3],
                ]) & 0x7fff_ffff;
                sink(FrameEvent::QuickAck(ack_id));
                pos += 4;
                continue;
            }

            let (prefix_len, payload_len) = if first != LONG_FORM_MARKER {
                (1, first as usize * 4)
            } else {
                if remaining < 4 {
                    self.stash(pool, &data[pos..], 0);
                    return Ok(());
                }
                let word = u32::from_le_bytes([
                    data[pos],
                    data[pos + 1],
                    data[pos + 2],
                    data[pos + 3],
                ]);
                (4, (word >> 8) as usize * 4)
            };

            if payload_len == 0 || payload_len > MAX_FRAME_SIZE {
                self.reset();
                return Err(FrameError::InvalidLength(payload_len));
            }

            let total = prefix_len + payload_len;
            if remaining < total {
                self.stash(pool, &data[pos..], total);
                return Ok(());
            }

            sink(FrameEvent::Data(&data[pos + prefix_len..pos + total]));
            pos += total;
        }
        Ok(())
    }

    fn stash(&mut self, pool: &BufferPool, rest: &[u8], expected_len: usize) {
        self.pending = Some(pool.take_from(rest));
        self.expected_len = expected_len;
    }
}
