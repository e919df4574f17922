//! Timestamp-addressed audio buffer
//!
//! Inbound RTP payload is written at the byte offset given by its RTP
//! timestamp (one byte per sample for G.711), so late or reordered packets
//! land where they belong and gaps read back as silence. Reads are
//! sequential from a cursor. The same type doubles as the outbound FIFO via
//! [`PacketBuffer::push`].
//!
//! Unread data is capped at the resync threshold; when a reader falls
//! behind, the oldest unread bytes are dropped.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Consumed bytes kept before the front of the buffer is discarded
const COMPACT_THRESHOLD: usize = 16 * 1024;

#[derive(Debug, Default)]
struct BufferState {
    /// Timestamp of `data[0]`
    base: Option<u64>,
    data: Vec<u8>,
    read_pos: usize,
}

impl BufferState {
    fn reset_to(&mut self, offset: u64, payload: &[u8]) {
        self.base = Some(offset);
        self.data.clear();
        self.data.extend_from_slice(payload);
        self.read_pos = 0;
    }

    fn compact(&mut self) {
        if self.read_pos < COMPACT_THRESHOLD {
            return;
        }
        self.discard_consumed();
    }

    /// Drop unread data beyond `limit`, oldest first. Returns the bytes dropped.
    fn enforce_limit(&mut self, limit: usize) -> usize {
        let unread = self.data.len() - self.read_pos;
        if unread <= limit {
            return 0;
        }
        let dropped = unread - limit;
        self.read_pos += dropped;
        self.discard_consumed();
        dropped
    }

    fn discard_consumed(&mut self) {
        self.data.drain(..self.read_pos);
        if let Some(base) = self.base.as_mut() {
            *base += self.read_pos as u64;
        }
        self.read_pos = 0;
    }
}

/// Outcome of a timestamped write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    /// Buffer was rebased onto this packet
    Resynchronized,
    /// Packet is older than what has already been read
    Stale,
}

/// Byte buffer addressed by RTP timestamp
#[derive(Debug)]
pub struct PacketBuffer {
    state: Mutex<BufferState>,
    fill: u8,
    resync_threshold: u64,
    readable: Notify,
}

impl PacketBuffer {
    pub fn new(fill: u8, resync_threshold: u32) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            fill,
            resync_threshold: resync_threshold as u64,
            readable: Notify::new(),
        }
    }

    /// Write `payload` at RTP timestamp `offset`.
    ///
    /// With `reset` the buffer is rebased onto this packet, discarding
    /// anything unread. A jump of at least the resync threshold in either
    /// direction rebases as well.
    pub fn write_at(&self, offset: u32, payload: &[u8], reset: bool) -> WriteOutcome {
        let offset = offset as u64;
        let outcome = {
            let mut state = self.state.lock();
            match state.base {
                Some(base) if !reset => {
                    let end = base + state.data.len() as u64;
                    if offset < base {
                        if base - offset >= self.resync_threshold {
                            state.reset_to(offset, payload);
                            WriteOutcome::Resynchronized
                        } else {
                            WriteOutcome::Stale
                        }
                    } else if offset > end && offset - end >= self.resync_threshold {
                        state.reset_to(offset, payload);
                        WriteOutcome::Resynchronized
                    } else {
                        let pos = (offset - base) as usize;
                        if pos + payload.len() <= state.read_pos {
                            WriteOutcome::Stale
                        } else {
                            if pos > state.data.len() {
                                let fill = self.fill;
                                state.data.resize(pos, fill);
                            }
                            let overlap = (state.data.len() - pos).min(payload.len());
                            state.data[pos..pos + overlap].copy_from_slice(&payload[..overlap]);
                            state.data.extend_from_slice(&payload[overlap..]);
                            WriteOutcome::Stored
                        }
                    }
                }
                _ => {
                    state.reset_to(offset, payload);
                    WriteOutcome::Resynchronized
                }
            }
        };

        self.enforce_limit();
        match outcome {
            WriteOutcome::Resynchronized => debug!(offset, "Receive buffer resynchronized"),
            WriteOutcome::Stale => trace!(offset, "Dropping stale payload"),
            WriteOutcome::Stored => {}
        }
        self.readable.notify_waiters();
        outcome
    }

    /// Append to the end of the buffer
    pub fn push(&self, payload: &[u8]) {
        {
            let mut state = self.state.lock();
            if state.base.is_none() {
                state.base = Some(0);
            }
            state.data.extend_from_slice(payload);
        }
        self.enforce_limit();
        self.readable.notify_waiters();
    }

    fn enforce_limit(&self) {
        let dropped = self.state.lock().enforce_limit(self.resync_threshold as usize);
        if dropped > 0 {
            trace!(dropped, "Buffer full, dropped oldest audio");
        }
    }

    /// Bytes buffered past the read cursor
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.data.len() - state.read_pos
    }

    /// Take up to `length` bytes from the read cursor
    pub fn read(&self, length: usize) -> Bytes {
        let mut state = self.state.lock();
        let start = state.read_pos;
        let end = (start + length).min(state.data.len());
        let out = Bytes::copy_from_slice(&state.data[start..end]);
        state.read_pos = end;
        state.compact();
        out
    }

    /// Take exactly `length` bytes, padding with the fill byte
    pub fn read_padded(&self, length: usize) -> Bytes {
        let data = self.read(length);
        if data.len() == length {
            return data;
        }
        let mut out = BytesMut::with_capacity(length);
        out.extend_from_slice(&data);
        out.resize(length, self.fill);
        out.freeze()
    }

    pub fn clear(&self) {
        *self.state.lock() = BufferState::default();
    }

    pub fn fill_byte(&self) -> u8 {
        self.fill
    }

    /// Future resolved on the next write or [`PacketBuffer::wake_readers`].
    /// Create it before checking [`PacketBuffer::available`] to avoid
    /// missing a wakeup.
    pub fn notified(&self) -> Notified<'_> {
        self.readable.notified()
    }

    pub fn wake_readers(&self) {
        self.readable.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> PacketBuffer {
        PacketBuffer::new(0xFF, 100_000)
    }

    #[test]
    fn test_sequential_writes() {
        let buf = buffer();
        assert_eq!(buf.write_at(1000, &[1; 160], false), WriteOutcome::Resynchronized);
        assert_eq!(buf.write_at(1160, &[2; 160], false), WriteOutcome::Stored);
        assert_eq!(buf.available(), 320);

        let first = buf.read(160);
        assert!(first.iter().all(|b| *b == 1));
        assert!(buf.read(160).iter().all(|b| *b == 2));
        assert_eq!(buf.available(), 0);
    }

    #[test]
    fn test_reordered_packet_lands_in_place() {
        let buf = buffer();
        buf.write_at(0, &[1; 4], false);
        buf.write_at(8, &[3; 4], false);
        assert_eq!(buf.read(12).as_ref(), &[1, 1, 1, 1, 0xFF, 0xFF, 0xFF, 0xFF, 3, 3, 3, 3]);

        let buf = buffer();
        buf.write_at(0, &[1; 4], false);
        buf.write_at(8, &[3; 4], false);
        buf.write_at(4, &[2; 4], false);
        assert_eq!(buf.read(12).as_ref(), &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
    }

    #[test]
    fn test_stale_and_resync() {
        let buf = buffer();
        buf.write_at(500_000, &[1; 10], false);
        buf.read(10);
        assert_eq!(buf.write_at(500_000, &[9; 10], false), WriteOutcome::Stale);
        assert_eq!(buf.write_at(499_990, &[9; 10], false), WriteOutcome::Stale);

        // Timestamp wrap or a fresh talk spurt far away rebases
        assert_eq!(buf.write_at(10, &[4; 10], false), WriteOutcome::Resynchronized);
        assert_eq!(buf.read(10).as_ref(), &[4; 10]);

        assert_eq!(buf.write_at(20, &[5; 2], true), WriteOutcome::Resynchronized);
        assert_eq!(buf.available(), 2);
    }

    #[test]
    fn test_padded_read_and_push() {
        let buf = buffer();
        buf.push(&[7, 7]);
        assert_eq!(buf.read_padded(4).as_ref(), &[7, 7, 0xFF, 0xFF]);
        assert_eq!(buf.read_padded(2).as_ref(), &[0xFF, 0xFF]);
    }

    #[test]
    fn test_unread_data_is_capped() {
        let buf = PacketBuffer::new(0xFF, 1000);
        let mut ts = 0u32;
        for i in 0..20u8 {
            buf.write_at(ts, &[i; 160], false);
            ts += 160;
        }
        assert_eq!(buf.available(), 1000);
        // The newest frame survives at the tail
        let all = buf.read(1000);
        assert!(all[840..].iter().all(|b| *b == 19));

        // Later packets still line up with the moved base
        assert_eq!(buf.write_at(ts, &[42; 160], false), WriteOutcome::Stored);
        assert_eq!(buf.read(160).as_ref(), &[42; 160]);

        for _ in 0..10 {
            buf.push(&[7; 160]);
        }
        assert_eq!(buf.available(), 1000);
    }

    #[test]
    fn test_compaction_keeps_cursor() {
        let buf = buffer();
        let mut ts = 0u32;
        for _ in 0..200 {
            buf.write_at(ts, &[ts as u8; 160], false);
            ts += 160;
        }
        for i in 0..150u32 {
            let frame = buf.read(160);
            assert!(frame.iter().all(|b| *b == (i * 160) as u8));
        }
        assert_eq!(buf.available(), 50 * 160);
        buf.write_at(ts, &[42; 160], false);
        assert_eq!(buf.available(), 51 * 160);
    }
}
