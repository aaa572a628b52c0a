use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use crate::error::{Result, ShmError};
use crate::events::{EventKind, EventSet};
use crate::futex::{futex_wait, futex_wake};
use crate::layout::{HEADER_SIZE, LEN_PREFIX, MAX_RECORD, RingHeader};
use crate::region::SharedRegion;

/// Single-producer/single-consumer byte ring with overwrite-oldest
/// semantics, laid out inside a [`SharedRegion`].
///
/// Records are stored as a 4-byte little-endian length followed by that
/// many payload bytes, wrapping across the end of the payload area. When a
/// write finds insufficient free space it advances `read_pos` past whole
/// records, discarding the oldest data, so a write of a valid-sized record
/// never fails: the ring always holds a contiguous, in-order suffix of
/// what was written.
///
/// Exactly one process may write and exactly one may read. The writer
/// touches `read_pos` only in the drop-oldest step, and does so with CAS so
/// it cannot race the consumer into corruption; the consumer likewise
/// advances by CAS and re-parses when it loses, which also makes torn reads
/// impossible under overrun.
pub struct ByteRing {
    region: Arc<SharedRegion>,
    header_offset: usize,
    payload_offset: usize,
    size: u32,
    events: Arc<EventSet>,
    blocking: bool,
    timeout: Duration,
}

// All shared state is behind atomics in the mapped header; payload bytes
// are only touched according to the positions those atomics publish.
unsafe impl Send for ByteRing {}
unsafe impl Sync for ByteRing {}

impl ByteRing {
    /// Initializes a fresh ring at `header_offset` inside `region`.
    ///
    /// # Safety
    ///
    /// `header_offset` must be 64-byte aligned and
    /// `header_offset + HEADER_SIZE + size` must lie within the region. No
    /// other party may be using that range yet.
    pub(crate) unsafe fn create_at(
        region: Arc<SharedRegion>,
        header_offset: usize,
        size: u32,
        events: Arc<EventSet>,
        blocking: bool,
        timeout: Duration,
    ) -> Self {
        debug_assert!(size.is_power_of_two());
        debug_assert!(header_offset + HEADER_SIZE + size as usize <= region.len());

        let ring = Self {
            region,
            header_offset,
            payload_offset: header_offset + HEADER_SIZE,
            size,
            events,
            blocking,
            timeout,
        };
        ring.header().init(size);
        ring
    }

    /// Attaches to a ring previously initialized by a peer.
    ///
    /// Fails with [`ShmError::NotFound`] while the creator has not finished
    /// initializing (observed size of zero), and with
    /// [`ShmError::InvalidParam`] when the header contradicts the region.
    ///
    /// # Safety
    ///
    /// `header_offset` must be 64-byte aligned and within the region.
    pub(crate) unsafe fn open_at(
        region: Arc<SharedRegion>,
        header_offset: usize,
        events: Arc<EventSet>,
        blocking: bool,
        timeout: Duration,
    ) -> Result<Self> {
        if header_offset + HEADER_SIZE > region.len() {
            return Err(ShmError::InvalidParam("ring header outside region"));
        }

        let header = unsafe { &*(region.as_ptr().add(header_offset) as *const RingHeader) };
        let size = header.size.load(Ordering::Acquire);
        if size == 0 {
            return Err(ShmError::NotFound);
        }
        if !size.is_power_of_two() {
            return Err(ShmError::InvalidParam("ring size is not a power of two"));
        }
        if header_offset + HEADER_SIZE + size as usize > region.len() {
            return Err(ShmError::InvalidParam("ring payload outside region"));
        }

        Ok(Self {
            region,
            header_offset,
            payload_offset: header_offset + HEADER_SIZE,
            size,
            events,
            blocking,
            timeout,
        })
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.region.as_ptr().add(self.header_offset) as *const RingHeader) }
    }

    fn payload(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(self.payload_offset) }
    }

    /// Payload length in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Bytes of committed, unread records.
    pub fn available(&self) -> u32 {
        let header = self.header();
        let write_pos = header.write_pos.load(Ordering::Acquire);
        let read_pos = header.read_pos.load(Ordering::Acquire);
        write_pos.wrapping_sub(read_pos)
    }

    /// Bytes that can be written without dropping old records.
    pub fn free_space(&self) -> u32 {
        self.size - self.available()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Publishes one record, dropping the oldest records if needed.
    ///
    /// Fails only on malformed input: an empty record, a payload larger
    /// than [`MAX_RECORD`], or a framed record that cannot fit the ring at
    /// all. Valid records always succeed.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(ShmError::InvalidParam("record is empty"));
        }
        if bytes.len() > MAX_RECORD {
            tracing::debug!(len = bytes.len(), "rejecting oversize record");
            return Err(ShmError::InvalidParam("record exceeds MAX_RECORD"));
        }
        let required = LEN_PREFIX + bytes.len() as u32;
        if required > self.size {
            return Err(ShmError::InvalidParam("record does not fit the ring"));
        }

        let header = self.header();
        // Single writer: write_pos is ours alone.
        let write_pos = header.write_pos.load(Ordering::Relaxed);
        let mut read_pos = header.read_pos.load(Ordering::Acquire);

        let backoff = Backoff::new();
        while write_pos.wrapping_sub(read_pos) as u64 + required as u64 > self.size as u64 {
            // Drop the whole record at the head. The consumer may be
            // advancing read_pos concurrently; whoever wins the CAS moves
            // it, the loser reloads and re-evaluates.
            let drop_len = self.record_len_at(read_pos);
            let next = read_pos.wrapping_add(LEN_PREFIX + drop_len);
            match header.read_pos.compare_exchange(
                read_pos,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => read_pos = next,
                Err(current) => {
                    read_pos = current;
                    backoff.snooze();
                }
            }
        }

        self.copy_in(write_pos, &(bytes.len() as u32).to_le_bytes());
        self.copy_in(write_pos.wrapping_add(LEN_PREFIX), bytes);

        header
            .write_pos
            .store(write_pos.wrapping_add(required), Ordering::Release);
        header.sequence.fetch_add(1, Ordering::Release);

        // Two wake channels: the position word unblocks this ring's
        // reader directly, the event slot feeds the peer's listener. The
        // record is already published, so a failing wake is logged rather
        // than unwinding the write; the reader's bounded sleep re-checks.
        if let Err(e) = futex_wake(&header.write_pos, 1) {
            tracing::warn!(error = %e, "reader wake failed");
        }
        self.events.signal(EventKind::DataAvailable);
        Ok(())
    }

    /// Reads the next record into `out`, returning its length.
    ///
    /// In blocking mode (with a nonzero timeout) an empty ring suspends
    /// until the writer publishes and returns [`ShmError::Timeout`] on
    /// expiry; in non-blocking mode it returns [`ShmError::Empty`]
    /// immediately. `out` must be at least as large as the record. A
    /// kernel-level wait failure surfaces as [`ShmError::Access`].
    ///
    /// The suspension is keyed on the `write_pos` word itself rather than
    /// the shared data event slot, so a peer's listener consuming that
    /// slot can never strand this reader.
    pub fn read(&self, out: &mut [u8]) -> Result<usize> {
        // A zero timeout in blocking mode degenerates to non-blocking.
        if !self.blocking || self.timeout.is_zero() {
            return self.try_read(out);
        }

        let header = self.header();
        let deadline = Instant::now() + self.timeout;
        loop {
            // Snapshot before the emptiness check: a write landing after
            // this load makes the sleep below return immediately.
            let seen_write_pos = header.write_pos.load(Ordering::Acquire);
            match self.try_read(out) {
                Err(ShmError::Empty) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ShmError::Timeout);
                    }
                    futex_wait(&header.write_pos, seen_write_pos, Some(deadline - now))
                        .map_err(ShmError::Access)?;
                }
                other => return other,
            }
        }
    }

    /// Non-blocking read of the next record into `out`.
    pub fn try_read(&self, out: &mut [u8]) -> Result<usize> {
        let header = self.header();
        let backoff = Backoff::new();

        loop {
            let read_pos = header.read_pos.load(Ordering::Acquire);
            let write_pos = header.write_pos.load(Ordering::Acquire);
            if write_pos == read_pos {
                return Err(ShmError::Empty);
            }

            let len = self.record_len_at(read_pos);
            // The writer may have dropped this record while we parsed its
            // length; only trust the length if the head did not move.
            if header.read_pos.load(Ordering::Acquire) != read_pos {
                backoff.snooze();
                continue;
            }
            if len as usize > out.len() {
                return Err(ShmError::InvalidParam("receive buffer smaller than record"));
            }

            self.copy_out(read_pos.wrapping_add(LEN_PREFIX), &mut out[..len as usize]);

            let next = read_pos.wrapping_add(LEN_PREFIX + len);
            match header.read_pos.compare_exchange(
                read_pos,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.events.signal(EventKind::SpaceAvailable);
                    return Ok(len as usize);
                }
                // Lost to the writer's drop-oldest: the bytes we copied may
                // belong to a discarded record, so re-parse from the new
                // head.
                Err(_) => backoff.snooze(),
            }
        }
    }

    /// Copies the next record into `out` without consuming it.
    ///
    /// Repeated peeks return identical bytes until a `read` advances the
    /// ring.
    pub fn peek(&self, out: &mut [u8]) -> Result<usize> {
        let header = self.header();
        let backoff = Backoff::new();

        loop {
            let read_pos = header.read_pos.load(Ordering::Acquire);
            let write_pos = header.write_pos.load(Ordering::Acquire);
            if write_pos == read_pos {
                return Err(ShmError::Empty);
            }

            let len = self.record_len_at(read_pos);
            if header.read_pos.load(Ordering::Acquire) != read_pos {
                backoff.snooze();
                continue;
            }
            if len as usize > out.len() {
                return Err(ShmError::InvalidParam("receive buffer smaller than record"));
            }

            self.copy_out(read_pos.wrapping_add(LEN_PREFIX), &mut out[..len as usize]);

            // An overrun during the copy may have replaced these bytes.
            if header.read_pos.load(Ordering::Acquire) != read_pos {
                backoff.snooze();
                continue;
            }
            return Ok(len as usize);
        }
    }

    /// Count of consumers currently attached to this ring.
    pub fn active_readers(&self) -> u32 {
        self.header().active_readers.load(Ordering::Acquire)
    }

    pub(crate) fn attach_reader(&self) -> u32 {
        self.header().active_readers.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn detach_reader(&self) {
        self.header().active_readers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Reads the length prefix of the record at `pos`, handling wrap.
    fn record_len_at(&self, pos: u32) -> u32 {
        let mut len_bytes = [0u8; LEN_PREFIX as usize];
        self.copy_out(pos, &mut len_bytes);
        u32::from_le_bytes(len_bytes)
    }

    /// Copies `data` into the payload area at `pos`, splitting at the end
    /// of the buffer.
    fn copy_in(&self, pos: u32, data: &[u8]) {
        let index = (pos & (self.size - 1)) as usize;
        let first = data.len().min(self.size as usize - index);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.payload().add(index), first);
            if first < data.len() {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first),
                    self.payload(),
                    data.len() - first,
                );
            }
        }
    }

    /// Copies payload bytes starting at `pos` into `out`, splitting at the
    /// end of the buffer.
    fn copy_out(&self, pos: u32, out: &mut [u8]) {
        let index = (pos & (self.size - 1)) as usize;
        let first = out.len().min(self.size as usize - index);
        unsafe {
            std::ptr::copy_nonoverlapping(self.payload().add(index), out.as_mut_ptr(), first);
            if first < out.len() {
                std::ptr::copy_nonoverlapping(
                    self.payload(),
                    out.as_mut_ptr().add(first),
                    out.len() - first,
                );
            }
        }
    }
}
