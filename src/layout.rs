use std::sync::atomic::AtomicU32;

/// Cache-line size assumed for the shared layout.
pub(crate) const CACHE_LINE: usize = 64;

/// Size of one ring header in the mapping. The payload area starts
/// immediately after it.
pub const HEADER_SIZE: usize = CACHE_LINE;

/// Length-prefix size of one bytestream record.
pub(crate) const LEN_PREFIX: u32 = 4;

/// Largest payload a single bytestream record may carry, in bytes.
///
/// A record additionally requires [`LEN_PREFIX`] bytes of framing, and the
/// framed record must be strictly smaller than the ring's payload area.
pub const MAX_RECORD: usize = 65_535;

/// Control block at the head of every ring, shared between processes.
///
/// Binary layout (all fields little-endian u32, total 64 bytes):
///
/// ```text
/// offset  0: write_pos        mutator: writer
/// offset  4: read_pos         mutator: reader (also writer when dropping
///                             oldest records in the overwrite variant)
/// offset  8: size             written once at creation
/// offset 12: mask             written once at creation
/// offset 16: active_readers   mutator: consumer on attach/detach
/// offset 20: sequence         mutator: writer on publish (bytestream) /
///                             reader on commit (fixed-slot)
/// offset 24: padding to one cache line
/// ```
///
/// `write_pos` and `read_pos` are free-running counters; the byte (or slot)
/// offset into the payload is `pos & mask`. In the bytestream variant
/// `size`/`mask` are in bytes; in the fixed-slot variant they are in slots.
/// Both are powers of two.
///
/// `size` and `mask` are modelled as atomics so an opener racing with
/// creation observes either the final values or zero; zero means the
/// creator has not finished initializing and the opener must treat the
/// region as not yet present.
#[repr(C, align(64))]
pub struct RingHeader {
    pub(crate) write_pos: AtomicU32,
    pub(crate) read_pos: AtomicU32,
    pub(crate) size: AtomicU32,
    pub(crate) mask: AtomicU32,
    pub(crate) active_readers: AtomicU32,
    pub(crate) sequence: AtomicU32,
    _pad: [u8; CACHE_LINE - 6 * 4],
}

impl RingHeader {
    /// Initializes a freshly created header in place.
    ///
    /// `size` must be a power of two. Counters start at zero; `size` and
    /// `mask` are published last so openers never observe a nonzero size
    /// with unreset counters.
    pub(crate) fn init(&self, size: u32) {
        use std::sync::atomic::Ordering;

        debug_assert!(size.is_power_of_two());
        self.write_pos.store(0, Ordering::Relaxed);
        self.read_pos.store(0, Ordering::Relaxed);
        self.active_readers.store(0, Ordering::Relaxed);
        self.sequence.store(0, Ordering::Relaxed);
        self.mask.store(size - 1, Ordering::Release);
        self.size.store(size, Ordering::Release);
    }
}
