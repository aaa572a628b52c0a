use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam_utils::Backoff;

use crate::error::{Result, ShmError};
use crate::layout::{HEADER_SIZE, RingHeader};
use crate::region::SharedRegion;

/// Single-producer/single-consumer ring of fixed-size slots with
/// bounded-reject semantics, laid out inside a [`SharedRegion`].
///
/// Unlike [`ByteRing`](crate::ByteRing), a full ring rejects the write:
/// `try_write` returning `false` is backpressure, not an error. Reads are
/// two-phase — [`try_read_borrow`](Self::try_read_borrow) hands out a
/// borrow of the head slot together with a sequence snapshot, and
/// [`commit_read`](Self::commit_read) advances the ring only if no other
/// commit got there first, so a stale borrow is detected instead of
/// silently yielding torn data.
///
/// For this variant the header's `size`/`mask` are in slot units: `size`
/// holds the power-of-two slot capacity. One slot is kept free to tell a
/// full ring from an empty one, so the usable capacity is `size - 1`.
///
/// `T` must be `Copy`: slots live in shared memory and are duplicated
/// byte-for-byte across the process boundary.
pub struct SlotRing<T> {
    region: Arc<SharedRegion>,
    header_offset: usize,
    slots_offset: usize,
    capacity: u32,
    mask: u32,
    _marker: PhantomData<T>,
}

// Slot payloads are plain `Copy` data in the mapping; all index exchange
// goes through the header atomics.
unsafe impl<T: Copy + Send> Send for SlotRing<T> {}
unsafe impl<T: Copy + Send> Sync for SlotRing<T> {}

impl<T: Copy> SlotRing<T> {
    /// Initializes a fresh ring of `capacity` slots at `header_offset`.
    ///
    /// # Safety
    ///
    /// `header_offset` must be 64-byte aligned, the slot area must satisfy
    /// `T`'s alignment, and `header_offset + HEADER_SIZE +
    /// capacity * size_of::<T>()` must lie within the region. No other
    /// party may be using that range yet.
    pub(crate) unsafe fn create_at(
        region: Arc<SharedRegion>,
        header_offset: usize,
        capacity: u32,
    ) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity >= 2);
        debug_assert!(
            header_offset + HEADER_SIZE + capacity as usize * size_of::<T>() <= region.len()
        );

        let ring = Self {
            region,
            header_offset,
            slots_offset: header_offset + HEADER_SIZE,
            capacity,
            mask: capacity - 1,
            _marker: PhantomData,
        };
        ring.header().init(capacity);
        ring
    }

    /// Attaches to a ring previously initialized by a peer.
    ///
    /// # Safety
    ///
    /// Same layout requirements as [`create_at`](Self::create_at), and the
    /// peer must have laid the ring out for the same `T`.
    pub(crate) unsafe fn open_at(region: Arc<SharedRegion>, header_offset: usize) -> Result<Self> {
        if header_offset + HEADER_SIZE > region.len() {
            return Err(ShmError::InvalidParam("ring header outside region"));
        }

        let header = unsafe { &*(region.as_ptr().add(header_offset) as *const RingHeader) };
        let capacity = header.size.load(Ordering::Acquire);
        if capacity == 0 {
            return Err(ShmError::NotFound);
        }
        if !capacity.is_power_of_two() || capacity < 2 {
            return Err(ShmError::InvalidParam("slot capacity is not a power of two"));
        }
        if header_offset + HEADER_SIZE + capacity as usize * size_of::<T>() > region.len() {
            return Err(ShmError::InvalidParam("slot area outside region"));
        }

        Ok(Self {
            region,
            header_offset,
            slots_offset: header_offset + HEADER_SIZE,
            capacity,
            mask: capacity - 1,
            _marker: PhantomData,
        })
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.region.as_ptr().add(self.header_offset) as *const RingHeader) }
    }

    fn slot_ptr(&self, pos: u32) -> *mut T {
        unsafe {
            self.region
                .as_ptr()
                .add(self.slots_offset + (pos & self.mask) as usize * size_of::<T>())
                .cast::<T>()
        }
    }

    /// Usable slot count (one slot stays free to mark the full state).
    pub fn capacity(&self) -> u32 {
        self.capacity - 1
    }

    /// Number of committed, unread items.
    pub fn len(&self) -> u32 {
        let header = self.header();
        let write_pos = header.write_pos.load(Ordering::Acquire);
        let read_pos = header.read_pos.load(Ordering::Acquire);
        write_pos.wrapping_sub(read_pos) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Attempts to copy `item` into the next free slot.
    ///
    /// Returns `false`, leaving nothing observable to the reader, when the
    /// ring is full at the moment the position update would commit. This
    /// is expected backpressure, not a fault; there are no internal
    /// retries beyond the position CAS itself.
    pub fn try_write(&self, item: &T) -> bool {
        let header = self.header();
        let mut write_pos = header.write_pos.load(Ordering::Relaxed);
        let backoff = Backoff::new();

        loop {
            let read_pos = header.read_pos.load(Ordering::Acquire);
            let next = write_pos.wrapping_add(1) & self.mask;
            if next == read_pos {
                return false;
            }

            // Slot bytes land before the position is published; the
            // release CAS makes them visible together.
            unsafe { self.slot_ptr(write_pos).write(*item) };

            match header.write_pos.compare_exchange_weak(
                write_pos,
                next,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => {
                    write_pos = current;
                    backoff.snooze();
                }
            }
        }
    }

    /// Borrows the slot at the read head without consuming it.
    ///
    /// Returns the borrow together with the current sequence snapshot,
    /// which must be handed back to [`commit_read`](Self::commit_read).
    /// `None` means the ring is empty.
    pub fn try_read_borrow(&self) -> Option<(&T, u32)> {
        let header = self.header();
        let read_pos = header.read_pos.load(Ordering::Relaxed);
        let write_pos = header.write_pos.load(Ordering::Acquire);
        if read_pos == write_pos {
            return None;
        }

        let sequence = header.sequence.load(Ordering::Acquire);
        Some((unsafe { &*self.slot_ptr(read_pos) }, sequence))
    }

    /// Consumes the borrowed slot if `sequence_snapshot` is still current.
    ///
    /// Returns `false` when another commit advanced the ring since the
    /// borrow was taken (the borrow is stale and must be retried), or when
    /// the ring is empty. On success the read head advances and the
    /// sequence is bumped, invalidating all other outstanding snapshots.
    ///
    /// Racing commits are serialized on the sequence word: of all commits
    /// carrying the same snapshot, exactly one wins the sequence CAS and
    /// advances the read head; every other caller observes `false`.
    pub fn commit_read(&self, sequence_snapshot: u32) -> bool {
        let header = self.header();
        let mut read_pos = header.read_pos.load(Ordering::Relaxed);
        if read_pos == header.write_pos.load(Ordering::Acquire) {
            return false;
        }

        if header
            .sequence
            .compare_exchange(
                sequence_snapshot,
                sequence_snapshot.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        // Sole winner for this snapshot: advance the read head.
        let backoff = Backoff::new();
        loop {
            let next = read_pos.wrapping_add(1) & self.mask;
            match header.read_pos.compare_exchange_weak(
                read_pos,
                next,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => {
                    read_pos = current;
                    backoff.snooze();
                }
            }
        }
    }

    /// Borrow-copy-commit convenience: pops the next item by value.
    ///
    /// Retries internally when a concurrent commit staled the borrow.
    pub fn try_read(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let (item, sequence) = self.try_read_borrow()?;
            let copy = *item;
            if self.commit_read(sequence) {
                return Some(copy);
            }
            backoff.snooze();
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn ring<T: Copy>(tag: &str, capacity: u32) -> SlotRing<T> {
        let shm_name = format!("/shm_duplex_slot_{}_{}", tag, std::process::id());
        let len = HEADER_SIZE + capacity as usize * size_of::<T>();
        let region = Arc::new(SharedRegion::create(&shm_name, len).expect("region"));
        unsafe { SlotRing::create_at(region, 0, capacity) }
    }

    #[test]
    fn roundtrip_preserves_order_and_values() {
        let ring: SlotRing<u64> = ring("roundtrip", 8);

        for i in 0u64..5 {
            assert!(ring.try_write(&(i * 100)), "ring should have space");
        }
        assert_eq!(ring.len(), 5);

        for i in 0u64..5 {
            assert_eq!(ring.try_read(), Some(i * 100), "FIFO order");
        }
        assert!(ring.is_empty());
        assert_eq!(ring.try_read(), None);
    }

    #[test]
    fn full_ring_rejects_writes_without_overwriting() {
        let ring: SlotRing<u32> = ring("full", 4);

        // Capacity 4 means 3 usable slots.
        assert!(ring.try_write(&1));
        assert!(ring.try_write(&2));
        assert!(ring.try_write(&3));
        assert!(ring.is_full());
        assert!(!ring.try_write(&4), "full ring must reject");

        // The rejected write must not have disturbed committed data.
        assert_eq!(ring.try_read(), Some(1));
        assert!(ring.try_write(&4), "space freed by the read");
        assert_eq!(ring.try_read(), Some(2));
        assert_eq!(ring.try_read(), Some(3));
        assert_eq!(ring.try_read(), Some(4));
    }

    #[test]
    fn borrow_then_commit_consumes_exactly_once() {
        let ring: SlotRing<u32> = ring("commit", 8);
        ring.try_write(&77);

        let (value, sequence) = ring.try_read_borrow().expect("data present");
        assert_eq!(*value, 77);
        assert!(ring.commit_read(sequence), "fresh snapshot must commit");
        assert!(
            !ring.commit_read(sequence),
            "the same snapshot must be stale after the commit"
        );
    }

    #[test]
    fn commit_on_empty_ring_is_rejected() {
        let ring: SlotRing<u32> = ring("empty_commit", 8);
        assert!(ring.try_read_borrow().is_none());
        assert!(!ring.commit_read(0), "nothing to commit on an empty ring");
    }

    #[test]
    fn wraparound_many_times() {
        let ring: SlotRing<u16> = ring("wrap", 4);

        for i in 0u16..100 {
            assert!(ring.try_write(&i));
            assert_eq!(ring.try_read(), Some(i));
        }
    }

    #[test]
    fn racing_commits_let_exactly_one_win() {
        let ring: Arc<SlotRing<u32>> = Arc::new(ring("race", 8));
        ring.try_write(&1);
        ring.try_write(&2);

        let (a, seq_a) = ring.try_read_borrow().unwrap();
        assert_eq!(*a, 1);
        let snapshot = seq_a;

        let successes = Arc::new(AtomicU32::new(0));
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let ring = Arc::clone(&ring);
                let successes = Arc::clone(&successes);
                std::thread::spawn(move || {
                    if ring.commit_read(snapshot) {
                        successes.fetch_add(1, Ordering::AcqRel);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(
            successes.load(Ordering::Acquire),
            1,
            "exactly one racing commit may win"
        );
        // The ring state must look like a single-threaded commit: one item
        // consumed, the next still in place.
        assert_eq!(ring.len(), 1);
        let (b, _) = ring.try_read_borrow().unwrap();
        assert_eq!(*b, 2);
    }

    #[test]
    fn struct_payloads_survive_the_ring() {
        #[derive(Clone, Copy, Debug, PartialEq)]
        #[repr(C)]
        struct Tick {
            id: u64,
            price: i64,
            flags: u32,
        }

        let ring: SlotRing<Tick> = ring("struct", 8);
        let tick = Tick {
            id: 42,
            price: -1_000_000,
            flags: 0xDEAD_BEEF,
        };
        assert!(ring.try_write(&tick));
        assert_eq!(ring.try_read(), Some(tick));
    }
}
