use std::sync::Arc;

use crate::channel::{CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY};
use crate::error::{Result, ShmError};
use crate::events::{EventKind, EventRole, EventSet};
use crate::layout::HEADER_SIZE;
use crate::region::{self, SharedRegion};
use crate::slot_ring::SlotRing;

/// A bidirectional typed channel over two fixed-slot rings.
///
/// One region per direction: `/SHM_<name>_tx` carries server-to-client
/// traffic, `/SHM_<name>_rx` client-to-server. Both rings reject writes
/// when full; nothing is ever overwritten. This is the reject-full
/// counterpart of the bytestream endpoints — the two flavors are separate
/// types on purpose and cannot be mixed on one name.
///
/// `T` must be `Copy` and both sides must agree on its layout; `repr(C)`
/// payloads are the safe choice.
///
/// Exactly one process per role. Within a process the channel is `Sync`,
/// but the single-producer/single-consumer discipline per direction is the
/// caller's to uphold: give each direction one writing thread and one
/// reading thread.
pub struct SlotChannel<T: Copy> {
    outbound: SlotRing<T>,
    inbound: SlotRing<T>,
    events: Arc<EventSet>,
    is_server: bool,
    attached: bool,
}

impl<T: Copy> SlotChannel<T> {
    /// Creates both regions and the event set (server role).
    ///
    /// `capacity` is the slot count per direction, rounded up to a power
    /// of two (minimum 2); one slot per ring stays unusable to mark the
    /// full state.
    pub fn create_server(name: &str, capacity: u32) -> Result<Self> {
        region::validate_name(name)?;
        if align_of::<T>() > HEADER_SIZE {
            return Err(ShmError::InvalidParam("slot alignment exceeds header size"));
        }
        if capacity == 0 {
            return Err(ShmError::InvalidParam("slot capacity is zero"));
        }
        if capacity > 1 << 24 {
            return Err(ShmError::InvalidParam("slot capacity too large"));
        }
        let capacity = capacity.max(2).next_power_of_two();

        let slot_bytes = (capacity as usize)
            .checked_mul(size_of::<T>())
            .filter(|&b| b <= 1 << 30)
            .ok_or(ShmError::InvalidParam("slot area too large"))?;
        let total = HEADER_SIZE + slot_bytes;

        let events = Arc::new(EventSet::with_role(name, EventRole::Server)?);
        let tx_region = Arc::new(SharedRegion::create(
            &region::slot_region_name(name, "tx"),
            total,
        )?);
        let rx_region = Arc::new(SharedRegion::create(
            &region::slot_region_name(name, "rx"),
            total,
        )?);

        let (outbound, inbound) = unsafe {
            (
                SlotRing::create_at(tx_region, 0, capacity),
                SlotRing::create_at(rx_region, 0, capacity),
            )
        };

        Ok(Self {
            outbound,
            inbound,
            events,
            is_server: true,
            attached: false,
        })
    }

    /// Opens the regions created by a server (client role), with the same
    /// bounded retry as the bytestream client, and attaches to the inbound
    /// reader counter.
    pub fn connect_client(name: &str) -> Result<Self> {
        region::validate_name(name)?;
        if align_of::<T>() > HEADER_SIZE {
            return Err(ShmError::InvalidParam("slot alignment exceeds header size"));
        }

        let tx_region = Arc::new(region::open_with_retry(
            || SharedRegion::open(&region::slot_region_name(name, "tx")),
            CONNECT_ATTEMPTS,
            CONNECT_RETRY_DELAY,
        )?);
        let rx_region = Arc::new(region::open_with_retry(
            || SharedRegion::open(&region::slot_region_name(name, "rx")),
            CONNECT_ATTEMPTS,
            CONNECT_RETRY_DELAY,
        )?);
        let events = Arc::new(EventSet::with_role(name, EventRole::Client)?);

        // The client reads the server's tx ring and writes its rx ring.
        let (inbound, outbound) = unsafe {
            let mut attempt = 0;
            loop {
                match (
                    SlotRing::open_at(Arc::clone(&tx_region), 0),
                    SlotRing::open_at(Arc::clone(&rx_region), 0),
                ) {
                    (Ok(inbound), Ok(outbound)) => break (inbound, outbound),
                    (Err(ShmError::NotFound), _) | (_, Err(ShmError::NotFound))
                        if attempt < CONNECT_ATTEMPTS =>
                    {
                        attempt += 1;
                        std::thread::sleep(CONNECT_RETRY_DELAY);
                    }
                    (Err(e), _) | (_, Err(e)) => return Err(e),
                }
            }
        };

        inbound.attach_reader();

        Ok(Self {
            outbound,
            inbound,
            events,
            is_server: false,
            attached: true,
        })
    }

    /// The ring this endpoint writes.
    pub fn outbound(&self) -> &SlotRing<T> {
        &self.outbound
    }

    /// The ring this endpoint reads.
    pub fn inbound(&self) -> &SlotRing<T> {
        &self.inbound
    }

    /// Writes one item and signals the data event on success.
    ///
    /// `false` is backpressure: the ring is full and the item was not
    /// enqueued.
    pub fn try_send(&self, item: &T) -> bool {
        let written = self.outbound.try_write(item);
        if written {
            self.events.signal(EventKind::DataAvailable);
        }
        written
    }

    /// Pops one item by value, signalling freed space.
    pub fn try_receive(&self) -> Option<T> {
        let item = self.inbound.try_read();
        if item.is_some() {
            self.events.signal(EventKind::SpaceAvailable);
        }
        item
    }

    /// Whether a consumer is currently attached to this endpoint's
    /// outbound ring.
    pub fn peer_attached(&self) -> bool {
        self.outbound.active_readers() > 0
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// The channel's event set, for callers that wait on
    /// [`EventKind::DataAvailable`] themselves.
    pub fn events(&self) -> &Arc<EventSet> {
        &self.events
    }
}

impl<T: Copy> Drop for SlotChannel<T> {
    fn drop(&mut self) {
        if self.attached {
            self.inbound.detach_reader();
            self.attached = false;
        }
        if !self.is_server {
            self.events.signal(EventKind::Disconnect);
        }
    }
}
