use std::sync::Arc;
use std::time::Duration;

use crate::byte_ring::ByteRing;
use crate::error::{Result, ShmError};
use crate::events::{EventRole, EventSet};
use crate::layout::HEADER_SIZE;
use crate::region::{self, SharedRegion};

/// How many times a client retries opening the server's objects, and how
/// long it sleeps between attempts (about 500 ms in total).
pub(crate) const CONNECT_ATTEMPTS: u32 = 50;
pub(crate) const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Options recognized when a channel is created.
///
/// The server fixes `size` at creation; a client inherits it from the
/// shared header. `blocking`/`timeout_ms` govern each endpoint's own
/// `receive` calls and may differ between the two sides.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Payload bytes per direction; rounded up to the next power of two.
    pub size: u32,
    /// Declared upper bound on attached readers, used for sanity checks
    /// only.
    pub max_readers: u32,
    /// Whether `receive` blocks until data or timeout.
    pub blocking: bool,
    /// Default timeout for blocking waits. Zero behaves like non-blocking.
    pub timeout_ms: u32,
}

impl Default for ChannelConfig {
    /// 4 MiB per direction, blocking reads with a 5 second timeout.
    fn default() -> Self {
        Self {
            size: 4 * 1024 * 1024,
            max_readers: 4,
            blocking: true,
            timeout_ms: 5000,
        }
    }
}

impl ChannelConfig {
    /// The ring size that will actually be used: the requested size rounded
    /// up to the next power of two, with a warning when it was adjusted.
    ///
    /// The floor of 64 bytes keeps every ring header in the region on its
    /// own cache-line boundary.
    pub(crate) fn effective_size(&self) -> Result<u32> {
        if self.size == 0 {
            return Err(ShmError::InvalidParam("ring size is zero"));
        }
        if self.size > 1 << 30 {
            return Err(ShmError::InvalidParam("ring size exceeds 1 GiB"));
        }
        let size = self.size.max(HEADER_SIZE as u32).next_power_of_two();
        if size != self.size {
            tracing::warn!(
                requested = self.size,
                adjusted = size,
                "ring size rounded up to the next power of two"
            );
        }
        Ok(size)
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms as u64)
    }
}

/// A bidirectional bytestream channel: two [`ByteRing`]s in one shared
/// region plus the event set, bound to one endpoint role.
///
/// Region layout (`/SHM_<name>`):
///
/// ```text
/// offset 0:             server-to-client ring header
/// offset 64:            server-to-client payload (size bytes)
/// offset 64 + size:     client-to-server ring header
/// offset 128 + size:    client-to-server payload (size bytes)
/// ```
///
/// The client attaches itself to its inbound ring's `active_readers`
/// counter on open and detaches on drop; that counter is what the server's
/// presence poll watches.
pub(crate) struct DualChannel {
    outbound: Arc<ByteRing>,
    inbound: Arc<ByteRing>,
    events: Arc<EventSet>,
    attached: bool,
}

impl DualChannel {
    /// Creates the region and event set and initializes both rings
    /// (server role).
    pub(crate) fn create_server(name: &str, config: &ChannelConfig) -> Result<Self> {
        region::validate_name(name)?;
        let size = config.effective_size()?;

        let events = Arc::new(EventSet::with_role(name, EventRole::Server)?);
        let total = 2 * HEADER_SIZE + 2 * size as usize;
        let region = Arc::new(SharedRegion::create(&region::data_region_name(name), total)?);

        let (outbound, inbound) = unsafe {
            let s2c = ByteRing::create_at(
                Arc::clone(&region),
                0,
                size,
                Arc::clone(&events),
                config.blocking,
                config.timeout(),
            );
            let c2s = ByteRing::create_at(
                region,
                HEADER_SIZE + size as usize,
                size,
                Arc::clone(&events),
                config.blocking,
                config.timeout(),
            );
            (s2c, c2s)
        };

        Ok(Self {
            outbound: Arc::new(outbound),
            inbound: Arc::new(inbound),
            events,
            attached: false,
        })
    }

    /// Opens the region and event set created by a server (client role)
    /// and attaches to the inbound reader counter.
    ///
    /// Retries for roughly half a second to tolerate a server that is
    /// still starting; a definitive failure surfaces as
    /// [`ShmError::NotFound`].
    pub(crate) fn open_client(name: &str, config: &ChannelConfig) -> Result<Self> {
        region::validate_name(name)?;

        let region = Arc::new(region::open_with_retry(
            || SharedRegion::open(&region::data_region_name(name)),
            CONNECT_ATTEMPTS,
            CONNECT_RETRY_DELAY,
        )?);
        let events = Arc::new(EventSet::with_role(name, EventRole::Client)?);

        // The client's inbound direction is the server's outbound ring,
        // which sits first in the region. Its header carries the size both
        // rings were created with.
        let open_both = || -> Result<(ByteRing, ByteRing)> {
            unsafe {
                let s2c = ByteRing::open_at(
                    Arc::clone(&region),
                    0,
                    Arc::clone(&events),
                    config.blocking,
                    config.timeout(),
                )?;
                let c2s = ByteRing::open_at(
                    Arc::clone(&region),
                    HEADER_SIZE + s2c.size() as usize,
                    Arc::clone(&events),
                    config.blocking,
                    config.timeout(),
                )?;
                Ok((s2c, c2s))
            }
        };

        // The creator publishes ring sizes after registering the name, so
        // ride out that window the same way as the name lookup itself.
        let mut attempt = 0;
        let (inbound, outbound) = loop {
            match open_both() {
                Ok(rings) => break rings,
                Err(ShmError::NotFound) if attempt < CONNECT_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(CONNECT_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        };

        let readers = inbound.attach_reader();
        tracing::debug!(name, readers, "client attached to inbound ring");

        Ok(Self {
            outbound: Arc::new(outbound),
            inbound: Arc::new(inbound),
            events,
            attached: true,
        })
    }

    pub(crate) fn outbound(&self) -> &ByteRing {
        &self.outbound
    }

    pub(crate) fn inbound(&self) -> &ByteRing {
        &self.inbound
    }

    /// The server's outbound ring, shared for presence watching.
    pub(crate) fn outbound_arc(&self) -> Arc<ByteRing> {
        Arc::clone(&self.outbound)
    }

    pub(crate) fn events(&self) -> &Arc<EventSet> {
        &self.events
    }

    /// Detaches from the inbound reader counter (client side).
    ///
    /// Idempotent; also runs on drop. Doing it eagerly lets an explicit
    /// close surface the detach to the server's presence poll before the
    /// mappings go away.
    pub(crate) fn detach(&mut self) {
        if self.attached {
            self.inbound.detach_reader();
            self.attached = false;
        }
    }
}

impl Drop for DualChannel {
    fn drop(&mut self) {
        self.detach();
    }
}
