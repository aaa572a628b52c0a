use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::error::{Result, ShmError};
use crate::futex::{futex_wait, futex_wake};
use crate::region::{self, SharedRegion};

/// Wake-up kinds delivered through an [`EventSet`].
///
/// The set of kinds is data, not code: creation, indexing, and
/// [`EventSet::wait_any`] all iterate [`EventKind::ALL`], so adding a kind
/// is a table edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A record was published into a ring.
    DataAvailable,
    /// A record was consumed, freeing space.
    SpaceAvailable,
    /// A peer detached, or an endpoint is tearing down.
    Disconnect,
    /// An out-of-band fault; delivered through the callback with no payload.
    Error,
    /// A peer attached.
    Connect,
}

impl EventKind {
    /// All kinds, in slot order. The order is part of the shared layout.
    pub const ALL: [EventKind; 5] = [
        EventKind::DataAvailable,
        EventKind::SpaceAvailable,
        EventKind::Disconnect,
        EventKind::Error,
        EventKind::Connect,
    ];

    fn index(self) -> usize {
        match self {
            EventKind::DataAvailable => 0,
            EventKind::SpaceAvailable => 1,
            EventKind::Disconnect => 2,
            EventKind::Error => 3,
            EventKind::Connect => 4,
        }
    }
}

const EVENT_COUNT: usize = EventKind::ALL.len();

/// Shared layout of the event block.
///
/// Each slot is a cache-padded futex word holding 0 (unsignalled) or
/// 1 (signalled). `any_seq` is bumped on every signal so `wait_any` has a
/// single word to sleep on.
#[repr(C)]
struct EventBlock {
    slots: [CachePadded<AtomicU32>; EVENT_COUNT],
    any_seq: CachePadded<AtomicU32>,
}

/// The role an endpoint plays towards a named event block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRole {
    /// Creates the block; fails if it already exists.
    Server,
    /// Opens an existing block; fails if it is missing.
    Client,
}

/// A named set of process-shared, auto-reset wake-up slots.
///
/// Each slot is auto-reset: a signal transitions it to signalled and wakes
/// at most one waiter; the waiter that consumes the signal returns the slot
/// to the unsignalled state. Signals coalesce — signalling an
/// already-signalled slot is a no-op.
pub struct EventSet {
    region: SharedRegion,
}

impl EventSet {
    /// Creates (server role) or opens (client role) the event block of
    /// channel `name`.
    pub fn with_role(name: &str, role: EventRole) -> Result<Self> {
        region::validate_name(name)?;
        let shm_name = region::event_region_name(name);
        let region = match role {
            EventRole::Server => {
                let region = SharedRegion::create(&shm_name, size_of::<EventBlock>())?;
                // ftruncate zero-filled the mapping, which is exactly the
                // unsignalled state, so no further initialization is needed.
                region
            }
            EventRole::Client => {
                let region = SharedRegion::open(&shm_name)?;
                if region.len() < size_of::<EventBlock>() {
                    return Err(ShmError::InvalidParam("event block truncated"));
                }
                region
            }
        };
        Ok(Self { region })
    }

    fn block(&self) -> &EventBlock {
        // The region is at least size_of::<EventBlock>() (checked at
        // construction) and page-aligned, which satisfies the block's
        // alignment.
        unsafe { &*(self.region.as_ptr() as *const EventBlock) }
    }

    fn slot(&self, kind: EventKind) -> &AtomicU32 {
        &self.block().slots[kind.index()]
    }

    /// Signals `kind`, waking at most one waiter.
    ///
    /// A failing wake is logged and otherwise dropped: the slot is already
    /// marked signalled, so any waiter that shows up later still consumes
    /// it, and the waiters' bounded sleeps re-check regardless.
    pub fn signal(&self, kind: EventKind) {
        let block = self.block();
        if block.slots[kind.index()].swap(1, Ordering::AcqRel) == 0 {
            block.any_seq.fetch_add(1, Ordering::Release);
            if let Err(e) = futex_wake(self.slot(kind), 1) {
                tracing::warn!(?kind, error = %e, "event wake failed");
            }
            if let Err(e) = futex_wake(&block.any_seq, 1) {
                tracing::warn!(?kind, error = %e, "event wake failed");
            }
        }
    }

    /// Blocks until `kind` is signalled or `timeout` elapses.
    ///
    /// `None` waits indefinitely. Consuming the signal resets the slot.
    /// A kernel-level wait failure surfaces as [`ShmError::Access`].
    pub fn wait(&self, kind: EventKind, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let slot = self.slot(kind);

        loop {
            if slot
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }

            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(ShmError::Timeout);
                    }
                    Some(d - now)
                }
                None => None,
            };
            futex_wait(slot, 0, remaining).map_err(ShmError::Access)?;
        }
    }

    /// Blocks until any slot is signalled, returning which kind fired.
    ///
    /// Uses the snapshot / re-scan / wait pattern against `any_seq` to
    /// avoid losing a wake between the scan and the sleep. A kernel-level
    /// wait failure surfaces as [`ShmError::Access`].
    pub fn wait_any(&self, timeout: Option<Duration>) -> Result<EventKind> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let block = self.block();

        loop {
            if let Some(kind) = self.try_consume_any() {
                return Ok(kind);
            }

            let seq = block.any_seq.load(Ordering::Acquire);

            // Re-scan: a signal may have landed between the scan above and
            // the sequence snapshot.
            if let Some(kind) = self.try_consume_any() {
                return Ok(kind);
            }

            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(ShmError::Timeout);
                    }
                    Some(d - now)
                }
                None => None,
            };
            futex_wait(&block.any_seq, seq, remaining).map_err(ShmError::Access)?;
        }
    }

    fn try_consume_any(&self) -> Option<EventKind> {
        for kind in EventKind::ALL {
            if self
                .slot(kind)
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(kind);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn unique_name(tag: &str) -> String {
        format!("shm_duplex_events_{}_{}", tag, std::process::id())
    }

    #[test]
    fn signal_then_wait_consumes_once() {
        let name = unique_name("once");
        let set = EventSet::with_role(&name, EventRole::Server).unwrap();

        set.signal(EventKind::DataAvailable);
        set.wait(EventKind::DataAvailable, Some(Duration::from_millis(100)))
            .expect("signalled slot must be consumable");

        // Auto-reset: the second wait must time out.
        assert!(matches!(
            set.wait(EventKind::DataAvailable, Some(Duration::from_millis(20))),
            Err(ShmError::Timeout)
        ));
    }

    #[test]
    fn signals_coalesce() {
        let name = unique_name("coalesce");
        let set = EventSet::with_role(&name, EventRole::Server).unwrap();

        set.signal(EventKind::Connect);
        set.signal(EventKind::Connect);
        set.signal(EventKind::Connect);

        set.wait(EventKind::Connect, Some(Duration::from_millis(100)))
            .unwrap();
        assert!(matches!(
            set.wait(EventKind::Connect, Some(Duration::from_millis(20))),
            Err(ShmError::Timeout)
        ));
    }

    #[test]
    fn wait_any_reports_which_kind_fired() {
        let name = unique_name("which");
        let set = EventSet::with_role(&name, EventRole::Server).unwrap();

        set.signal(EventKind::Disconnect);
        let kind = set.wait_any(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(kind, EventKind::Disconnect);
    }

    #[test]
    fn wait_any_times_out_when_quiet() {
        let name = unique_name("quiet");
        let set = EventSet::with_role(&name, EventRole::Server).unwrap();

        let start = Instant::now();
        assert!(matches!(
            set.wait_any(Some(Duration::from_millis(30))),
            Err(ShmError::Timeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn client_role_requires_existing_block() {
        let name = unique_name("missing");
        assert!(matches!(
            EventSet::with_role(&name, EventRole::Client),
            Err(ShmError::NotFound)
        ));
    }

    #[test]
    fn cross_handle_signal_wakes_waiter() {
        let name = unique_name("cross");
        let server = Arc::new(EventSet::with_role(&name, EventRole::Server).unwrap());
        let client = EventSet::with_role(&name, EventRole::Client).unwrap();

        let waiter = {
            let server = Arc::clone(&server);
            std::thread::spawn(move || server.wait_any(Some(Duration::from_secs(2))))
        };

        std::thread::sleep(Duration::from_millis(20));
        client.signal(EventKind::SpaceAvailable);

        let kind = waiter.join().unwrap().expect("waiter must be woken");
        assert_eq!(kind, EventKind::SpaceAvailable);
    }
}
