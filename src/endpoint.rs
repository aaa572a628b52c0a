use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::byte_ring::ByteRing;
use crate::channel::{ChannelConfig, DualChannel};
use crate::error::{Result, ShmError};
use crate::events::{EventKind, EventSet};
use crate::listener::Listener;

/// Watches the attached-reader counter of the server's outbound ring and
/// turns its edges into Connect/Disconnect events.
///
/// There is no application-level hello: a client announces itself purely
/// by incrementing `active_readers` when it maps its inbound ring, and
/// departs by decrementing it. The watcher is polled from the listener's
/// idle hook and defensively at the start of every data-path call, so a
/// transition is observed within one poll period at the latest.
///
/// Known limitation, inherent to the counter scheme: a peer that dies
/// without unmapping leaves the counter stale until the OS reclaims the
/// mapping, and a peer that attaches and detaches entirely between two
/// polls is never observed.
pub(crate) struct PresenceWatch {
    ring: Arc<ByteRing>,
    connected: AtomicBool,
    last_known_readers: AtomicU32,
    max_readers: u32,
}

impl PresenceWatch {
    fn new(ring: Arc<ByteRing>, max_readers: u32) -> Self {
        Self {
            ring,
            connected: AtomicBool::new(false),
            last_known_readers: AtomicU32::new(0),
            max_readers,
        }
    }

    pub(crate) fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Samples the counter and signals on a transition.
    ///
    /// Returns `true` when the presence state changed.
    pub(crate) fn poll(&self, events: &EventSet) -> bool {
        let readers = self.ring.active_readers();
        if readers > self.max_readers {
            tracing::warn!(
                readers,
                max_readers = self.max_readers,
                "attached reader count exceeds the configured bound"
            );
        }

        if readers > 0 {
            self.last_known_readers.store(readers, Ordering::Release);
            if self
                .connected
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::info!(readers, "peer attached");
                events.signal(EventKind::Connect);
                return true;
            }
        } else if self
            .connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let previous = self.last_known_readers.swap(0, Ordering::AcqRel);
            tracing::info!(previous_readers = previous, "peer detached");
            events.signal(EventKind::Disconnect);
            return true;
        }
        false
    }
}

/// Server end of a named bytestream channel.
///
/// Creates the shared region and event set, then waits for a client to
/// attach. Records flow through two overwrite-oldest rings, so `send`
/// never blocks on a slow peer; under overrun the peer sees the most
/// recent contiguous suffix.
///
/// Delivery is best-effort by contract: while no client is attached,
/// `send` silently discards the record and still reports success.
///
/// Dropping the endpoint (or calling [`close`](Self::close)) stops the
/// listener, signals Disconnect to the peer, and releases the shared
/// objects; the region name disappears once the last mapping is gone.
pub struct ShmServer {
    name: String,
    channel: DualChannel,
    presence: Arc<PresenceWatch>,
    listener: Option<Listener>,
    closed: bool,
}

impl ShmServer {
    /// Creates the channel objects and starts in the not-connected state.
    pub fn create(name: &str, config: &ChannelConfig) -> Result<Self> {
        let channel = DualChannel::create_server(name, config)?;
        let presence = Arc::new(PresenceWatch::new(
            channel.outbound_arc(),
            config.max_readers,
        ));
        tracing::debug!(name, "server created, waiting for a peer");

        Ok(Self {
            name: name.to_owned(),
            channel,
            presence,
            listener: None,
            closed: false,
        })
    }

    /// Sends one record to the client.
    ///
    /// With no client attached the record is dropped and `Ok(())` is
    /// returned — the channel promises delivery only while someone is
    /// listening. Malformed records (empty, oversize) fail with
    /// [`ShmError::InvalidParam`] regardless of presence.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.presence.poll(self.channel.events());
        if !self.presence.connected() {
            tracing::trace!(len = bytes.len(), "no peer attached, dropping record");
            return Ok(());
        }
        self.channel.outbound().write(bytes)
    }

    /// Receives one record from the client into `out`.
    ///
    /// Blocking behavior follows the creation config: [`ShmError::Empty`]
    /// for a quiet non-blocking read, [`ShmError::Timeout`] when a
    /// blocking wait expires.
    pub fn receive(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(ShmError::Empty);
        }
        self.presence.poll(self.channel.events());
        self.channel.inbound().read(out)
    }

    /// Copies the next inbound record into `out` without consuming it.
    ///
    /// Repeated peeks return the same record until a
    /// [`receive`](Self::receive) advances the ring.
    pub fn peek(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(ShmError::Empty);
        }
        self.channel.inbound().peek(out)
    }

    /// Installs the event callback and starts the background listener.
    ///
    /// The callback observes every kind in [`EventKind`]; Connect and
    /// Disconnect are produced by the presence watcher, which runs on each
    /// listener poll timeout. Registering again replaces the previous
    /// callback.
    ///
    /// Presence kinds are delivered strictly alternating: a Disconnect can
    /// reach the event set twice for one departure (once from the peer's
    /// teardown, once from the watcher), so duplicates are filtered here
    /// and every Connect the callback sees is paired with exactly one
    /// Disconnect before the next Connect.
    pub fn register_callback(
        &mut self,
        callback: impl Fn(EventKind) + Send + Sync + 'static,
    ) -> Result<()> {
        if self.closed {
            return Err(ShmError::InvalidParam("endpoint is closed"));
        }
        if let Some(mut old) = self.listener.take() {
            old.stop();
        }

        let events = Arc::clone(self.channel.events());
        let presence = Arc::clone(&self.presence);
        let on_idle = move || {
            presence.poll(&events);
        };

        let delivered_connected = AtomicBool::new(false);
        let wrapped = move |kind: EventKind| match kind {
            EventKind::Connect => {
                if !delivered_connected.swap(true, Ordering::AcqRel) {
                    callback(EventKind::Connect);
                }
            }
            EventKind::Disconnect => {
                if delivered_connected.swap(false, Ordering::AcqRel) {
                    callback(EventKind::Disconnect);
                }
            }
            other => callback(other),
        };

        self.listener = Some(Listener::start(
            Arc::clone(self.channel.events()),
            Box::new(wrapped),
            Some(Box::new(on_idle)),
        )?);
        Ok(())
    }

    /// Whether a client is currently attached, as of the last poll.
    pub fn peer_present(&self) -> bool {
        self.presence.connected()
    }

    /// Polls presence right now and reports the current state.
    pub fn check_peer(&self) -> bool {
        self.presence.poll(self.channel.events());
        self.presence.connected()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the listener and signals Disconnect to the peer.
    ///
    /// Idempotent: the second and later calls do nothing. The shared
    /// mappings themselves are released when the endpoint is dropped.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        self.channel.events().signal(EventKind::Disconnect);
        tracing::debug!(name = %self.name, "server closed");
    }
}

impl Drop for ShmServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Client end of a named bytestream channel.
///
/// Opens the objects a [`ShmServer`] created, retrying for roughly half a
/// second to tolerate a server that is still starting, and attaches itself
/// to the reader counter the server's presence watcher observes. The
/// client counts as connected from the moment both mappings succeed; it
/// learns of server departure through the Disconnect event, which flips
/// [`connected`](Self::connected) once a callback is registered.
pub struct ShmClient {
    name: String,
    channel: DualChannel,
    connected: Arc<AtomicBool>,
    listener: Option<Listener>,
    closed: bool,
}

impl ShmClient {
    /// Connects with the default configuration (blocking reads, 5 s
    /// timeout).
    pub fn connect(name: &str) -> Result<Self> {
        Self::connect_with(name, &ChannelConfig::default())
    }

    /// Connects with explicit read-side options.
    ///
    /// `size` and `max_readers` in `config` are ignored: the ring geometry
    /// is fixed by the server and read from the shared header.
    pub fn connect_with(name: &str, config: &ChannelConfig) -> Result<Self> {
        let channel = DualChannel::open_client(name, config)?;
        tracing::debug!(name, "client connected");

        Ok(Self {
            name: name.to_owned(),
            channel,
            connected: Arc::new(AtomicBool::new(true)),
            listener: None,
            closed: false,
        })
    }

    /// Sends one record to the server.
    ///
    /// After the server has departed (observed via Disconnect) or the
    /// endpoint was closed, records are silently dropped with `Ok(())`,
    /// mirroring the server's best-effort contract.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed || !self.connected() {
            tracing::trace!(len = bytes.len(), "not connected, dropping record");
            return Ok(());
        }
        self.channel.outbound().write(bytes)
    }

    /// Receives one record from the server into `out`.
    pub fn receive(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.closed || !self.connected() {
            return Err(ShmError::Empty);
        }
        self.channel.inbound().read(out)
    }

    /// Copies the next inbound record into `out` without consuming it.
    pub fn peek(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.closed || !self.connected() {
            return Err(ShmError::Empty);
        }
        self.channel.inbound().peek(out)
    }

    /// Installs the event callback and starts the background listener.
    ///
    /// The endpoint additionally reacts to Disconnect itself by dropping
    /// into the not-connected state before the callback runs.
    pub fn register_callback(
        &mut self,
        callback: impl Fn(EventKind) + Send + Sync + 'static,
    ) -> Result<()> {
        if self.closed {
            return Err(ShmError::InvalidParam("endpoint is closed"));
        }
        if let Some(mut old) = self.listener.take() {
            old.stop();
        }

        let connected = Arc::clone(&self.connected);
        let wrapped = move |kind: EventKind| {
            if kind == EventKind::Disconnect {
                connected.store(false, Ordering::Release);
            }
            callback(kind);
        };

        self.listener = Some(Listener::start(
            Arc::clone(self.channel.events()),
            Box::new(wrapped),
            None,
        )?);
        Ok(())
    }

    /// Whether this endpoint still considers the server present.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Detaches from the server: stops the listener, removes this reader
    /// from the attach counter, and signals Disconnect.
    ///
    /// Idempotent. The detach is performed eagerly so the server's next
    /// presence poll observes the departure even while this endpoint
    /// lingers before being dropped.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.connected.store(false, Ordering::Release);
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        self.channel.detach();
        self.channel.events().signal(EventKind::Disconnect);
        tracing::debug!(name = %self.name, "client disconnected");
    }
}

impl Drop for ShmClient {
    fn drop(&mut self) {
        self.close();
    }
}
