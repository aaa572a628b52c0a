use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Result, ShmError};
use crate::events::{EventKind, EventSet};

/// How long one `wait_any` pass sleeps before the listener runs its
/// periodic work (peer-presence polling).
pub(crate) const LISTENER_POLL: Duration = Duration::from_millis(100);

/// Background task that waits on an [`EventSet`] and dispatches a user
/// callback, owned by an endpoint.
///
/// Started lazily on the first callback registration; stopped
/// cooperatively: the stop flag is raised, a Disconnect signal kicks the
/// waiter out of its sleep, and the thread is joined. There is no forced
/// termination. Every poll timeout runs `on_idle`, which is where the
/// server hangs its presence check.
pub(crate) struct Listener {
    stop: Arc<AtomicBool>,
    events: Arc<EventSet>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Listener {
    /// Spawns the listener thread.
    ///
    /// Thread creation failure surfaces as [`ShmError::Memory`].
    pub(crate) fn start(
        events: Arc<EventSet>,
        callback: Box<dyn Fn(EventKind) + Send + Sync + 'static>,
        on_idle: Option<Box<dyn Fn() + Send + Sync + 'static>>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = Arc::clone(&stop);
            let events = Arc::clone(&events);
            std::thread::Builder::new()
                .name("shm-duplex-listener".into())
                .spawn(move || run(&stop, &events, &callback, on_idle.as_deref()))
                .map_err(ShmError::Memory)?
        };

        Ok(Self {
            stop,
            events,
            handle: Some(handle),
        })
    }

    /// Raises the stop flag, kicks the waiter, and joins the thread.
    ///
    /// Idempotent; also runs on drop.
    pub(crate) fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.store(true, Ordering::Release);
            self.events.signal(EventKind::Disconnect);
            let _ = handle.join();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    stop: &AtomicBool,
    events: &EventSet,
    callback: &(dyn Fn(EventKind) + Send + Sync),
    on_idle: Option<&(dyn Fn() + Send + Sync)>,
) {
    while !stop.load(Ordering::Acquire) {
        match events.wait_any(Some(LISTENER_POLL)) {
            Ok(kind) => {
                // A Disconnect raised by stop() lands here; do not hand
                // the shutdown kick to the user.
                if stop.load(Ordering::Acquire) {
                    break;
                }
                callback(kind);
            }
            Err(ShmError::Timeout) => {
                if let Some(idle) = on_idle {
                    idle();
                }
            }
            Err(e) => {
                // Kernel-level wait failure: report once through the
                // callback's Error kind and shut the listener down.
                tracing::warn!(error = %e, "listener wait failed");
                callback(EventKind::Error);
                break;
            }
        }
    }
}
