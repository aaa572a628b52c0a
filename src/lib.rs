//! # Bidirectional shared-memory IPC channel
//!
//! A local inter-process channel built on a pair of named shared-memory
//! ring buffers: exactly one writer and one reader per direction, no
//! kernel copies on the data path, and futex-backed wake-ups so readers
//! can block instead of spinning.
//!
//! Two cooperating processes take the *server* and *client* roles. The
//! server creates the shared objects; the client opens them (with a short
//! retry window) and announces itself purely by incrementing the
//! attached-reader counter in the shared ring header — there is no
//! application-level handshake. The server's listener polls that counter
//! and turns its edges into Connect and Disconnect events.
//!
//! # Features
//!
//! * **Lock-free** SPSC ring buffers over POSIX shared memory
//! * **Two ring flavors** with non-overlapping contracts:
//!   * [`ShmServer`]/[`ShmClient`] carry length-prefixed byte records and
//!     **overwrite the oldest** records under overrun, preserving a
//!     contiguous most-recent suffix
//!   * [`SlotChannel`] carries fixed-size `Copy` values and **rejects**
//!     writes when full, with sequence-verified two-phase reads
//! * **Event set** of five named auto-reset wake-up slots
//!   (data/space/connect/disconnect/error)
//! * **Background listener** with user callbacks and presence polling
//! * Zero allocations on the data path after construction
//!
//! # Quick example
//!
//! ```no_run
//! use shm_duplex::{ChannelConfig, EventKind, ShmClient, ShmServer};
//!
//! // Process A
//! let mut server = ShmServer::create("demo", &ChannelConfig::default())?;
//! server.register_callback(|kind| {
//!     if kind == EventKind::Connect {
//!         println!("client attached");
//!     }
//! })?;
//! server.send(b"hello")?;
//!
//! // Process B
//! let mut client = ShmClient::connect("demo")?;
//! let mut buf = [0u8; 64];
//! let n = client.receive(&mut buf)?;
//! assert_eq!(&buf[..n], b"hello");
//! # Ok::<(), shm_duplex::ShmError>(())
//! ```
//!
//! # Design overview
//!
//! Each direction is one ring: a cache-line-sized header of cross-process
//! atomics (`write_pos`, `read_pos`, `size`, `mask`, `active_readers`,
//! `sequence`) followed by a power-of-two payload area. Positions are
//! free-running counters; the offset into the payload is `pos & mask`.
//! A committed record is exactly the byte range `[read_pos, write_pos)`.
//!
//! The bytestream writer makes room by advancing `read_pos` past whole
//! records with CAS — the consumer advances the same word with CAS, so
//! whoever loses simply re-parses from the new head and torn reads are
//! impossible. The fixed-slot reader borrows the head slot with a sequence
//! snapshot and commits it back; racing commits are serialized on the
//! sequence word so exactly one wins.
//!
//! Wake-ups go through a small named event region holding one futex word
//! per event kind. Waits are auto-reset and coalescing: signalling an
//! already-signalled slot is a no-op, and consuming a signal rearms the
//! slot.

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

mod byte_ring;
mod channel;
mod endpoint;
mod error;
mod events;
mod futex;
mod layout;
mod listener;
mod mmap;
mod region;
mod slot_channel;
mod slot_ring;
mod utils;

pub use byte_ring::ByteRing;
pub use channel::ChannelConfig;
pub use endpoint::{ShmClient, ShmServer};
pub use error::{Result, ShmError};
pub use events::{EventKind, EventRole, EventSet};
pub use layout::{HEADER_SIZE, MAX_RECORD};
pub use region::SharedRegion;
pub use slot_channel::SlotChannel;
pub use slot_ring::SlotRing;
pub use utils::{LatencyStats, mono_time_ns};
