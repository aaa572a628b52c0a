use std::ptr::NonNull;

use crate::error::{Result, ShmError};
use crate::mmap;

/// Longest user-supplied channel name accepted by the naming scheme.
///
/// Keeps the derived POSIX object names well under `NAME_MAX`.
const MAX_NAME_LEN: usize = 200;

/// A named, page-backed shared-memory mapping.
///
/// The creator owns the allocation: it registers the name at construction
/// and unlinks it on drop, after which the backing store lives on only
/// until the last mapping (here or in a peer process) is released. Openers
/// own a view: dropping one merely unmaps.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    shm_name: String,
    is_owner: bool,
}

// The mapping is plain shared bytes; all coordination on top of it is done
// with atomics by the ring and event types.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Creates a new region of exactly `len` bytes, zero-filled.
    ///
    /// Fails with [`ShmError::Exists`] if the name is already registered.
    pub fn create(shm_name: &str, len: usize) -> Result<Self> {
        let ptr = mmap::create_shared_memory(shm_name, len).map_err(|e| {
            if e.raw_os_error() == Some(libc::EEXIST) {
                ShmError::Exists
            } else {
                ShmError::Memory(e)
            }
        })?;
        tracing::debug!(name = shm_name, len, "created shared region");

        Ok(Self {
            ptr,
            len,
            shm_name: shm_name.to_owned(),
            is_owner: true,
        })
    }

    /// Maps an existing region read/write.
    ///
    /// Fails with [`ShmError::NotFound`] if no region of that name exists.
    pub fn open(shm_name: &str) -> Result<Self> {
        let (ptr, len) = mmap::open_shared_memory(shm_name).map_err(|e| {
            if e.raw_os_error() == Some(libc::ENOENT) {
                ShmError::NotFound
            } else {
                ShmError::Memory(e)
            }
        })?;
        tracing::debug!(name = shm_name, len, "opened shared region");

        Ok(Self {
            ptr,
            len,
            shm_name: shm_name.to_owned(),
            is_owner: false,
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.shm_name
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = mmap::unmap_shared_memory(self.ptr, self.len) {
                tracing::warn!(name = %self.shm_name, error = %e, "munmap failed");
            }
        }
        if self.is_owner {
            if let Err(e) = mmap::unlink_shared_memory(&self.shm_name) {
                tracing::warn!(name = %self.shm_name, error = %e, "shm_unlink failed");
            }
        }
    }
}

/// Validates a user-supplied channel name.
///
/// Names become part of POSIX object names, so they must be non-empty,
/// free of `/` and NUL, and bounded in length.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ShmError::InvalidParam("channel name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ShmError::InvalidParam("channel name too long"));
    }
    if name.contains(['/', '\0']) {
        return Err(ShmError::InvalidParam("channel name contains '/' or NUL"));
    }
    Ok(())
}

/// POSIX object name for the bytestream data region of channel `name`.
pub(crate) fn data_region_name(name: &str) -> String {
    format!("/SHM_{name}")
}

/// POSIX object name for one direction of a fixed-slot channel.
/// `suffix` is `"tx"` (server to client) or `"rx"` (client to server).
pub(crate) fn slot_region_name(name: &str, suffix: &str) -> String {
    format!("/SHM_{name}_{suffix}")
}

/// POSIX object name for the event block of channel `name`.
pub(crate) fn event_region_name(name: &str) -> String {
    format!("/SHM_EVENTS_{name}")
}

/// Retries `open` for up to `attempts * delay` to ride out the window in
/// which a creator has registered nothing yet, or registered the name but
/// not finished initializing it.
pub(crate) fn open_with_retry(
    open: impl Fn() -> Result<SharedRegion>,
    attempts: u32,
    delay: std::time::Duration,
) -> Result<SharedRegion> {
    let mut last = ShmError::NotFound;
    for _ in 0..attempts {
        match open() {
            Ok(region) => return Ok(region),
            Err(ShmError::NotFound) => {
                last = ShmError::NotFound;
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}
