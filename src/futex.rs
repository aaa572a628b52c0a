//! Cross-process futex wait/wake.
//!
//! The event words these functions operate on live in shared memory, so the
//! Linux path deliberately omits `FUTEX_PRIVATE_FLAG`. Waits are best-effort:
//! callers re-check their condition in a loop and track deadlines
//! themselves, so a spurious wakeup, `EINTR`, `EAGAIN` (value already
//! changed), and `ETIMEDOUT` all report success. Anything else is a real
//! kernel-level failure and is returned to the caller, which surfaces it as
//! [`ShmError::Access`](crate::ShmError::Access).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Sleeps until `word` changes away from `expected`, `timeout` elapses, or
/// a wake (possibly spurious) arrives.
#[cfg(target_os = "linux")]
pub(crate) fn futex_wait(
    word: &AtomicU32,
    expected: u32,
    timeout: Option<Duration>,
) -> std::io::Result<()> {
    // Skip the syscall when the value already moved on.
    if word.load(Ordering::Acquire) != expected {
        return Ok(());
    }

    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs() as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null::<libc::timespec>(), |ts| ts as *const _);

    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            // Value changed, signal delivered, or deadline hit: the
            // caller's re-check loop handles all of these.
            Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::ETIMEDOUT) => Ok(()),
            _ => Err(err),
        }
    } else {
        Ok(())
    }
}

/// Wakes up to `count` waiters blocked on `word`.
#[cfg(target_os = "linux")]
pub(crate) fn futex_wake(word: &AtomicU32, count: i32) -> std::io::Result<()> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Fallback for Unixes without futexes: bounded sleep so the caller's
/// re-check loop degrades into polling.
#[cfg(not(target_os = "linux"))]
pub(crate) fn futex_wait(
    word: &AtomicU32,
    expected: u32,
    timeout: Option<Duration>,
) -> std::io::Result<()> {
    if word.load(Ordering::Acquire) != expected {
        return Ok(());
    }
    let nap = Duration::from_millis(1);
    std::thread::sleep(timeout.map_or(nap, |t| t.min(nap)));
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn futex_wake(_word: &AtomicU32, _count: i32) -> std::io::Result<()> {
    Ok(())
}
