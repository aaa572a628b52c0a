use std::ptr::NonNull;

/// Creates a new POSIX shared-memory object and maps it read/write.
///
/// The object is created exclusively: if `shm_name` already exists the call
/// fails with `EEXIST` rather than silently reusing the old region. The
/// backing store is extended to `size` bytes with `ftruncate`, which
/// zero-fills it.
pub(crate) fn create_shared_memory(
    shm_name: &str,
    size: usize,
) -> Result<NonNull<u8>, std::io::Error> {
    let addr = unsafe {
        let shm_name = std::ffi::CString::new(shm_name).unwrap();

        let fd = libc::shm_open(
            shm_name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600,
        );
        if fd == -1 {
            return Err(std::io::Error::last_os_error());
        }

        if libc::ftruncate(fd, size as libc::off_t) == -1 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            libc::shm_unlink(shm_name.as_ptr());
            return Err(err);
        }

        let addr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );

        if addr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            libc::shm_unlink(shm_name.as_ptr());
            return Err(err);
        } else {
            libc::close(fd); // mapping stays valid
        }

        addr
    };

    Ok(NonNull::new(addr as *mut u8).unwrap())
}

/// Opens an existing POSIX shared-memory object and maps it read/write.
///
/// Returns the mapping together with its length as reported by `fstat`.
/// Fails with `ENOENT` if no object of that name exists.
pub(crate) fn open_shared_memory(
    shm_name: &str,
) -> Result<(NonNull<u8>, usize), std::io::Error> {
    let (addr, size) = unsafe {
        let shm_name = std::ffi::CString::new(shm_name).unwrap();

        let fd = libc::shm_open(shm_name.as_ptr(), libc::O_RDWR, 0o600);
        if fd == -1 {
            return Err(std::io::Error::last_os_error());
        }

        let mut st: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &mut st) == -1 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        let size = st.st_size as usize;

        let addr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );

        if addr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        } else {
            libc::close(fd); // mapping stays valid
        }

        (addr, size)
    };

    Ok((NonNull::new(addr as *mut u8).unwrap(), size))
}

pub(crate) unsafe fn unmap_shared_memory(
    ptr: NonNull<u8>,
    size: usize,
) -> Result<(), std::io::Error> {
    unsafe {
        if libc::munmap(ptr.as_ptr().cast(), size) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Removes the name from the shared-memory namespace.
///
/// Existing mappings stay valid; the backing store is reclaimed once the
/// last mapping is released.
pub(crate) fn unlink_shared_memory(shm_name: &str) -> Result<(), std::io::Error> {
    let shm_name = std::ffi::CString::new(shm_name).unwrap();
    unsafe {
        if libc::shm_unlink(shm_name.as_ptr()) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/shm_duplex_mmap_{}_{}", tag, std::process::id())
    }

    #[test]
    fn create_map_write_open_read_roundtrip() {
        let name = unique_name("roundtrip");
        let size = 4096;

        let ptr = create_shared_memory(&name, size).expect("create should succeed");
        unsafe { ptr.as_ptr().write(0xAB) };

        let (ptr2, size2) = open_shared_memory(&name).expect("open should succeed");
        assert_eq!(size2, size);
        assert_eq!(unsafe { ptr2.as_ptr().read() }, 0xAB);

        unsafe {
            unmap_shared_memory(ptr, size).unwrap();
            unmap_shared_memory(ptr2, size).unwrap();
        }
        unlink_shared_memory(&name).unwrap();
    }

    #[test]
    fn create_fails_on_existing_name() {
        let name = unique_name("exists");
        let size = 4096;

        let ptr = create_shared_memory(&name, size).expect("first create should succeed");
        let err = create_shared_memory(&name, size).expect_err("second create must fail");
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));

        unsafe { unmap_shared_memory(ptr, size).unwrap() };
        unlink_shared_memory(&name).unwrap();
    }

    #[test]
    fn open_fails_on_missing_name() {
        let err = open_shared_memory("/shm_duplex_mmap_no_such_object")
            .expect_err("open of missing object must fail");
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
