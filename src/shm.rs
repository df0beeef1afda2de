//! File-backed shared mappings.
//!
//! Both inter-process backends exchange descriptors through a mapping of a
//! POSIX shared-memory object named by the caller. Whichever endpoint
//! manages to create the object exclusively becomes the *creator* and is
//! responsible for sizing the file and initializing the channel layout; the
//! other endpoint (the *joiner*) attaches without truncating or zeroing.

use alloc::ffi::CString;
use core::ptr::NonNull;

use crate::{Errno, LastErrno};

/// A mapping of a named shared-memory object, unmapped and unlinked on drop.
pub struct SharedMapping {
    base: NonNull<u8>,
    len: usize,
    name: CString,
    creator: bool,
}

impl SharedMapping {
    /// Create or attach to the object `name` and map `len` bytes of it.
    ///
    /// `clear` zeroes the mapping; it only takes effect on the creator, the
    /// joiner must never wipe channel state the peer may already be using.
    /// Partially acquired resources are released in reverse order on any
    /// failure.
    pub fn open(name: &str, len: usize, clear: bool) -> Result<Self, Errno> {
        let name = CString::new(name).map_err(|_| Errno(libc::EINVAL))?;

        let mut creator = true;
        let mut fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            // Someone else created the object; attach to it as-is.
            creator = false;
            fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o600 as libc::mode_t) };
            if fd < 0 {
                return Err(LastErrno)?;
            }
        }

        if creator && unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let errno = Errno::new();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(name.as_ptr());
            }
            return Err(errno);
        }

        let mmap = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if mmap == libc::MAP_FAILED {
            let errno = Errno::new();
            unsafe {
                libc::close(fd);
                if creator {
                    libc::shm_unlink(name.as_ptr());
                }
            }
            return Err(errno);
        }

        // The mapping keeps the object alive on its own.
        unsafe { libc::close(fd) };

        let base = unsafe { NonNull::new_unchecked(mmap as *mut u8) };

        if creator && clear {
            unsafe { core::ptr::write_bytes(base.as_ptr(), 0, len) };
        }

        Ok(SharedMapping {
            base,
            len,
            name,
            creator,
        })
    }

    /// The base of the mapping in this process.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.base
    }

    /// A pointer `offset` bytes into the mapping.
    ///
    /// # Safety
    ///
    /// `offset` must be within the mapping.
    pub unsafe fn offset(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.len);
        NonNull::new_unchecked(self.base.as_ptr().add(offset))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this endpoint created the object (and initialized it).
    pub fn is_creator(&self) -> bool {
        self.creator
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base.as_ptr() as *mut _, self.len) } == -1 {
            eprint!("WARNING: shared mapping teardown failed (munmap): {}\n", Errno::new());
        }

        // Both peers unlink; whoever goes second finds the name gone.
        if unsafe { libc::shm_unlink(self.name.as_ptr()) } == -1 {
            let errno = Errno::new();
            if errno.raw() != libc::ENOENT {
                eprint!("WARNING: shared mapping teardown failed (shm_unlink): {}\n", errno);
            }
        }
    }
}
