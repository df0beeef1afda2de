#![no_std]
extern crate alloc;

macro_rules! eprint {
    ($msg:literal $(, $arg:expr)* $(,)?) => {
        match ::alloc::format!($msg $(, $arg)*) {
            msg => {
                unsafe { libc::write(2, msg.as_bytes().as_ptr() as *const _, msg.len()) };
            }
        }
    }
}

/// The queue frontend: buffer and region types, errors, operations.
pub mod queue;
/// Region bookkeeping shared by all queue frontends.
pub mod pool;
/// File-backed shared mappings for the inter-process backends.
pub mod shm;
/// Fixed-block index arena backing the ownership tracker.
pub mod slab;

/// The fast-forward (sentinel-slot) shared-memory backend.
pub mod ffq;
/// The sequence-numbered shared-memory backend.
pub mod ipcq;
/// The ownership-tracking wrapper, stackable on any queue.
pub mod debug;
/// In-process reflection backend, used to drive test suites.
pub mod loopback;

pub use queue::{BufDesc, BufFlags, DescQueue, Error, MemBlock, RegionId};

pub(crate) struct LastErrno;
pub struct Errno(libc::c_int);

impl From<LastErrno> for Errno {
    fn from(LastErrno: LastErrno) -> Self {
        Errno::new()
    }
}

impl Errno {
    pub(crate) fn new() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }

    pub(crate) fn raw(&self) -> libc::c_int {
        self.0
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = unsafe { libc::strerror(self.0) };
        let cstr = unsafe { core::ffi::CStr::from_ptr(st) };
        write!(f, "{}", cstr.to_string_lossy())
    }
}

impl core::fmt::Debug for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}
