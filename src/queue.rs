//! The generic queue frontend.
//!
//! A queue endpoint hands ownership of buffers (sub-ranges of registered
//! memory regions) to its peer by transferring descriptors, never the bytes
//! themselves. The frontend validates every transfer against the endpoint's
//! region pool and dispatches to a backend. Backends are concrete types
//! implementing [`QueueBackend`]; the public surface is the [`DescQueue`]
//! trait so that wrappers (see [`crate::debug`]) can stack transparently on
//! any queue.

use alloc::boxed::Box;
use core::any::Any;

use crate::pool::RegionPool;

bitflags::bitflags! {
    /// The flags word of a buffer descriptor.
    ///
    /// All bits but the named ones are free for the application, except
    /// that the fast-forward backend reserves the raw values `1` and `2`
    /// for in-band region commands.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct BufFlags: u64 {
        /// Marks the last buffer of a chain.
        const LAST = 1 << 30;
    }
}

/// Identifies a registered memory region within one endpoint's pool.
///
/// Ids are assigned from a randomized base; the high bits act as a
/// generation-like tag so that ids from unrelated queues are unlikely to
/// alias by accident.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RegionId(pub u32);

/// A contiguous block of memory that may contain buffers.
///
/// The block is never dereferenced by this crate; `vaddr` and `paddr` are
/// carried verbatim so both endpoints can name the same physical bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemBlock {
    /// The virtual address of the block in the registering process.
    pub vaddr: u64,
    /// The physical (or otherwise endpoint-shared) address of the block.
    pub paddr: u64,
    /// The size of the block in bytes.
    pub len: u64,
}

/// A buffer descriptor, the unit of ownership transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufDesc {
    /// The region this buffer belongs to.
    pub rid: RegionId,
    /// Offset of the buffer within its region.
    pub offset: u64,
    /// Length of the buffer in bytes.
    pub length: u64,
    /// Offset of the valid data from the start of the buffer.
    pub valid_data: u64,
    /// Length of the valid data.
    pub valid_length: u64,
    /// Caller-defined flags, see [`BufFlags`].
    pub flags: BufFlags,
}

/// Errors returned by every queue operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The queue could not be initialized.
    InitQueue,
    /// Invalid buffer region.
    BufferId,
    /// The supplied buffer was not within a registered region.
    BufferNotInRegion,
    /// The buffer is already in use.
    BufferAlreadyInUse,
    /// Invalid buffer arguments.
    InvalidBufferArgs,
    /// The region id was not valid.
    InvalidRegionId,
    /// The region could not be removed.
    RegionDestroy,
    /// Invalid region arguments.
    InvalidRegionArgs,
    /// The queue was empty.
    QueueEmpty,
    /// The queue was full.
    QueueFull,
    /// The buffer was not in use.
    BufferNotInUse,
    /// Memory allocation failed.
    MallocFail,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::InitQueue => "could not initialize the queue",
            Error::BufferId => "invalid buffer id",
            Error::BufferNotInRegion => "buffer not within a registered region",
            Error::BufferAlreadyInUse => "buffer already in use",
            Error::InvalidBufferArgs => "invalid buffer arguments",
            Error::InvalidRegionId => "invalid region id",
            Error::RegionDestroy => "could not remove the region",
            Error::InvalidRegionArgs => "invalid region arguments",
            Error::QueueEmpty => "queue empty",
            Error::QueueFull => "queue full",
            Error::BufferNotInUse => "buffer not in use",
            Error::MallocFail => "memory allocation failed",
        };
        f.write_str(msg)
    }
}

/// Callback invoked when the peer registered a region on the datapath.
pub type RegisterCallback = Box<dyn FnMut(MemBlock, RegionId) -> Result<(), Error>>;
/// Callback invoked when the peer deregistered a region on the datapath.
pub type DeregisterCallback = Box<dyn FnMut(RegionId) -> Result<(), Error>>;

#[derive(Default)]
pub(crate) struct Callbacks {
    pub reg: Option<RegisterCallback>,
    pub dereg: Option<DeregisterCallback>,
}

/// The backend-independent part of a queue endpoint: the region pool, an
/// opaque user state slot, and the event callbacks.
///
/// Backends receive a mutable reference to this on every operation so the
/// inline command path can mirror peer-initiated region lifecycle events
/// into the pool.
pub struct QueueCore {
    pub(crate) pool: RegionPool,
    state: Option<Box<dyn Any>>,
    pub(crate) callbacks: Callbacks,
}

impl QueueCore {
    pub(crate) fn new() -> Result<Self, Error> {
        Ok(QueueCore {
            pool: RegionPool::new()?,
            state: None,
            callbacks: Callbacks::default(),
        })
    }

    /// Mirror a peer-assigned region into the pool.
    ///
    /// Fails with [`Error::InvalidRegionId`] if the id slot is occupied.
    pub fn add_region(&mut self, block: MemBlock, rid: RegionId) -> Result<(), Error> {
        self.pool.add_region_with_id(block, rid)
    }

    /// Drop a region from the pool, returning its memory block.
    pub fn remove_region(&mut self, rid: RegionId) -> Result<MemBlock, Error> {
        self.pool.remove_region(rid)
    }

    /// Apply a peer-initiated register that arrived inline on the datapath,
    /// then notify the user callback.
    pub(crate) fn peer_register(&mut self, block: MemBlock, rid: RegionId) -> Result<(), Error> {
        self.add_region(block, rid)?;
        match &mut self.callbacks.reg {
            Some(cb) => cb(block, rid),
            None => Ok(()),
        }
    }

    /// Apply a peer-initiated deregister, then notify the user callback.
    pub(crate) fn peer_deregister(&mut self, rid: RegionId) -> Result<(), Error> {
        self.remove_region(rid)?;
        match &mut self.callbacks.dereg {
            Some(cb) => cb(rid),
            None => Ok(()),
        }
    }
}

/// The capability set every backend realizes.
///
/// Mirrors the seven frontend operations one-to-one, with the region pool
/// handling hoisted into [`Queue`]. `notify` and `control` default to no-ops
/// since the shared-memory backends have nothing to do for either.
pub trait QueueBackend {
    fn enqueue(&mut self, core: &mut QueueCore, buf: BufDesc) -> Result<(), Error>;

    fn dequeue(&mut self, core: &mut QueueCore) -> Result<BufDesc, Error>;

    /// Announce a locally registered region to the peer. The id has already
    /// been assigned by the caller's pool.
    fn register(&mut self, core: &mut QueueCore, block: MemBlock, rid: RegionId)
        -> Result<(), Error>;

    /// Announce a local deregistration to the peer.
    fn deregister(&mut self, core: &mut QueueCore, rid: RegionId) -> Result<(), Error>;

    fn notify(&mut self, _core: &mut QueueCore) -> Result<(), Error> {
        Ok(())
    }

    fn control(&mut self, _core: &mut QueueCore, _request: u64, _value: u64) -> Result<u64, Error> {
        Ok(0)
    }

    fn destroy(&mut self, _core: &mut QueueCore) -> Result<(), Error> {
        Ok(())
    }
}

/// The uniform operations of a queue endpoint.
pub trait DescQueue {
    /// Make a memory region available for buffer transfers on this queue.
    ///
    /// Returns the id naming the region on both endpoints.
    fn register(&mut self, block: MemBlock) -> Result<RegionId, Error>;

    /// Remove a region, returning the memory block it was registered with.
    fn deregister(&mut self, rid: RegionId) -> Result<MemBlock, Error>;

    /// Hand the buffer `[offset, offset + length)` of region `rid` to the
    /// peer. The valid range must lie within the buffer.
    fn enqueue(
        &mut self,
        rid: RegionId,
        offset: u64,
        length: u64,
        valid_data: u64,
        valid_length: u64,
        flags: BufFlags,
    ) -> Result<(), Error>;

    /// Take ownership of the next buffer the peer handed to us.
    fn dequeue(&mut self) -> Result<BufDesc, Error>;

    /// Tell the peer that new buffers are available. A no-op for the polled
    /// shared-memory backends.
    fn notify(&mut self) -> Result<(), Error>;

    /// Backend-specific control request.
    fn control(&mut self, request: u64, value: u64) -> Result<u64, Error>;

    /// Tear the queue down. Must only be called when no other thread uses
    /// the queue.
    fn destroy(self) -> Result<(), Error>
    where
        Self: Sized;
}

/// A queue endpoint: a backend plus the generic frontend state.
pub struct Queue<B> {
    core: QueueCore,
    backend: B,
}

impl<B: QueueBackend> Queue<B> {
    pub(crate) fn with_backend(backend: B) -> Result<Self, Error> {
        Ok(Queue {
            core: QueueCore::new()?,
            backend,
        })
    }

    /// Attach an opaque state to this queue, returning the previous one.
    pub fn set_state(&mut self, state: Box<dyn Any>) -> Option<Box<dyn Any>> {
        self.core.state.replace(state)
    }

    /// The previously attached state, if any.
    pub fn state(&self) -> Option<&dyn Any> {
        self.core.state.as_deref()
    }

    pub fn state_mut(&mut self) -> Option<&mut (dyn Any + 'static)> {
        self.core.state.as_deref_mut()
    }

    /// Install the callback invoked when the peer registers a region.
    pub fn set_register_callback(&mut self, cb: RegisterCallback) {
        self.core.callbacks.reg = Some(cb);
    }

    /// Install the callback invoked when the peer deregisters a region.
    pub fn set_deregister_callback(&mut self, cb: DeregisterCallback) {
        self.core.callbacks.dereg = Some(cb);
    }

    /// The number of regions currently registered on this endpoint,
    /// including peer-initiated ones.
    pub fn num_regions(&self) -> usize {
        self.core.pool.num_regions()
    }

    /// Look up the memory block a region was registered with.
    pub fn region(&self, rid: RegionId) -> Option<MemBlock> {
        self.core.pool.get(rid)
    }
}

impl<B: QueueBackend> DescQueue for Queue<B> {
    fn register(&mut self, block: MemBlock) -> Result<RegionId, Error> {
        let rid = self.core.pool.add_region(block)?;
        match self.backend.register(&mut self.core, block, rid) {
            Ok(()) => Ok(rid),
            Err(err) => {
                // Transient backend refusal must not leave a half-registered
                // region behind; the caller retries the whole operation.
                let _ = self.core.pool.remove_region(rid);
                Err(err)
            }
        }
    }

    fn deregister(&mut self, rid: RegionId) -> Result<MemBlock, Error> {
        let block = self.core.pool.remove_region(rid)?;
        match self.backend.deregister(&mut self.core, rid) {
            Ok(()) => Ok(block),
            Err(err) => {
                let _ = self.core.pool.add_region_with_id(block, rid);
                Err(err)
            }
        }
    }

    fn enqueue(
        &mut self,
        rid: RegionId,
        offset: u64,
        length: u64,
        valid_data: u64,
        valid_length: u64,
        flags: BufFlags,
    ) -> Result<(), Error> {
        if !self
            .core
            .pool
            .check_bounds(rid, offset, length, valid_data, valid_length)
        {
            return Err(Error::InvalidBufferArgs);
        }

        self.backend.enqueue(
            &mut self.core,
            BufDesc {
                rid,
                offset,
                length,
                valid_data,
                valid_length,
                flags,
            },
        )
    }

    fn dequeue(&mut self) -> Result<BufDesc, Error> {
        let buf = self.backend.dequeue(&mut self.core)?;

        // A descriptor from the wire is untrusted until it checks out
        // against our own view of the registered regions.
        if !self.core.pool.check_bounds(
            buf.rid,
            buf.offset,
            buf.length,
            buf.valid_data,
            buf.valid_length,
        ) {
            return Err(Error::InvalidBufferArgs);
        }

        Ok(buf)
    }

    fn notify(&mut self) -> Result<(), Error> {
        self.backend.notify(&mut self.core)
    }

    fn control(&mut self, request: u64, value: u64) -> Result<u64, Error> {
        self.backend.control(&mut self.core, request, value)
    }

    fn destroy(mut self) -> Result<(), Error> {
        self.core.pool.destroy();
        self.backend.destroy(&mut self.core)
    }
}
