//! The loopback backend: a fixed-capacity in-process ring that reflects
//! every enqueued descriptor back to the same endpoint. Exists to drive
//! test suites and stacked wrappers without shared memory.

use crate::queue::{BufDesc, BufFlags, Error, MemBlock, Queue, QueueBackend, QueueCore, RegionId};

/// Descriptors the ring can hold.
pub const DEFAULT_SLOTS: usize = 64;

const EMPTY_DESC: BufDesc = BufDesc {
    rid: RegionId(0),
    offset: 0,
    length: 0,
    valid_data: 0,
    valid_length: 0,
    flags: BufFlags::empty(),
};

/// The loopback backend state.
pub struct LoopbackBackend {
    ring: [BufDesc; DEFAULT_SLOTS],
    head: usize,
    tail: usize,
    num: usize,
}

/// A queue endpoint that is its own peer.
pub type LoopbackQueue = Queue<LoopbackBackend>;

impl Queue<LoopbackBackend> {
    pub fn create() -> Result<Self, Error> {
        Queue::with_backend(LoopbackBackend {
            ring: [EMPTY_DESC; DEFAULT_SLOTS],
            head: 0,
            tail: 0,
            num: 0,
        })
    }
}

impl QueueBackend for LoopbackBackend {
    fn enqueue(&mut self, _core: &mut QueueCore, buf: BufDesc) -> Result<(), Error> {
        if self.num == DEFAULT_SLOTS {
            return Err(Error::QueueFull);
        }

        self.ring[self.head] = buf;
        self.head = (self.head + 1) % DEFAULT_SLOTS;
        self.num += 1;
        Ok(())
    }

    fn dequeue(&mut self, _core: &mut QueueCore) -> Result<BufDesc, Error> {
        if self.num == 0 {
            return Err(Error::QueueEmpty);
        }

        let buf = self.ring[self.tail];
        self.tail = (self.tail + 1) % DEFAULT_SLOTS;
        self.num -= 1;
        Ok(buf)
    }

    fn register(
        &mut self,
        _core: &mut QueueCore,
        _block: MemBlock,
        _rid: RegionId,
    ) -> Result<(), Error> {
        // There is no other endpoint to tell.
        Ok(())
    }

    fn deregister(&mut self, _core: &mut QueueCore, _rid: RegionId) -> Result<(), Error> {
        Ok(())
    }
}
