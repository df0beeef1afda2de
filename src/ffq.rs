//! The fast-forward backend: two one-directional SPSC rings of cache-line
//! slots in a shared mapping, without head/tail counters.
//!
//! The first word of a slot doubles as the readiness marker: the value
//! [`SLOT_EMPTY`] means the slot is free for the producer, anything else is
//! a published message whose remaining words are valid. Producer and
//! consumer each keep a private position, so the only shared state is the
//! slots themselves and the two sides touch disjoint cache lines whenever
//! they are not neck and neck.
//!
//! Region lifecycle events travel in-band: the flags word of a message
//! carries the command code, so the raw flag values `1` and `2` are
//! reserved and must not be used for data transfers.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::queue::{
    BufDesc, BufFlags, Error, MemBlock, Queue, QueueBackend, QueueCore, RegionId,
};
use crate::shm::SharedMapping;

/// One message slot occupies a cache line.
pub const SLOT_BYTES: usize = 64;

/// Slots per one-directional channel.
pub const DEFAULT_SLOTS: u16 = 64;

/// Bytes of one one-directional channel.
pub const CHAN_BYTES: usize = DEFAULT_SLOTS as usize * SLOT_BYTES;

/// Bytes of the whole bi-directional mapping.
pub const MEM_BYTES: usize = 2 * CHAN_BYTES;

/// First word of an empty slot.
pub const SLOT_EMPTY: u64 = u64::MAX;

const CMD_REGISTER: u64 = 1;
const CMD_DEREGISTER: u64 = 2;

/// Words of a message: leading word, then offset, length, valid_data,
/// valid_length, flags.
const MSG_WORDS: usize = 6;

#[derive(Debug, PartialEq, Eq)]
enum Direction {
    Send,
    Recv,
}

/// One direction of the channel.
///
/// Points into the shared mapping owned by [`FfBackend`]; the mapping
/// outlives the channel by construction.
struct FfChan {
    slots: NonNull<u8>,
    size: u16,
    pos: u16,
    direction: Direction,
}

impl FfChan {
    /// # Safety
    ///
    /// `buf` must point at `slots * SLOT_BYTES` bytes of a live shared
    /// mapping, cache-line aligned, and remain valid for the channel's
    /// lifetime.
    unsafe fn init(buf: NonNull<u8>, slots: u16, direction: Direction, init: bool) -> Self {
        debug_assert!(buf.as_ptr() as usize & (SLOT_BYTES - 1) == 0);
        let chan = FfChan {
            slots: buf,
            size: slots,
            pos: 0,
            direction,
        };

        for index in 0..slots {
            if init {
                chan.header(index).store(SLOT_EMPTY, Ordering::Relaxed);
            }
        }

        chan
    }

    unsafe fn init_tx(buf: NonNull<u8>, slots: u16, init: bool) -> Self {
        Self::init(buf, slots, Direction::Send, init)
    }

    unsafe fn init_rx(buf: NonNull<u8>, slots: u16, init: bool) -> Self {
        Self::init(buf, slots, Direction::Recv, init)
    }

    fn slot_ptr(&self, index: u16) -> *mut u64 {
        debug_assert!(index < self.size);
        unsafe { self.slots.as_ptr().add(index as usize * SLOT_BYTES) as *mut u64 }
    }

    fn header(&self, index: u16) -> &AtomicU64 {
        // The slot base is cache-line aligned, so word 0 is suitably
        // aligned for an atomic view.
        unsafe { &*(self.slot_ptr(index) as *const AtomicU64) }
    }

    fn can_send(&self) -> bool {
        debug_assert!(self.direction == Direction::Send);
        self.header(self.pos).load(Ordering::Acquire) == SLOT_EMPTY
    }

    /// Publish a message in the slot at the current position.
    ///
    /// `msg[0]` must not be [`SLOT_EMPTY`]; writing it is what hands the
    /// slot to the consumer.
    fn send(&mut self, msg: [u64; MSG_WORDS]) -> bool {
        if !self.can_send() {
            return false;
        }

        let slot = self.slot_ptr(self.pos);
        for (word, value) in msg.iter().enumerate().skip(1) {
            unsafe { slot.add(word).write(*value) };
        }

        debug_assert!(msg[0] != SLOT_EMPTY);
        // The release store keeps the payload writes ahead of the
        // publication.
        self.header(self.pos).store(msg[0], Ordering::Release);

        self.pos = (self.pos + 1) % self.size;
        true
    }

    /// Take the message at the current position, releasing its slot.
    fn recv(&mut self) -> Option<[u64; MSG_WORDS]> {
        debug_assert!(self.direction == Direction::Recv);

        let first = self.header(self.pos).load(Ordering::Acquire);
        if first == SLOT_EMPTY {
            return None;
        }

        let slot = self.slot_ptr(self.pos);
        let mut msg = [first, 0, 0, 0, 0, 0];
        for (word, value) in msg.iter_mut().enumerate().skip(1) {
            *value = unsafe { slot.add(word).read() };
        }

        // Handing the slot back must not overtake the payload reads above.
        self.header(self.pos).store(SLOT_EMPTY, Ordering::Release);

        self.pos = (self.pos + 1) % self.size;
        Some(msg)
    }
}

/// The fast-forward backend state.
pub struct FfBackend {
    /// Owns the bytes both channels point into.
    #[allow(dead_code)]
    mem: SharedMapping,
    txq: FfChan,
    rxq: FfChan,
}

/// A queue endpoint over a fast-forward channel pair.
pub type FfQueue = Queue<FfBackend>;

impl Queue<FfBackend> {
    /// Create or attach to the fast-forward channel named `name`.
    ///
    /// The creator takes the first half of the mapping as its receive ring
    /// and seeds every slot of both halves with the empty sentinel; the
    /// joiner attaches with the halves swapped and touches nothing.
    pub fn create(name: &str, clear: bool) -> Result<Self, Error> {
        let mem = match SharedMapping::open(name, MEM_BYTES, clear) {
            Ok(mem) => mem,
            Err(errno) => {
                eprint!("descq: ffq: opening {} failed: {}\n", name, errno);
                return Err(Error::InitQueue);
            }
        };

        let creator = mem.is_creator();
        let (rx_off, tx_off) = if creator { (0, CHAN_BYTES) } else { (CHAN_BYTES, 0) };

        let rxq = unsafe { FfChan::init_rx(mem.offset(rx_off), DEFAULT_SLOTS, creator) };
        let txq = unsafe { FfChan::init_tx(mem.offset(tx_off), DEFAULT_SLOTS, creator) };

        Queue::with_backend(FfBackend { mem, txq, rxq })
    }
}

impl QueueBackend for FfBackend {
    fn enqueue(&mut self, _core: &mut QueueCore, buf: BufDesc) -> Result<(), Error> {
        let msg = [
            buf.rid.0 as u64,
            buf.offset,
            buf.length,
            buf.valid_data,
            buf.valid_length,
            buf.flags.bits(),
        ];

        if self.txq.send(msg) {
            Ok(())
        } else {
            Err(Error::QueueFull)
        }
    }

    fn dequeue(&mut self, core: &mut QueueCore) -> Result<BufDesc, Error> {
        // Commands never surface; consume them and keep receiving.
        loop {
            let msg = match self.rxq.recv() {
                Some(msg) => msg,
                None => return Err(Error::QueueEmpty),
            };

            let rid = RegionId(msg[0] as u32);
            match msg[5] {
                CMD_REGISTER => {
                    let block = MemBlock {
                        vaddr: msg[1],
                        paddr: msg[3],
                        len: msg[2],
                    };
                    if let Err(err) = core.peer_register(block, rid) {
                        eprint!("descq: ffq: peer register of rid={} failed: {}\n", rid.0, err);
                    }
                }
                CMD_DEREGISTER => {
                    if let Err(err) = core.peer_deregister(rid) {
                        eprint!("descq: ffq: peer deregister of rid={} failed: {}\n", rid.0, err);
                    }
                }
                _ => {
                    return Ok(BufDesc {
                        rid,
                        offset: msg[1],
                        length: msg[2],
                        valid_data: msg[3],
                        valid_length: msg[4],
                        flags: BufFlags::from_bits_retain(msg[5]),
                    })
                }
            }
        }
    }

    fn register(
        &mut self,
        _core: &mut QueueCore,
        block: MemBlock,
        rid: RegionId,
    ) -> Result<(), Error> {
        // The payload carries the block through the descriptor fields:
        // vaddr as offset, len as length, paddr as valid_data.
        let msg = [rid.0 as u64, block.vaddr, block.len, block.paddr, 0, CMD_REGISTER];

        if self.txq.send(msg) {
            Ok(())
        } else {
            Err(Error::QueueFull)
        }
    }

    fn deregister(&mut self, _core: &mut QueueCore, rid: RegionId) -> Result<(), Error> {
        let msg = [rid.0 as u64, 0, 0, 0, 0, CMD_DEREGISTER];

        if self.txq.send(msg) {
            Ok(())
        } else {
            Err(Error::QueueFull)
        }
    }
}
