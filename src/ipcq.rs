//! The sequence-numbered backend: two one-directional descriptor rings plus
//! one acknowledgement word per direction.
//!
//! Descriptors carry a monotonically increasing sequence number; a slot is
//! visible to the consumer while its stored `seq` has caught up with the
//! consumer's own counter. The consumer never writes into descriptor slots,
//! it only publishes its counter through the shared ack word, which the
//! producer compares against for flow control. Slot 0 of each channel half
//! holds the ack word, leaving `N - 1` usable descriptor slots per
//! direction.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::queue::{
    BufDesc, BufFlags, Error, MemBlock, Queue, QueueBackend, QueueCore, RegionId,
};
use crate::shm::SharedMapping;

/// Descriptors and ack words are cache-line sized and aligned.
pub const SLOT_BYTES: usize = 64;

/// Slots per one-directional channel, including the ack slot.
pub const DEFAULT_SLOTS: u64 = 64;

/// Usable descriptor slots per direction.
pub const USABLE_SLOTS: u64 = DEFAULT_SLOTS - 1;

/// Bytes of one one-directional channel.
pub const CHAN_BYTES: usize = DEFAULT_SLOTS as usize * SLOT_BYTES;

/// Bytes of the whole bi-directional mapping.
pub const MEM_BYTES: usize = 2 * CHAN_BYTES;

const CMD_REGISTER: u64 = 1;
const CMD_DEREGISTER: u64 = 2;

/// The on-wire descriptor record.
#[repr(C, align(64))]
struct IpcDesc {
    /// Publication word; written last by the producer.
    seq: AtomicU64,
    rid: u32,
    _pad: u32,
    offset: u64,
    length: u64,
    valid_data: u64,
    valid_length: u64,
    flags: u64,
    cmd: u64,
}

/// The peer-visible acknowledgement word, padded to its own cache line.
#[repr(C, align(64))]
struct SeqNum {
    value: AtomicU64,
    _pad: [u8; 56],
}

const _FIXED_LAYOUT: () = {
    assert!(core::mem::size_of::<IpcDesc>() == SLOT_BYTES);
    assert!(core::mem::size_of::<SeqNum>() == SLOT_BYTES);
};

/// The sequence-numbered backend state.
pub struct IpcBackend {
    /// Owns the bytes all ring pointers point into.
    #[allow(dead_code)]
    mem: SharedMapping,
    /// Usable descriptor slots per direction.
    slots: u64,

    rx_descs: NonNull<IpcDesc>,
    /// Next sequence number expected on receive.
    rx_seq: u64,
    /// Our ack word; the peer reads it for flow control.
    rx_seq_ack: NonNull<SeqNum>,

    tx_descs: NonNull<IpcDesc>,
    /// Sequence number of the next descriptor sent.
    tx_seq: u64,
    /// The peer's ack word for our transmit direction.
    tx_seq_ack: NonNull<SeqNum>,
}

/// A queue endpoint over a sequence-numbered channel pair.
pub type IpcQueue = Queue<IpcBackend>;

impl Queue<IpcBackend> {
    /// Create or attach to the channel named `name`.
    ///
    /// The creator transmits through the first half of the mapping and
    /// receives through the second; the joiner attaches with the halves
    /// swapped. Sequence counters start at 1 over a zeroed mapping, so a
    /// freshly attached consumer sees every slot as not yet published.
    pub fn create(name: &str, clear: bool) -> Result<Self, Error> {
        let mem = match SharedMapping::open(name, MEM_BYTES, clear) {
            Ok(mem) => mem,
            Err(errno) => {
                eprint!("descq: ipcq: opening {} failed: {}\n", name, errno);
                return Err(Error::InitQueue);
            }
        };

        let creator = mem.is_creator();
        let (tx_half, rx_half) = if creator { (0, CHAN_BYTES) } else { (CHAN_BYTES, 0) };

        let backend = unsafe {
            IpcBackend {
                slots: USABLE_SLOTS,
                tx_seq_ack: mem.offset(tx_half).cast(),
                tx_descs: mem.offset(tx_half + SLOT_BYTES).cast(),
                rx_seq_ack: mem.offset(rx_half).cast(),
                rx_descs: mem.offset(rx_half + SLOT_BYTES).cast(),
                tx_seq: 1,
                rx_seq: 1,
                mem,
            }
        };

        if creator {
            // The consumer publishes its next expected sequence number, so
            // the resting value of an idle direction is the initial rx_seq.
            unsafe {
                (*backend.tx_seq_ack.as_ptr()).value.store(1, Ordering::Release);
                (*backend.rx_seq_ack.as_ptr()).value.store(1, Ordering::Release);
            }
        }

        Queue::with_backend(backend)
    }
}

impl IpcBackend {
    fn can_send(&self) -> bool {
        let ack = unsafe { (*self.tx_seq_ack.as_ptr()).value.load(Ordering::Acquire) };
        // `tx_seq - ack` is the number of descriptors in flight; one more
        // may go out while fewer than `slots` are outstanding.
        self.tx_seq.wrapping_sub(ack) < self.slots
    }

    fn tx_desc(&self) -> *mut IpcDesc {
        let index = (self.tx_seq % self.slots) as usize;
        unsafe { self.tx_descs.as_ptr().add(index) }
    }

    fn rx_desc(&self) -> *mut IpcDesc {
        let index = (self.rx_seq % self.slots) as usize;
        unsafe { self.rx_descs.as_ptr().add(index) }
    }

    fn send(&mut self, buf: BufDesc, cmd: u64) -> Result<(), Error> {
        if !self.can_send() {
            return Err(Error::QueueFull);
        }

        let desc = self.tx_desc();
        unsafe {
            (*desc).rid = buf.rid.0;
            (*desc).offset = buf.offset;
            (*desc).length = buf.length;
            (*desc).valid_data = buf.valid_data;
            (*desc).valid_length = buf.valid_length;
            (*desc).flags = buf.flags.bits();
            (*desc).cmd = cmd;

            // Writing the sequence number publishes the descriptor; the
            // release store keeps the field writes ahead of it.
            (*desc).seq.store(self.tx_seq, Ordering::Release);
        }

        self.tx_seq += 1;
        Ok(())
    }

    /// Publish our receive progress for the peer's flow control.
    fn publish_ack(&mut self) {
        self.rx_seq += 1;
        unsafe {
            (*self.rx_seq_ack.as_ptr())
                .value
                .store(self.rx_seq, Ordering::Release);
        }
    }
}

impl QueueBackend for IpcBackend {
    fn enqueue(&mut self, _core: &mut QueueCore, buf: BufDesc) -> Result<(), Error> {
        self.send(buf, 0)
    }

    fn dequeue(&mut self, core: &mut QueueCore) -> Result<BufDesc, Error> {
        // Commands never surface; consume them and keep receiving.
        loop {
            let desc = self.rx_desc();

            let seq = unsafe { (*desc).seq.load(Ordering::Acquire) };
            if self.rx_seq > seq {
                return Err(Error::QueueEmpty);
            }

            // Copy everything out before acking; the ack frees the slot for
            // the producer to overwrite.
            let (rid, offset, length, valid_data, valid_length, flags, cmd) = unsafe {
                (
                    RegionId((*desc).rid),
                    (*desc).offset,
                    (*desc).length,
                    (*desc).valid_data,
                    (*desc).valid_length,
                    (*desc).flags,
                    (*desc).cmd,
                )
            };

            self.publish_ack();

            match cmd {
                0 => {
                    return Ok(BufDesc {
                        rid,
                        offset,
                        length,
                        valid_data,
                        valid_length,
                        flags: BufFlags::from_bits_retain(flags),
                    })
                }
                CMD_REGISTER => {
                    let block = MemBlock {
                        vaddr: offset,
                        paddr: valid_data,
                        len: length,
                    };
                    if let Err(err) = core.peer_register(block, rid) {
                        eprint!("descq: ipcq: peer register of rid={} failed: {}\n", rid.0, err);
                    }
                }
                _ => {
                    if let Err(err) = core.peer_deregister(rid) {
                        eprint!("descq: ipcq: peer deregister of rid={} failed: {}\n", rid.0, err);
                    }
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
        // The command descriptor carries the block through the buffer
        // fields: vaddr as offset, len as length, paddr as valid_data.
        // Full queues report back to the caller, which polls.
        self.send(
            BufDesc {
                rid,
                offset: block.vaddr,
                length: block.len,
                valid_data: block.paddr,
                valid_length: 0,
                flags: BufFlags::empty(),
            },
            CMD_REGISTER,
        )
    }

    fn deregister(&mut self, _core: &mut QueueCore, rid: RegionId) -> Result<(), Error> {
        self.send(
            BufDesc {
                rid,
                offset: 0,
                length: 0,
                valid_data: 0,
                valid_length: 0,
                flags: BufFlags::empty(),
            },
            CMD_DEREGISTER,
        )
    }
}
