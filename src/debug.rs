//! The ownership-tracking wrapper.
//!
//! Stacks on any queue and checks every transfer against a per-region,
//! ordered list of byte ranges this endpoint currently owns. Registering a
//! region starts with one range covering all of it; enqueues carve the
//! transferred buffer out (shrinking or splitting a range), dequeues insert
//! it back (fusing with neighbours whose boundaries touch). An enqueue of
//! bytes we do not own is refused before it reaches the wrapped queue; a
//! dequeue of bytes we already own is reported after the fact.
//!
//! Regions the peer registered out-of-band are discovered on first dequeue
//! and tracked as *not consistent*: their recorded extent grows as buffers
//! arrive and their list is not authoritative.
//!
//! All tracking nodes live in one index arena per region, freed wholesale
//! on deregister.

use alloc::vec::Vec;

use crate::queue::{BufDesc, BufFlags, DescQueue, Error, MemBlock, RegionId};
use crate::slab::{Slab, NIL};

#[cfg(feature = "history")]
const HIST_SIZE: usize = 128;

/// A free range `[offset, offset + length)`, doubly linked by arena index.
struct RangeNode {
    offset: u64,
    length: u64,
    prev: u32,
    next: u32,
}

/// The free-range list of one region.
///
/// Invariants at rest: nodes ordered by offset, adjacent nodes never touch,
/// all nodes within `[0, length)`.
struct RegionTracker {
    rid: RegionId,
    length: u64,
    /// Synthesized from a dequeue of a region this side never registered.
    not_consistent: bool,
    head: u32,
    ranges: Slab<RangeNode>,
}

impl RegionTracker {
    fn with_range(rid: RegionId, length: u64, not_consistent: bool) -> Result<Self, Error> {
        let mut ranges = Slab::new();
        let head = ranges.alloc(RangeNode {
            offset: 0,
            length,
            prev: NIL,
            next: NIL,
        })?;

        Ok(RegionTracker {
            rid,
            length,
            not_consistent,
            head,
            ranges,
        })
    }

    /// The whole region is owned as a single range.
    fn is_whole(&self) -> bool {
        if self.head == NIL {
            return false;
        }
        let node = self.ranges.get(self.head);
        node.offset == 0 && node.length == self.length && node.next == NIL
    }

    /// The range fully containing `[offset, offset + length)`, if any.
    fn find_containing(&self, offset: u64, length: u64) -> Option<u32> {
        let mut idx = self.head;
        while idx != NIL {
            let node = self.ranges.get(idx);
            if offset >= node.offset && offset + length <= node.offset + node.length {
                return Some(idx);
            }
            idx = node.next;
        }
        None
    }

    fn unlink_free(&mut self, idx: u32) {
        let (prev, next) = {
            let node = self.ranges.get(idx);
            (node.prev, node.next)
        };

        if prev != NIL {
            self.ranges.get_mut(prev).next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.ranges.get_mut(next).prev = prev;
        }

        self.ranges.free(idx);
    }

    /// Carve `[offset, offset + length)` out of the containing range `idx`.
    fn remove_split(&mut self, idx: u32, offset: u64, length: u64) -> Result<(), Error> {
        let (node_offset, node_length, node_next) = {
            let node = self.ranges.get(idx);
            (node.offset, node.length, node.next)
        };

        // Cut at the front of the range.
        if offset == node_offset {
            let node = self.ranges.get_mut(idx);
            node.offset += length;
            node.length -= length;
            if node.length == 0 {
                self.unlink_free(idx);
            }
            return Ok(());
        }

        // Cut at the back of the range.
        if offset + length == node_offset + node_length {
            let node = self.ranges.get_mut(idx);
            node.length -= length;
            if node.length == 0 {
                self.unlink_free(idx);
            }
            return Ok(());
        }

        // The buffer is in the middle, split the range around it.
        let after = self.ranges.alloc(RangeNode {
            offset: offset + length,
            length: (node_offset + node_length) - (offset + length),
            prev: idx,
            next: node_next,
        })?;

        self.ranges.get_mut(idx).length = offset - node_offset;
        self.ranges.get_mut(idx).next = after;
        if node_next != NIL {
            self.ranges.get_mut(node_next).prev = after;
        }
        Ok(())
    }

    /// Give `[offset, offset + length)` back to this endpoint, fusing with
    /// both neighbours where boundaries touch.
    ///
    /// Fails with [`Error::BufferNotInUse`] if any part of the range is
    /// already owned.
    fn insert_merge(&mut self, offset: u64, length: u64) -> Result<(), Error> {
        // Locate the insertion point: `next` is the first node past
        // `offset`, `prev` the one before it.
        let mut prev = NIL;
        let mut next = self.head;
        while next != NIL && self.ranges.get(next).offset <= offset {
            prev = next;
            next = self.ranges.get(next).next;
        }

        if prev != NIL {
            let node = self.ranges.get(prev);
            if node.offset + node.length > offset {
                return Err(Error::BufferNotInUse);
            }
        }
        if next != NIL && offset + length > self.ranges.get(next).offset {
            return Err(Error::BufferNotInUse);
        }

        let fuse_prev = prev != NIL && {
            let node = self.ranges.get(prev);
            node.offset + node.length == offset
        };
        let fuse_next = next != NIL && offset + length == self.ranges.get(next).offset;

        match (fuse_prev, fuse_next) {
            // Both boundaries touch, three ranges collapse into one.
            (true, true) => {
                let (next_length, next_next) = {
                    let node = self.ranges.get(next);
                    (node.length, node.next)
                };
                {
                    let node = self.ranges.get_mut(prev);
                    node.length += length + next_length;
                    node.next = next_next;
                }
                if next_next != NIL {
                    self.ranges.get_mut(next_next).prev = prev;
                }
                self.ranges.free(next);
            }
            (true, false) => {
                self.ranges.get_mut(prev).length += length;
            }
            (false, true) => {
                let node = self.ranges.get_mut(next);
                node.offset = offset;
                node.length += length;
            }
            (false, false) => {
                let idx = self.ranges.alloc(RangeNode {
                    offset,
                    length,
                    prev,
                    next,
                })?;
                if prev != NIL {
                    self.ranges.get_mut(prev).next = idx;
                } else {
                    self.head = idx;
                }
                if next != NIL {
                    self.ranges.get_mut(next).prev = idx;
                }
            }
        }
        Ok(())
    }

    fn dump(&self) {
        eprint!("================================================\n");
        let mut idx = self.head;
        let mut index = 0;
        while idx != NIL {
            let node = self.ranges.get(idx);
            eprint!(
                "idx={} offset={} length={}\n",
                index, node.offset, node.length
            );
            idx = node.next;
            index += 1;
        }
        eprint!("================================================\n");
    }
}

#[cfg(feature = "history")]
#[derive(Copy, Clone)]
struct OpRecord {
    op: &'static str,
    offset: u64,
    length: u64,
}

#[cfg(feature = "history")]
struct History {
    head: usize,
    ops: [OpRecord; HIST_SIZE],
}

#[cfg(feature = "history")]
impl History {
    fn new() -> Self {
        History {
            head: 0,
            ops: [OpRecord {
                op: "",
                offset: 0,
                length: 0,
            }; HIST_SIZE],
        }
    }

    fn record(&mut self, op: &'static str, offset: u64, length: u64) {
        self.ops[self.head] = OpRecord { op, offset, length };
        self.head = (self.head + 1) % HIST_SIZE;
    }

    fn dump(&self) {
        for slot in 0..HIST_SIZE {
            let record = &self.ops[(self.head + slot) % HIST_SIZE];
            if !record.op.is_empty() {
                eprint!(
                    "{} offset={} length={}\n",
                    record.op, record.offset, record.length
                );
            }
        }
    }
}

/// An ownership-checking wrapper around any queue.
pub struct DebugQueue<Q> {
    inner: Q,
    regions: Vec<RegionTracker>,
    #[cfg(feature = "history")]
    history: History,
}

impl<Q: DescQueue> DebugQueue<Q> {
    /// Stack the wrapper on `inner`. All operations are forwarded after the
    /// ownership checks pass.
    pub fn create(inner: Q) -> Self {
        DebugQueue {
            inner,
            regions: Vec::new(),
            #[cfg(feature = "history")]
            history: History::new(),
        }
    }

    /// The wrapped queue.
    pub fn inner(&self) -> &Q {
        &self.inner
    }

    /// The wrapped queue, mutably. Transfers made directly on it are
    /// invisible to the ownership tracking.
    pub fn inner_mut(&mut self) -> &mut Q {
        &mut self.inner
    }

    fn position(&self, rid: RegionId) -> Option<usize> {
        self.regions.iter().position(|tracker| tracker.rid == rid)
    }

    fn record(&mut self, op: &'static str, offset: u64, length: u64) {
        #[cfg(feature = "history")]
        self.history.record(op, offset, length);
        #[cfg(not(feature = "history"))]
        let _ = (op, offset, length);
    }

    fn push_tracker(&mut self, tracker: RegionTracker) -> Result<(), Error> {
        self.regions.try_reserve(1).map_err(|_| Error::MallocFail)?;
        self.regions.push(tracker);
        Ok(())
    }

    /// Track a region that was registered out-of-band, so dequeues for it
    /// are checked against an authoritative list.
    pub fn add_region(&mut self, block: MemBlock, rid: RegionId) -> Result<(), Error> {
        if self.position(rid).is_some() {
            return Err(Error::InvalidRegionId);
        }
        let tracker = RegionTracker::with_range(rid, block.len, false)?;
        self.push_tracker(tracker)
    }

    /// Forget a region tracked via [`Self::add_region`].
    pub fn remove_region(&mut self, rid: RegionId) -> Result<(), Error> {
        match self.position(rid) {
            Some(pos) => {
                self.regions.remove(pos);
                Ok(())
            }
            None => Err(Error::InvalidRegionId),
        }
    }

    /// Snapshot of the free ranges of `rid`, ordered by offset.
    pub fn region_ranges(&self, rid: RegionId) -> Option<Vec<(u64, u64)>> {
        let tracker = &self.regions[self.position(rid)?];
        let mut ranges = Vec::new();
        let mut idx = tracker.head;
        while idx != NIL {
            let node = tracker.ranges.get(idx);
            ranges.push((node.offset, node.length));
            idx = node.next;
        }
        Some(ranges)
    }

    /// Whether `rid` was registered through this endpoint (`true`) or
    /// synthesized from a peer-registered region on dequeue (`false`).
    pub fn region_consistent(&self, rid: RegionId) -> Option<bool> {
        let tracker = &self.regions[self.position(rid)?];
        Some(!tracker.not_consistent)
    }

    /// The tracked extent of `rid`. For not-consistent regions this is a
    /// lower bound that grows as buffers arrive.
    pub fn region_length(&self, rid: RegionId) -> Option<u64> {
        Some(self.regions[self.position(rid)?].length)
    }

    /// Write the free-range list of `rid` to stderr.
    pub fn dump_region(&self, rid: RegionId) {
        match self.position(rid) {
            Some(pos) => self.regions[pos].dump(),
            None => eprint!("descq: debug: no region rid={} to dump\n", rid.0),
        }
    }

    /// Write the recorded operation history to stderr.
    #[cfg(feature = "history")]
    pub fn dump_history(&self) {
        self.history.dump();
    }
}

impl<Q: DescQueue> DescQueue for DebugQueue<Q> {
    fn register(&mut self, block: MemBlock) -> Result<RegionId, Error> {
        let rid = self.inner.register(block)?;
        let tracker = RegionTracker::with_range(rid, block.len, false)?;
        self.push_tracker(tracker)?;
        Ok(rid)
    }

    fn deregister(&mut self, rid: RegionId) -> Result<MemBlock, Error> {
        let pos = self.position(rid).ok_or(Error::InvalidRegionId)?;

        if !self.regions[pos].is_whole() {
            eprint!(
                "descq: debug: deregister of rid={} with buffers still in flight\n",
                rid.0
            );
            self.regions[pos].dump();
            return Err(Error::RegionDestroy);
        }

        let block = self.inner.deregister(rid)?;
        self.regions.remove(pos);
        Ok(block)
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
        debug_assert!(length > 0);

        let pos = self.position(rid).ok_or(Error::InvalidRegionId)?;

        if self.regions[pos].head == NIL {
            // Everything is in flight already.
            return Err(Error::BufferAlreadyInUse);
        }

        let idx = match self.regions[pos].find_containing(offset, length) {
            Some(idx) => idx,
            None => {
                eprint!(
                    "descq: debug: enqueue of unowned buffer rid={} offset={} length={}\n",
                    rid.0, offset, length
                );
                #[cfg(feature = "history")]
                self.history.dump();
                self.regions[pos].dump();
                return Err(Error::InvalidBufferArgs);
            }
        };

        self.inner
            .enqueue(rid, offset, length, valid_data, valid_length, flags)?;

        self.regions[pos].remove_split(idx, offset, length)?;
        self.record("enq", offset, length);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<BufDesc, Error> {
        let buf = self.inner.dequeue()?;
        let (offset, length) = (buf.offset, buf.length);

        let pos = match self.position(buf.rid) {
            Some(pos) => pos,
            None => {
                // The layers below checked the region id, so the peer
                // registered this region without us seeing it. Track it
                // with what we know: it is at least this long.
                let tracker = RegionTracker::with_range(buf.rid, offset + length, true)?;
                self.push_tracker(tracker)?;
                self.record("deq", offset, length);
                return Ok(buf);
            }
        };

        let tracker = &mut self.regions[pos];
        if tracker.not_consistent && offset + length > tracker.length {
            tracker.length = offset + length;
        }

        tracker.insert_merge(offset, length)?;
        self.record("deq", offset, length);
        Ok(buf)
    }

    fn notify(&mut self) -> Result<(), Error> {
        self.inner.notify()
    }

    fn control(&mut self, request: u64, value: u64) -> Result<u64, Error> {
        self.inner.control(request, value)
    }

    fn destroy(self) -> Result<(), Error> {
        self.inner.destroy()
    }
}
