use std::collections::VecDeque;

use descq::debug::DebugQueue;
use descq::ffq::FfQueue;
use descq::loopback::LoopbackQueue;
use descq::{BufFlags, DescQueue, Error, MemBlock, RegionId};

fn region(len: u64) -> MemBlock {
    MemBlock {
        vaddr: 0x7fbc_0000_0000,
        paddr: 0x6_0000_0000,
        len,
    }
}

fn wrapped(len: u64) -> (DebugQueue<LoopbackQueue>, RegionId) {
    let mut q = DebugQueue::create(LoopbackQueue::create().unwrap());
    let rid = q.register(region(len)).unwrap();
    (q, rid)
}

#[test]
fn register_starts_with_one_full_range() {
    let (q, rid) = wrapped(8192);

    assert_eq!(q.region_ranges(rid), Some(vec![(0, 8192)]));
    assert_eq!(q.region_consistent(rid), Some(true));
    assert_eq!(q.region_length(rid), Some(8192));
}

#[test]
fn enqueue_splits_and_dequeue_merges() {
    let (mut q, rid) = wrapped(8192);

    // A buffer from the middle splits the range in two.
    q.enqueue(rid, 2048, 2048, 0, 2048, BufFlags::empty())
        .unwrap();
    assert_eq!(q.region_ranges(rid), Some(vec![(0, 2048), (4096, 4096)]));

    // Taking it back fuses all three pieces again.
    let buf = q.dequeue().unwrap();
    assert_eq!((buf.offset, buf.length), (2048, 2048));
    assert_eq!(q.region_ranges(rid), Some(vec![(0, 8192)]));
}

#[test]
fn double_enqueue_is_refused_without_side_effect() {
    let (mut q, rid) = wrapped(8192);

    q.enqueue(rid, 2048, 2048, 0, 2048, BufFlags::empty())
        .unwrap();
    let before = q.region_ranges(rid);

    assert_eq!(
        q.enqueue(rid, 2048, 2048, 0, 2048, BufFlags::empty()),
        Err(Error::InvalidBufferArgs)
    );
    assert_eq!(q.region_ranges(rid), before);

    // The refused enqueue never reached the wrapped queue.
    assert_eq!(q.dequeue().unwrap().offset, 2048);
    assert_eq!(q.dequeue().unwrap_err(), Error::QueueEmpty);
}

#[test]
fn split_at_region_edges() {
    let (mut q, rid) = wrapped(8192);

    // Cut at the front.
    q.enqueue(rid, 0, 2048, 0, 2048, BufFlags::empty()).unwrap();
    assert_eq!(q.region_ranges(rid), Some(vec![(2048, 6144)]));

    // Cut at the back, at exactly `region.len - length`.
    q.enqueue(rid, 6144, 2048, 0, 2048, BufFlags::empty())
        .unwrap();
    assert_eq!(q.region_ranges(rid), Some(vec![(2048, 4096)]));

    // Merge back at both edges.
    q.dequeue().unwrap();
    assert_eq!(q.region_ranges(rid), Some(vec![(0, 6144)]));
    q.dequeue().unwrap();
    assert_eq!(q.region_ranges(rid), Some(vec![(0, 8192)]));
}

#[test]
fn dequeue_coalesces_three_ranges() {
    let (mut q, rid) = wrapped(8192);

    q.enqueue(rid, 0, 2048, 0, 2048, BufFlags::empty()).unwrap();
    q.enqueue(rid, 2048, 2048, 0, 2048, BufFlags::empty())
        .unwrap();
    q.enqueue(rid, 4096, 2048, 0, 2048, BufFlags::empty())
        .unwrap();
    assert_eq!(q.region_ranges(rid), Some(vec![(6144, 2048)]));

    // Returned out of the middle last: the final merge collapses the two
    // flanking ranges and the buffer into one.
    assert_eq!(q.dequeue().unwrap().offset, 0);
    assert_eq!(q.region_ranges(rid), Some(vec![(0, 2048), (6144, 2048)]));
    assert_eq!(q.dequeue().unwrap().offset, 2048);
    assert_eq!(q.region_ranges(rid), Some(vec![(0, 4096), (6144, 2048)]));
    assert_eq!(q.dequeue().unwrap().offset, 4096);
    assert_eq!(q.region_ranges(rid), Some(vec![(0, 8192)]));
}

#[test]
fn everything_in_flight_refuses_further_enqueues() {
    let (mut q, rid) = wrapped(4096);

    q.enqueue(rid, 0, 4096, 0, 4096, BufFlags::empty()).unwrap();
    assert_eq!(q.region_ranges(rid), Some(vec![]));

    assert_eq!(
        q.enqueue(rid, 0, 64, 0, 64, BufFlags::empty()),
        Err(Error::BufferAlreadyInUse)
    );

    q.dequeue().unwrap();
    assert_eq!(q.region_ranges(rid), Some(vec![(0, 4096)]));
}

#[test]
fn deregister_with_in_flight_buffers_fails() {
    let (mut q, rid) = wrapped(8192);

    q.enqueue(rid, 2048, 2048, 0, 2048, BufFlags::empty())
        .unwrap();
    assert_eq!(q.deregister(rid), Err(Error::RegionDestroy));

    // Once the buffer is back, the region can go.
    q.dequeue().unwrap();
    assert_eq!(q.deregister(rid), Ok(region(8192)));
    assert_eq!(q.region_ranges(rid), None);
}

#[test]
fn unknown_region_enqueue_is_refused() {
    let (mut q, _rid) = wrapped(8192);

    assert_eq!(
        q.enqueue(RegionId(999), 0, 64, 0, 64, BufFlags::empty()),
        Err(Error::InvalidRegionId)
    );
}

#[test]
fn dequeue_of_owned_bytes_is_detected() {
    let (mut q, rid) = wrapped(8192);

    q.enqueue(rid, 0, 2048, 0, 2048, BufFlags::empty()).unwrap();

    // Slip a descriptor for bytes this endpoint still owns past the
    // wrapper, straight into the wrapped queue.
    q.inner_mut()
        .enqueue(rid, 4096, 2048, 0, 2048, BufFlags::empty())
        .unwrap();

    assert_eq!(q.dequeue().unwrap().offset, 0);
    assert_eq!(q.dequeue().unwrap_err(), Error::BufferNotInUse);
}

#[test]
fn manual_region_sync() {
    let mut q = DebugQueue::create(LoopbackQueue::create().unwrap());
    let rid = RegionId(42);

    q.add_region(region(4096), rid).unwrap();
    assert_eq!(q.region_ranges(rid), Some(vec![(0, 4096)]));
    assert_eq!(q.region_consistent(rid), Some(true));
    assert_eq!(q.add_region(region(4096), rid), Err(Error::InvalidRegionId));

    q.remove_region(rid).unwrap();
    assert_eq!(q.region_ranges(rid), None);
    assert_eq!(q.remove_region(rid), Err(Error::InvalidRegionId));
}

// A peer-registered region is discovered on dequeue, tracked as not
// consistent, and its extent grows as buffers arrive.
#[test]
fn peer_region_is_synthesized_on_dequeue() {
    let name = format!("/descq-debug-synth-{}", std::process::id());
    let mut creator = FfQueue::create(&name, true).unwrap();
    let mut joiner = DebugQueue::create(FfQueue::create(&name, false).unwrap());

    let rid = creator.register(region(0x10000)).unwrap();
    creator
        .enqueue(rid, 0, 2048, 0, 2048, BufFlags::empty())
        .unwrap();

    let buf = joiner.dequeue().unwrap();
    assert_eq!((buf.rid, buf.offset, buf.length), (rid, 0, 2048));
    assert_eq!(joiner.region_consistent(rid), Some(false));
    assert_eq!(joiner.region_length(rid), Some(2048));
    assert_eq!(joiner.region_ranges(rid), Some(vec![(0, 2048)]));

    // Returning the buffer to the peer carves it back out.
    joiner
        .enqueue(rid, 0, 2048, 0, 2048, BufFlags::empty())
        .unwrap();
    assert_eq!(joiner.region_ranges(rid), Some(vec![]));

    // A buffer further into the region grows the tracked extent.
    creator
        .enqueue(rid, 4096, 2048, 0, 2048, BufFlags::empty())
        .unwrap();
    let buf = joiner.dequeue().unwrap();
    assert_eq!(buf.offset, 4096);
    assert_eq!(joiner.region_length(rid), Some(6144));
    assert_eq!(joiner.region_ranges(rid), Some(vec![(4096, 2048)]));
}

struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, max_exclusive: u64) -> u64 {
        self.next() % max_exclusive
    }
}

// Conservation: free ranges plus in-flight buffers always cover the region
// exactly, under a randomized enqueue/dequeue interleaving.
#[test]
fn ownership_is_conserved_under_fuzz() {
    const UNIT: u64 = 1024;
    const UNITS: u64 = 64;

    let (mut q, rid) = wrapped(UNIT * UNITS);

    let mut owned = [true; UNITS as usize];
    let mut inflight: VecDeque<(u64, u64)> = VecDeque::new();
    let mut rng = Rng(0x0dde_face_cafe_f00d);

    for _ in 0..20_000 {
        let try_enqueue = rng.below(2) == 0;

        if try_enqueue {
            // Pick a run of owned units, if one starts here.
            let start = rng.below(UNITS) as usize;
            let mut run = 0;
            while start + run < UNITS as usize && owned[start + run] {
                run += 1;
            }

            if run > 0 {
                let units = 1 + rng.below(run.min(4) as u64);
                let offset = start as u64 * UNIT;
                let length = units * UNIT;
                q.enqueue(rid, offset, length, 0, length, BufFlags::empty())
                    .unwrap();
                for unit in 0..units as usize {
                    owned[start + unit] = false;
                }
                inflight.push_back((offset, length));
            }
        } else if let Some((offset, length)) = inflight.pop_front() {
            let buf = q.dequeue().unwrap();
            assert_eq!((buf.offset, buf.length), (offset, length));
            for unit in 0..(length / UNIT) as usize {
                owned[(offset / UNIT) as usize + unit] = true;
            }
        }

        // The tracker must agree with the model, range for range.
        let mut expected = Vec::new();
        let mut unit = 0usize;
        while unit < UNITS as usize {
            if owned[unit] {
                let start = unit;
                while unit < UNITS as usize && owned[unit] {
                    unit += 1;
                }
                expected.push((start as u64 * UNIT, (unit - start) as u64 * UNIT));
            } else {
                unit += 1;
            }
        }
        assert_eq!(q.region_ranges(rid), Some(expected.clone()));

        let covered: u64 = expected.iter().map(|(_, len)| len).sum();
        let in_flight: u64 = inflight.iter().map(|(_, len)| len).sum();
        assert_eq!(covered + in_flight, UNIT * UNITS);
    }
}
