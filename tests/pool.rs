use descq::pool::RegionPool;
use descq::{Error, MemBlock};

fn block(paddr: u64, len: u64) -> MemBlock {
    MemBlock {
        vaddr: 0x7f00_0000_0000 + paddr,
        paddr,
        len,
    }
}

#[test]
fn assigns_unique_ids() {
    let mut pool = RegionPool::new().unwrap();

    let mut ids = Vec::new();
    for i in 0..8u64 {
        let rid = pool.add_region(block(i * 0x10000, 0x1000)).unwrap();
        ids.push(rid);
    }

    assert_eq!(pool.num_regions(), 8);
    for (i, rid) in ids.iter().enumerate() {
        assert_eq!(pool.get(*rid), Some(block(i as u64 * 0x10000, 0x1000)));
    }

    let mut deduped = ids.clone();
    deduped.sort_by_key(|rid| rid.0);
    deduped.dedup();
    assert_eq!(deduped.len(), ids.len());
}

#[test]
fn rejects_duplicate_paddr() {
    let mut pool = RegionPool::new().unwrap();
    pool.add_region(block(0x1000, 0x1000)).unwrap();

    assert_eq!(
        pool.add_region(block(0x1000, 0x2000)),
        Err(Error::InvalidRegionArgs)
    );
}

#[test]
fn rejects_overlapping_regions() {
    let mut pool = RegionPool::new().unwrap();
    pool.add_region(block(0x1000, 0x1000)).unwrap();

    // Overlaps the tail of the registered interval.
    assert_eq!(
        pool.add_region(block(0x1800, 0x1000)),
        Err(Error::InvalidRegionArgs)
    );
    // Contains it entirely.
    assert_eq!(
        pool.add_region(block(0x0, 0x10000)),
        Err(Error::InvalidRegionArgs)
    );
    // Touching intervals are fine.
    pool.add_region(block(0x2000, 0x1000)).unwrap();
    pool.add_region(block(0x0, 0x1000)).unwrap();
}

#[test]
fn grows_past_initial_capacity() {
    let mut pool = RegionPool::new().unwrap();

    let mut ids = Vec::new();
    for i in 0..40u64 {
        ids.push(pool.add_region(block(i * 0x10000, 0x1000)).unwrap());
    }
    assert_eq!(pool.num_regions(), 40);

    for (i, rid) in ids.iter().enumerate() {
        assert_eq!(pool.get(*rid), Some(block(i as u64 * 0x10000, 0x1000)));
    }

    for rid in ids {
        pool.remove_region(rid).unwrap();
    }
    assert_eq!(pool.num_regions(), 0);
}

#[test]
fn remove_of_unknown_region_fails() {
    let mut pool = RegionPool::new().unwrap();
    let rid = pool.add_region(block(0x1000, 0x1000)).unwrap();

    pool.remove_region(rid).unwrap();
    assert_eq!(pool.remove_region(rid), Err(Error::InvalidRegionId));
}

#[test]
fn register_deregister_cycle_is_idempotent() {
    let mut pool = RegionPool::new().unwrap();
    let b = block(0x4000, 0x2000);

    for _ in 0..5 {
        let rid = pool.add_region(b).unwrap();
        assert_eq!(pool.get(rid), Some(b));
        assert_eq!(pool.remove_region(rid), Ok(b));
        assert_eq!(pool.num_regions(), 0);
    }
}

#[test]
fn bounds_check_edges() {
    let mut pool = RegionPool::new().unwrap();
    let rid = pool.add_region(block(0x1000, 0x1000)).unwrap();

    // The whole region is a valid buffer.
    assert!(pool.check_bounds(rid, 0, 0x1000, 0, 0x1000));
    // A buffer ending exactly at the region end.
    assert!(pool.check_bounds(rid, 0x1000 - 0x200, 0x200, 0, 0x200));
    // One byte past the end.
    assert!(!pool.check_bounds(rid, 0x1000 - 0x200, 0x201, 0, 0x200));
    // Valid range extending past the buffer.
    assert!(!pool.check_bounds(rid, 0, 0x200, 0x100, 0x101));
    // Unknown region.
    pool.remove_region(rid).unwrap();
    assert!(!pool.check_bounds(rid, 0, 0x100, 0, 0x100));
}

#[test]
fn bounds_check_rejects_overflowing_ranges() {
    let mut pool = RegionPool::new().unwrap();
    let rid = pool.add_region(block(0x1000, 0x1000)).unwrap();

    assert!(!pool.check_bounds(rid, u64::MAX, 2, 0, 1));
    assert!(!pool.check_bounds(rid, 0, 0x100, u64::MAX, 2));
}
