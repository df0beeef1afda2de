//! Region bookkeeping for one queue endpoint.
//!
//! The pool maps region ids to the memory blocks they were registered with
//! and is the authority for the buffer-boundary checks bracketing every
//! transfer. The table length is always a power of two so `id & (size - 1)`
//! is a valid slot index; ids start from a randomized base with the probe
//! displacement in the lower bits.

use alloc::vec::Vec;

use crate::queue::{Error, MemBlock, RegionId};

/// Initial table length, in slots.
const INIT_POOL_SIZE: u16 = 16;

#[derive(Debug, Copy, Clone)]
struct Region {
    id: RegionId,
    block: MemBlock,
}

/// The set of regions registered on one endpoint.
pub struct RegionPool {
    /// Table length, always a power of two.
    size: u16,
    /// Number of occupied slots, `num_regions <= size`.
    num_regions: u16,
    /// Randomized base the assigned ids start from.
    region_offset: u32,
    /// Probe displacement of the last insert, making runs of inserts cheap.
    last_offset: u16,
    slots: Vec<Option<Region>>,
}

fn random_offset() -> u32 {
    let mut bytes = [0u8; 4];
    let got = unsafe { libc::getrandom(bytes.as_mut_ptr() as *mut libc::c_void, 4, 0) };
    let seed = if got == 4 {
        u32::from_ne_bytes(bytes)
    } else {
        unsafe { libc::time(core::ptr::null_mut()) as u32 }
    };
    // Keep headroom in the high bits; they tag ids of this pool.
    seed >> 12
}

impl RegionPool {
    pub fn new() -> Result<Self, Error> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(INIT_POOL_SIZE as usize)
            .map_err(|_| Error::MallocFail)?;
        slots.resize_with(INIT_POOL_SIZE as usize, || None);

        Ok(RegionPool {
            size: INIT_POOL_SIZE,
            num_regions: 0,
            region_offset: random_offset(),
            last_offset: 0,
            slots,
        })
    }

    pub fn num_regions(&self) -> usize {
        self.num_regions as usize
    }

    fn slot_index(&self, id: u32) -> usize {
        (id & (self.size as u32 - 1)) as usize
    }

    /// Double the table and rehash by `id & (size - 1)`.
    fn grow(&mut self) -> Result<(), Error> {
        let new_size = self.size * 2;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(new_size as usize)
            .map_err(|_| Error::MallocFail)?;
        slots.resize_with(new_size as usize, || None);

        for region in self.slots.drain(..).flatten() {
            let index = (region.id.0 & (new_size as u32 - 1)) as usize;
            slots[index] = Some(region);
        }

        self.slots = slots;
        self.size = new_size;
        self.last_offset = 0;
        Ok(())
    }

    /// Register a new block, assigning it a fresh id.
    ///
    /// Rejects blocks that duplicate or overlap an already registered
    /// physical interval.
    pub fn add_region(&mut self, block: MemBlock) -> Result<RegionId, Error> {
        for region in self.slots.iter().flatten() {
            if region.block.paddr == block.paddr {
                return Err(Error::InvalidRegionArgs);
            }

            // Entirely before or entirely after, anything else overlaps.
            let before = block.paddr + block.len <= region.block.paddr;
            let after = region.block.paddr + region.block.len <= block.paddr;
            if !(before || after) {
                return Err(Error::InvalidRegionArgs);
            }
        }

        if self.num_regions >= self.size {
            self.grow()?;
        }

        self.num_regions += 1;
        let base = self
            .region_offset
            .wrapping_add(self.num_regions as u32);

        // Linear probe from the last displacement for an empty slot; at
        // least one slot is free after the growth check above.
        let mut offset = self.last_offset;
        let id = loop {
            let id = base.wrapping_add(offset as u32);
            if self.slots[self.slot_index(id)].is_none() {
                break id;
            }
            offset = offset.wrapping_add(1);
        };
        self.last_offset = offset;

        let rid = RegionId(id);
        let index = self.slot_index(id);
        self.slots[index] = Some(Region { id: rid, block });
        Ok(rid)
    }

    /// Register a block under an id the peer assigned.
    pub fn add_region_with_id(&mut self, block: MemBlock, rid: RegionId) -> Result<(), Error> {
        if self.num_regions >= self.size {
            self.grow()?;
        }

        let index = self.slot_index(rid.0);
        if self.slots[index].is_some() {
            return Err(Error::InvalidRegionId);
        }

        self.slots[index] = Some(Region { id: rid, block });
        self.num_regions += 1;
        Ok(())
    }

    pub fn remove_region(&mut self, rid: RegionId) -> Result<MemBlock, Error> {
        let index = self.slot_index(rid.0);
        match self.slots[index] {
            Some(region) if region.id == rid => {
                self.slots[index] = None;
                self.num_regions -= 1;
                Ok(region.block)
            }
            _ => Err(Error::InvalidRegionId),
        }
    }

    pub fn get(&self, rid: RegionId) -> Option<MemBlock> {
        match self.slots[self.slot_index(rid.0)] {
            Some(region) if region.id == rid => Some(region.block),
            _ => None,
        }
    }

    /// True iff the region exists and the buffer and its valid range lie
    /// within it.
    pub fn check_bounds(
        &self,
        rid: RegionId,
        offset: u64,
        length: u64,
        valid_data: u64,
        valid_length: u64,
    ) -> bool {
        let region = match self.get(rid) {
            Some(region) => region,
            None => return false,
        };

        let buf_end = match offset.checked_add(length) {
            Some(end) => end,
            None => return false,
        };
        let valid_end = match valid_data.checked_add(valid_length) {
            Some(end) => end,
            None => return false,
        };

        buf_end <= region.len && valid_end <= length
    }

    /// Drop all remaining regions.
    pub fn destroy(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.num_regions = 0;
    }
}
