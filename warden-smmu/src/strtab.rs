//! Stream table
//!
//! One STE per stream ID, in one of two layouts chosen at probe:
//!
//! - **Linear**: `2^sid_bits` contiguous STEs.
//! - **Two-level**: an L1 array of descriptors, one per group of
//!   `2^STRTAB_SPLIT` streams, each pointing to a leaf of STEs. Leaves are
//!   allocated the first time a stream in their group is configured.
//!
//! ```text
//! L1 descriptor  SPAN[4:0] L2PTR[51:6]
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::write_volatile;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;
use tock_registers::{LocalRegisterCopy, register_bitfields};
use warden_common::{FrameAllocator, PhysAddr};
use warden_mmio::barrier;

use crate::config::STRTAB_SPLIT;
use crate::entry::{ENTRY_QWORDS, EntrySlot, EntryWriter, RawEntry, WriteMode, write_entry};
use crate::error::SmmuError;
use crate::frames::Frames;
use crate::regs::{STRTAB_BASE, STRTAB_BASE_CFG};
use crate::ste::{STE_SIZE, Ste};

register_bitfields![u64,
    L1_DESC [
        SPAN OFFSET(0) NUMBITS(5) [],
        L2PTR OFFSET(6) NUMBITS(46) []
    ]
];

/// Bytes per L1 descriptor
const L1_DESC_SIZE: usize = 8;

/// Memory of the top-level table.
enum Storage {
    Owned(Frames),
    /// Programmed by another agent; not freed here
    Adopted(PhysAddr),
}

impl Storage {
    fn pa(&self) -> PhysAddr {
        match self {
            Self::Owned(frames) => frames.pa(),
            Self::Adopted(pa) => *pa,
        }
    }

    fn as_mut_ptr<T>(&self) -> *mut T {
        self.pa().to_virt().as_mut_ptr()
    }
}

/// Stream table layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrtabLayout {
    Linear,
    TwoLevel,
}

/// The stream table of one controller.
pub struct StreamTable {
    layout: StrtabLayout,
    sid_bits: u32,
    storage: Storage,
    /// Leaf tables, indexed by L1 slot (two-level only); the lock serializes
    /// leaf allocation
    leaves: Mutex<Vec<Option<Frames>>>,
    leaf_allocations: AtomicUsize,
    alloc: Arc<dyn FrameAllocator>,
}

impl StreamTable {
    /// Allocate a table for `2^sid_bits` streams.
    ///
    /// Linear tables start with every STE set to abort. Two-level tables
    /// start with every L1 descriptor invalid.
    pub fn new(
        alloc: &Arc<dyn FrameAllocator>,
        sid_bits: u32,
        layout: StrtabLayout,
    ) -> Result<Self, SmmuError> {
        if layout == StrtabLayout::TwoLevel && sid_bits < STRTAB_SPLIT {
            return Err(SmmuError::Configuration);
        }
        let bytes = Self::top_level_size(layout, sid_bits);
        let frames = Frames::alloc(alloc, bytes as u64)?;
        let table = Self::with_storage(alloc, sid_bits, layout, Storage::Owned(frames));
        if layout == StrtabLayout::Linear {
            table.init_abort(table.storage.as_mut_ptr(), 1usize << sid_bits);
        }
        Ok(table)
    }

    /// Take over a table another agent placed at `base` and described in
    /// `cfg` (an STRTAB_BASE_CFG value).
    ///
    /// The table is cleared: every STE is disabled and every L1 descriptor
    /// invalid. Leaves are allocated from `alloc`.
    ///
    /// # Safety
    ///
    /// `base` must be memory of the size `cfg` describes, reachable through
    /// the direct map and reserved for this table until it is dropped.
    pub unsafe fn adopt(
        alloc: &Arc<dyn FrameAllocator>,
        base: PhysAddr,
        cfg: u32,
    ) -> Result<Self, SmmuError> {
        let (layout, sid_bits) = Self::parse_cfg(cfg)?;
        let table = Self::with_storage(alloc, sid_bits, layout, Storage::Adopted(base));
        let bytes = Self::top_level_size(layout, sid_bits);
        // SAFETY: the caller reserved `bytes` at base for this table
        unsafe { core::ptr::write_bytes(table.storage.as_mut_ptr::<u8>(), 0, bytes) };
        barrier::write_barrier();
        Ok(table)
    }

    /// Check an STRTAB_BASE_CFG value and decode its layout and width.
    pub fn parse_cfg(cfg: u32) -> Result<(StrtabLayout, u32), SmmuError> {
        let reg = LocalRegisterCopy::<u32, STRTAB_BASE_CFG::Register>::new(cfg);
        let sid_bits = reg.read(STRTAB_BASE_CFG::LOG2SIZE);
        let split = reg.read(STRTAB_BASE_CFG::SPLIT);
        match reg.read_as_enum(STRTAB_BASE_CFG::FMT) {
            Some(STRTAB_BASE_CFG::FMT::Value::Linear) if split == 0 => {
                Ok((StrtabLayout::Linear, sid_bits))
            }
            Some(STRTAB_BASE_CFG::FMT::Value::TwoLevel)
                if split == STRTAB_SPLIT && sid_bits >= STRTAB_SPLIT =>
            {
                Ok((StrtabLayout::TwoLevel, sid_bits))
            }
            _ => {
                log::warn!("strtab: unsupported configuration {cfg:#x}");
                Err(SmmuError::Configuration)
            }
        }
    }

    fn with_storage(
        alloc: &Arc<dyn FrameAllocator>,
        sid_bits: u32,
        layout: StrtabLayout,
        storage: Storage,
    ) -> Self {
        let l1_entries = match layout {
            StrtabLayout::Linear => 0,
            StrtabLayout::TwoLevel => 1usize << (sid_bits - STRTAB_SPLIT),
        };
        let mut leaves = Vec::new();
        leaves.resize_with(l1_entries, || None);
        Self {
            layout,
            sid_bits,
            storage,
            leaves: Mutex::new(leaves),
            leaf_allocations: AtomicUsize::new(0),
            alloc: Arc::clone(alloc),
        }
    }

    /// Bytes of the top-level table.
    #[must_use]
    pub const fn top_level_size(layout: StrtabLayout, sid_bits: u32) -> usize {
        match layout {
            StrtabLayout::Linear => STE_SIZE << sid_bits,
            StrtabLayout::TwoLevel => L1_DESC_SIZE << (sid_bits - STRTAB_SPLIT),
        }
    }

    fn init_abort(&self, ptr: *mut u64, count: usize) {
        let abort = Ste::abort();
        for i in 0..count {
            for (w, word) in abort.0.iter().enumerate() {
                // SAFETY: callers pass memory holding `count` STEs
                unsafe { write_volatile(ptr.add(i * ENTRY_QWORDS + w), *word) };
            }
        }
        barrier::write_barrier();
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> StrtabLayout {
        self.layout
    }

    #[inline]
    #[must_use]
    pub const fn sid_bits(&self) -> u32 {
        self.sid_bits
    }

    #[must_use]
    pub fn base(&self) -> PhysAddr {
        self.storage.pa()
    }

    /// Leaf tables allocated so far.
    #[must_use]
    pub fn leaf_allocations(&self) -> usize {
        self.leaf_allocations.load(Ordering::Relaxed)
    }

    /// Value for SMMU_STRTAB_BASE.
    #[must_use]
    pub fn base_register(&self) -> u64 {
        let mut reg = LocalRegisterCopy::<u64, STRTAB_BASE::Register>::new(0);
        reg.write(STRTAB_BASE::RA::SET + STRTAB_BASE::ADDR.val(self.base().as_u64() >> 6));
        reg.get()
    }

    /// Value for SMMU_STRTAB_BASE_CFG.
    #[must_use]
    pub fn cfg_register(&self) -> u32 {
        let mut reg = LocalRegisterCopy::<u32, STRTAB_BASE_CFG::Register>::new(0);
        let fmt = match self.layout {
            StrtabLayout::Linear => STRTAB_BASE_CFG::FMT::Linear + STRTAB_BASE_CFG::SPLIT.val(0),
            StrtabLayout::TwoLevel => {
                STRTAB_BASE_CFG::FMT::TwoLevel + STRTAB_BASE_CFG::SPLIT.val(STRTAB_SPLIT)
            }
        };
        reg.write(fmt + STRTAB_BASE_CFG::LOG2SIZE.val(self.sid_bits));
        reg.get()
    }

    fn check_sid(&self, sid: u32) -> Result<(), SmmuError> {
        if u64::from(sid) >> self.sid_bits != 0 {
            return Err(SmmuError::InvalidStreamId);
        }
        Ok(())
    }

    /// Make sure the leaf holding `sid` exists.
    ///
    /// Returns whether a leaf was allocated.
    pub fn ensure_leaf(&self, sid: u32) -> Result<bool, SmmuError> {
        self.check_sid(sid)?;
        if self.layout == StrtabLayout::Linear {
            return Ok(false);
        }

        let l1 = (sid >> STRTAB_SPLIT) as usize;
        let mut leaves = self.leaves.lock();
        if leaves[l1].is_some() {
            return Ok(false);
        }

        let leaf = Frames::alloc(&self.alloc, (STE_SIZE as u64) << STRTAB_SPLIT)?;
        self.init_abort(leaf.as_mut_ptr(), 1usize << STRTAB_SPLIT);

        let mut desc = LocalRegisterCopy::<u64, L1_DESC::Register>::new(0);
        desc.write(
            L1_DESC::SPAN.val(u64::from(STRTAB_SPLIT + 1))
                + L1_DESC::L2PTR.val(leaf.pa().as_u64() >> 6),
        );
        // SAFETY: l1 < number of L1 descriptors, which the top-level table holds
        unsafe { write_volatile(self.storage.as_mut_ptr::<u64>().add(l1), desc.get()) };
        barrier::write_barrier();

        log::debug!("strtab: leaf {l1} at {:?}", leaf.pa());
        leaves[l1] = Some(leaf);
        self.leaf_allocations.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Words of the STE for `sid`, if its leaf exists.
    fn slot(&self, sid: u32) -> Result<Option<RawEntry>, SmmuError> {
        self.check_sid(sid)?;
        let ptr = match self.layout {
            StrtabLayout::Linear => {
                // SAFETY: sid < 2^sid_bits, the number of STEs in the table
                unsafe { self.storage.as_mut_ptr::<u64>().add(sid as usize * ENTRY_QWORDS) }
            }
            StrtabLayout::TwoLevel => {
                let leaves = self.leaves.lock();
                let Some(leaf) = &leaves[(sid >> STRTAB_SPLIT) as usize] else {
                    return Ok(None);
                };
                let index = (sid & ((1 << STRTAB_SPLIT) - 1)) as usize;
                // SAFETY: index < 2^STRTAB_SPLIT, the number of STEs per leaf
                unsafe { leaf.as_mut_ptr::<u64>().add(index * ENTRY_QWORDS) }
            }
        };
        // SAFETY: ptr addresses one STE of table memory that lives as long as
        // the table (leaves are only freed on drop)
        Ok(Some(unsafe { RawEntry::new(ptr) }))
    }

    /// Current STE of `sid`; streams without a leaf read as disabled.
    pub fn get(&self, sid: u32) -> Result<Ste, SmmuError> {
        Ok(self
            .slot(sid)?
            .map_or(Ste::disabled(), |slot| Ste(slot.load())))
    }

    /// Install `target` for `sid`, allocating its leaf if needed.
    pub fn write<W: EntryWriter + ?Sized>(
        &self,
        sid: u32,
        target: &Ste,
        writer: &mut W,
    ) -> Result<WriteMode, SmmuError> {
        self.ensure_leaf(sid)?;
        let mut slot = self.slot(sid)?.ok_or(SmmuError::NotFound)?;
        write_entry(&mut slot, &target.0, writer)
    }
}

impl core::fmt::Debug for StreamTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamTable")
            .field("layout", &self.layout)
            .field("sid_bits", &self.sid_bits)
            .field("base", &self.base())
            .field("leaves", &self.leaf_allocations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryWords;
    use crate::ste::{SteMode, used_bits};
    use warden_common::HeapFrameAllocator;

    struct NoSync;

    impl EntryWriter for NoSync {
        fn used_bits(&self, entry: &EntryWords) -> EntryWords {
            used_bits(entry)
        }

        fn sync(&mut self) -> Result<(), SmmuError> {
            Ok(())
        }
    }

    fn alloc() -> (Arc<HeapFrameAllocator>, Arc<dyn FrameAllocator>) {
        let heap = Arc::new(HeapFrameAllocator::new());
        let dyn_alloc: Arc<dyn FrameAllocator> = heap.clone();
        (heap, dyn_alloc)
    }

    #[test]
    fn test_linear_table_starts_aborting() {
        let (_, alloc) = alloc();
        let table = StreamTable::new(&alloc, 4, StrtabLayout::Linear).unwrap();
        assert_eq!(table.get(15).unwrap().mode(), SteMode::Abort);
        assert_eq!(table.get(16), Err(SmmuError::InvalidStreamId));
        assert_eq!(table.cfg_register(), 4);
        assert_eq!(table.ensure_leaf(3), Ok(false));
    }

    #[test]
    fn test_two_level_allocates_one_leaf_per_group() {
        let (heap, alloc) = alloc();
        let table = StreamTable::new(&alloc, 16, StrtabLayout::TwoLevel).unwrap();
        let before = heap.allocations();
        assert_eq!(table.get(0x101).unwrap().mode(), SteMode::Disabled);

        table.write(0x101, &Ste::bypass(), &mut NoSync).unwrap();
        table.write(0x1ff, &Ste::bypass(), &mut NoSync).unwrap();
        assert_eq!(table.leaf_allocations(), 1);
        assert_eq!(heap.allocations(), before + 1);

        assert_eq!(table.get(0x101).unwrap().mode(), SteMode::Bypass);
        assert_eq!(table.get(0x100).unwrap().mode(), SteMode::Abort);

        table.write(0x201, &Ste::bypass(), &mut NoSync).unwrap();
        assert_eq!(table.leaf_allocations(), 2);
    }

    #[test]
    fn test_leaf_allocation_failure_is_retryable() {
        let (heap, alloc) = alloc();
        let table = StreamTable::new(&alloc, 12, StrtabLayout::TwoLevel).unwrap();
        heap.set_limit(heap.live_frames());
        let err = table.write(5, &Ste::bypass(), &mut NoSync).unwrap_err();
        assert_eq!(err, SmmuError::OutOfMemory);
        assert!(err.is_retryable());

        let err = table.write(1 << 12, &Ste::bypass(), &mut NoSync).unwrap_err();
        assert_eq!(err, SmmuError::InvalidStreamId);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cfg_round_trip_for_adoption() {
        let (_, alloc) = alloc();
        let table = StreamTable::new(&alloc, 16, StrtabLayout::TwoLevel).unwrap();
        assert_eq!(
            StreamTable::parse_cfg(table.cfg_register()),
            Ok((StrtabLayout::TwoLevel, 16))
        );
        // Two-level tables must use the driver's split
        let odd_split = (1 << 16) | (6 << 6) | 16;
        assert_eq!(StreamTable::parse_cfg(odd_split), Err(SmmuError::Configuration));
    }
}
