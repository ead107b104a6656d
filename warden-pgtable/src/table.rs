//! I/O page table operations
//!
//! # Mapping
//!
//! Callers choose the leaf size: [`IoPageTable::map_pages`] installs
//! `pgcount` leaves of `pgsize` bytes, allocating intermediate tables on
//! demand. Greedy block selection (largest aligned size first) is the
//! caller's job, so the same table serves both DMA mappings (mostly 4KB) and
//! identity maps (mostly 1GB/2MB blocks).
//!
//! # Unmapping
//!
//! [`IoPageTable::unmap_pages`] stops at the first hole and never splits a
//! block larger than the requested page size. Intermediate tables left empty
//! by an unmap are detached from their parent and queued in the gather, so
//! the table never holds more memory than its live mappings need.

use core::ptr::{read_volatile, write_volatile};

use alloc::sync::Arc;

use warden_common::memory::page;
use warden_common::{FrameAllocator, PhysAddr};
use warden_mmio::barrier;

use crate::ENTRIES_PER_TABLE;
use crate::config::{
    IoPgtableCfg, MAIR, SH_IS, Stage1Regs, Stage2Regs, TG_4K, Tcr, Vtcr,
    pa_size_encoding,
};
use crate::descriptors::{
    self, LEAF_LEVEL, is_table, is_valid, leaf_descriptor, leaf_level_for, level_index,
    level_size, output_address, table_descriptor,
};
use crate::error::PgtableError;
use crate::gather::{FlushOps, IotlbGather};
use crate::prot::IommuProt;

/// Result of looking up one IOVA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// A leaf maps `[iova, iova + size)` to `[pa, pa + size)`
    Leaf { iova: u64, pa: PhysAddr, size: u64 },
    /// Nothing is mapped in `[iova, iova + size)`
    Hole { iova: u64, size: u64 },
}

/// An LPAE I/O page table.
///
/// Owns every table frame reachable from its root; dropping the table frees
/// them. The controller must have stopped walking it (detached and
/// invalidated) before that happens.
pub struct IoPageTable {
    cfg: IoPgtableCfg,
    root: PhysAddr,
    alloc: Arc<dyn FrameAllocator>,
}

impl IoPageTable {
    /// Allocate an empty table.
    pub fn new(cfg: IoPgtableCfg, alloc: Arc<dyn FrameAllocator>) -> Result<Self, PgtableError> {
        let cfg = cfg.finalize()?;
        let root = alloc.alloc_zeroed(0).ok_or(PgtableError::AllocationFailed)?;
        log::debug!(
            "io-pgtable: {:?} ias={} oas={} levels={} root={}",
            cfg.fmt,
            cfg.ias,
            cfg.oas,
            cfg.levels(),
            root
        );
        Ok(Self { cfg, root, alloc })
    }

    /// Configuration after finalization.
    #[inline]
    #[must_use]
    pub const fn cfg(&self) -> &IoPgtableCfg {
        &self.cfg
    }

    /// Physical address of the root table.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    /// Translation registers for a stage 1 context descriptor.
    #[must_use]
    pub fn stage1_regs(&self) -> Stage1Regs {
        let rgn = self.cfg.walk_rgn();
        Stage1Regs {
            ttbr: self.root.as_u64(),
            tcr: Tcr {
                t0sz: (64 - self.cfg.ias) as u8,
                tg0: TG_4K,
                irgn0: rgn,
                orgn0: rgn,
                sh0: SH_IS,
                ips: pa_size_encoding(self.cfg.oas).unwrap_or(0b101),
            },
            mair: MAIR,
        }
    }

    /// Translation registers for a stage 2 stream table entry.
    #[must_use]
    pub fn stage2_regs(&self) -> Stage2Regs {
        let rgn = self.cfg.walk_rgn();
        Stage2Regs {
            vttbr: self.root.as_u64(),
            vtcr: Vtcr {
                t0sz: (64 - self.cfg.ias) as u8,
                // 4KB granule: SL0 counts down from level 2
                sl0: (2 - self.cfg.start_level()) as u8,
                irgn0: rgn,
                orgn0: rgn,
                sh0: SH_IS,
                tg0: TG_4K,
                ps: pa_size_encoding(self.cfg.oas).unwrap_or(0b101),
            },
        }
    }

    // -- Raw table access

    fn read_pte(&self, table: PhysAddr, index: usize) -> u64 {
        debug_assert!(index < ENTRIES_PER_TABLE);
        let ptr = table.to_virt().as_ptr::<u64>();
        // SAFETY: table is a live table frame owned by this page table and
        // index is below ENTRIES_PER_TABLE
        unsafe { read_volatile(ptr.add(index)) }
    }

    fn write_pte(&self, table: PhysAddr, index: usize, value: u64) {
        debug_assert!(index < ENTRIES_PER_TABLE);
        let ptr = table.to_virt().as_mut_ptr::<u64>();
        // SAFETY: table is a live table frame owned by this page table and
        // index is below ENTRIES_PER_TABLE
        unsafe { write_volatile(ptr.add(index), value) }
    }

    fn table_is_empty(&self, table: PhysAddr) -> bool {
        (0..ENTRIES_PER_TABLE).all(|i| self.read_pte(table, i) == 0)
    }

    fn check_pgsize(&self, pgsize: u64) -> Result<u32, PgtableError> {
        if !pgsize.is_power_of_two() || self.cfg.pgsize_bitmap & pgsize == 0 {
            return Err(PgtableError::UnsupportedPageSize(pgsize));
        }
        leaf_level_for(pgsize).ok_or(PgtableError::UnsupportedPageSize(pgsize))
    }

    fn check_iova(&self, iova: u64, size: u64) -> Result<(), PgtableError> {
        let limit = 1u64 << self.cfg.ias;
        match iova.checked_add(size) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(PgtableError::OutOfRange),
        }
    }

    // -- Map

    /// Map `pgcount` leaves of `pgsize` bytes from `iova` to `paddr`.
    ///
    /// `mapped` is increased by the bytes actually installed, including on
    /// failure, so the caller can unwind a partial mapping. A request without
    /// read or write access maps nothing and succeeds.
    pub fn map_pages(
        &mut self,
        iova: u64,
        paddr: PhysAddr,
        pgsize: u64,
        pgcount: u64,
        prot: IommuProt,
        mapped: &mut u64,
    ) -> Result<(), PgtableError> {
        let leaf_level = self.check_pgsize(pgsize)?;
        if iova & (pgsize - 1) != 0 || paddr.as_u64() & (pgsize - 1) != 0 {
            return Err(PgtableError::NotAligned);
        }
        let size = pgsize
            .checked_mul(pgcount)
            .ok_or(PgtableError::OutOfRange)?;
        self.check_iova(iova, size)?;
        match paddr.as_u64().checked_add(size) {
            Some(end) if end <= 1u64 << self.cfg.oas => {}
            _ => return Err(PgtableError::OutOfRange),
        }
        if !prot.is_accessible() {
            return Ok(());
        }

        let mut result = Ok(());
        for i in 0..pgcount {
            let offset = i * pgsize;
            if let Err(e) = self.map_one(iova + offset, paddr.offset(offset), leaf_level, prot) {
                result = Err(e);
                break;
            }
            *mapped += pgsize;
        }

        // Leaves must reach the walker before the caller publishes them.
        barrier::dsb_ishst();
        result
    }

    fn map_one(
        &mut self,
        iova: u64,
        paddr: PhysAddr,
        leaf_level: u32,
        prot: IommuProt,
    ) -> Result<(), PgtableError> {
        let mut table = self.root;
        let mut level = self.cfg.start_level();

        while level < leaf_level {
            let index = level_index(iova, level);
            let pte = self.read_pte(table, index);
            table = if is_table(pte, level) {
                output_address(pte)
            } else if is_valid(pte) {
                return Err(PgtableError::AlreadyMapped);
            } else {
                let child = self
                    .alloc
                    .alloc_zeroed(0)
                    .ok_or(PgtableError::AllocationFailed)?;
                // The zeroed child must be visible before it is linked.
                barrier::dsb_ishst();
                self.write_pte(table, index, table_descriptor(child));
                child
            };
            level += 1;
        }

        let index = level_index(iova, leaf_level);
        if is_valid(self.read_pte(table, index)) {
            return Err(PgtableError::AlreadyMapped);
        }
        self.write_pte(
            table,
            index,
            leaf_descriptor(paddr, leaf_level, prot, self.cfg.fmt),
        );
        Ok(())
    }

    // -- Unmap

    /// Unmap up to `pgcount` leaves of `pgsize` bytes starting at `iova`.
    ///
    /// Returns the number of bytes unmapped. Stops early at a hole or at a
    /// block larger than `pgsize`. Cleared leaves are reported through
    /// `flush.add_page`; tables freed by the unmap are queued in `gather` and
    /// must be released with [`release_freelist`](Self::release_freelist)
    /// once the gathered range has been invalidated.
    pub fn unmap_pages(
        &mut self,
        iova: u64,
        pgsize: u64,
        pgcount: u64,
        gather: &mut IotlbGather,
        flush: &dyn FlushOps,
    ) -> u64 {
        let Ok(leaf_level) = self.check_pgsize(pgsize) else {
            log::warn!("io-pgtable: unmap with unsupported page size {pgsize:#x}");
            return 0;
        };
        if iova & (pgsize - 1) != 0 {
            log::warn!("io-pgtable: unaligned unmap at {iova:#x}");
            return 0;
        }
        let Some(size) = pgsize.checked_mul(pgcount) else {
            return 0;
        };
        if self.check_iova(iova, size).is_err() {
            return 0;
        }

        let mut unmapped = 0;
        for i in 0..pgcount {
            if !self.unmap_one(iova + i * pgsize, leaf_level, gather, flush) {
                break;
            }
            unmapped += pgsize;
        }
        unmapped
    }

    fn unmap_one(
        &mut self,
        iova: u64,
        leaf_level: u32,
        gather: &mut IotlbGather,
        flush: &dyn FlushOps,
    ) -> bool {
        // (parent table, index in parent) for every table below the root
        let mut path = [(PhysAddr::new(0), 0usize); 4];
        let mut depth = 0;
        let mut table = self.root;
        let mut level = self.cfg.start_level();

        loop {
            let index = level_index(iova, level);
            let pte = self.read_pte(table, index);
            if !is_valid(pte) {
                return false;
            }

            if level == leaf_level {
                self.write_pte(table, index, 0);
                if is_table(pte, level) {
                    // A whole sub-table of smaller leaves goes at once.
                    flush.flush_walk(iova, level_size(level), page::SIZE_4K);
                    self.collect_tables(output_address(pte), level + 1, gather);
                } else {
                    flush.add_page(gather, iova, level_size(level));
                }
                break;
            }

            if !is_table(pte, level) {
                log::warn!(
                    "io-pgtable: partial unmap of {:#x}-byte block at {iova:#x}",
                    level_size(level)
                );
                return false;
            }
            path[depth] = (table, index);
            depth += 1;
            table = output_address(pte);
            level += 1;
        }

        // Detach tables this unmap left empty, bottom-up; the root stays.
        while depth > 0 && self.table_is_empty(table) {
            depth -= 1;
            let (parent, index) = path[depth];
            level -= 1;
            self.write_pte(parent, index, 0);
            let span = level_size(level);
            flush.flush_walk(iova & !(span - 1), span, page::SIZE_4K);
            gather.push_free(table);
            table = parent;
        }
        true
    }

    /// Queue `table` and every table below it for release.
    fn collect_tables(&self, table: PhysAddr, level: u32, gather: &mut IotlbGather) {
        if level < LEAF_LEVEL {
            for i in 0..ENTRIES_PER_TABLE {
                let pte = self.read_pte(table, i);
                if is_table(pte, level) {
                    self.collect_tables(output_address(pte), level + 1, gather);
                }
            }
        }
        gather.push_free(table);
    }

    /// Release tables queued by unmaps.
    ///
    /// Call only after the controller has invalidated the gathered range.
    pub fn release_freelist(&self, gather: &mut IotlbGather) {
        for table in gather.take_freelist() {
            // SAFETY: the table was detached by an unmap and the caller has
            // invalidated every walk that could still reach it
            unsafe { self.alloc.free(table, 0) };
        }
    }

    // -- Lookup

    /// Look up the leaf (or hole) covering `iova`.
    #[must_use]
    pub fn lookup(&self, iova: u64) -> Lookup {
        let mut table = self.root;
        let mut level = self.cfg.start_level();
        loop {
            let pte = self.read_pte(table, level_index(iova, level));
            let size = level_size(level);
            let base = iova & !(size - 1);
            if !is_valid(pte) {
                return Lookup::Hole { iova: base, size };
            }
            if is_table(pte, level) {
                table = output_address(pte);
                level += 1;
                continue;
            }
            return Lookup::Leaf {
                iova: base,
                pa: output_address(pte),
                size,
            };
        }
    }

    /// Translate `iova`, or `None` when it is not mapped.
    #[must_use]
    pub fn iova_to_phys(&self, iova: u64) -> Option<PhysAddr> {
        if self.check_iova(iova, 0).is_err() {
            return None;
        }
        match self.lookup(iova) {
            Lookup::Leaf { iova: base, pa, .. } => Some(pa.offset(iova - base)),
            Lookup::Hole { .. } => None,
        }
    }

    /// Visit every leaf overlapping `[iova, iova + size)` as
    /// `(leaf_iova, pa, leaf_size)`.
    pub fn walk<F>(&self, iova: u64, size: u64, mut visit: F)
    where
        F: FnMut(u64, PhysAddr, u64),
    {
        let end = iova.saturating_add(size).min(1u64 << self.cfg.ias);
        let mut cursor = iova;
        while cursor < end {
            let next = match self.lookup(cursor) {
                Lookup::Leaf { iova, pa, size } => {
                    visit(iova, pa, size);
                    iova + size
                }
                Lookup::Hole { iova, size } => iova + size,
            };
            cursor = next;
        }
    }

    /// Access granted by the leaf covering `iova`.
    #[must_use]
    pub fn prot_at(&self, iova: u64) -> Option<IommuProt> {
        let mut table = self.root;
        let mut level = self.cfg.start_level();
        loop {
            let pte = self.read_pte(table, level_index(iova, level));
            if !is_valid(pte) {
                return None;
            }
            if is_table(pte, level) {
                table = output_address(pte);
                level += 1;
                continue;
            }
            return Some(descriptors::leaf_prot(pte, self.cfg.fmt));
        }
    }

    // -- Teardown

    /// Free the table and every frame it owns.
    pub fn free(self) {
        drop(self);
    }

    fn free_tables(&self, table: PhysAddr, level: u32) {
        if level < LEAF_LEVEL {
            for i in 0..ENTRIES_PER_TABLE {
                let pte = self.read_pte(table, i);
                if is_table(pte, level) {
                    self.free_tables(output_address(pte), level + 1);
                }
            }
        }
        // SAFETY: table is owned by this page table, which is being dropped
        unsafe { self.alloc.free(table, 0) };
    }
}

impl Drop for IoPageTable {
    fn drop(&mut self) {
        self.free_tables(self.root, self.cfg.start_level());
    }
}

impl core::fmt::Debug for IoPageTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoPageTable")
            .field("fmt", &self.cfg.fmt)
            .field("root", &self.root)
            .finish()
    }
}
