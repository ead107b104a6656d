//! Wrap-Bit Circular Queue Engine
//!
//! Generic producer/consumer ring used for both SMMU queues:
//!
//! - **Command queue**: the driver produces, the device consumes.
//! - **Event queue**: the device produces, the driver consumes.
//!
//! # Index Encoding
//!
//! A queue holds `2^log2size` entries. Producer and consumer indices carry
//! `log2size` index bits plus one wrap bit directly above them, so a full
//! queue (same index, different wrap) and an empty queue (same index, same
//! wrap) are distinguishable without sacrificing a slot. Bit 31 of the
//! producer is the overflow flag for device-produced queues: the device
//! toggles it when it drops entries, and the driver acknowledges by copying
//! it into the consumer.
//!
//! ```text
//!   31        log2size+1  log2size   log2size-1        0
//!  +---+------------------+---------+-------------------+
//!  |OVF|     (unused)     |  WRAP   |       INDEX       |
//!  +---+------------------+---------+-------------------+
//! ```
//!
//! # Memory Requirements
//!
//! Queue memory must be physically contiguous, zeroed, aligned to its total
//! size and remain valid for the lifetime of the queue.

use core::fmt;
use core::ptr::{read_volatile, write_volatile};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::barrier::{read_barrier, write_barrier};
use crate::poll::{Backoff, PollConfig};
use crate::region::RegisterIo;

/// Overflow flag carried in bit 31 of queue indices.
pub const OVERFLOW_FLAG: u32 = 1 << 31;

/// Largest supported queue size.
pub const MAX_LOG2SIZE: u32 = 19;

/// Trait for queue entries that can be safely shared with a device.
///
/// Entries must be POD (Plain Old Data) types that can be safely:
/// - Copied to/from DMA buffers
/// - Interpreted as raw bytes
pub trait QueueEntry:
    Copy + Default + Sized + FromBytes + IntoBytes + Immutable + KnownLayout
{
    /// Size of this entry type in bytes.
    const SIZE: usize = core::mem::size_of::<Self>();
}

impl<T> QueueEntry for T where
    T: Copy + Default + Sized + FromBytes + IntoBytes + Immutable + KnownLayout
{
}

/// Queue engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue did not drain within the poll budget
    Timeout,
    /// A single reservation is larger than the whole queue
    TooLarge {
        /// Entries requested
        requested: u32,
        /// Queue capacity
        capacity: u32,
    },
    /// The queue cannot hold the minimum number of entries required
    Capacity {
        /// Size the queue was clamped to
        log2size: u32,
        /// Entries required
        required: u32,
    },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "queue wait timed out"),
            Self::TooLarge {
                requested,
                capacity,
            } => write!(
                f,
                "reservation of {requested} entries exceeds queue capacity {capacity}"
            ),
            Self::Capacity { log2size, required } => write!(
                f,
                "queue of 2^{log2size} entries cannot hold {required} entries"
            ),
        }
    }
}

/// Clamp a requested queue size to the hardware maximum.
///
/// Fails when the clamped queue cannot hold `min_entries`.
pub fn clamp_log2size(requested: u32, hw_max: u32, min_entries: u32) -> Result<u32, QueueError> {
    let log2size = requested.min(hw_max).min(MAX_LOG2SIZE);
    if (1u32 << log2size) < min_entries {
        return Err(QueueError::Capacity {
            log2size,
            required: min_entries,
        });
    }
    Ok(log2size)
}

/// A circular queue shared with a device.
///
/// The queue caches both indices. The side the device owns is refreshed from
/// its register with [`sync_cons`](Self::sync_cons) or
/// [`sync_prod`](Self::sync_prod); the side the driver owns is published
/// with [`commit`](Self::commit) or [`consume`](Self::consume).
pub struct Queue<E: QueueEntry> {
    /// Pointer to the entry array
    entries: *mut E,
    /// DMA address of the entry array
    base: u64,
    log2size: u32,
    prod: u32,
    cons: u32,
    /// Register offset of the producer index
    prod_reg: usize,
    /// Register offset of the consumer index
    cons_reg: usize,
}

impl<E: QueueEntry> Queue<E> {
    /// Memory needed for a queue of `2^log2size` entries.
    #[inline]
    #[must_use]
    pub const fn memory_size(log2size: u32) -> usize {
        (1usize << log2size) * E::SIZE
    }

    /// Create a new queue with both indices at zero.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `vaddr` points to at least `memory_size(log2size)` bytes of memory
    ///   that the device sees at `base`
    /// - The memory remains valid for the lifetime of this queue
    #[inline]
    pub unsafe fn new(
        vaddr: *mut E,
        base: u64,
        log2size: u32,
        prod_reg: usize,
        cons_reg: usize,
    ) -> Self {
        debug_assert!(log2size <= MAX_LOG2SIZE, "queue too large");
        Self {
            entries: vaddr,
            base,
            log2size,
            prod: 0,
            cons: 0,
            prod_reg,
            cons_reg,
        }
    }

    /// DMA address of the entry array.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// log2 of the number of entries.
    #[inline]
    #[must_use]
    pub const fn log2size(&self) -> u32 {
        self.log2size
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        1 << self.log2size
    }

    /// Cached producer index (with wrap and overflow bits).
    #[inline]
    #[must_use]
    pub const fn prod(&self) -> u32 {
        self.prod
    }

    /// Cached consumer index (with wrap and overflow bits).
    #[inline]
    #[must_use]
    pub const fn cons(&self) -> u32 {
        self.cons
    }

    /// Slot number of an index.
    #[inline]
    #[must_use]
    pub const fn idx(&self, p: u32) -> u32 {
        p & (self.capacity() - 1)
    }

    #[inline]
    const fn wrp(&self, p: u32) -> u32 {
        p & self.capacity()
    }

    /// Index and wrap bits.
    #[inline]
    const fn index_mask(&self) -> u32 {
        (self.capacity() << 1) - 1
    }

    /// Advance an index by `n` slots, flipping the wrap bit on wrap-around.
    #[inline]
    #[must_use]
    pub const fn advance(&self, p: u32, n: u32) -> u32 {
        (((p & self.index_mask()) + n) & self.index_mask()) | (p & OVERFLOW_FLAG)
    }

    /// Free slots according to the cached indices.
    #[inline]
    #[must_use]
    pub const fn space(&self) -> u32 {
        if self.wrp(self.prod) == self.wrp(self.cons) {
            self.capacity() - (self.idx(self.prod) - self.idx(self.cons))
        } else {
            self.idx(self.cons) - self.idx(self.prod)
        }
    }

    /// Check whether `n` more entries fit according to the cached indices.
    #[inline]
    #[must_use]
    pub const fn has_space(&self, n: u32) -> bool {
        self.space() >= n
    }

    /// Check if the queue is full (same slot, different wrap).
    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.idx(self.prod) == self.idx(self.cons) && self.wrp(self.prod) != self.wrp(self.cons)
    }

    /// Check if the queue is empty (same slot, same wrap).
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.prod & self.index_mask() == self.cons & self.index_mask()
    }

    /// Check whether the producer reported an overflow not yet acknowledged.
    #[inline]
    #[must_use]
    pub const fn overflowed(&self) -> bool {
        (self.prod ^ self.cons) & OVERFLOW_FLAG != 0
    }

    /// Set both cached indices, for example after the device was reset or
    /// when adopting a queue another agent already programmed.
    #[inline]
    pub fn set_indices(&mut self, prod: u32, cons: u32) {
        self.prod = prod & (self.index_mask() | OVERFLOW_FLAG);
        self.cons = cons & (self.index_mask() | OVERFLOW_FLAG);
    }

    // -- Driver-produced queues

    /// Refresh the consumer index from the device.
    #[inline]
    pub fn sync_cons<R: RegisterIo + ?Sized>(&mut self, io: &R) {
        self.cons = io.read32(self.cons_reg) & self.index_mask();
    }

    /// Claim `n` contiguous slots, waiting for the device to drain the
    /// queue if needed.
    ///
    /// Returns the producer index of the first claimed slot.
    pub fn reserve<R: RegisterIo + ?Sized>(
        &mut self,
        io: &R,
        n: u32,
        poll: &PollConfig,
    ) -> Result<u32, QueueError> {
        if n > self.capacity() {
            return Err(QueueError::TooLarge {
                requested: n,
                capacity: self.capacity(),
            });
        }

        let mut backoff = Backoff::new(*poll);
        loop {
            if self.has_space(n) {
                return Ok(self.prod);
            }
            self.sync_cons(io);
            if self.has_space(n) {
                return Ok(self.prod);
            }
            backoff.wait().map_err(|_| QueueError::Timeout)?;
        }
    }

    /// Write an entry into the slot addressed by `p`.
    #[inline]
    pub fn write_entry(&mut self, p: u32, entry: &E) {
        let slot = self.idx(p) as usize;
        // SAFETY: slot < capacity and the entry array is valid for the
        // lifetime of the queue
        unsafe { write_volatile(self.entries.add(slot), *entry) }
    }

    /// Read the entry in the slot addressed by `p`.
    #[inline]
    #[must_use]
    pub fn read_entry(&self, p: u32) -> E {
        let slot = self.idx(p) as usize;
        // SAFETY: slot < capacity and the entry array is valid for the
        // lifetime of the queue
        unsafe { read_volatile(self.entries.add(slot)) }
    }

    /// Publish the producer index to the device.
    ///
    /// Entry writes are ordered before the index update.
    #[inline]
    pub fn commit<R: RegisterIo + ?Sized>(&mut self, io: &R, new_prod: u32) {
        write_barrier();
        self.prod = new_prod;
        io.write32(self.prod_reg, new_prod);
    }

    /// Reserve, write and publish `entries` in one step.
    ///
    /// Returns the new producer index.
    pub fn push<R: RegisterIo + ?Sized>(
        &mut self,
        io: &R,
        entries: &[E],
        poll: &PollConfig,
    ) -> Result<u32, QueueError> {
        let n = u32::try_from(entries.len()).map_err(|_| QueueError::TooLarge {
            requested: u32::MAX,
            capacity: self.capacity(),
        })?;
        let start = self.reserve(io, n, poll)?;
        for (i, entry) in entries.iter().enumerate() {
            let p = self.advance(start, i as u32);
            self.write_entry(p, entry);
        }
        let new_prod = self.advance(start, n);
        self.commit(io, new_prod);
        Ok(new_prod)
    }

    /// Wait until the device has consumed everything produced so far.
    pub fn poll_empty<R: RegisterIo + ?Sized>(
        &mut self,
        io: &R,
        poll: &PollConfig,
    ) -> Result<(), QueueError> {
        let mut backoff = Backoff::new(*poll);
        loop {
            self.sync_cons(io);
            if self.is_empty() {
                return Ok(());
            }
            backoff.wait().map_err(|_| QueueError::Timeout)?;
        }
    }

    // -- Device-produced queues

    /// Refresh the producer index (and overflow flag) from the device.
    #[inline]
    pub fn sync_prod<R: RegisterIo + ?Sized>(&mut self, io: &R) {
        self.prod = io.read32(self.prod_reg) & (self.index_mask() | OVERFLOW_FLAG);
    }

    /// Acknowledge an overflow by copying the producer's flag into the
    /// consumer and publishing it.
    pub fn ack_overflow<R: RegisterIo + ?Sized>(&mut self, io: &R) {
        self.cons = (self.cons & self.index_mask()) | (self.prod & OVERFLOW_FLAG);
        io.write32(self.cons_reg, self.cons);
    }

    /// Take one entry if the device has produced one.
    ///
    /// Refreshes the producer index when the cached view is empty and
    /// publishes the advanced consumer index to the device.
    pub fn consume<R: RegisterIo + ?Sized>(&mut self, io: &R) -> Option<E> {
        if self.is_empty() {
            self.sync_prod(io);
            if self.is_empty() {
                return None;
            }
        }

        read_barrier();
        let entry = self.read_entry(self.cons);
        self.cons = self.advance(self.cons, 1);
        io.write32(self.cons_reg, self.cons);
        Some(entry)
    }
}

// SAFETY: the queue owns its entry memory; access is serialized by `&mut self`
unsafe impl<E: QueueEntry + Send> Send for Queue<E> {}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
    #[repr(C)]
    struct TestEntry {
        a: u64,
        b: u64,
    }

    const PROD: usize = 0x0;
    const CONS: usize = 0x4;

    #[derive(Default)]
    struct FakeRegs {
        prod: AtomicU32,
        cons: AtomicU32,
    }

    impl RegisterIo for FakeRegs {
        fn read32(&self, offset: usize) -> u32 {
            match offset {
                PROD => self.prod.load(Ordering::SeqCst),
                CONS => self.cons.load(Ordering::SeqCst),
                _ => 0,
            }
        }

        fn write32(&self, offset: usize, value: u32) {
            match offset {
                PROD => self.prod.store(value, Ordering::SeqCst),
                CONS => self.cons.store(value, Ordering::SeqCst),
                _ => {}
            }
        }

        fn read64(&self, _offset: usize) -> u64 {
            0
        }

        fn write64(&self, _offset: usize, _value: u64) {}
    }

    fn make_queue(mem: &mut Vec<TestEntry>, log2size: u32) -> Queue<TestEntry> {
        // SAFETY: mem outlives the queue in every test
        unsafe { Queue::new(mem.as_mut_ptr(), 0x8000_0000, log2size, PROD, CONS) }
    }

    fn entry(n: u64) -> TestEntry {
        TestEntry { a: n, b: !n }
    }

    #[test]
    fn test_fill_and_drain() {
        let mut mem = vec![TestEntry::default(); 4];
        let mut q = make_queue(&mut mem, 2);
        let regs = FakeRegs::default();
        let poll = PollConfig::IMMEDIATE;

        assert!(q.is_empty());
        let prod = q
            .push(&regs, &[entry(1), entry(2), entry(3), entry(4)], &poll)
            .unwrap();
        assert_eq!(prod, 0b100); // index 0, wrap set
        assert_eq!(regs.prod.load(Ordering::SeqCst), prod);
        assert!(q.is_full());
        assert!(!q.has_space(1));

        // Nothing consumed yet: a further reservation times out.
        assert_eq!(q.reserve(&regs, 1, &poll), Err(QueueError::Timeout));

        // Device consumes two entries.
        regs.cons.store(2, Ordering::SeqCst);
        assert_eq!(q.reserve(&regs, 2, &poll), Ok(prod));
        assert!(!q.has_space(3));

        // Device drains everything.
        regs.cons.store(0b100, Ordering::SeqCst);
        assert!(q.poll_empty(&regs, &poll).is_ok());
    }

    #[test]
    fn test_reserve_larger_than_queue() {
        let mut mem = vec![TestEntry::default(); 4];
        let mut q = make_queue(&mut mem, 2);
        let regs = FakeRegs::default();
        assert_eq!(
            q.reserve(&regs, 5, &PollConfig::IMMEDIATE),
            Err(QueueError::TooLarge {
                requested: 5,
                capacity: 4
            })
        );
    }

    #[test]
    fn test_poll_empty_times_out() {
        let mut mem = vec![TestEntry::default(); 4];
        let mut q = make_queue(&mut mem, 2);
        let regs = FakeRegs::default();
        q.push(&regs, &[entry(7)], &PollConfig::IMMEDIATE).unwrap();
        assert_eq!(
            q.poll_empty(&regs, &PollConfig::IMMEDIATE),
            Err(QueueError::Timeout)
        );
    }

    #[test]
    fn test_wrap_cycles_preserve_order() {
        let mut mem = vec![TestEntry::default(); 8];
        let mut q = make_queue(&mut mem, 3);
        let regs = FakeRegs::default();
        let poll = PollConfig::IMMEDIATE;

        let mut next = 0u64;
        for _ in 0..10 {
            let batch = [entry(next), entry(next + 1), entry(next + 2)];
            let start = q.prod();
            q.push(&regs, &batch, &poll).unwrap();
            for (i, e) in batch.iter().enumerate() {
                assert_eq!(q.read_entry(q.advance(start, i as u32)), *e);
            }
            // Device catches up.
            regs.cons.store(q.prod(), Ordering::SeqCst);
            q.poll_empty(&regs, &poll).unwrap();
            next += 3;
        }
        // 30 entries through an 8-entry ring: index 6, wrap bit set.
        assert_eq!(q.prod(), 30 % 16);
    }

    #[test]
    fn test_consume_device_entries() {
        let mut mem = vec![TestEntry::default(); 4];
        mem[0] = entry(10);
        mem[1] = entry(11);
        let mut q = make_queue(&mut mem, 2);
        let regs = FakeRegs::default();

        regs.prod.store(2, Ordering::SeqCst);
        assert_eq!(q.consume(&regs), Some(entry(10)));
        assert_eq!(regs.cons.load(Ordering::SeqCst), 1);
        assert_eq!(q.consume(&regs), Some(entry(11)));
        assert_eq!(q.consume(&regs), None);
        assert_eq!(regs.cons.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_overflow_reported_once() {
        let mut mem = vec![TestEntry::default(); 4];
        let mut q = make_queue(&mut mem, 2);
        let regs = FakeRegs::default();

        regs.prod.store(OVERFLOW_FLAG | 1, Ordering::SeqCst);
        q.sync_prod(&regs);
        assert!(q.overflowed());
        q.ack_overflow(&regs);
        assert!(!q.overflowed());
        assert_eq!(regs.cons.load(Ordering::SeqCst), OVERFLOW_FLAG);

        // Entries are still delivered after the acknowledgement.
        assert!(q.consume(&regs).is_some());
        assert_eq!(regs.cons.load(Ordering::SeqCst), OVERFLOW_FLAG | 1);
        q.sync_prod(&regs);
        assert!(!q.overflowed());
    }

    #[test]
    fn test_clamp_log2size() {
        assert_eq!(clamp_log2size(10, 8, 64), Ok(8));
        assert_eq!(clamp_log2size(6, 8, 64), Ok(6));
        assert_eq!(
            clamp_log2size(10, 4, 65),
            Err(QueueError::Capacity {
                log2size: 4,
                required: 65
            })
        );
    }
}
