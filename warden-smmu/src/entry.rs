//! Torn-write-safe updates of hardware-cached entries
//!
//! STEs and CDs are eight 64-bit words that the controller may fetch at any
//! time, one word at a time, while software rewrites them. Software can only
//! store one word atomically, so an update must never expose a mix of old
//! and new live configuration. The writer decides, from the bits the
//! controller actually interprets in the current and target entries
//! (the *used bits*), how much ceremony an update needs:
//!
//! - **In place**: no used bit changes. Unused bits are rewritten and one
//!   invalidation follows.
//! - **Hitless**: exactly one word changes used bits. Every bit the current
//!   entry ignores is written first, then the critical word, then the bits
//!   the target ignores are cleaned up, each step followed by an
//!   invalidation.
//! - **Breaking**: several words change used bits. Word 0 is cleared
//!   (disabling the entry), words 1..N are written, then word 0.
//!
//! Every store is followed by an invalidation (CFGI + sync) before the next
//! step, and steps that change nothing skip both.

use core::ptr::{read_volatile, write_volatile};

use crate::error::SmmuError;

/// Words in an STE or CD
pub const ENTRY_QWORDS: usize = 8;

/// Contents of an STE or CD
pub type EntryWords = [u64; ENTRY_QWORDS];

/// Storage of one entry.
pub trait EntrySlot {
    /// Current contents.
    fn load(&self) -> EntryWords;

    /// Store one word as a single 64-bit write.
    fn store(&mut self, index: usize, value: u64);
}

/// Entry-type-specific half of an update.
pub trait EntryWriter {
    /// Bits of `entry` the controller interprets.
    fn used_bits(&self, entry: &EntryWords) -> EntryWords;

    /// Make the controller drop cached copies of the entry and wait.
    fn sync(&mut self) -> Result<(), SmmuError>;
}

/// How an update was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The entry already held the target
    Unchanged,
    /// Only ignored bits changed
    InPlace,
    /// One critical word changed used bits
    Hitless,
    /// The entry went through a disabled state
    Breaking,
}

/// An entry in table memory.
pub struct RawEntry {
    ptr: *mut u64,
}

impl RawEntry {
    /// # Safety
    ///
    /// `ptr` must point to [`ENTRY_QWORDS`] aligned words of table memory
    /// that stay valid while this value is used.
    #[inline]
    pub const unsafe fn new(ptr: *mut u64) -> Self {
        Self { ptr }
    }
}

impl EntrySlot for RawEntry {
    fn load(&self) -> EntryWords {
        let mut words = [0; ENTRY_QWORDS];
        for (i, word) in words.iter_mut().enumerate() {
            // SAFETY: i < ENTRY_QWORDS and the entry is valid per new()
            *word = unsafe { read_volatile(self.ptr.add(i)) };
        }
        words
    }

    fn store(&mut self, index: usize, value: u64) {
        debug_assert!(index < ENTRY_QWORDS);
        // SAFETY: index < ENTRY_QWORDS and the entry is valid per new()
        unsafe { write_volatile(self.ptr.add(index), value) }
    }
}

impl EntrySlot for EntryWords {
    fn load(&self) -> EntryWords {
        *self
    }

    fn store(&mut self, index: usize, value: u64) {
        self[index] = value;
    }
}

/// Write `target[range]` over the live entry, syncing if anything changed.
fn set_words<S, W>(
    slot: &mut S,
    writer: &mut W,
    target: &EntryWords,
    range: core::ops::Range<usize>,
) -> Result<bool, SmmuError>
where
    S: EntrySlot + ?Sized,
    W: EntryWriter + ?Sized,
{
    let live = slot.load();
    let mut changed = false;
    for i in range {
        if live[i] != target[i] {
            slot.store(i, target[i]);
            changed = true;
        }
    }
    if changed {
        writer.sync()?;
    }
    Ok(changed)
}

/// Move the entry in `slot` to `target` without a torn intermediate state.
pub fn write_entry<S, W>(
    slot: &mut S,
    target: &EntryWords,
    writer: &mut W,
) -> Result<WriteMode, SmmuError>
where
    S: EntrySlot + ?Sized,
    W: EntryWriter + ?Sized,
{
    let current = slot.load();
    if current == *target {
        return Ok(WriteMode::Unchanged);
    }

    let cur_used = writer.used_bits(&current);
    let target_used = writer.used_bits(target);

    let mut unused_update = [0u64; ENTRY_QWORDS];
    let mut critical: u32 = 0;
    for i in 0..ENTRY_QWORDS {
        if target[i] & !target_used[i] != 0 {
            log::warn!(
                "entry: word {i} sets bits {:#x} the controller ignores",
                target[i] & !target_used[i]
            );
        }
        // Bits can change while the current entry does not use them
        unused_update[i] = (current[i] & cur_used[i]) | (target[i] & !cur_used[i]);
        if unused_update[i] & target_used[i] != target[i] & target_used[i] {
            critical |= 1 << i;
        }
    }

    match critical.count_ones() {
        0 => {
            set_words(slot, writer, target, 0..ENTRY_QWORDS)?;
            Ok(WriteMode::InPlace)
        }
        1 => {
            let index = critical.trailing_zeros() as usize;
            unused_update[index] = current[index];
            set_words(slot, writer, &unused_update, 0..ENTRY_QWORDS)?;
            set_words(slot, writer, target, index..index + 1)?;
            set_words(slot, writer, target, 0..ENTRY_QWORDS)?;
            Ok(WriteMode::Hitless)
        }
        _ => {
            unused_update[0] = 0;
            set_words(slot, writer, &unused_update, 0..1)?;
            set_words(slot, writer, target, 1..ENTRY_QWORDS)?;
            set_words(slot, writer, target, 0..1)?;
            Ok(WriteMode::Breaking)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    extern crate alloc;

    use super::*;
    use alloc::vec::Vec;

    /// Slot that records the entry after every store and counts syncs.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub words: EntryWords,
        pub snapshots: Vec<EntryWords>,
        pub syncs: usize,
    }

    impl EntrySlot for Recorder {
        fn load(&self) -> EntryWords {
            self.words
        }

        fn store(&mut self, index: usize, value: u64) {
            self.words[index] = value;
            self.snapshots.push(self.words);
        }
    }

    /// Check that every snapshot is disabled (`valid` clear in word 0) or
    /// matches `old` or `new` in the bits that entry uses.
    pub(crate) fn assert_no_torn_state(
        snapshots: &[EntryWords],
        old: &EntryWords,
        new: &EntryWords,
        valid: u64,
        used: impl Fn(&EntryWords) -> EntryWords,
    ) {
        let same_under = |a: &EntryWords, b: &EntryWords, mask: &EntryWords| {
            (0..ENTRY_QWORDS).all(|i| a[i] & mask[i] == b[i] & mask[i])
        };
        for snap in snapshots {
            if snap[0] & valid == 0 {
                continue;
            }
            let old_used = used(old);
            let new_used = used(new);
            assert!(
                same_under(snap, old, &old_used) || same_under(snap, new, &new_used),
                "torn entry {snap:#x?} between {old:#x?} and {new:#x?}"
            );
        }
    }

    /// Word 0: V at bit 0, mode at bits [2:1]; mode 1 uses word 1, mode 2
    /// uses word 2, mode 3 uses words 1 and 2.
    struct ToyWriter<'a> {
        syncs: &'a mut usize,
    }

    fn toy_used(entry: &EntryWords) -> EntryWords {
        let mut used = [0; ENTRY_QWORDS];
        used[0] = 1;
        if entry[0] & 1 == 0 {
            return used;
        }
        used[0] |= 0b110;
        match (entry[0] >> 1) & 0b11 {
            1 => used[1] = u64::MAX,
            2 => used[2] = u64::MAX,
            3 => {
                used[1] = u64::MAX;
                used[2] = u64::MAX;
            }
            _ => {}
        }
        used
    }

    impl EntryWriter for ToyWriter<'_> {
        fn used_bits(&self, entry: &EntryWords) -> EntryWords {
            toy_used(entry)
        }

        fn sync(&mut self) -> Result<(), SmmuError> {
            *self.syncs += 1;
            Ok(())
        }
    }

    fn entry(mode: u64, w1: u64, w2: u64) -> EntryWords {
        let mut e = [0; ENTRY_QWORDS];
        e[0] = 1 | (mode << 1);
        e[1] = w1;
        e[2] = w2;
        e
    }

    fn run(old: EntryWords, new: EntryWords) -> (WriteMode, Recorder) {
        let mut slot = Recorder {
            words: old,
            ..Recorder::default()
        };
        let mut syncs = 0;
        let mode = write_entry(&mut slot, &new, &mut ToyWriter { syncs: &mut syncs }).unwrap();
        slot.syncs = syncs;
        assert_eq!(slot.words, new);
        assert_no_torn_state(&slot.snapshots, &old, &new, 1, toy_used);
        (mode, slot)
    }

    #[test]
    fn test_identical_entry_is_untouched() {
        let e = entry(1, 0xAA, 0);
        let (mode, slot) = run(e, e);
        assert_eq!(mode, WriteMode::Unchanged);
        assert_eq!(slot.syncs, 0);
    }

    #[test]
    fn test_ignored_bits_written_in_place() {
        // Mode 1 ignores word 2, so stale contents there are cleaned up
        let (mode, slot) = run(entry(1, 0xAA, 0x55), entry(1, 0xAA, 0));
        assert_eq!(mode, WriteMode::InPlace);
        assert_eq!(slot.syncs, 1);
    }

    #[test]
    fn test_enable_from_disabled_is_hitless() {
        let (mode, slot) = run([0; ENTRY_QWORDS], entry(3, 0x11, 0x22));
        assert_eq!(mode, WriteMode::Hitless);
        // Payload first, then word 0
        assert_eq!(slot.snapshots.last().map(|s| s[0]), Some(entry(3, 0x11, 0x22)[0]));
    }

    #[test]
    fn test_two_live_words_force_breaking_update() {
        let (mode, slot) = run(entry(3, 0x11, 0x22), entry(3, 0x33, 0x44));
        assert_eq!(mode, WriteMode::Breaking);
        assert_eq!(slot.snapshots[0][0] & 1, 0, "first store must disable");
        assert_eq!(slot.syncs, 3);
    }

    #[test]
    fn test_mode_switch_through_unused_words() {
        // Mode 1 -> mode 2: word 2 is unused by mode 1, word 0 is critical
        let (mode, _) = run(entry(1, 0x11, 0), entry(2, 0, 0x22));
        assert_eq!(mode, WriteMode::Hitless);
    }
}
