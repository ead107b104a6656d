//! Range invalidation decomposition
//!
//! With range invalidation (IDR3.RIL) one TLBI covers `(num + 1) << scale`
//! pages of the translation granule, so `[start, start + size)` splits into
//! one command per set bit group of the page count. Without it the range is
//! invalidated one leaf granule at a time.

/// Largest NUM field value plus one.
const RANGE_NUM_MAX: u64 = 0x1f;

/// Largest SCALE field value.
const RANGE_SCALE_MAX: u32 = 0x1f;

/// One TLBI worth of a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvChunk {
    pub addr: u64,
    /// Bytes covered
    pub size: u64,
    /// Encoded NUM field (pages = (num + 1) << scale)
    pub num: u8,
    pub scale: u8,
    /// Encoded TG field, 0 without range invalidation
    pub tg: u8,
    /// Level hint, 0 when unknown
    pub ttl: u8,
}

/// Iterator over the commands needed to invalidate a range.
#[derive(Debug, Clone)]
pub struct InvRange {
    addr: u64,
    end: u64,
    /// Pages of 2^tg still to cover (range mode only)
    pages: u64,
    tg_shift: u32,
    granule: u64,
    ttl: u8,
    ranged: bool,
}

impl InvRange {
    /// Decompose `[start, start + size)`.
    ///
    /// `granule` is the leaf size being invalidated, `pgsize_bitmap` the
    /// page sizes of the table (its smallest is the translation granule).
    #[must_use]
    pub fn new(
        start: u64,
        size: u64,
        granule: u64,
        leaf: bool,
        pgsize_bitmap: u64,
        range_inv: bool,
    ) -> Self {
        let end = start.saturating_add(size);
        let tg_shift = pgsize_bitmap.trailing_zeros().min(63);
        let granule = granule.max(1);

        if !range_inv || size == 0 || tg_shift < 12 {
            return Self {
                addr: start,
                end,
                pages: 0,
                tg_shift,
                granule,
                ttl: 0,
                ranged: false,
            };
        }

        let mut pages = size.div_ceil(1 << tg_shift);
        let ttl = if leaf {
            (4 - ((granule.ilog2() - 3) / (tg_shift - 3))) as u8
        } else {
            // Avoid num = scale = 0 for a non-leaf single page range
            if pages & RANGE_NUM_MAX == 1 {
                pages += 1;
            }
            0
        };

        Self {
            addr: start,
            end,
            pages,
            tg_shift,
            granule,
            ttl,
            ranged: true,
        }
    }

    /// Encoded translation granule (1 = 4KB, 2 = 16KB, 3 = 64KB).
    #[inline]
    #[must_use]
    pub const fn tg(&self) -> u8 {
        if self.ranged {
            ((self.tg_shift - 10) / 2) as u8
        } else {
            0
        }
    }
}

impl Iterator for InvRange {
    type Item = InvChunk;

    fn next(&mut self) -> Option<InvChunk> {
        if self.addr >= self.end {
            return None;
        }

        let chunk = if self.ranged {
            if self.pages == 0 {
                return None;
            }
            // Lowest set bits first. Past the largest scale, whole
            // RANGE_NUM_MAX groups are taken until the count is small again.
            let scale = self.pages.trailing_zeros();
            let (scale, num) = if scale >= RANGE_SCALE_MAX {
                let scale = RANGE_SCALE_MAX;
                (scale, (self.pages >> scale).min(RANGE_NUM_MAX))
            } else {
                (scale, (self.pages >> scale) & RANGE_NUM_MAX)
            };
            debug_assert!((1..=RANGE_NUM_MAX).contains(&num));
            self.pages -= num << scale;
            InvChunk {
                addr: self.addr,
                size: num << (scale + self.tg_shift),
                num: (num - 1) as u8,
                scale: scale as u8,
                tg: self.tg(),
                ttl: self.ttl,
            }
        } else {
            InvChunk {
                addr: self.addr,
                size: self.granule,
                num: 0,
                scale: 0,
                tg: 0,
                ttl: 0,
            }
        };

        self.addr = self.addr.saturating_add(chunk.size);
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use alloc::vec::Vec;
    use warden_common::memory::page::{SIZE_1G, SIZE_2M, SIZE_4K};

    const BITMAP: u64 = SIZE_4K | SIZE_2M | SIZE_1G;

    fn chunks(start: u64, size: u64, granule: u64, leaf: bool, ranged: bool) -> Vec<InvChunk> {
        InvRange::new(start, size, granule, leaf, BITMAP, ranged).collect()
    }

    fn assert_covers(chunks: &[InvChunk], start: u64, size: u64) {
        let mut next = start;
        for c in chunks {
            assert_eq!(c.addr, next, "chunks must be contiguous");
            next += c.size;
        }
        assert!(next >= start + size, "range not covered");
    }

    #[test]
    fn test_range_chunks_follow_page_count_bits() {
        // 33 pages = 0b100001: one single page, then one 32-page chunk
        let got = chunks(0x10_0000, 33 * SIZE_4K, SIZE_4K, true, true);
        assert_eq!(got.len(), 2);
        assert_covers(&got, 0x10_0000, 33 * SIZE_4K);
        assert_eq!((got[0].num, got[0].scale), (0, 0));
        assert_eq!((got[1].num, got[1].scale), (0, 5));
        assert!(got.iter().all(|c| c.tg == 1 && c.ttl == 3));
    }

    #[test]
    fn test_range_large_count_uses_num_field() {
        // 31 pages fit one command: num = 30, scale = 0
        let got = chunks(0, 31 * SIZE_4K, SIZE_4K, true, true);
        assert_eq!(got.len(), 1);
        assert_eq!((got[0].num, got[0].scale), (30, 0));

        // 100 pages = 25 << 2
        let got = chunks(0, 100 * SIZE_4K, SIZE_4K, true, true);
        assert_eq!(got.len(), 1);
        assert_eq!((got[0].num, got[0].scale), (24, 2));

        // 1000 pages = (29 << 3) + (3 << 8)
        let got = chunks(0, 1000 * SIZE_4K, SIZE_4K, true, true);
        assert_eq!(got.len(), 2);
        assert_covers(&got, 0, 1000 * SIZE_4K);
        assert_eq!(got.iter().map(|c| c.size).sum::<u64>(), 1000 * SIZE_4K);
    }

    #[test]
    fn test_block_leaf_level_hint() {
        let got = chunks(0, 2 * SIZE_2M, SIZE_2M, true, true);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].ttl, 2);
        assert_eq!(got[0].scale, 10);

        let got = chunks(0, SIZE_1G, SIZE_1G, true, true);
        assert_eq!(got[0].ttl, 1);
    }

    #[test]
    fn test_non_leaf_single_page_rounded_up() {
        let got = chunks(0x4000, SIZE_4K, SIZE_4K, false, true);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].ttl, 0);
        assert_eq!((got[0].num, got[0].scale), (0, 1));
        assert_eq!(got[0].size, 2 * SIZE_4K);
    }

    #[test]
    fn test_per_granule_without_range_support() {
        let got = chunks(0x8000, 5 * SIZE_4K, SIZE_4K, true, false);
        assert_eq!(got.len(), 5);
        assert_covers(&got, 0x8000, 5 * SIZE_4K);
        assert!(got.iter().all(|c| c.tg == 0 && c.size == SIZE_4K));
    }

    #[test]
    fn test_range_chunks_encodable_and_tiling() {
        let starts = [0, 0x1000, 0x1f_f000, 0x20_0000, 0x4000_0000, 0xffff_0000_0000];
        let sizes = [
            SIZE_4K,
            2 * SIZE_4K,
            31 * SIZE_4K,
            32 * SIZE_4K,
            33 * SIZE_4K,
            1000 * SIZE_4K,
            0x1234_5000,
            SIZE_2M,
            SIZE_1G + SIZE_4K,
            1 << 39,
            (1 << 44) - SIZE_4K,
            1 << 44,
            1 << 48,
            1 << 52,
        ];
        for start in starts {
            for size in sizes {
                for granule in [SIZE_4K, SIZE_2M] {
                    for leaf in [true, false] {
                        let got = chunks(start, size, granule, leaf, true);
                        let mut next = start;
                        for c in &got {
                            assert_eq!(c.addr, next, "gap at {start:#x}+{size:#x}");
                            assert!(c.num <= 30 && c.scale <= 31, "{c:?} not encodable");
                            assert_eq!(c.size, (u64::from(c.num) + 1) << (c.scale + 12));
                            assert_eq!(c.tg, 1);
                            next += c.size;
                        }
                        let pages = size.div_ceil(SIZE_4K);
                        let extra = if !leaf && pages & 0x1f == 1 { SIZE_4K } else { 0 };
                        assert_eq!(next - start, pages * SIZE_4K + extra, "{start:#x}+{size:#x}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_huge_range_keeps_scale_in_field() {
        // 2^40 pages: scale stays at 31 with NUM groups of 31
        let got = chunks(0, 1 << 52, SIZE_4K, true, true);
        assert_eq!(got.len(), 17);
        assert!(got[..16].iter().all(|c| (c.num, c.scale) == (30, 31)));
        assert_eq!((got[16].num, got[16].scale), (15, 31));
    }

    #[test]
    fn test_empty_range() {
        assert!(chunks(0x1000, 0, SIZE_4K, true, true).is_empty());
        assert!(chunks(0x1000, 0, SIZE_4K, true, false).is_empty());
    }
}
