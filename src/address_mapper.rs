//! Per-process interval map of mapped virtual-address regions.
//!
//! Each process gets one [`AddressMapper`]. Regions are inserted as MMAP
//! events arrive, tagged with an opaque identifier (the index of the
//! originating event) so a resolved sample can be traced back to the mapping
//! that owns it. When remapping is enabled the mapper also assigns every
//! region a start address in a compact synthetic address space, preserving
//! the page offset of the real address so page-granularity analyses remain
//! meaningful while the real layout stays hidden.

use std::collections::BTreeMap;
use std::ops::Bound::Excluded;

use tracing::error;

/// Host page size, the default alignment for synthetic address assignment.
pub fn host_page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// One mapped region. `real_start` is the address from the MMAP event;
/// `mapped_start` is the synthetic address assigned at insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    pub real_start: u64,
    pub mapped_start: u64,
    pub size: u64,
    pub id: u64,
    /// File offset (pgoff) of the mapping's start.
    pub offset_base: u64,
    pub is_jit: bool,
}

impl MappedRange {
    fn real_end(&self) -> u64 {
        self.real_start + self.size
    }
}

/// Ordered, non-overlapping interval store over 64-bit addresses.
#[derive(Debug, Clone, Default)]
pub struct AddressMapper {
    /// Regions keyed by real start address. Never overlapping.
    regions: BTreeMap<u64, MappedRange>,
    /// Bump allocator high-water mark for the synthetic space. Evictions do
    /// not lower it; freed synthetic ranges are never reused.
    next_mapped: u64,
    /// Power of two, or zero to disable page-alignment gaps.
    page_alignment: u64,
}

impl AddressMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called before the first insertion.
    pub fn set_page_alignment(&mut self, page_alignment: u64) {
        debug_assert!(self.regions.is_empty());
        self.page_alignment = page_alignment;
    }

    pub fn page_alignment(&self) -> u64 {
        self.page_alignment
    }

    pub fn num_mappings(&self) -> usize {
        self.regions.len()
    }

    /// Inserts the region `[start, start + len)` tagged with `id` and
    /// `pgoff`. Overlapping regions are evicted entirely when
    /// `remove_existing_mappings` is set; otherwise the insertion fails.
    /// Zero-length regions and ranges that wrap the address space are
    /// rejected.
    pub fn map_with_id(
        &mut self,
        start: u64,
        len: u64,
        id: u64,
        pgoff: u64,
        remove_existing_mappings: bool,
        is_jit: bool,
    ) -> bool {
        if len == 0 {
            error!("cannot map zero-length region at {start:#x}");
            return false;
        }
        let Some(end) = start.checked_add(len) else {
            error!("address overflow: start={start:#x} len={len:#x}");
            return false;
        };

        let mut overlapping = Vec::new();
        if let Some((&key, range)) = self.regions.range(..=start).next_back() {
            if range.real_end() > start {
                overlapping.push(key);
            }
        }
        overlapping.extend(
            self.regions
                .range((Excluded(start), Excluded(end)))
                .map(|(&key, _)| key),
        );
        if !overlapping.is_empty() {
            if !remove_existing_mappings {
                return false;
            }
            for key in overlapping {
                self.regions.remove(&key);
            }
        }

        // Synthetic placement: bump allocation, with a gap inserted so the
        // new region's page offset matches the real address. JIT regions may
        // be sub-page and unaligned, so they are packed without a gap.
        let gap = if is_jit || self.page_alignment == 0 {
            0
        } else {
            let want = start % self.page_alignment;
            let have = self.next_mapped % self.page_alignment;
            (want + self.page_alignment - have) % self.page_alignment
        };
        let Some(mapped_end) = self
            .next_mapped
            .checked_add(gap)
            .and_then(|mapped_start| mapped_start.checked_add(len))
        else {
            error!("synthetic address space exhausted mapping {start:#x}+{len:#x}");
            return false;
        };
        let mapped_start = mapped_end - len;
        self.next_mapped = mapped_end;

        self.regions.insert(
            start,
            MappedRange {
                real_start: start,
                mapped_start,
                size: len,
                id,
                offset_base: pgoff,
                is_jit,
            },
        );
        true
    }

    /// Point query: finds the region containing `ip` and returns its
    /// synthetic address together with the region itself.
    pub fn get_mapped_address(&self, ip: u64) -> Option<(u64, &MappedRange)> {
        let (_, range) = self.regions.range(..=ip).next_back()?;
        if ip >= range.real_end() {
            return None;
        }
        Some((range.mapped_start + (ip - range.real_start), range))
    }

    /// Identifier and file offset of `ip` within a region previously
    /// returned by [`get_mapped_address`](Self::get_mapped_address).
    pub fn get_mapped_id_and_offset(&self, ip: u64, range: &MappedRange) -> (u64, u64) {
        (range.id, range.offset_base + (ip - range.real_start))
    }

    pub fn ranges(&self) -> impl Iterator<Item = &MappedRange> {
        self.regions.values()
    }

    /// Logs every region, one line each. Called when an insertion fails so
    /// the conflicting state ends up in the log.
    pub fn dump_to_log(&self) {
        for range in self.regions.values() {
            error!(
                "mapped: id={} [{:#x}, {:#x}) -> {:#x} pgoff={:#x}",
                range.id,
                range.real_start,
                range.real_end(),
                range.mapped_start,
                range.offset_base,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 4096;

    fn mapper() -> AddressMapper {
        let mut m = AddressMapper::new();
        m.set_page_alignment(PAGE);
        m
    }

    #[test]
    fn test_map_and_lookup() {
        let mut m = mapper();
        assert!(m.map_with_id(0x1000, 0x2000, 7, 0x500, false, false));

        let (mapped, range) = m.get_mapped_address(0x1800).unwrap();
        assert_eq!(mapped, 0x800);
        let (id, offset) = m.get_mapped_id_and_offset(0x1800, range);
        assert_eq!(id, 7);
        assert_eq!(offset, 0x500 + 0x800);

        assert!(m.get_mapped_address(0xfff).is_none());
        assert!(m.get_mapped_address(0x3000).is_none());
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut m = mapper();
        assert!(!m.map_with_id(0x1000, 0, 1, 0, false, false));
    }

    #[test]
    fn test_overflow_rejected() {
        let mut m = mapper();
        assert!(!m.map_with_id(u64::MAX - 0xfff, 0x2000, 1, 0, false, false));
    }

    #[test]
    fn test_overlap_fails_without_removal() {
        let mut m = mapper();
        assert!(m.map_with_id(0x1000, 0x2000, 1, 0, false, false));
        assert!(!m.map_with_id(0x2000, 0x2000, 2, 0, false, false));
        // The original region is untouched.
        let (_, range) = m.get_mapped_address(0x1500).unwrap();
        assert_eq!(range.id, 1);
    }

    #[test]
    fn test_overlap_evicts_with_removal() {
        let mut m = mapper();
        assert!(m.map_with_id(0x1000, 0x2000, 1, 0, false, false));
        assert!(m.map_with_id(0x4000, 0x1000, 2, 0, false, false));
        // Covers the tail of region 1 and all of region 2.
        assert!(m.map_with_id(0x2000, 0x4000, 3, 0, true, false));

        // Both old regions are gone entirely, not split.
        assert!(m.get_mapped_address(0x1000).is_none());
        let (_, range) = m.get_mapped_address(0x4800).unwrap();
        assert_eq!(range.id, 3);
        assert_eq!(m.num_mappings(), 1);
    }

    #[test]
    fn test_page_offset_preserved() {
        let mut m = mapper();
        assert!(m.map_with_id(0x1abc, 0x1000, 1, 0, false, false));
        assert!(m.map_with_id(0x7f00_0000_0123, 0x2000, 2, 0, false, false));

        for ip in [0x1abc, 0x1fff, 0x7f00_0000_0123, 0x7f00_0000_1122] {
            let (mapped, _) = m.get_mapped_address(ip).unwrap();
            assert_eq!(mapped % PAGE, ip % PAGE, "ip={ip:#x}");
        }
    }

    #[test]
    fn test_mapped_order_matches_insertion_order() {
        let mut m = mapper();
        // Inserted in decreasing real order; synthetic order must follow
        // insertion order, not address order.
        assert!(m.map_with_id(0x9000_0000, 0x1000, 1, 0, false, false));
        assert!(m.map_with_id(0x1000, 0x1000, 2, 0, false, false));

        let (first, _) = m.get_mapped_address(0x9000_0000).unwrap();
        let (second, _) = m.get_mapped_address(0x1000).unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_jit_regions_pack_unaligned() {
        let mut m = mapper();
        assert!(m.map_with_id(0x1123, 0x40, 1, 0, false, true));
        assert!(m.map_with_id(0x2077, 0x40, 2, 0, false, true));

        let (a, _) = m.get_mapped_address(0x1123).unwrap();
        let (b, _) = m.get_mapped_address(0x2077).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 0x40);
    }

    #[test]
    fn test_eviction_does_not_reuse_synthetic_space() {
        let mut m = mapper();
        assert!(m.map_with_id(0x1000, 0x1000, 1, 0, false, false));
        let (old, _) = m.get_mapped_address(0x1000).unwrap();
        assert!(m.map_with_id(0x1000, 0x1000, 2, 0, true, false));
        let (new, _) = m.get_mapped_address(0x1000).unwrap();
        assert!(new > old);
    }

    #[test]
    fn test_clone_preserves_queries() {
        let mut m = mapper();
        assert!(m.map_with_id(0x1000, 0x1000, 1, 0x100, false, false));
        assert!(m.map_with_id(0x5000, 0x2000, 2, 0, false, false));

        let copy = m.clone();
        for ip in [0x1000, 0x1fff, 0x5000, 0x6abc] {
            assert_eq!(m.get_mapped_address(ip), copy.get_mapped_address(ip));
        }
        assert!(copy.get_mapped_address(0x3000).is_none());
    }

    #[test]
    fn test_zero_page_alignment_packs_tightly() {
        let mut m = AddressMapper::new();
        assert!(m.map_with_id(0x1abc, 0x100, 1, 0, false, false));
        assert!(m.map_with_id(0x9def, 0x100, 2, 0, false, false));
        assert_eq!(m.get_mapped_address(0x1abc).unwrap().0, 0);
        assert_eq!(m.get_mapped_address(0x9def).unwrap().0, 0x100);
    }

    #[test]
    fn test_adjacent_regions_do_not_overlap() {
        let mut m = mapper();
        assert!(m.map_with_id(0x1000, 0x1000, 1, 0, false, false));
        // Exactly adjacent, no overlap.
        assert!(m.map_with_id(0x2000, 0x1000, 2, 0, false, false));
        assert_eq!(m.get_mapped_address(0x1fff).unwrap().1.id, 1);
        assert_eq!(m.get_mapped_address(0x2000).unwrap().1.id, 2);
    }
}
