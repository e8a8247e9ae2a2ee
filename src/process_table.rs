//! Per-pid ownership of address mappers, with fork inheritance.

use std::collections::HashMap;

use crate::address_mapper::AddressMapper;

/// Pid perf uses to tag kernel mmaps (-1 as u32). Distinct from pid 0, the
/// swapper process.
pub const KERNEL_PID: u32 = u32::MAX;

/// Owns one [`AddressMapper`] per observed pid.
#[derive(Debug, Default)]
pub struct ProcessTable {
    page_alignment: u64,
    mappers: HashMap<u32, AddressMapper>,
}

impl ProcessTable {
    pub fn new(page_alignment: u64) -> Self {
        ProcessTable {
            page_alignment,
            mappers: HashMap::new(),
        }
    }

    pub fn get(&self, pid: u32) -> Option<&AddressMapper> {
        self.mappers.get(&pid)
    }

    /// Returns the mapper for `pid`, creating one if needed, and whether it
    /// was created by this call.
    ///
    /// A new mapper inherits the parent's mappings when `ppid` is known.
    /// Perf emits an explicit swapper->init fork without any memory maps for
    /// the swapper, so an unknown parent falls back to the kernel mappings;
    /// that way kernel samples in the new process resolve immediately.
    pub fn get_or_create(&mut self, pid: u32, ppid: Option<u32>) -> (&mut AddressMapper, bool) {
        if self.mappers.contains_key(&pid) {
            return (self.mappers.get_mut(&pid).unwrap(), false);
        }

        let parent = ppid
            .and_then(|ppid| self.mappers.get(&ppid))
            .or_else(|| self.mappers.get(&KERNEL_PID));
        let mapper = match parent {
            Some(parent) => parent.clone(),
            None => {
                let mut mapper = AddressMapper::new();
                mapper.set_page_alignment(self.page_alignment);
                mapper
            }
        };
        (self.mappers.entry(pid).or_insert(mapper), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_empty_mapper() {
        let mut table = ProcessTable::new(4096);
        let (mapper, created) = table.get_or_create(100, None);
        assert!(created);
        assert_eq!(mapper.page_alignment(), 4096);
        assert_eq!(mapper.num_mappings(), 0);

        let (_, created) = table.get_or_create(100, None);
        assert!(!created);
    }

    #[test]
    fn test_fork_clones_parent() {
        let mut table = ProcessTable::new(4096);
        let (parent, _) = table.get_or_create(100, None);
        assert!(parent.map_with_id(0x1000, 0x1000, 1, 0, false, false));

        let (child, created) = table.get_or_create(200, Some(100));
        assert!(created);
        let (_, range) = child.get_mapped_address(0x1800).unwrap();
        assert_eq!(range.id, 1);
    }

    #[test]
    fn test_unknown_parent_falls_back_to_kernel() {
        let mut table = ProcessTable::new(4096);
        let (kernel, _) = table.get_or_create(KERNEL_PID, None);
        assert!(kernel.map_with_id(0xffff_8000_0000_0000, 0x10000, 9, 0, false, false));

        let (child, _) = table.get_or_create(1, Some(0));
        assert!(child.get_mapped_address(0xffff_8000_0000_1234).is_some());
    }

    #[test]
    fn test_clone_is_independent() {
        let mut table = ProcessTable::new(4096);
        let (parent, _) = table.get_or_create(100, None);
        assert!(parent.map_with_id(0x1000, 0x1000, 1, 0, false, false));
        let (child, _) = table.get_or_create(200, Some(100));
        assert!(child.map_with_id(0x5000, 0x1000, 2, 0, false, false));

        assert!(table.get(100).unwrap().get_mapped_address(0x5000).is_none());
    }
}
