//! APS binding table (C9): source `{ext-addr, endpoint, cluster-id}` → list
//! of destinations, bounded to 10 source entries with 10 destinations each.
//!
//! Grounded in `zigbee-aps-tables.cc`'s `BindingTable`.

use crate::zigbee::address::{ExtAddr, ShortAddr};

pub const MAX_SRC_ENTRIES: usize = 10;
pub const MAX_DST_ENTRIES_PER_SRC: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SrcBindingEntry {
    pub ext_addr: ExtAddr,
    pub endpoint: u8,
    pub cluster_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DstBindingEntry {
    Group { group_addr: ShortAddr, endpoint: u8 },
    IeeeEndpoint { ext_addr: ExtAddr, endpoint: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindResult {
    Bound,
    EntryExists,
    TableFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbindResult {
    Unbound,
    EntryNotFound,
}

#[derive(Default)]
pub struct BindingTable {
    entries: Vec<(SrcBindingEntry, Vec<DstBindingEntry>)>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_src_mut(&mut self, src: &SrcBindingEntry) -> Option<&mut Vec<DstBindingEntry>> {
        self.entries
            .iter_mut()
            .find(|(s, _)| s == src)
            .map(|(_, dsts)| dsts)
    }

    pub fn bind(&mut self, src: SrcBindingEntry, dst: DstBindingEntry) -> BindResult {
        if let Some(dsts) = self.find_src_mut(&src) {
            if dsts.contains(&dst) {
                return BindResult::EntryExists;
            }
            if dsts.len() == MAX_DST_ENTRIES_PER_SRC {
                return BindResult::TableFull;
            }
            dsts.push(dst);
            return BindResult::Bound;
        }
        if self.entries.len() == MAX_SRC_ENTRIES {
            return BindResult::TableFull;
        }
        self.entries.push((src, vec![dst]));
        BindResult::Bound
    }

    pub fn unbind(&mut self, src: SrcBindingEntry, dst: DstBindingEntry) -> UnbindResult {
        let Some(idx) = self.entries.iter().position(|(s, _)| *s == src) else {
            return UnbindResult::EntryNotFound;
        };
        let dsts = &mut self.entries[idx].1;
        let Some(dst_idx) = dsts.iter().position(|d| *d == dst) else {
            return UnbindResult::EntryNotFound;
        };
        dsts.remove(dst_idx);
        if dsts.is_empty() {
            self.entries.remove(idx);
        }
        UnbindResult::Unbound
    }

    pub fn lookup_entries(&self, src: &SrcBindingEntry) -> &[DstBindingEntry] {
        self.entries
            .iter()
            .find(|(s, _)| s == src)
            .map(|(_, dsts)| dsts.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> SrcBindingEntry {
        SrcBindingEntry {
            ext_addr: 0xAABBCCDD,
            endpoint: 1,
            cluster_id: 6,
        }
    }

    #[test]
    fn second_identical_bind_reports_entry_exists() {
        let mut t = BindingTable::new();
        let dst = DstBindingEntry::Group {
            group_addr: 0x0123,
            endpoint: 3,
        };
        assert_eq!(t.bind(src(), dst), BindResult::Bound);
        assert_eq!(t.bind(src(), dst), BindResult::EntryExists);
    }

    #[test]
    fn table_full_once_max_sources_reached() {
        let mut t = BindingTable::new();
        for i in 0..MAX_SRC_ENTRIES as u64 {
            let s = SrcBindingEntry {
                ext_addr: i,
                endpoint: 1,
                cluster_id: 1,
            };
            let d = DstBindingEntry::IeeeEndpoint {
                ext_addr: 99,
                endpoint: 2,
            };
            assert_eq!(t.bind(s, d), BindResult::Bound);
        }
        let overflow_src = SrcBindingEntry {
            ext_addr: 9999,
            endpoint: 1,
            cluster_id: 1,
        };
        let d = DstBindingEntry::IeeeEndpoint {
            ext_addr: 99,
            endpoint: 2,
        };
        assert_eq!(t.bind(overflow_src, d), BindResult::TableFull);
    }

    #[test]
    fn unbind_removes_the_source_once_its_last_destination_is_gone() {
        let mut t = BindingTable::new();
        let dst = DstBindingEntry::Group {
            group_addr: 1,
            endpoint: 1,
        };
        t.bind(src(), dst);
        assert_eq!(t.unbind(src(), dst), UnbindResult::Unbound);
        assert!(t.lookup_entries(&src()).is_empty());
        assert_eq!(t.unbind(src(), dst), UnbindResult::EntryNotFound);
    }
}
