//! Zigbee NWK tables (C5): routing table, route-discovery table, RREQ-retry
//! table, neighbor table, broadcast-transaction table, PAN-id table.
//!
//! Grounded in `zigbee-nwk-tables.cc`. All tables are bounded and purge
//! lazily against the kernel's current virtual time, which every lookup
//! method takes as an explicit parameter rather than reading a global clock
//! (see `SPEC_FULL.md` §9 on threading `SimulationContext` explicitly).

use crate::time::Time;
use crate::zigbee::address::{DeviceType, ExtAddr, ShortAddr};
use std::collections::HashMap;

pub const MAX_ROUTING_TABLE_SIZE: usize = 32;
pub const MAX_ROUTE_DISCOVERY_TABLE_SIZE: usize = 32;
pub const MAX_NEIGHBOR_TABLE_SIZE: usize = 32;
pub const MAX_BROADCAST_TABLE_SIZE: usize = 32;

pub const INITIAL_RREQ_RETRIES: u8 = 3;
pub const RREQ_RETRIES: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Active,
    DiscoveryUnderway,
    DiscoveryFailed,
    Inactive,
    ValidationUnderway,
}

#[derive(Debug, Clone)]
pub struct RoutingTableEntry {
    pub destination: ShortAddr,
    pub next_hop: ShortAddr,
    pub status: RouteStatus,
    pub many_to_one: bool,
    pub no_route_cache: bool,
    pub route_record_required: bool,
    pub group_id_flag: bool,
    pub lifetime_deadline: Time,
}

#[derive(Default)]
pub struct RoutingTable {
    entries: HashMap<ShortAddr, RoutingTableEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, entry: RoutingTableEntry) -> bool {
        if !self.entries.contains_key(&entry.destination) && self.entries.len() == MAX_ROUTING_TABLE_SIZE {
            return false;
        }
        self.entries.insert(entry.destination, entry);
        true
    }

    fn expire_if_due(entry: &mut RoutingTableEntry, now: Time) {
        if entry.status == RouteStatus::Active && now >= entry.lifetime_deadline {
            entry.status = RouteStatus::Inactive;
        }
    }

    pub fn lookup(&mut self, destination: ShortAddr, now: Time) -> Option<&RoutingTableEntry> {
        let entry = self.entries.get_mut(&destination)?;
        Self::expire_if_due(entry, now);
        Some(&*entry)
    }

    pub fn lookup_mut(&mut self, destination: ShortAddr, now: Time) -> Option<&mut RoutingTableEntry> {
        let entry = self.entries.get_mut(&destination)?;
        Self::expire_if_due(entry, now);
        Some(entry)
    }

    pub fn delete(&mut self, destination: ShortAddr) -> bool {
        self.entries.remove(&destination).is_some()
    }

    pub fn purge(&mut self, now: Time) {
        for entry in self.entries.values_mut() {
            Self::expire_if_due(entry, now);
        }
        self.entries.retain(|_, e| e.status != RouteStatus::Inactive);
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoutingTableEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RouteDiscoveryEntry {
    pub rreq_id: u8,
    pub source: ShortAddr,
    pub sender: ShortAddr,
    pub forward_cost: u8,
    pub residual_cost: u8,
    pub expiration: Time,
}

#[derive(Default)]
pub struct RouteDiscoveryTable {
    entries: HashMap<(u8, ShortAddr), RouteDiscoveryEntry>,
}

impl RouteDiscoveryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn purge(&mut self, now: Time) {
        self.entries.retain(|_, e| e.expiration > now);
    }

    pub fn add_entry(&mut self, entry: RouteDiscoveryEntry, now: Time) -> bool {
        self.purge(now);
        let key = (entry.rreq_id, entry.source);
        if !self.entries.contains_key(&key) && self.entries.len() == MAX_ROUTE_DISCOVERY_TABLE_SIZE {
            return false;
        }
        self.entries.insert(key, entry);
        true
    }

    pub fn lookup(&mut self, rreq_id: u8, source: ShortAddr, now: Time) -> Option<&RouteDiscoveryEntry> {
        self.purge(now);
        self.entries.get(&(rreq_id, source))
    }

    pub fn delete(&mut self, rreq_id: u8, source: ShortAddr, now: Time) -> bool {
        self.purge(now);
        self.entries.remove(&(rreq_id, source)).is_some()
    }
}

#[derive(Debug, Clone)]
pub struct RreqRetryEntry {
    pub rreq_id: u8,
    pub retry_count: u8,
    pub retry_event: crate::time::EventId,
}

#[derive(Default)]
pub struct RreqRetryTable {
    entries: HashMap<u8, RreqRetryEntry>,
}

impl RreqRetryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: RreqRetryEntry) {
        self.entries.insert(entry.rreq_id, entry);
    }

    pub fn get_mut(&mut self, rreq_id: u8) -> Option<&mut RreqRetryEntry> {
        self.entries.get_mut(&rreq_id)
    }

    pub fn remove(&mut self, rreq_id: u8) -> Option<RreqRetryEntry> {
        self.entries.remove(&rreq_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    Parent,
    Child,
    Sibling,
    None,
    PreviousChild,
    UnauthenticatedChild,
}

#[derive(Debug, Clone)]
pub struct NeighborTableEntry {
    pub ext_addr: ExtAddr,
    pub nwk_addr: ShortAddr,
    pub device_type: DeviceType,
    pub rx_on_when_idle: bool,
    pub relationship: Relationship,
    pub timeout_counter: u32,
    pub device_timeout_deadline: Time,
    pub tx_failure: u32,
    pub lqi: u8,
    pub outgoing_cost: u8,
    pub age: u32,
    pub ext_pan_id: ExtAddr,
    pub logical_channel: u8,
    pub depth: u8,
    pub beacon_order: u8,
    pub potential_parent: bool,
}

/// Piecewise LQI → link-cost mapping, verbatim from `GetLinkCost` in
/// `zigbee-nwk-tables.cc`.
pub fn link_cost_from_lqi(lqi: u8) -> u8 {
    if lqi >= 240 {
        1
    } else if lqi >= 202 {
        2
    } else if lqi >= 154 {
        3
    } else if lqi >= 106 {
        4
    } else if lqi >= 58 {
        5
    } else if lqi >= 11 {
        6
    } else {
        7
    }
}

#[derive(Default)]
pub struct NeighborTable {
    entries: Vec<NeighborTableEntry>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, entry: NeighborTableEntry) -> bool {
        if self.entries.len() == MAX_NEIGHBOR_TABLE_SIZE {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborTableEntry> {
        self.entries.iter()
    }

    pub fn find_by_ext_addr(&self, ext_addr: ExtAddr) -> Option<&NeighborTableEntry> {
        self.entries.iter().find(|e| e.ext_addr == ext_addr)
    }

    pub fn find_by_nwk_addr(&self, nwk_addr: ShortAddr) -> Option<&NeighborTableEntry> {
        self.entries.iter().find(|e| e.nwk_addr == nwk_addr)
    }

    /// Among entries sharing `ext_pan_id`, of device type COORD/ROUTER,
    /// flagged as a potential parent, and with link cost ≤ 3: the entry
    /// with the minimum link cost. Ties are won by the last entry scanned
    /// (the order the table happens to be iterated in), replicating the
    /// original's `LookUpForBestParent` behavior.
    pub fn lookup_best_parent(&self, ext_pan_id: ExtAddr) -> Option<&NeighborTableEntry> {
        let mut best: Option<&NeighborTableEntry> = None;
        let mut best_cost = u8::MAX;
        for entry in &self.entries {
            if entry.ext_pan_id != ext_pan_id {
                continue;
            }
            if !matches!(entry.device_type, DeviceType::Coordinator | DeviceType::Router) {
                continue;
            }
            if !entry.potential_parent {
                continue;
            }
            let cost = link_cost_from_lqi(entry.lqi);
            if cost > 3 {
                continue;
            }
            if cost <= best_cost {
                best_cost = cost;
                best = Some(entry);
            }
        }
        best
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastTransactionRecord {
    pub src: ShortAddr,
    pub sequence_number: u8,
    pub expiration: Time,
    pub retry_count: u8,
}

#[derive(Default)]
pub struct BroadcastTransactionTable {
    entries: Vec<BroadcastTransactionRecord>,
}

impl BroadcastTransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn purge(&mut self, now: Time) {
        self.entries.retain(|e| e.expiration > now);
    }

    /// Returns `true` (already seen) without mutating the table when a
    /// matching `(src, sequence_number)` record is still live; otherwise
    /// inserts `record` and returns `false`.
    pub fn add_entry(&mut self, record: BroadcastTransactionRecord, now: Time) -> bool {
        self.purge(now);
        let seen = self
            .entries
            .iter()
            .any(|e| e.src == record.src && e.sequence_number == record.sequence_number);
        if seen {
            return true;
        }
        if self.entries.len() == MAX_BROADCAST_TABLE_SIZE {
            self.entries.remove(0);
        }
        self.entries.push(record);
        false
    }

    pub fn lookup_entry(&mut self, src: ShortAddr, sequence_number: u8, now: Time) -> bool {
        self.purge(now);
        self.entries
            .iter()
            .any(|e| e.src == src && e.sequence_number == sequence_number)
    }
}

#[derive(Default)]
pub struct PanIdTable {
    entries: HashMap<ExtAddr, u16>,
}

impl PanIdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates the PAN id for `ext_pan_id`; returns `true` when
    /// the stored value actually changed.
    pub fn update(&mut self, ext_pan_id: ExtAddr, pan_id: u16) -> bool {
        let changed = self.entries.get(&ext_pan_id) != Some(&pan_id);
        self.entries.insert(ext_pan_id, pan_id);
        changed
    }

    pub fn lookup(&self, ext_pan_id: ExtAddr) -> Option<u16> {
        self.entries.get(&ext_pan_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dest: ShortAddr, status: RouteStatus, deadline: Time) -> RoutingTableEntry {
        RoutingTableEntry {
            destination: dest,
            next_hop: dest,
            status,
            many_to_one: false,
            no_route_cache: false,
            route_record_required: false,
            group_id_flag: false,
            lifetime_deadline: deadline,
        }
    }

    #[test]
    fn routing_table_rejects_new_destinations_once_full() {
        let mut t = RoutingTable::new();
        for i in 0..MAX_ROUTING_TABLE_SIZE as u16 {
            assert!(t.add_entry(entry(i, RouteStatus::Active, Time(1000))));
        }
        assert!(!t.add_entry(entry(9999, RouteStatus::Active, Time(1000))));
    }

    #[test]
    fn lookup_marks_expired_active_entries_inactive() {
        let mut t = RoutingTable::new();
        t.add_entry(entry(1, RouteStatus::Active, Time(100)));
        let found = t.lookup(1, Time(200)).unwrap();
        assert_eq!(found.status, RouteStatus::Inactive);
    }

    #[test]
    fn link_cost_matches_the_piecewise_lqi_mapping() {
        assert_eq!(link_cost_from_lqi(255), 1);
        assert_eq!(link_cost_from_lqi(240), 1);
        assert_eq!(link_cost_from_lqi(202), 2);
        assert_eq!(link_cost_from_lqi(154), 3);
        assert_eq!(link_cost_from_lqi(106), 4);
        assert_eq!(link_cost_from_lqi(58), 5);
        assert_eq!(link_cost_from_lqi(11), 6);
        assert_eq!(link_cost_from_lqi(0), 7);
    }

    #[test]
    fn best_parent_ties_are_won_by_the_last_scan() {
        let mut t = NeighborTable::new();
        let base = NeighborTableEntry {
            ext_addr: 0,
            nwk_addr: 0,
            device_type: DeviceType::Router,
            rx_on_when_idle: true,
            relationship: Relationship::None,
            timeout_counter: 0,
            device_timeout_deadline: Time::ZERO,
            tx_failure: 0,
            lqi: 255,
            outgoing_cost: 1,
            age: 0,
            ext_pan_id: 42,
            logical_channel: 11,
            depth: 1,
            beacon_order: 15,
            potential_parent: true,
        };
        let mut first = base.clone();
        first.ext_addr = 1;
        let mut second = base.clone();
        second.ext_addr = 2;
        t.add_entry(first);
        t.add_entry(second);
        let best = t.lookup_best_parent(42).unwrap();
        assert_eq!(best.ext_addr, 2);
    }

    #[test]
    fn broadcast_table_suppresses_duplicate_src_and_sequence() {
        let mut bt = BroadcastTransactionTable::new();
        let seen_before = bt.add_entry(
            BroadcastTransactionRecord {
                src: 0x1234,
                sequence_number: 7,
                expiration: Time(1000),
                retry_count: 0,
            },
            Time::ZERO,
        );
        assert!(!seen_before);
        let seen_again = bt.add_entry(
            BroadcastTransactionRecord {
                src: 0x1234,
                sequence_number: 7,
                expiration: Time(1000),
                retry_count: 0,
            },
            Time(10),
        );
        assert!(seen_again);
    }
}
