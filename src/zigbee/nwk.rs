//! Zigbee NWK state machine (C7): the largest and hardest component. Network
//! formation/discovery/join, AODV-style route discovery with retry budgets,
//! many-to-one concentrator routes, mesh forwarding, broadcast and
//! multicast delivery, and trace-route.
//!
//! Grounded primarily in `SPEC_FULL.md` §4.5 prose (the ns-3 `zigbee-nwk.cc`
//! state machine itself is not present in the retrieval pack — only its
//! tables and test/example files are) and cross-checked against
//! `zigbee-nwk-tables.cc` for table semantics.

use crate::packet::Packet;
use crate::simulator::Simulator;
use crate::time::Time;
use crate::zigbee::address::{self, DeviceType, ExtAddr, ShortAddr};
use crate::zigbee::mac::{McpsDataRequestParams, McpsDataStatus, ZigbeeMac};
use crate::zigbee::nwk_header::{
    DiscoverRoute, NwkCommandId, NwkFrameType, NwkHeader, RrepPayload, RreqPayload,
};
use crate::zigbee::nwk_tables::{
    link_cost_from_lqi, BroadcastTransactionRecord, NeighborTableEntry, NeighborTable, PanIdTable,
    Relationship, RouteDiscoveryEntry, RouteDiscoveryTable, RouteStatus, RoutingTable,
    RoutingTableEntry, RreqRetryEntry, RreqRetryTable, INITIAL_RREQ_RETRIES, RREQ_RETRIES,
};
use crate::zigbee::group_table::GroupTable;
use crate::zigbee::status::NwkStatus;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub const DEFAULT_ROUTE_LIFETIME: Time = Time(30_000);
pub const DEFAULT_RADIUS: u8 = 10;
pub const RREQ_RETRY_DELAY: Time = Time(500);
pub const BROADCAST_RECORD_LIFETIME: Time = Time(9_000);
pub const BROADCAST_JITTER_MAX_TICKS: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NwkAddrMode {
    UcstBcst,
    Mcst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NwkDstAddrMode {
    Unicast,
    Broadcast,
    GroupAddressing,
}

#[derive(Debug, Clone, Copy)]
pub struct NldeDataRequestParams {
    pub addr_mode: NwkAddrMode,
    pub dst_addr: ShortAddr,
    pub radius: u8,
    pub discover_route: DiscoverRoute,
    pub security: bool,
    pub alias: Option<(ShortAddr, u8)>,
    pub non_member_radius: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct NldeDataConfirm {
    pub status: NwkStatus,
    pub dst_addr: ShortAddr,
}

/// One network found by NLME-NETWORK-DISCOVERY, describing a PAN a
/// neighbor beacon (in this crate, a neighbor-table entry) reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkDescriptor {
    pub ext_pan_id: ExtAddr,
    pub pan_id: u16,
    pub logical_channel: u8,
    pub stack_profile: u8,
    pub beacon_order: u8,
    pub permit_joining: bool,
}

#[derive(Debug)]
pub struct NldeDataIndication {
    pub src_addr: ShortAddr,
    pub dst_addr: ShortAddr,
    pub dst_addr_mode: NwkDstAddrMode,
    pub link_quality: u8,
    pub security_use: bool,
    pub rx_time: Time,
    pub nsdu: Packet,
}

/// Callback surface the layer above NWK (APS, or test code) implements to
/// receive confirms, indications, and the RREQ-retry diagnostic trace.
pub trait NwkClient {
    fn nlde_data_confirm(&mut self, sim: &mut Simulator, confirm: NldeDataConfirm);
    fn nlde_data_indication(&mut self, sim: &mut Simulator, indication: NldeDataIndication);
    fn rreq_retries_exhausted(&mut self, _rreq_id: u8, _dst: ShortAddr, _retries_used: u8) {}
}

struct PendingRequest {
    params: NldeDataRequestParams,
    nsdu: Packet,
}

/// Whether the relay that just (re)issued an RREQ is the original requester
/// or a forwarding router; they use different retry budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RreqRole {
    Originator,
    Relay,
}

pub struct Nwk {
    pub node_id: u32,
    pub short_addr: ShortAddr,
    pub ext_addr: ExtAddr,
    pub ext_pan_id: ExtAddr,
    pub pan_id: u16,
    pub device_type: DeviceType,
    pub sequence_number: u8,
    rreq_id_counter: u8,
    pub routing_table: RoutingTable,
    pub route_discovery_table: RouteDiscoveryTable,
    pub rreq_retry_table: RreqRetryTable,
    pub neighbor_table: NeighborTable,
    pub broadcast_table: BroadcastTransactionTable,
    pub pan_id_table: PanIdTable,
    pub group_table: Rc<RefCell<GroupTable>>,
    pub mac: Rc<RefCell<dyn ZigbeeMac>>,
    pub client: Option<Rc<RefCell<dyn NwkClient>>>,
    rreq_role: HashMap<u8, RreqRole>,
    pending: HashMap<ShortAddr, Vec<PendingRequest>>,
    rng: StdRng,
}

pub type NwkHandle = Rc<RefCell<Nwk>>;

impl Nwk {
    pub fn new(
        node_id: u32,
        ext_addr: ExtAddr,
        device_type: DeviceType,
        mac: Rc<RefCell<dyn ZigbeeMac>>,
        group_table: Rc<RefCell<GroupTable>>,
        rng_seed: u64,
    ) -> NwkHandle {
        Rc::new(RefCell::new(Nwk {
            node_id,
            short_addr: address::UNASSIGNED,
            ext_addr,
            ext_pan_id: 0,
            pan_id: 0,
            device_type,
            sequence_number: 0,
            rreq_id_counter: 0,
            routing_table: RoutingTable::new(),
            route_discovery_table: RouteDiscoveryTable::new(),
            rreq_retry_table: RreqRetryTable::new(),
            neighbor_table: NeighborTable::new(),
            broadcast_table: BroadcastTransactionTable::new(),
            pan_id_table: PanIdTable::new(),
            group_table,
            mac,
            client: None,
            rreq_role: HashMap::new(),
            pending: HashMap::new(),
            rng: StdRng::seed_from_u64(rng_seed),
        }))
    }

    fn next_sequence_number(&mut self) -> u8 {
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.sequence_number
    }

    fn next_rreq_id(&mut self) -> u8 {
        self.rreq_id_counter = self.rreq_id_counter.wrapping_add(1);
        self.rreq_id_counter
    }

    /// NLME-NETWORK-FORMATION.request: coordinator-only. Assigns itself
    /// PAN id and the reserved coordinator short address `0x0000`.
    pub fn form_network(&mut self, pan_id: u16) {
        self.ext_pan_id = self.ext_addr;
        self.pan_id = pan_id;
        self.short_addr = 0x0000;
        self.mac.borrow_mut().set_short_address(0x0000);
        self.pan_id_table.update(self.ext_pan_id, pan_id);
        info!(
            "node {} formed network pan_id={:#06x} ext_pan_id={:#018x}",
            self.node_id, pan_id, self.ext_pan_id
        );
    }

    /// NLME-DIRECT-JOIN.request: pre-registers a child's address on a
    /// router/coordinator without a MAC association handshake.
    pub fn direct_join(&mut self, child_ext_addr: ExtAddr, allocated_addr: ShortAddr) {
        self.neighbor_table.add_entry(NeighborTableEntry {
            ext_addr: child_ext_addr,
            nwk_addr: allocated_addr,
            device_type: DeviceType::Router,
            rx_on_when_idle: true,
            relationship: Relationship::UnauthenticatedChild,
            timeout_counter: 0,
            device_timeout_deadline: Time::MAX,
            tx_failure: 0,
            lqi: 255,
            outgoing_cost: 1,
            age: 0,
            ext_pan_id: self.ext_pan_id,
            logical_channel: 11,
            depth: 1,
            beacon_order: 15,
            potential_parent: false,
        });
    }

    /// NLME-JOIN.request (association): selects the best parent already in
    /// the neighbor table (populated by a prior discovery) and assumes the
    /// parent has pre-allocated `allocated_addr` via `direct_join`.
    pub fn join(&mut self, ext_pan_id: ExtAddr, allocated_addr: ShortAddr) -> bool {
        let Some(parent) = self.neighbor_table.lookup_best_parent(ext_pan_id) else {
            warn!("node {} found no eligible parent for join", self.node_id);
            return false;
        };
        let parent_addr = parent.nwk_addr;
        self.ext_pan_id = ext_pan_id;
        self.short_addr = allocated_addr;
        self.mac.borrow_mut().set_short_address(allocated_addr);
        self.neighbor_table.add_entry(NeighborTableEntry {
            ext_addr: 0,
            nwk_addr: parent_addr,
            device_type: DeviceType::Router,
            rx_on_when_idle: true,
            relationship: Relationship::Parent,
            timeout_counter: 0,
            device_timeout_deadline: Time::MAX,
            tx_failure: 0,
            lqi: 255,
            outgoing_cost: 1,
            age: 0,
            ext_pan_id,
            logical_channel: 11,
            depth: 0,
            beacon_order: 15,
            potential_parent: false,
        });
        info!(
            "node {} joined pan_id={:#06x} addr={:#06x} via parent={:#06x}",
            self.node_id, self.pan_id, allocated_addr, parent_addr
        );
        true
    }

    /// Registers a neighbor reachable over the simulated medium, with its
    /// reported link quality, so that `lookup_best_parent` and route
    /// discovery relaying have something to work with.
    pub fn add_known_neighbor(
        &mut self,
        ext_addr: ExtAddr,
        nwk_addr: ShortAddr,
        device_type: DeviceType,
        ext_pan_id: ExtAddr,
        lqi: u8,
        potential_parent: bool,
    ) {
        self.neighbor_table.add_entry(NeighborTableEntry {
            ext_addr,
            nwk_addr,
            device_type,
            rx_on_when_idle: true,
            relationship: Relationship::Sibling,
            timeout_counter: 0,
            device_timeout_deadline: Time::MAX,
            tx_failure: 0,
            lqi,
            outgoing_cost: link_cost_from_lqi(lqi),
            age: 0,
            ext_pan_id,
            logical_channel: 11,
            depth: 1,
            beacon_order: 15,
            potential_parent,
        });
    }

    /// NLME-NETWORK-DISCOVERY.request: an active scan across `channel_list`.
    /// There is no beacon exchange in this simulator, so the scan reports
    /// the PANs already visible in the neighbor table — populated the way a
    /// real scan would populate it from received beacons, via
    /// `add_known_neighbor` — filtered to the requested channels (an empty
    /// `channel_list` matches every channel) and deduplicated to one
    /// descriptor per ext-PAN-id.
    pub fn network_discovery(&self, channel_list: &[u8]) -> Vec<NetworkDescriptor> {
        let mut seen = std::collections::HashSet::new();
        let mut found = Vec::new();
        for entry in self.neighbor_table.iter() {
            if !channel_list.is_empty() && !channel_list.contains(&entry.logical_channel) {
                continue;
            }
            if !seen.insert(entry.ext_pan_id) {
                continue;
            }
            found.push(NetworkDescriptor {
                ext_pan_id: entry.ext_pan_id,
                pan_id: self.pan_id_table.lookup(entry.ext_pan_id).unwrap_or(address::UNASSIGNED),
                logical_channel: entry.logical_channel,
                stack_profile: 2,
                beacon_order: entry.beacon_order,
                permit_joining: true,
            });
        }
        found
    }

    /// NLME-START-ROUTER.request: flips a joined device into router mode so
    /// it starts accepting children. This crate has no separate "accepting
    /// joins" flag; router mode is the device-type flip itself.
    pub fn start_router(&mut self) {
        self.device_type = DeviceType::Router;
        info!("node {} started router mode", self.node_id);
    }

    fn deliver_confirm(handle: &NwkHandle, sim: &mut Simulator, confirm: NldeDataConfirm) {
        let client = handle.borrow().client.clone();
        if let Some(client) = client {
            sim.schedule_now(move |sim| client.borrow_mut().nlde_data_confirm(sim, confirm));
        }
    }

    fn deliver_indication(handle: &NwkHandle, sim: &mut Simulator, indication: NldeDataIndication) {
        let client = handle.borrow().client.clone();
        if let Some(client) = client {
            sim.schedule_now(move |sim| client.borrow_mut().nlde_data_indication(sim, indication));
        }
    }

    fn trace_retries_exhausted(handle: &NwkHandle, rreq_id: u8, dst: ShortAddr, retries_used: u8) {
        if let Some(client) = handle.borrow().client.clone() {
            client.borrow_mut().rreq_retries_exhausted(rreq_id, dst, retries_used);
        }
    }

    /// NLDE-DATA.request (§4.5).
    pub fn data_request(
        handle: &NwkHandle,
        sim: &mut Simulator,
        params: NldeDataRequestParams,
        nsdu: Packet,
    ) {
        let dst = params.dst_addr;
        if matches!(params.addr_mode, NwkAddrMode::Mcst) || address::is_broadcast(dst) {
            Self::send_broadcast_or_multicast(handle, sim, params, nsdu);
            return;
        }

        let (status, next_hop, discover_needed) = {
            let mut nwk = handle.borrow_mut();
            let now = sim.now();
            match nwk.routing_table.lookup(dst, now).map(|e| e.status) {
                Some(RouteStatus::Active) => {
                    let next_hop = nwk.routing_table.lookup(dst, now).unwrap().next_hop;
                    (Some(NwkStatus::Success), Some(next_hop), false)
                }
                Some(RouteStatus::DiscoveryUnderway) => {
                    nwk.pending.entry(dst).or_default().push(PendingRequest { params, nsdu: nsdu.clone() });
                    (None, None, false)
                }
                _ if params.discover_route == DiscoverRoute::Suppress => {
                    (Some(NwkStatus::NoRouteAvailable), None, false)
                }
                _ => (None, None, true),
            }
        };

        if discover_needed {
            let inserted = {
                let mut nwk = handle.borrow_mut();
                nwk.routing_table.add_entry(RoutingTableEntry {
                    destination: dst,
                    next_hop: address::UNASSIGNED,
                    status: RouteStatus::DiscoveryUnderway,
                    many_to_one: false,
                    no_route_cache: false,
                    route_record_required: false,
                    group_id_flag: false,
                    lifetime_deadline: Time::MAX,
                })
            };
            if !inserted {
                Self::deliver_confirm(
                    handle,
                    sim,
                    NldeDataConfirm { status: NwkStatus::InvalidRequest, dst_addr: dst },
                );
                return;
            }
            handle
                .borrow_mut()
                .pending
                .entry(dst)
                .or_default()
                .push(PendingRequest { params, nsdu });
            Self::start_route_discovery(handle, sim, dst, false);
            return;
        }

        if let Some(status) = status {
            if status == NwkStatus::Success {
                let next_hop = next_hop.unwrap();
                Self::transmit_data(handle, sim, dst, next_hop, params, nsdu);
            } else {
                Self::deliver_confirm(handle, sim, NldeDataConfirm { status, dst_addr: dst });
            }
        }
    }

    fn transmit_data(
        handle: &NwkHandle,
        sim: &mut Simulator,
        dst: ShortAddr,
        next_hop: ShortAddr,
        params: NldeDataRequestParams,
        nsdu: Packet,
    ) {
        let (header, mac) = {
            let mut nwk = handle.borrow_mut();
            let seq = params.alias.map(|(_, s)| s).unwrap_or_else(|| nwk.next_sequence_number());
            let header = NwkHeader {
                frame_type: NwkFrameType::Data,
                protocol_version: 2,
                discover_route: params.discover_route,
                multicast: false,
                security: params.security,
                destination: dst,
                source: nwk.short_addr,
                radius: if params.radius == 0 { DEFAULT_RADIUS } else { params.radius },
                sequence_number: seq,
                non_member_radius: 0,
                max_non_member_radius: 0,
            };
            (header, nwk.mac.clone())
        };
        let mut packet = nsdu;
        packet.add_header(&header);
        let confirm_handle = handle.clone();
        mac.borrow_mut().mcps_data_request(
            sim,
            McpsDataRequestParams { dst_addr: next_hop, tx_options: 0 },
            packet,
            Box::new(move |sim, status| {
                let status = if status == McpsDataStatus::Success {
                    NwkStatus::Success
                } else {
                    NwkStatus::FrameNotBuffered
                };
                Self::deliver_confirm(&confirm_handle, sim, NldeDataConfirm { status, dst_addr: dst });
            }),
        );
    }

    fn send_broadcast_or_multicast(
        handle: &NwkHandle,
        sim: &mut Simulator,
        params: NldeDataRequestParams,
        nsdu: Packet,
    ) {
        let (header, mac) = {
            let mut nwk = handle.borrow_mut();
            let seq = params.alias.map(|(_, s)| s).unwrap_or_else(|| nwk.next_sequence_number());
            let multicast = matches!(params.addr_mode, NwkAddrMode::Mcst);
            let header = NwkHeader {
                frame_type: NwkFrameType::Data,
                protocol_version: 2,
                discover_route: DiscoverRoute::Suppress,
                multicast,
                security: params.security,
                destination: params.dst_addr,
                source: nwk.short_addr,
                radius: if params.radius == 0 { DEFAULT_RADIUS } else { params.radius },
                sequence_number: seq,
                non_member_radius: params.non_member_radius,
                max_non_member_radius: params.non_member_radius,
            };
            // Record our own origination in the broadcast table so that an echo
            // back from a neighbor is recognized as a duplicate, not reprocessed.
            nwk.broadcast_table.add_entry(
                BroadcastTransactionRecord {
                    src: header.source,
                    sequence_number: seq,
                    expiration: sim.now().saturating_add(BROADCAST_RECORD_LIFETIME),
                    retry_count: 0,
                },
                sim.now(),
            );
            (header, nwk.mac.clone())
        };
        let mut packet = nsdu;
        packet.add_header(&header);
        let confirm_handle = handle.clone();
        let dst_addr = params.dst_addr;
        mac.borrow_mut().mcps_data_request(
            sim,
            McpsDataRequestParams { dst_addr: params.dst_addr, tx_options: 0 },
            packet,
            Box::new(move |sim, status| {
                let status = if status == McpsDataStatus::Success {
                    NwkStatus::Success
                } else {
                    NwkStatus::FrameNotBuffered
                };
                Self::deliver_confirm(&confirm_handle, sim, NldeDataConfirm { status, dst_addr });
            }),
        );
    }

    /// `NLME-ROUTE-DISCOVERY.request` with destination-mode=NO_ADDRESS on a
    /// concentrator: floods a many-to-one RREQ; no RREPs.
    pub fn many_to_one_route_discovery(handle: &NwkHandle, sim: &mut Simulator) {
        Self::start_route_discovery(handle, sim, address::UNASSIGNED, true);
    }

    fn start_route_discovery(handle: &NwkHandle, sim: &mut Simulator, dst: ShortAddr, many_to_one: bool) {
        let (rreq_id, source, seq) = {
            let mut nwk = handle.borrow_mut();
            (nwk.next_rreq_id(), nwk.short_addr, nwk.next_sequence_number())
        };
        handle.borrow_mut().rreq_role.insert(rreq_id, RreqRole::Originator);
        broadcast_rreq(handle, sim, rreq_id, source, dst, 0, many_to_one, seq, DEFAULT_RADIUS);
        arm_retry(handle, sim, rreq_id, dst, INITIAL_RREQ_RETRIES, RreqRole::Originator);
    }

    /// Called by the MAC boundary when a frame destined for (or passing
    /// through) this stack arrives. `lqi` is the link quality reported for
    /// the hop that just delivered it.
    pub fn mac_data_indication(handle: &NwkHandle, sim: &mut Simulator, from: ShortAddr, lqi: u8, mut psdu: Packet) {
        let header = psdu.peek_header::<NwkHeader>();
        psdu.remove_header::<NwkHeader>();

        match header.frame_type {
            NwkFrameType::Command => {
                Self::handle_command_frame(handle, sim, from, lqi, &header, psdu);
            }
            NwkFrameType::Data => {
                Self::handle_data_frame(handle, sim, from, lqi, &header, psdu);
            }
        }
    }

    fn handle_command_frame(
        handle: &NwkHandle,
        sim: &mut Simulator,
        from: ShortAddr,
        lqi: u8,
        header: &NwkHeader,
        mut payload: Packet,
    ) {
        // RREQ and RREP share the command frame type; a leading command-id
        // byte (§6 wire format) disambiguates them since both payloads
        // otherwise serialize to the same length.
        let command_id = payload.remove_header::<NwkCommandId>();
        match command_id {
            NwkCommandId::RouteRequest => {
                let rreq = payload.remove_header::<RreqPayload>();
                Self::on_rreq(handle, sim, from, lqi, header, rreq);
            }
            NwkCommandId::RouteReply => {
                let rrep = payload.remove_header::<RrepPayload>();
                Self::on_rrep(handle, sim, from, lqi, rrep);
            }
        }
    }

    fn on_rreq(
        handle: &NwkHandle,
        sim: &mut Simulator,
        from: ShortAddr,
        lqi: u8,
        header: &NwkHeader,
        rreq: RreqPayload,
    ) {
        let (self_addr, node_id) = {
            let nwk = handle.borrow();
            (nwk.short_addr, nwk.node_id)
        };
        if rreq.source == self_addr {
            return; // our own RREQ, echoed back
        }
        let link_cost = link_cost_from_lqi(lqi);
        let new_forward_cost = rreq.path_cost.saturating_add(link_cost);
        let now = sim.now();

        let should_process = {
            let mut nwk = handle.borrow_mut();
            match nwk.route_discovery_table.lookup(rreq.rreq_id, rreq.source, now).cloned() {
                Some(existing) if existing.forward_cost <= new_forward_cost => false,
                _ => {
                    nwk.route_discovery_table.add_entry(
                        RouteDiscoveryEntry {
                            rreq_id: rreq.rreq_id,
                            source: rreq.source,
                            sender: from,
                            forward_cost: new_forward_cost,
                            residual_cost: 0,
                            expiration: now.saturating_add(DEFAULT_ROUTE_LIFETIME),
                        },
                        now,
                    );
                    true
                }
            }
        };
        if !should_process {
            debug!("node {node_id} dropping non-improving duplicate RREQ id={}", rreq.rreq_id);
            return;
        }

        // Install/refresh our reverse route toward the RREQ's source.
        {
            let mut nwk = handle.borrow_mut();
            nwk.routing_table.add_entry(RoutingTableEntry {
                destination: rreq.source,
                next_hop: from,
                status: RouteStatus::Active,
                many_to_one: rreq.many_to_one,
                no_route_cache: false,
                route_record_required: false,
                group_id_flag: false,
                lifetime_deadline: now.saturating_add(DEFAULT_ROUTE_LIFETIME),
            });
        }

        if !rreq.many_to_one && rreq.destination == self_addr {
            // We are the sought destination: reply, do not keep flooding.
            let seq = handle.borrow_mut().next_sequence_number();
            send_rrep(handle, sim, from, rreq.rreq_id, rreq.source, self_addr, new_forward_cost, seq);
            return;
        }

        if header.radius == 0 {
            debug!("node {node_id} dropping RREQ id={} at radius 0", rreq.rreq_id);
            return;
        }

        handle.borrow_mut().rreq_role.insert(rreq.rreq_id, RreqRole::Relay);
        let seq = handle.borrow_mut().next_sequence_number();
        broadcast_rreq(
            handle,
            sim,
            rreq.rreq_id,
            rreq.source,
            rreq.destination,
            new_forward_cost,
            rreq.many_to_one,
            seq,
            header.radius - 1,
        );
        arm_retry(handle, sim, rreq.rreq_id, rreq.destination, RREQ_RETRIES, RreqRole::Relay);
    }

    fn on_rrep(handle: &NwkHandle, sim: &mut Simulator, from: ShortAddr, lqi: u8, rrep: RrepPayload) {
        let self_addr = handle.borrow().short_addr;
        let now = sim.now();
        let link_cost = link_cost_from_lqi(lqi);
        let residual = rrep.path_cost.saturating_add(link_cost);

        {
            let mut nwk = handle.borrow_mut();
            nwk.routing_table.add_entry(RoutingTableEntry {
                destination: rrep.responder,
                next_hop: from,
                status: RouteStatus::Active,
                many_to_one: false,
                no_route_cache: false,
                route_record_required: false,
                group_id_flag: false,
                lifetime_deadline: now.saturating_add(DEFAULT_ROUTE_LIFETIME),
            });
            if let Some(retry) = nwk.rreq_retry_table.remove(rrep.rreq_id) {
                sim.cancel(retry.retry_event);
            }
        }

        if rrep.originator == self_addr {
            Self::flush_pending(handle, sim, rrep.responder);
            return;
        }

        let sender = {
            let mut nwk = handle.borrow_mut();
            nwk.route_discovery_table.lookup(rrep.rreq_id, rrep.originator, now).map(|e| e.sender)
        };
        if let Some(next_hop) = sender {
            send_rrep(handle, sim, next_hop, rrep.rreq_id, rrep.originator, rrep.responder, residual, {
                handle.borrow_mut().next_sequence_number()
            });
        }
    }

    fn flush_pending(handle: &NwkHandle, sim: &mut Simulator, dst: ShortAddr) {
        let pending = handle.borrow_mut().pending.remove(&dst).unwrap_or_default();
        for req in pending {
            let next_hop = {
                let mut nwk = handle.borrow_mut();
                nwk.routing_table.lookup(dst, sim.now()).map(|e| e.next_hop)
            };
            match next_hop {
                Some(hop) => Self::transmit_data(handle, sim, dst, hop, req.params, req.nsdu),
                None => Self::deliver_confirm(
                    handle,
                    sim,
                    NldeDataConfirm { status: NwkStatus::RouteError, dst_addr: dst },
                ),
            }
        }
    }

    fn handle_data_frame(
        handle: &NwkHandle,
        sim: &mut Simulator,
        from: ShortAddr,
        lqi: u8,
        header: &NwkHeader,
        nsdu: Packet,
    ) {
        let (self_addr, node_id) = {
            let nwk = handle.borrow();
            (nwk.short_addr, nwk.node_id)
        };

        if header.multicast {
            Self::handle_multicast_data(handle, sim, from, lqi, header, nsdu);
            return;
        }

        if address::is_broadcast(header.destination) {
            Self::handle_broadcast_data(handle, sim, from, lqi, header, nsdu);
            return;
        }

        if header.destination == self_addr {
            Self::deliver_indication(
                handle,
                sim,
                NldeDataIndication {
                    src_addr: header.source,
                    dst_addr: header.destination,
                    dst_addr_mode: NwkDstAddrMode::Unicast,
                    link_quality: lqi,
                    security_use: header.security,
                    rx_time: sim.now(),
                    nsdu,
                },
            );
            return;
        }

        // Forward toward the real destination.
        let next_hop = {
            let mut nwk = handle.borrow_mut();
            nwk.routing_table.lookup(header.destination, sim.now()).map(|e| e.next_hop)
        };
        let Some(next_hop) = next_hop else {
            warn!("node {node_id} dropping frame to {:#06x}: no route", header.destination);
            return;
        };
        if header.radius == 0 {
            warn!("node {node_id} dropping frame to {:#06x}: radius exhausted", header.destination);
            return;
        }
        let mut forwarded_header = header.clone();
        forwarded_header.radius -= 1;
        let mut packet = nsdu;
        packet.add_header(&forwarded_header);
        let mac = handle.borrow().mac.clone();
        mac.borrow_mut().mcps_data_request(
            sim,
            McpsDataRequestParams { dst_addr: next_hop, tx_options: 0 },
            packet,
            Box::new(move |_sim, status| {
                if status != McpsDataStatus::Success {
                    warn!("node {node_id} MAC send failed forwarding frame to {next_hop:#06x}");
                }
            }),
        );
    }

    fn handle_broadcast_data(
        handle: &NwkHandle,
        sim: &mut Simulator,
        _from: ShortAddr,
        lqi: u8,
        header: &NwkHeader,
        nsdu: Packet,
    ) {
        let now = sim.now();
        let already_seen = handle.borrow_mut().broadcast_table.add_entry(
            BroadcastTransactionRecord {
                src: header.source,
                sequence_number: header.sequence_number,
                expiration: now.saturating_add(BROADCAST_RECORD_LIFETIME),
                retry_count: 0,
            },
            now,
        );
        if already_seen {
            return;
        }

        Self::deliver_indication(
            handle,
            sim,
            NldeDataIndication {
                src_addr: header.source,
                dst_addr: header.destination,
                dst_addr_mode: NwkDstAddrMode::Broadcast,
                link_quality: lqi,
                security_use: header.security,
                rx_time: now,
                nsdu: nsdu.clone(),
            },
        );

        if header.radius > 0 {
            let mut forwarded_header = header.clone();
            forwarded_header.radius -= 1;
            let mut packet = nsdu;
            packet.add_header(&forwarded_header);
            let jitter = {
                let mut nwk = handle.borrow_mut();
                Time(nwk.rng.gen_range(0..=BROADCAST_JITTER_MAX_TICKS))
            };
            let mac = handle.borrow().mac.clone();
            let dst = header.destination;
            let node_id = handle.borrow().node_id;
            sim.schedule(jitter, move |sim| {
                mac.borrow_mut().mcps_data_request(
                    sim,
                    McpsDataRequestParams { dst_addr: dst, tx_options: 0 },
                    packet,
                    Box::new(move |_sim, status| {
                        if status != McpsDataStatus::Success {
                            warn!("node {node_id} MAC send failed rebroadcasting frame from {dst:#06x}");
                        }
                    }),
                );
            });
        }
    }

    fn handle_multicast_data(
        handle: &NwkHandle,
        sim: &mut Simulator,
        _from: ShortAddr,
        lqi: u8,
        header: &NwkHeader,
        nsdu: Packet,
    ) {
        let group_id = header.destination;
        let is_member = handle.borrow().group_table.borrow().is_group_member(group_id);
        if is_member {
            Self::deliver_indication(
                handle,
                sim,
                NldeDataIndication {
                    src_addr: header.source,
                    dst_addr: group_id,
                    dst_addr_mode: NwkDstAddrMode::GroupAddressing,
                    link_quality: lqi,
                    security_use: header.security,
                    rx_time: sim.now(),
                    nsdu: nsdu.clone(),
                },
            );
        }

        let forward = if is_member {
            header.radius > 0
        } else {
            header.non_member_radius > 0
        };
        if !forward {
            return;
        }
        let mut forwarded_header = header.clone();
        if is_member {
            forwarded_header.radius -= 1;
        } else {
            forwarded_header.non_member_radius -= 1;
        }
        let mut packet = nsdu;
        packet.add_header(&forwarded_header);
        let mac = handle.borrow().mac.clone();
        let node_id = handle.borrow().node_id;
        mac.borrow_mut().mcps_data_request(
            sim,
            McpsDataRequestParams { dst_addr: group_id, tx_options: 0 },
            packet,
            Box::new(move |_sim, status| {
                if status != McpsDataStatus::Success {
                    warn!("node {node_id} MAC send failed forwarding multicast to group {group_id:#06x}");
                }
            }),
        );
    }

    /// Prints the hop sequence from `src` to `dst` by walking each stack's
    /// routing table via `resolve`, terminating on an unreachable next-hop
    /// (`0xFFFF`) or once the walk reaches `dst`.
    pub fn trace_route(
        src: ShortAddr,
        dst: ShortAddr,
        resolve: &dyn Fn(ShortAddr) -> Option<NwkHandle>,
    ) -> Vec<ShortAddr> {
        let mut path = vec![src];
        let mut current = src;
        loop {
            if current == dst {
                break;
            }
            let Some(stack) = resolve(current) else { break };
            let next_hop = stack
                .borrow_mut()
                .routing_table
                .lookup(dst, Time::MAX)
                .map(|e| e.next_hop);
            match next_hop {
                Some(hop) if hop != address::UNASSIGNED => {
                    path.push(hop);
                    current = hop;
                }
                _ => break,
            }
            if path.len() > 64 {
                break; // guards against a routing loop in a malformed topology
            }
        }
        path
    }
}

fn broadcast_rreq(
    handle: &NwkHandle,
    sim: &mut Simulator,
    rreq_id: u8,
    source: ShortAddr,
    dest: ShortAddr,
    path_cost: u8,
    many_to_one: bool,
    sequence_number: u8,
    radius: u8,
) {
    let header = NwkHeader {
        frame_type: NwkFrameType::Command,
        protocol_version: 2,
        discover_route: DiscoverRoute::Enable,
        multicast: false,
        security: false,
        destination: address::BROADCAST_ALL_DEVICES,
        source,
        radius,
        sequence_number,
        non_member_radius: 0,
        max_non_member_radius: 0,
    };
    let mut packet = Packet::new();
    packet.add_header(&RreqPayload { rreq_id, source, destination: dest, path_cost, many_to_one });
    packet.add_header(&NwkCommandId::RouteRequest);
    packet.add_header(&header);
    let mac = handle.borrow().mac.clone();
    mac.borrow_mut().mcps_data_request(
        sim,
        McpsDataRequestParams { dst_addr: address::BROADCAST_ALL_DEVICES, tx_options: 0 },
        packet,
        Box::new(move |_sim, status| {
            if status != McpsDataStatus::Success {
                debug!("RREQ id={rreq_id} MAC send failed");
            }
        }),
    );
}

fn send_rrep(
    handle: &NwkHandle,
    sim: &mut Simulator,
    next_hop: ShortAddr,
    rreq_id: u8,
    originator: ShortAddr,
    responder: ShortAddr,
    path_cost: u8,
    sequence_number: u8,
) {
    let self_addr = handle.borrow().short_addr;
    let header = NwkHeader {
        frame_type: NwkFrameType::Command,
        protocol_version: 2,
        discover_route: DiscoverRoute::Enable,
        multicast: false,
        security: false,
        destination: next_hop,
        source: self_addr,
        radius: DEFAULT_RADIUS,
        sequence_number,
        non_member_radius: 0,
        max_non_member_radius: 0,
    };
    let mut packet = Packet::new();
    packet.add_header(&RrepPayload { rreq_id, originator, responder, path_cost });
    packet.add_header(&NwkCommandId::RouteReply);
    packet.add_header(&header);
    let mac = handle.borrow().mac.clone();
    mac.borrow_mut().mcps_data_request(
        sim,
        McpsDataRequestParams { dst_addr: next_hop, tx_options: 0 },
        packet,
        Box::new(move |_sim, status| {
            if status != McpsDataStatus::Success {
                debug!("RREP id={rreq_id} MAC send failed");
            }
        }),
    );
}

fn arm_retry(handle: &NwkHandle, sim: &mut Simulator, rreq_id: u8, dst: ShortAddr, budget: u8, role: RreqRole) {
    let retry_handle = handle.clone();
    let event = sim.schedule(RREQ_RETRY_DELAY, move |sim| on_retry_timer(&retry_handle, sim, rreq_id, dst, budget, role));
    handle.borrow_mut().rreq_retry_table.insert(RreqRetryEntry { rreq_id, retry_count: budget, retry_event: event });
}

fn on_retry_timer(handle: &NwkHandle, sim: &mut Simulator, rreq_id: u8, dst: ShortAddr, budget: u8, role: RreqRole) {
    let remaining = budget.saturating_sub(1);
    let still_undiscovered = handle
        .borrow_mut()
        .routing_table
        .lookup(dst, sim.now())
        .map(|e| e.status != RouteStatus::Active)
        .unwrap_or(true);
    if !still_undiscovered && dst != address::UNASSIGNED {
        handle.borrow_mut().rreq_retry_table.remove(rreq_id);
        return;
    }
    if remaining > 0 {
        let (source, seq, many_to_one) = {
            let mut nwk = handle.borrow_mut();
            let many_to_one = dst == address::UNASSIGNED;
            (nwk.short_addr, nwk.next_sequence_number(), many_to_one)
        };
        broadcast_rreq(handle, sim, rreq_id, source, dst, 0, many_to_one, seq, DEFAULT_RADIUS);
        arm_retry(handle, sim, rreq_id, dst, remaining, role);
    } else {
        handle.borrow_mut().rreq_retry_table.remove(rreq_id);
        let retries_used = match role {
            RreqRole::Originator => INITIAL_RREQ_RETRIES,
            RreqRole::Relay => RREQ_RETRIES,
        };
        Nwk::trace_retries_exhausted(handle, rreq_id, dst, retries_used);
        if role == RreqRole::Originator {
            let node_id = handle.borrow().node_id;
            {
                let mut nwk = handle.borrow_mut();
                if let Some(entry) = nwk.routing_table.lookup_mut(dst, sim.now()) {
                    entry.status = RouteStatus::DiscoveryFailed;
                }
            }
            debug!("node {node_id} route discovery to {:#06x} failed", dst);
            let pending = handle.borrow_mut().pending.remove(&dst).unwrap_or_default();
            for req in pending {
                let _ = req;
                Nwk::deliver_confirm(handle, sim, NldeDataConfirm { status: NwkStatus::RouteDiscoveryFailed, dst_addr: dst });
            }
        }
    }
}
