//! Zigbee APS state machine (C8): APSDE-DATA dispatch over unicast,
//! broadcast, groupcast, and binding-table delivery; APSME group and
//! binding management; tx-options parsing.
//!
//! Grounded in `SPEC_FULL.md` §4.6 and, per §10.6, in
//! `zigbee-aps.cc`'s `SendDataWithBindingTable` / `ApsmeBindRequest` /
//! `ApsmeAddGroupRequest` shapes (the NWK state machine in this crate is
//! the pattern this module's request/confirm plumbing follows).

use crate::packet::Packet;
use crate::simulator::Simulator;
use crate::time::Time;
use crate::zigbee::address::{self, ExtAddr, ShortAddr};
use crate::zigbee::aps_header::{ApsFrameType, ApsHeader, DeliveryMode};
use crate::zigbee::aps_tables::{BindResult, BindingTable, DstBindingEntry, SrcBindingEntry, UnbindResult};
use crate::zigbee::group_table::GroupTable;
use crate::zigbee::nwk::{
    Nwk, NwkAddrMode, NwkClient, NwkDstAddrMode, NldeDataConfirm, NldeDataIndication,
    NldeDataRequestParams, NwkHandle,
};
use crate::zigbee::nwk_header::DiscoverRoute;
use crate::zigbee::status::ApsStatus;
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::{HashSet, HashMap, VecDeque};
use std::rc::{Rc, Weak};

/// Default non-member radius used for APSDE-DATA.request(GROUP) when the
/// caller leaves it at zero (§4.6).
pub const DEFAULT_NON_MEMBER_RADIUS: u8 = 2;

/// Bit layout verbatim from §6: bit0 security, bit1 use-NWK-key, bit2
/// ack-required, bit3 fragmentation-permitted, bit4 extended-nonce. Carried
/// as named accessors rather than hand-rolled masking at every call site
/// (§10.6), matching the original's `ZigbeeApsTxOptions` intent without its
/// abort-on-ack-required behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions(pub u8);

impl TxOptions {
    pub fn security(self) -> bool {
        self.0 & (1 << 0) != 0
    }
    pub fn use_nwk_key(self) -> bool {
        self.0 & (1 << 1) != 0
    }
    pub fn ack_required(self) -> bool {
        self.0 & (1 << 2) != 0
    }
    pub fn fragmentation_permitted(self) -> bool {
        self.0 & (1 << 3) != 0
    }
    pub fn include_extended_nonce(self) -> bool {
        self.0 & (1 << 4) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApsDstMode {
    NoAddrUseBinding,
    Group,
    ShortEp,
    ExtEp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApsIndicationDstMode {
    ShortEp,
    Group,
}

#[derive(Debug, Clone, Copy)]
pub struct ApsdeDataRequestParams {
    pub dst_mode: ApsDstMode,
    pub dst_addr_16: ShortAddr,
    pub dst_addr_64: ExtAddr,
    pub dst_endpoint: u8,
    pub src_endpoint: u8,
    pub profile_id: u16,
    pub cluster_id: u16,
    pub radius: u8,
    pub tx_options: TxOptions,
    pub use_alias: bool,
    pub alias_src: ShortAddr,
    pub alias_seq_num: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct ApsdeDataConfirm {
    pub status: ApsStatus,
    pub dst_endpoint: u8,
    pub src_endpoint: u8,
}

#[derive(Debug)]
pub struct ApsdeDataIndication {
    pub src_addr_16: ShortAddr,
    pub src_endpoint: u8,
    pub dst_addr_mode: ApsIndicationDstMode,
    pub dst_addr_16: ShortAddr,
    pub dst_endpoint: u8,
    pub profile_id: u16,
    pub cluster_id: u16,
    pub asdu: Packet,
    pub link_quality: u8,
    pub security_status: ApsStatus,
    pub rx_time: Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupConfirmStatus {
    Success,
    TableFull,
    InvalidGroup,
    InvalidParameter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindConfirmStatus {
    Success,
    InvalidBinding,
    TableFull,
    IllegalRequest,
}

/// Callback surface the application layer above APS implements.
pub trait ApsClient {
    fn apsde_data_confirm(&mut self, sim: &mut Simulator, confirm: ApsdeDataConfirm);
    fn apsde_data_indication(&mut self, sim: &mut Simulator, indication: ApsdeDataIndication);
}

pub struct Aps {
    pub node_id: u32,
    pub ext_addr: ExtAddr,
    pub nwk: NwkHandle,
    pub group_table: Rc<RefCell<GroupTable>>,
    pub binding_table: BindingTable,
    pub client: Option<Rc<RefCell<dyn ApsClient>>>,
    pub non_member_radius: u8,
    registered_endpoints: HashSet<u8>,
    aps_counter: u8,
    /// Endpoint pairs awaiting an APSDE-DATA.confirm for a unicast send,
    /// queued per NWK destination address in send order so the eventual
    /// `NwkClient::nlde_data_confirm` callback (which only carries the
    /// destination, not the endpoints) can be matched back up (§4.6).
    pending_confirms: HashMap<ShortAddr, VecDeque<(u8, u8)>>,
    /// A weak handle to this value's own `Rc`, populated at construction
    /// via `Rc::new_cyclic` so the `NwkClient` callbacks below (which the
    /// kernel invokes as `&mut self` through a `Rc<RefCell<dyn NwkClient>>`
    /// it owns) can still schedule further work through `ApsHandle`-taking
    /// static methods, the same pattern `Nwk`'s own methods use.
    self_weak: Weak<RefCell<Aps>>,
}

pub type ApsHandle = Rc<RefCell<Aps>>;

impl Aps {
    pub fn new(node_id: u32, ext_addr: ExtAddr, nwk: NwkHandle, group_table: Rc<RefCell<GroupTable>>) -> ApsHandle {
        Rc::new_cyclic(|weak| {
            RefCell::new(Aps {
                node_id,
                ext_addr,
                nwk,
                group_table,
                binding_table: BindingTable::new(),
                client: None,
                non_member_radius: DEFAULT_NON_MEMBER_RADIUS,
                registered_endpoints: HashSet::new(),
                aps_counter: 0,
                pending_confirms: HashMap::new(),
                self_weak: weak.clone(),
            })
        })
    }

    /// Registers a local application endpoint (1..=254) so that
    /// APSME-REMOVE-ALL-GROUPS can tell an empty-but-valid endpoint from
    /// one that was never instantiated on this node.
    pub fn register_endpoint(&mut self, endpoint: u8) {
        self.registered_endpoints.insert(endpoint);
    }

    fn next_aps_counter(&mut self) -> u8 {
        self.aps_counter = self.aps_counter.wrapping_add(1);
        self.aps_counter
    }

    fn deliver_confirm(handle: &ApsHandle, sim: &mut Simulator, confirm: ApsdeDataConfirm) {
        let client = handle.borrow().client.clone();
        if let Some(client) = client {
            sim.schedule_now(move |sim| client.borrow_mut().apsde_data_confirm(sim, confirm));
        }
    }

    fn deliver_indication(handle: &ApsHandle, sim: &mut Simulator, indication: ApsdeDataIndication) {
        let client = handle.borrow().client.clone();
        if let Some(client) = client {
            sim.schedule_now(move |sim| client.borrow_mut().apsde_data_indication(sim, indication));
        }
    }

    /// APSDE-DATA.request (§4.6).
    pub fn data_request(handle: &ApsHandle, sim: &mut Simulator, params: ApsdeDataRequestParams, asdu: Packet) {
        if params.tx_options.ack_required() {
            Self::deliver_confirm(
                handle,
                sim,
                ApsdeDataConfirm {
                    status: ApsStatus::NotSupported,
                    dst_endpoint: params.dst_endpoint,
                    src_endpoint: params.src_endpoint,
                },
            );
            return;
        }

        match params.dst_mode {
            ApsDstMode::NoAddrUseBinding => Self::send_with_binding_table(handle, sim, params, asdu),
            ApsDstMode::Group => Self::send_group(handle, sim, params, asdu),
            ApsDstMode::ShortEp => Self::send_short_ep(handle, sim, params.dst_addr_16, params, asdu),
            ApsDstMode::ExtEp => {
                // §9 open question (ii): no nwkAddressMap is maintained in
                // this crate; a transmit-side IEEE destination can never be
                // resolved to a short address.
                Self::deliver_confirm(
                    handle,
                    sim,
                    ApsdeDataConfirm {
                        status: ApsStatus::NoShortAddress,
                        dst_endpoint: params.dst_endpoint,
                        src_endpoint: params.src_endpoint,
                    },
                );
            }
        }
    }

    fn send_with_binding_table(
        handle: &ApsHandle,
        sim: &mut Simulator,
        params: ApsdeDataRequestParams,
        asdu: Packet,
    ) {
        let destinations = {
            let aps = handle.borrow();
            let key = SrcBindingEntry {
                ext_addr: aps.ext_addr,
                endpoint: params.src_endpoint,
                cluster_id: params.cluster_id,
            };
            aps.binding_table.lookup_entries(&key).to_vec()
        };
        if destinations.is_empty() {
            Self::deliver_confirm(
                handle,
                sim,
                ApsdeDataConfirm {
                    status: ApsStatus::NoBoundDevice,
                    dst_endpoint: params.dst_endpoint,
                    src_endpoint: params.src_endpoint,
                },
            );
            return;
        }

        for dst in destinations {
            match dst {
                DstBindingEntry::Group { group_addr, endpoint } => {
                    let mut group_params = params;
                    group_params.dst_mode = ApsDstMode::Group;
                    group_params.dst_addr_16 = group_addr;
                    group_params.dst_endpoint = endpoint;
                    Self::send_group(handle, sim, group_params, asdu.clone());
                }
                DstBindingEntry::IeeeEndpoint { ext_addr: _, endpoint } => {
                    // No nwkAddressMap in this crate: always unresolved.
                    Self::deliver_confirm(
                        handle,
                        sim,
                        ApsdeDataConfirm {
                            status: ApsStatus::NoShortAddress,
                            dst_endpoint: endpoint,
                            src_endpoint: params.src_endpoint,
                        },
                    );
                }
            }
        }
    }

    fn send_group(handle: &ApsHandle, sim: &mut Simulator, params: ApsdeDataRequestParams, asdu: Packet) {
        if params.dst_addr_16 == 0x0000 {
            Self::deliver_confirm(
                handle,
                sim,
                ApsdeDataConfirm {
                    status: ApsStatus::InvalidGroup,
                    dst_endpoint: params.dst_endpoint,
                    src_endpoint: params.src_endpoint,
                },
            );
            return;
        }

        let (counter, non_member_radius) = {
            let mut aps = handle.borrow_mut();
            let counter = if params.use_alias { params.alias_seq_num } else { aps.next_aps_counter() };
            (counter, aps.non_member_radius)
        };
        let header = ApsHeader {
            frame_type: ApsFrameType::Data,
            delivery_mode: DeliveryMode::GroupAddressing,
            security: params.tx_options.security(),
            ack_request: false,
            extended_header_present: false,
            dst_endpoint: 0,
            group_addr: params.dst_addr_16,
            cluster_id: params.cluster_id,
            profile_id: params.profile_id,
            src_endpoint: params.src_endpoint,
            aps_counter: counter,
        };
        let mut packet = asdu;
        packet.add_header(&header);

        let nwk = handle.borrow().nwk.clone();
        let alias = if params.use_alias { Some((params.alias_src, params.alias_seq_num)) } else { None };
        Nwk::data_request(
            &nwk,
            sim,
            NldeDataRequestParams {
                addr_mode: NwkAddrMode::Mcst,
                dst_addr: params.dst_addr_16,
                radius: params.radius,
                discover_route: DiscoverRoute::Suppress,
                security: params.tx_options.security(),
                alias,
                non_member_radius,
            },
            packet,
        );
        Self::deliver_confirm(
            handle,
            sim,
            ApsdeDataConfirm {
                status: ApsStatus::Success,
                dst_endpoint: params.dst_endpoint,
                src_endpoint: params.src_endpoint,
            },
        );
    }

    fn send_short_ep(
        handle: &ApsHandle,
        sim: &mut Simulator,
        dst_addr: ShortAddr,
        params: ApsdeDataRequestParams,
        asdu: Packet,
    ) {
        if params.use_alias && params.tx_options.ack_required() {
            Self::deliver_confirm(
                handle,
                sim,
                ApsdeDataConfirm {
                    status: ApsStatus::NotSupported,
                    dst_endpoint: params.dst_endpoint,
                    src_endpoint: params.src_endpoint,
                },
            );
            return;
        }

        let delivery_mode = if address::is_broadcast(dst_addr) { DeliveryMode::Broadcast } else { DeliveryMode::Unicast };
        let counter = {
            let mut aps = handle.borrow_mut();
            if params.use_alias { params.alias_seq_num } else { aps.next_aps_counter() }
        };
        let header = ApsHeader {
            frame_type: ApsFrameType::Data,
            delivery_mode,
            security: params.tx_options.security(),
            ack_request: false,
            extended_header_present: false,
            dst_endpoint: params.dst_endpoint,
            group_addr: 0,
            cluster_id: params.cluster_id,
            profile_id: params.profile_id,
            src_endpoint: params.src_endpoint,
            aps_counter: counter,
        };
        let mut packet = asdu;
        packet.add_header(&header);

        handle
            .borrow_mut()
            .pending_confirms
            .entry(dst_addr)
            .or_default()
            .push_back((params.dst_endpoint, params.src_endpoint));

        let nwk = handle.borrow().nwk.clone();
        let alias = if params.use_alias { Some((params.alias_src, params.alias_seq_num)) } else { None };
        Nwk::data_request(
            &nwk,
            sim,
            NldeDataRequestParams {
                addr_mode: NwkAddrMode::UcstBcst,
                dst_addr,
                radius: params.radius,
                discover_route: DiscoverRoute::Enable,
                security: params.tx_options.security(),
                alias,
                non_member_radius: 0,
            },
            packet,
        );
    }

    /// APSME-ADD-GROUP.request.
    pub fn add_group(&mut self, group_id: u16, endpoint: u8) -> GroupConfirmStatus {
        if self.group_table.borrow_mut().add(group_id, endpoint) {
            GroupConfirmStatus::Success
        } else {
            GroupConfirmStatus::TableFull
        }
    }

    /// APSME-REMOVE-GROUP.request.
    pub fn remove_group(&mut self, group_id: u16, endpoint: u8) -> GroupConfirmStatus {
        if self.group_table.borrow_mut().remove(group_id, endpoint) {
            GroupConfirmStatus::Success
        } else {
            GroupConfirmStatus::InvalidGroup
        }
    }

    /// APSME-REMOVE-ALL-GROUPS.request.
    pub fn remove_all_groups(&mut self, endpoint: u8) -> GroupConfirmStatus {
        if !self.registered_endpoints.contains(&endpoint) {
            return GroupConfirmStatus::InvalidParameter;
        }
        self.group_table.borrow_mut().remove_all_memberships(endpoint);
        GroupConfirmStatus::Success
    }

    /// APSME-BIND.request.
    pub fn bind(&mut self, src: SrcBindingEntry, dst: DstBindingEntry) -> BindConfirmStatus {
        if let Some(status) = validate_endpoints(src.endpoint, dst_endpoint(&dst)) {
            return status;
        }
        match self.binding_table.bind(src, dst) {
            BindResult::Bound => BindConfirmStatus::Success,
            BindResult::EntryExists => BindConfirmStatus::InvalidBinding,
            BindResult::TableFull => BindConfirmStatus::TableFull,
        }
    }

    /// APSME-UNBIND.request.
    pub fn unbind(&mut self, src: SrcBindingEntry, dst: DstBindingEntry) -> BindConfirmStatus {
        if let Some(status) = validate_endpoints(src.endpoint, dst_endpoint(&dst)) {
            return status;
        }
        match self.binding_table.unbind(src, dst) {
            UnbindResult::Unbound => BindConfirmStatus::Success,
            UnbindResult::EntryNotFound => BindConfirmStatus::InvalidBinding,
        }
    }
}

fn dst_endpoint(dst: &DstBindingEntry) -> u8 {
    match dst {
        DstBindingEntry::Group { endpoint, .. } => *endpoint,
        DstBindingEntry::IeeeEndpoint { endpoint, .. } => *endpoint,
    }
}

/// §4.6: src-endpoint must be in `[1,254]`, dst-endpoint `>= 1`.
fn validate_endpoints(src_endpoint: u8, dst_endpoint: u8) -> Option<BindConfirmStatus> {
    if src_endpoint == 0 || src_endpoint == 255 || dst_endpoint == 0 {
        Some(BindConfirmStatus::IllegalRequest)
    } else {
        None
    }
}

impl NwkClient for Aps {
    fn nlde_data_confirm(&mut self, sim: &mut Simulator, confirm: NldeDataConfirm) {
        let Some((dst_endpoint, src_endpoint)) = self
            .pending_confirms
            .get_mut(&confirm.dst_addr)
            .and_then(|q| q.pop_front())
        else {
            return;
        };
        let Some(handle) = self.self_handle() else { return };
        Self::deliver_confirm(
            &handle,
            sim,
            ApsdeDataConfirm { status: confirm.status.into(), dst_endpoint, src_endpoint },
        );
    }

    fn nlde_data_indication(&mut self, sim: &mut Simulator, indication: NldeDataIndication) {
        let mut nsdu = indication.nsdu;
        if indication.security_use {
            debug!("node {} dropping secured NWK frame: security not implemented", self.node_id);
            return;
        }
        if nsdu.size() < 9 {
            warn!("node {} dropping undersized APS frame", self.node_id);
            return;
        }
        let header = nsdu.remove_header::<ApsHeader>();
        if header.extended_header_present {
            debug!("node {} dropping fragmented APS frame: unsupported", self.node_id);
            return;
        }
        match header.frame_type {
            ApsFrameType::Data => match header.delivery_mode {
                DeliveryMode::Unicast | DeliveryMode::Broadcast => {
                    let handle_stub = self.self_handle();
                    if let Some(handle) = handle_stub {
                        Aps::deliver_indication(
                            &handle,
                            sim,
                            ApsdeDataIndication {
                                src_addr_16: indication.src_addr,
                                src_endpoint: header.src_endpoint,
                                dst_addr_mode: ApsIndicationDstMode::ShortEp,
                                dst_addr_16: indication.dst_addr,
                                dst_endpoint: header.dst_endpoint,
                                profile_id: header.profile_id,
                                cluster_id: header.cluster_id,
                                asdu: nsdu,
                                link_quality: indication.link_quality,
                                security_status: ApsStatus::Success,
                                rx_time: indication.rx_time,
                            },
                        );
                    }
                }
                DeliveryMode::GroupAddressing => {
                    let endpoints = self.group_table.borrow().lookup_endpoints(header.group_addr);
                    let handle_stub = self.self_handle();
                    if let Some(handle) = handle_stub {
                        for endpoint in endpoints {
                            Aps::deliver_indication(
                                &handle,
                                sim,
                                ApsdeDataIndication {
                                    src_addr_16: indication.src_addr,
                                    src_endpoint: header.src_endpoint,
                                    dst_addr_mode: ApsIndicationDstMode::Group,
                                    dst_addr_16: header.group_addr,
                                    dst_endpoint: endpoint,
                                    profile_id: header.profile_id,
                                    cluster_id: header.cluster_id,
                                    asdu: nsdu.clone(),
                                    link_quality: indication.link_quality,
                                    security_status: ApsStatus::Success,
                                    rx_time: indication.rx_time,
                                },
                            );
                        }
                    }
                }
            },
            ApsFrameType::Ack | ApsFrameType::Command | ApsFrameType::InterPan => {
                debug!("node {} dropping unsupported APS frame type {:?}", self.node_id, header.frame_type);
            }
        }
    }

    fn rreq_retries_exhausted(&mut self, _rreq_id: u8, _dst: ShortAddr, _retries_used: u8) {}
}

impl Aps {
    fn self_handle(&self) -> Option<ApsHandle> {
        self.self_weak.upgrade()
    }
}
