//! Shared multi-node test harness: a loopback `ZigbeeMac` test double wired
//! from a [`zigbee_net_sim::topology::Scenario`] (§10.4 — "a small in-process
//! loopback MAC test double, not a real radio/channel simulation"), plus
//! small confirm/indication collectors used by the end-to-end tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Once;

use zigbee_net_sim::packet::Packet;
use zigbee_net_sim::simulator::Simulator;
use zigbee_net_sim::time::Time;
use zigbee_net_sim::topology::Scenario;
use zigbee_net_sim::zigbee::address::{self, DeviceType, ExtAddr, ShortAddr};
use zigbee_net_sim::zigbee::aps::{Aps, ApsClient, ApsHandle, ApsdeDataConfirm, ApsdeDataIndication};
use zigbee_net_sim::zigbee::group_table::GroupTable;
use zigbee_net_sim::zigbee::mac::{McpsDataRequestParams, McpsDataStatus, ZigbeeMac};
use zigbee_net_sim::zigbee::nwk::{Nwk, NwkClient, NwkHandle, NldeDataConfirm, NldeDataIndication};

/// Fixed per-hop propagation delay; small relative to `RREQ_RETRY_DELAY`
/// (500 ticks) so route discovery never needs a retry to complete in these
/// tests unless the scenario specifically exercises the retry budget.
pub const LINK_DELAY: Time = Time(2);

#[derive(Clone, Default)]
pub struct NetworkRegistry {
    nodes: Rc<RefCell<HashMap<ShortAddr, NwkHandle>>>,
    links: Rc<RefCell<HashMap<ShortAddr, Vec<(ShortAddr, u8)>>>>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register_node(&self, addr: ShortAddr, nwk: NwkHandle) {
        self.nodes.borrow_mut().insert(addr, nwk);
    }

    fn add_link(&self, a: ShortAddr, b: ShortAddr, lqi: u8) {
        self.links.borrow_mut().entry(a).or_default().push((b, lqi));
        self.links.borrow_mut().entry(b).or_default().push((a, lqi));
    }

    fn neighbors_of(&self, addr: ShortAddr) -> Vec<(ShortAddr, u8)> {
        self.links.borrow().get(&addr).cloned().unwrap_or_default()
    }
}

/// Delivers every MAC-layer send after a fixed link delay to whichever of
/// the sender's registered neighbors match the destination (every neighbor,
/// for a broadcast address).
pub struct LoopbackMac {
    short_addr: ShortAddr,
    ext_addr: ExtAddr,
    registry: NetworkRegistry,
    fail_sends: bool,
}

impl LoopbackMac {
    pub fn new(short_addr: ShortAddr, ext_addr: ExtAddr, registry: NetworkRegistry) -> Self {
        LoopbackMac { short_addr, ext_addr, registry, fail_sends: false }
    }

    /// Test hook: makes every subsequent send confirm
    /// `McpsDataStatus::ChannelAccessFailure` instead of delivering, so a
    /// test can exercise the NWK layer's `FRAME_NOT_BUFFERED` path.
    pub fn set_fail_sends(&mut self, fail: bool) {
        self.fail_sends = fail;
    }
}

impl ZigbeeMac for LoopbackMac {
    fn mcps_data_request(
        &mut self,
        sim: &mut Simulator,
        params: McpsDataRequestParams,
        psdu: Packet,
        confirm: Box<dyn FnOnce(&mut Simulator, McpsDataStatus)>,
    ) {
        let from = self.short_addr;
        let registry = self.registry.clone();
        let dst = params.dst_addr;
        let fail = self.fail_sends;
        sim.schedule(LINK_DELAY, move |sim| {
            if fail {
                confirm(sim, McpsDataStatus::ChannelAccessFailure);
                return;
            }
            for (addr, lqi) in registry.neighbors_of(from) {
                if address::is_broadcast(dst) || addr == dst {
                    if let Some(nwk) = registry.nodes.borrow().get(&addr).cloned() {
                        Nwk::mac_data_indication(&nwk, sim, from, lqi, psdu.clone());
                    }
                }
            }
            confirm(sim, McpsDataStatus::Success);
        });
    }

    fn set_short_address(&mut self, addr: ShortAddr) {
        self.short_addr = addr;
    }

    fn short_address(&self) -> ShortAddr {
        self.short_addr
    }

    fn set_extended_address(&mut self, addr: ExtAddr) {
        self.ext_addr = addr;
    }

    fn extended_address(&self) -> ExtAddr {
        self.ext_addr
    }
}

pub struct BuiltNode {
    pub node_id: u32,
    pub addr: ShortAddr,
    pub ext_addr: ExtAddr,
    pub device_type: DeviceType,
    pub nwk: NwkHandle,
    pub aps: ApsHandle,
    pub mac: Rc<RefCell<LoopbackMac>>,
}

pub struct Network {
    pub nodes: Vec<BuiltNode>,
}

impl Network {
    pub fn by_id(&self, node_id: u32) -> &BuiltNode {
        self.nodes.iter().find(|n| n.node_id == node_id).expect("node_id present in scenario")
    }
}

/// Builds one `Nwk`/`Aps` stack per `scenario` node and a loopback MAC
/// adjacency from its links, bypassing the association/join handshake: each
/// node's short address is assigned directly (coordinator gets `0x0000`;
/// everyone else `node_id + 1`, or the scenario's explicit `short_addr` if
/// it set one) since §1 scopes MAC association out and these tests care
/// about NWK/APS behavior given a formed network, not network formation.
static LOGGER_INIT: Once = Once::new();

/// Installs `env_logger` once per test process, the same `Builder`-backed
/// setup `main.rs` does for the real application (minus its `TeeLogger`
/// capture, which is a UI-only concern) so `RUST_LOG=debug cargo test` can
/// surface this crate's `log::debug!`/`warn!` trace of a scenario run.
fn init_logging() {
    LOGGER_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn build_network(scenario: &Scenario) -> Network {
    init_logging();
    let registry = NetworkRegistry::new();
    let mut addr_of = HashMap::new();
    for n in &scenario.nodes {
        let addr = if n.short_addr != address::UNASSIGNED {
            n.short_addr
        } else if n.device_type == DeviceType::Coordinator {
            0x0000
        } else {
            (n.node_id as u16).wrapping_add(1)
        };
        addr_of.insert(n.node_id, addr);
    }
    for link in &scenario.links {
        registry.add_link(addr_of[&link.a], addr_of[&link.b], link.lqi);
    }

    let mut nodes = Vec::new();
    for (i, n) in scenario.nodes.iter().enumerate() {
        let addr = addr_of[&n.node_id];
        let mac = Rc::new(RefCell::new(LoopbackMac::new(addr, n.ext_addr, registry.clone())));
        let group_table = Rc::new(RefCell::new(GroupTable::new()));
        let nwk = Nwk::new(n.node_id, n.ext_addr, n.device_type, mac.clone(), group_table.clone(), 0xC0FFEE + i as u64);
        {
            let mut guard = nwk.borrow_mut();
            guard.short_addr = addr;
            guard.pan_id = scenario.pan_id;
            guard.ext_pan_id = scenario.pan_id as u64;
        }
        registry.register_node(addr, nwk.clone());
        let aps = Aps::new(n.node_id, n.ext_addr, nwk.clone(), group_table);
        nwk.borrow_mut().client = Some(aps.clone() as Rc<RefCell<dyn NwkClient>>);
        nodes.push(BuiltNode { node_id: n.node_id, addr, ext_addr: n.ext_addr, device_type: n.device_type, nwk, aps, mac });
    }
    Network { nodes }
}

/// Records every NWK-level confirm and RREQ-retry-exhaustion trace seen by
/// whichever node it is installed as the client of, tagging each with
/// `node_id` so a test can tell which physical node emitted it.
#[derive(Default)]
pub struct NwkTrace {
    pub node_id: u32,
    pub confirms: Vec<NldeDataConfirm>,
    pub retries_exhausted: Vec<(u8, ShortAddr, u8)>,
}

pub type NwkTraceHandle = Rc<RefCell<NwkTrace>>;

pub fn install_nwk_trace(node: &BuiltNode) -> NwkTraceHandle {
    let trace = Rc::new(RefCell::new(NwkTrace { node_id: node.node_id, ..Default::default() }));
    node.nwk.borrow_mut().client = Some(trace.clone() as Rc<RefCell<dyn NwkClient>>);
    trace
}

impl NwkClient for NwkTrace {
    fn nlde_data_confirm(&mut self, _sim: &mut Simulator, confirm: NldeDataConfirm) {
        self.confirms.push(confirm);
    }

    fn nlde_data_indication(&mut self, _sim: &mut Simulator, _indication: NldeDataIndication) {}

    fn rreq_retries_exhausted(&mut self, rreq_id: u8, dst: ShortAddr, retries_used: u8) {
        self.retries_exhausted.push((rreq_id, dst, retries_used));
    }
}

/// Records every APSDE-DATA confirm/indication delivered to whichever
/// node's `Aps` it is installed on.
#[derive(Default)]
pub struct ApsCollector {
    pub confirms: Vec<ApsdeDataConfirm>,
    pub indications: Vec<(ShortAddr, u8, usize)>,
}

pub type ApsCollectorHandle = Rc<RefCell<ApsCollector>>;

pub fn install_aps_collector(node: &BuiltNode) -> ApsCollectorHandle {
    let collector = Rc::new(RefCell::new(ApsCollector::default()));
    node.aps.borrow_mut().client = Some(collector.clone() as Rc<RefCell<dyn ApsClient>>);
    collector
}

impl ApsClient for ApsCollector {
    fn apsde_data_confirm(&mut self, _sim: &mut Simulator, confirm: ApsdeDataConfirm) {
        self.confirms.push(confirm);
    }

    fn apsde_data_indication(&mut self, _sim: &mut Simulator, indication: ApsdeDataIndication) {
        self.indications.push((indication.src_addr_16, indication.dst_endpoint, indication.asdu.size()));
    }
}
