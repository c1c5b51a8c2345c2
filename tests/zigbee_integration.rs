//! End-to-end scenarios (§8): these exercise NWK route discovery and APS
//! delivery across a multi-node loopback network rather than a single
//! stack in isolation. Event ordering and packet round-trip properties are
//! covered in-crate (`simulator.rs`, `packet/mod.rs`); this file covers the
//! scenarios that need more than one node.

mod common;

use common::{build_network, install_aps_collector, install_nwk_trace};

use zigbee_net_sim::packet::Packet;
use zigbee_net_sim::simulator::Simulator;
use zigbee_net_sim::time::Time;
use zigbee_net_sim::topology::Scenario;
use zigbee_net_sim::zigbee::address::BROADCAST_ALL_DEVICES;
use zigbee_net_sim::zigbee::aps::{Aps, ApsDstMode, ApsdeDataRequestParams, TxOptions};
use zigbee_net_sim::zigbee::nwk::{Nwk, NldeDataRequestParams, NwkAddrMode};
use zigbee_net_sim::zigbee::nwk_header::DiscoverRoute;
use zigbee_net_sim::zigbee::status::NwkStatus;

fn unicast_params(dst_addr: u16) -> NldeDataRequestParams {
    NldeDataRequestParams {
        addr_mode: NwkAddrMode::UcstBcst,
        dst_addr,
        radius: 0,
        discover_route: DiscoverRoute::Enable,
        security: false,
        alias: None,
        non_member_radius: 0,
    }
}

/// ZC–ZR1–ZR2 line, route discovery toward an address nothing in the
/// network holds: the originator (ZC) should exhaust its 3-retry budget and
/// surface `ROUTE_DISCOVERY_FAILED`; a relaying router (ZR1) should exhaust
/// its own, smaller, 2-retry budget for the same RREQ id.
#[test]
fn rreq_retry_budget_is_reported_on_originator_and_relay() {
    let scenario = Scenario::line(2, 0x1234);
    let net = build_network(&scenario);
    let zc = net.by_id(0);
    let zr1 = net.by_id(1);

    let zc_trace = install_nwk_trace(zc);
    let zr1_trace = install_nwk_trace(zr1);

    let mut sim = Simulator::new();
    let unreachable = 0x0D10;
    Nwk::data_request(&zc.nwk, &mut sim, unicast_params(unreachable), Packet::new_from_bytes(b"ping"));
    sim.stop_after(Time(3000));
    sim.run();

    assert!(
        zc_trace.borrow().retries_exhausted.iter().any(|&(rreq_id, dst, retries)| rreq_id == 1
            && dst == unreachable
            && retries == 3),
        "expected originator trace to report its 3-retry budget exhausted, got {:?}",
        zc_trace.borrow().retries_exhausted
    );
    assert!(
        zr1_trace.borrow().retries_exhausted.iter().any(|&(rreq_id, dst, retries)| rreq_id == 1
            && dst == unreachable
            && retries == 2),
        "expected relay trace to report its 2-retry budget exhausted, got {:?}",
        zr1_trace.borrow().retries_exhausted
    );
    assert!(
        zc_trace
            .borrow()
            .confirms
            .iter()
            .any(|c| c.dst_addr == unreachable && c.status == NwkStatus::RouteDiscoveryFailed),
        "expected a final ROUTE_DISCOVERY_FAILED confirm on the originator, got {:?}",
        zc_trace.borrow().confirms
    );
}

/// A 3-node line; device-0 sends APSDE-DATA.request(SHORT_EP) to device-2's
/// endpoint 4. Exactly one indication should land at device-2 with that
/// endpoint; the relaying device-1 forwards at the NWK layer without ever
/// handing the frame up to its own APS client.
#[test]
fn unicast_to_an_endpoint_reaches_only_the_destination_node() {
    let scenario = Scenario::line(2, 0xABCD);
    let net = build_network(&scenario);
    let sender = net.by_id(0);
    let relay = net.by_id(1);
    let dest = net.by_id(2);

    let relay_collector = install_aps_collector(relay);
    let dest_collector = install_aps_collector(dest);

    let mut sim = Simulator::new();
    let params = ApsdeDataRequestParams {
        dst_mode: ApsDstMode::ShortEp,
        dst_addr_16: dest.addr,
        dst_addr_64: 0,
        dst_endpoint: 4,
        src_endpoint: 1,
        profile_id: 0x0104,
        cluster_id: 6,
        radius: 0,
        tx_options: TxOptions(0),
        use_alias: false,
        alias_src: 0,
        alias_seq_num: 0,
    };
    Aps::data_request(&sender.aps, &mut sim, params, Packet::new_from_bytes(b"switch-on"));
    sim.stop_after(Time(200));
    sim.run();

    assert_eq!(relay_collector.borrow().indications.len(), 0, "relay must not see its own APS indication");
    let dest_indications = &dest_collector.borrow().indications;
    assert_eq!(dest_indications.len(), 1, "destination should see exactly one indication");
    assert_eq!(dest_indications[0].1, 4, "indication should carry the requested destination endpoint");
}

/// ZC–ZR1–ZR2–ZR3 plus ZR1–ZR4: groupcast to group `0x0123` reaches every
/// member endpoint exactly once per group membership, and nothing at
/// endpoints that never joined the group.
#[test]
fn groupcast_fans_out_once_per_member_endpoint() {
    let mut scenario = Scenario::line(3, 0x5678); // ZC(0)-ZR1(1)-ZR2(2)-ZR3(3)
    let branch_id = 4u32;
    scenario.nodes.push(zigbee_net_sim::topology::NodeSpec {
        node_id: branch_id,
        ext_addr: 0x9000,
        device_type: zigbee_net_sim::zigbee::address::DeviceType::Router,
        short_addr: zigbee_net_sim::zigbee::address::UNASSIGNED,
    });
    scenario.links.push(zigbee_net_sim::topology::LinkSpec { a: 1, b: branch_id, lqi: 255 });

    let net = build_network(&scenario);
    let zc = net.by_id(0);
    let zr2 = net.by_id(2);
    let zr3 = net.by_id(3);
    let zr4 = net.by_id(branch_id);

    let group_id = 0x0123;
    zr2.aps.borrow_mut().add_group(group_id, 5);
    zr3.aps.borrow_mut().add_group(group_id, 5);
    zr3.aps.borrow_mut().add_group(group_id, 6);
    // ZR4 never joins the group.

    let zr2_collector = install_aps_collector(zr2);
    let zr3_collector = install_aps_collector(zr3);
    let zr4_collector = install_aps_collector(zr4);

    let mut sim = Simulator::new();
    let params = ApsdeDataRequestParams {
        dst_mode: ApsDstMode::Group,
        dst_addr_16: group_id,
        dst_addr_64: 0,
        dst_endpoint: 0,
        src_endpoint: 1,
        profile_id: 0x0104,
        cluster_id: 8,
        radius: 0,
        tx_options: TxOptions(0),
        use_alias: false,
        alias_src: 0,
        alias_seq_num: 0,
    };
    Aps::data_request(&zc.aps, &mut sim, params, Packet::new_from_bytes(b"all-on"));
    sim.stop_after(Time(200));
    sim.run();

    assert_eq!(zr2_collector.borrow().indications.len(), 1, "ZR2 joined on one endpoint");
    assert_eq!(
        zr3_collector.borrow().indications.len(),
        2,
        "ZR3 joined on two endpoints, so it gets one indication per endpoint"
    );
    assert_eq!(zr4_collector.borrow().indications.len(), 0, "ZR4 never joined the group");
}

/// A MAC-level send failure on a broadcast NLDE-DATA.request should surface
/// as `FRAME_NOT_BUFFERED` on NLDE-DATA.confirm rather than the unconditional
/// `SUCCESS` a MAC that can't report failure would force.
#[test]
fn mac_send_failure_surfaces_as_frame_not_buffered() {
    let scenario = Scenario::line(1, 0x4242);
    let net = build_network(&scenario);
    let zc = net.by_id(0);
    zc.mac.borrow_mut().set_fail_sends(true);
    let trace = install_nwk_trace(zc);

    let mut sim = Simulator::new();
    let params = NldeDataRequestParams {
        addr_mode: NwkAddrMode::UcstBcst,
        dst_addr: BROADCAST_ALL_DEVICES,
        radius: 0,
        discover_route: DiscoverRoute::Suppress,
        security: false,
        alias: None,
        non_member_radius: 0,
    };
    Nwk::data_request(&zc.nwk, &mut sim, params, Packet::new_from_bytes(b"x"));
    sim.stop_after(Time(50));
    sim.run();

    assert!(
        trace.borrow().confirms.iter().any(|c| c.status == NwkStatus::FrameNotBuffered),
        "expected a FRAME_NOT_BUFFERED confirm, got {:?}",
        trace.borrow().confirms
    );
}

/// A small grid plus a concentrator attached to its corner: a many-to-one
/// route discovery (NLME-ROUTE-DISCOVERY, NO_ADDRESS) should leave every
/// router with an ACTIVE, many-to-one route toward the concentrator, and a
/// trace-route from the far corner should terminate at the concentrator in
/// a bounded number of hops (flooding may not find the geometric shortest
/// path, but it must not loop or fail to converge).
#[test]
fn many_to_one_discovery_reaches_every_router_in_the_grid() {
    let rows = 4u32;
    let cols = 4u32;
    let scenario = Scenario::grid(rows, cols, 0x9999);
    let net = build_network(&scenario);
    let concentrator_id = rows * cols;
    let concentrator = net.by_id(concentrator_id);

    let mut sim = Simulator::new();
    Nwk::many_to_one_route_discovery(&concentrator.nwk, &mut sim);
    sim.stop_after(Time(2000));
    sim.run();

    for r in 0..rows {
        for c in 0..cols {
            let router = net.by_id(r * cols + c);
            let mut nwk = router.nwk.borrow_mut();
            let entry = nwk
                .routing_table
                .lookup(concentrator.addr, sim.now())
                .unwrap_or_else(|| panic!("router ({r},{c}) has no route to the concentrator"));
            assert_eq!(
                entry.status,
                zigbee_net_sim::zigbee::nwk_tables::RouteStatus::Active,
                "router ({r},{c}) route to concentrator should be active"
            );
            assert!(entry.many_to_one, "router ({r},{c}) route should be flagged many-to-one");
        }
    }

    let far_corner = net.by_id((rows - 1) * cols + (cols - 1));
    let resolve = |addr: u16| net.nodes.iter().find(|n| n.addr == addr).map(|n| n.nwk.clone());
    let path = Nwk::trace_route(far_corner.addr, concentrator.addr, &resolve);
    assert_eq!(*path.last().unwrap(), concentrator.addr, "trace-route should reach the concentrator");
    assert!(path.len() <= (rows + cols) as usize * 2, "trace-route hop count should stay bounded: {path:?}");
}
