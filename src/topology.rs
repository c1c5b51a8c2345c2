//! Scenario/topology description (§10.3 of `SPEC_FULL.md`): the multi-node
//! wiring the end-to-end Zigbee scenarios need, loaded the way the
//! reference crate's `simulation::types::Scene` is loaded by
//! `network_task::load_scene` — a serde-deserializable description read
//! from TOML or JSON via `anyhow::Context`-wrapped I/O, plus a couple of
//! small generators (line, grid) so integration tests don't have to author
//! a fixture file for every topology shape.
//!
//! This module only describes a scenario; it does not construct any
//! `Nwk`/`Aps` stacks itself; per §1 the PHY/channel model that would
//! actually deliver a frame between two `NodeSpec`s is out of scope; test
//! code wires a loopback MAC from a [`Scenario`].

use crate::zigbee::address::{DeviceType, ExtAddr, ShortAddr};
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Samples a link quality indicator around `base_lqi` with log-normal-style
/// shadowing, the same `rand_distr::Normal` pattern the reference crate uses
/// in `simulation/signal_calculations.rs` for its own RSSI sampling — seeded
/// rather than `thread_rng`-backed so a scenario author can reproduce a
/// particular noisy topology deterministically (§4.1's determinism
/// invariant applies to the simulator, not topology generation, but there is
/// no reason to give this one up for free).
pub fn sample_lqi(seed: u64, base_lqi: u8, sigma: f32) -> u8 {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(base_lqi as f32, sigma).expect("sigma must be finite and non-negative");
    normal.sample(&mut rng).round().clamp(0.0, 255.0) as u8
}

fn default_lqi() -> u8 {
    255
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    pub node_id: u32,
    pub ext_addr: ExtAddr,
    #[serde(default = "default_device_type")]
    pub device_type: DeviceType,
    /// Pre-assigned short address; `0xFFFF` (the default) means "join at
    /// scenario build time" rather than "broadcast" here.
    #[serde(default = "default_short_addr")]
    pub short_addr: ShortAddr,
}

fn default_device_type() -> DeviceType {
    DeviceType::Router
}

fn default_short_addr() -> ShortAddr {
    crate::zigbee::address::UNASSIGNED
}

/// An undirected radio-reachability edge between two [`NodeSpec::node_id`]s
/// with the link quality a loopback MAC should report for frames crossing
/// it (§3 "neighbor table entry").
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LinkSpec {
    pub a: u32,
    pub b: u32,
    #[serde(default = "default_lqi")]
    pub lqi: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub pan_id: u16,
    #[serde(default)]
    pub channel_list: Vec<u8>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

impl Scenario {
    /// Loads a scenario from a `.toml` or `.json` file, mirroring
    /// `network_task::load_scene`'s `with_context`-wrapped read-then-parse
    /// shape.
    pub fn load(path: impl AsRef<Path>) -> Result<Scenario> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario file: {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&data).context("invalid scenario JSON"),
            _ => toml::from_str(&data).context("invalid scenario TOML"),
        }
    }

    /// A coordinator followed by `hop_count` routers in a line, each only
    /// reachable from its immediate neighbors (used by the RREQ-retry-budget
    /// scenario in §8).
    pub fn line(hop_count: u32, pan_id: u16) -> Scenario {
        let mut nodes = Vec::new();
        let mut links = Vec::new();
        for i in 0..=hop_count {
            nodes.push(NodeSpec {
                node_id: i,
                ext_addr: 0x1000 + i as u64,
                device_type: if i == 0 { DeviceType::Coordinator } else { DeviceType::Router },
                short_addr: crate::zigbee::address::UNASSIGNED,
            });
            if i > 0 {
                links.push(LinkSpec { a: i - 1, b: i, lqi: 255 });
            }
        }
        Scenario { pan_id, channel_list: vec![11], nodes, links }
    }

    /// A `rows`×`cols` grid of routers plus one concentrator at node id
    /// `rows*cols` attached to the corner `(0,0)`, used by the many-to-one
    /// scenario in §8. Each cell links to its orthogonal neighbors.
    pub fn grid(rows: u32, cols: u32, pan_id: u16) -> Scenario {
        let mut nodes = Vec::new();
        let mut links = Vec::new();
        let id = |r: u32, c: u32| r * cols + c;
        for r in 0..rows {
            for c in 0..cols {
                let n = id(r, c);
                nodes.push(NodeSpec {
                    node_id: n,
                    ext_addr: 0x2000 + n as u64,
                    device_type: DeviceType::Router,
                    short_addr: crate::zigbee::address::UNASSIGNED,
                });
                if c + 1 < cols {
                    links.push(LinkSpec { a: n, b: id(r, c + 1), lqi: 255 });
                }
                if r + 1 < rows {
                    links.push(LinkSpec { a: n, b: id(r + 1, c), lqi: 255 });
                }
            }
        }
        let concentrator_id = rows * cols;
        nodes.push(NodeSpec {
            node_id: concentrator_id,
            ext_addr: 0x2FFF,
            device_type: DeviceType::Coordinator,
            short_addr: crate::zigbee::address::UNASSIGNED,
        });
        links.push(LinkSpec { a: concentrator_id, b: id(0, 0), lqi: 255 });
        Scenario { pan_id, channel_list: vec![11], nodes, links }
    }

    /// Re-samples every link's LQI around `base_lqi` via [`sample_lqi`],
    /// seeded per-link so the result is reproducible. Scenario generators
    /// default every link to a flat 255 so the §8 integration tests don't
    /// have to tolerate route flaps from a noisy topology; this is the
    /// opt-in path for a scenario that wants that noise anyway.
    pub fn with_noisy_links(mut self, seed: u64, base_lqi: u8, sigma: f32) -> Scenario {
        for (i, link) in self.links.iter_mut().enumerate() {
            link.lqi = sample_lqi(seed.wrapping_add(i as u64), base_lqi, sigma);
        }
        self
    }
}
