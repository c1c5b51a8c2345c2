//! A discrete-event network simulation kernel (§1–2: virtual-time
//! scheduler, event identities, packet model) carrying a Zigbee NWK/APS
//! mesh-routing and group-delivery stack (§4.3–4.7) as its reference
//! protocol.
//!
//! Module map:
//! - [`time`] / [`scheduler`] / [`simulator`] — the kernel (C1–C3).
//! - [`packet`] — the byte-buffer/header/tag model (C4).
//! - [`zigbee`] — NWK tables, NWK state machine, group table, APS state
//!   machine, and the APS binding table (C5–C9).
//! - [`topology`] — scenario description/generation used by multi-node
//!   integration tests (§10.3); not part of the simulated protocol itself.

pub mod packet;
pub mod scheduler;
pub mod simulator;
pub mod time;
pub mod topology;
pub mod zigbee;

pub use simulator::Simulator;
pub use time::{resolution, set_resolution, EventId, Time, TimeUnit};
