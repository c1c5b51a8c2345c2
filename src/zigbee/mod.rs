//! Zigbee protocol stack: NWK routing/mesh (C5, C7) and APS delivery (C6,
//! C8, C9) riding on the kernel in [`crate::simulator`] and the packet
//! model in [`crate::packet`].
//!
//! The MAC boundary ([`mac`]) and everything below it (PHY, channel,
//! association bookkeeping) is out of scope (§1) and expressed here only
//! as the trait NWK needs to call through.

pub mod address;
pub mod aps;
pub mod aps_header;
pub mod aps_tables;
pub mod group_table;
pub mod mac;
pub mod nwk;
pub mod nwk_header;
pub mod nwk_tables;
pub mod status;
