//! The MAC boundary (§6): the NWK layer is the sole direct client. The real
//! IEEE 802.15.4 MAC (ACK/retry, beacon ordering, association bookkeeping)
//! is out of scope; only the request/confirm/indication shape matters here.

use crate::packet::Packet;
use crate::simulator::Simulator;
use crate::zigbee::address::{ExtAddr, ShortAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpsDataStatus {
    Success,
    ChannelAccessFailure,
    NoAck,
    TransactionOverflow,
    TransactionExpired,
}

#[derive(Debug, Clone, Copy)]
pub struct McpsDataRequestParams {
    pub dst_addr: ShortAddr,
    pub tx_options: u8,
}

/// Everything the NWK layer needs from a MAC implementation.
///
/// `mcps_data_request` is asynchronous like every other primitive in this
/// crate: the MAC implementation invokes `confirm` once it knows whether
/// the frame went out, rather than returning a status synchronously, so a
/// MAC that itself models channel access delay or retry can defer the
/// confirm until it actually knows the outcome.
pub trait ZigbeeMac {
    fn mcps_data_request(
        &mut self,
        sim: &mut Simulator,
        params: McpsDataRequestParams,
        psdu: Packet,
        confirm: Box<dyn FnOnce(&mut Simulator, McpsDataStatus)>,
    );
    fn set_short_address(&mut self, addr: ShortAddr);
    fn short_address(&self) -> ShortAddr;
    fn set_extended_address(&mut self, addr: ExtAddr);
    fn extended_address(&self) -> ExtAddr;
}
