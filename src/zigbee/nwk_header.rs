//! NWK header wire format (§6): frame type, destination/source short
//! addresses, radius, sequence number, and the multicast control subframe
//! used for group addressing.

use crate::packet::Header;
use crate::zigbee::address::ShortAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NwkFrameType {
    Data,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverRoute {
    Suppress,
    Enable,
    Force,
}

#[derive(Debug, Clone)]
pub struct NwkHeader {
    pub frame_type: NwkFrameType,
    pub protocol_version: u8,
    pub discover_route: DiscoverRoute,
    pub multicast: bool,
    pub security: bool,
    pub destination: ShortAddr,
    pub source: ShortAddr,
    pub radius: u8,
    pub sequence_number: u8,
    /// Present only when `multicast` is set.
    pub non_member_radius: u8,
    pub max_non_member_radius: u8,
}

impl NwkHeader {
    pub fn fixed_size() -> usize {
        // frame control (2) + dest (2) + src (2) + radius (1) + seq (1) +
        // multicast control (1, always present, meaningful only if `multicast`)
        9
    }
}

impl Header for NwkHeader {
    fn serialized_size(&self) -> usize {
        Self::fixed_size()
    }

    fn serialized_size_hint() -> usize {
        Self::fixed_size()
    }

    fn serialize(&self, buf: &mut [u8]) {
        let mut frame_control: u16 = 0;
        if matches!(self.frame_type, NwkFrameType::Command) {
            frame_control |= 1 << 0;
        }
        frame_control |= (self.protocol_version as u16 & 0xF) << 2;
        frame_control |= match self.discover_route {
            DiscoverRoute::Suppress => 0,
            DiscoverRoute::Enable => 1,
            DiscoverRoute::Force => 2,
        } << 6;
        if self.multicast {
            frame_control |= 1 << 8;
        }
        if self.security {
            frame_control |= 1 << 9;
        }
        buf[0..2].copy_from_slice(&frame_control.to_be_bytes());
        buf[2..4].copy_from_slice(&self.destination.to_be_bytes());
        buf[4..6].copy_from_slice(&self.source.to_be_bytes());
        buf[6] = self.radius;
        buf[7] = self.sequence_number;
        buf[8] = self.non_member_radius | (self.max_non_member_radius << 4);
    }

    fn deserialize(buf: &[u8]) -> Self {
        let frame_control = u16::from_be_bytes([buf[0], buf[1]]);
        let frame_type = if frame_control & 1 != 0 {
            NwkFrameType::Command
        } else {
            NwkFrameType::Data
        };
        let protocol_version = ((frame_control >> 2) & 0xF) as u8;
        let discover_route = match (frame_control >> 6) & 0x3 {
            1 => DiscoverRoute::Enable,
            2 => DiscoverRoute::Force,
            _ => DiscoverRoute::Suppress,
        };
        let multicast = frame_control & (1 << 8) != 0;
        let security = frame_control & (1 << 9) != 0;
        let destination = u16::from_be_bytes([buf[2], buf[3]]);
        let source = u16::from_be_bytes([buf[4], buf[5]]);
        let radius = buf[6];
        let sequence_number = buf[7];
        let (non_member_radius, max_non_member_radius) = (buf[8] & 0xF, (buf[8] >> 4) & 0xF);
        NwkHeader {
            frame_type,
            protocol_version,
            discover_route,
            multicast,
            security,
            destination,
            source,
            radius,
            sequence_number,
            non_member_radius,
            max_non_member_radius,
        }
    }

    fn print(&self) -> String {
        format!(
            "Nwk(src={:#06x} dst={:#06x} radius={} seq={} mcst={})",
            self.source, self.destination, self.radius, self.sequence_number, self.multicast
        )
    }
}

/// Command identifier distinguishing RREQ from RREP within a `Command`-type
/// frame's NSDU; both payloads otherwise serialize to the same byte length,
/// so a frame-type tag alone can't tell them apart on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NwkCommandId {
    RouteRequest,
    RouteReply,
}

impl Header for NwkCommandId {
    fn serialized_size(&self) -> usize {
        1
    }

    fn serialized_size_hint() -> usize {
        1
    }

    fn serialize(&self, buf: &mut [u8]) {
        buf[0] = match self {
            NwkCommandId::RouteRequest => 0x01,
            NwkCommandId::RouteReply => 0x02,
        };
    }

    fn deserialize(buf: &[u8]) -> Self {
        match buf[0] {
            0x02 => NwkCommandId::RouteReply,
            _ => NwkCommandId::RouteRequest,
        }
    }

    fn print(&self) -> String {
        match self {
            NwkCommandId::RouteRequest => "Cmd(RREQ)".to_string(),
            NwkCommandId::RouteReply => "Cmd(RREP)".to_string(),
        }
    }
}

/// RREQ/RREP control payloads, carried as the NSDU of a `Command`-type frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RreqPayload {
    pub rreq_id: u8,
    pub source: ShortAddr,
    pub destination: ShortAddr,
    pub path_cost: u8,
    pub many_to_one: bool,
}

impl Header for RreqPayload {
    fn serialized_size(&self) -> usize {
        6
    }

    fn serialized_size_hint() -> usize {
        6
    }

    fn serialize(&self, buf: &mut [u8]) {
        buf[0] = self.rreq_id;
        buf[1..3].copy_from_slice(&self.source.to_be_bytes());
        buf[3..5].copy_from_slice(&self.destination.to_be_bytes());
        buf[5] = self.path_cost | if self.many_to_one { 0x80 } else { 0 };
    }

    fn deserialize(buf: &[u8]) -> Self {
        RreqPayload {
            rreq_id: buf[0],
            source: u16::from_be_bytes([buf[1], buf[2]]),
            destination: u16::from_be_bytes([buf[3], buf[4]]),
            path_cost: buf[5] & 0x7F,
            many_to_one: buf[5] & 0x80 != 0,
        }
    }

    fn print(&self) -> String {
        format!(
            "Rreq(id={} src={:#06x} dst={:#06x} cost={})",
            self.rreq_id, self.source, self.destination, self.path_cost
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RrepPayload {
    pub rreq_id: u8,
    pub originator: ShortAddr,
    pub responder: ShortAddr,
    pub path_cost: u8,
}

impl Header for RrepPayload {
    fn serialized_size(&self) -> usize {
        6
    }

    fn serialized_size_hint() -> usize {
        6
    }

    fn serialize(&self, buf: &mut [u8]) {
        buf[0] = self.rreq_id;
        buf[1..3].copy_from_slice(&self.originator.to_be_bytes());
        buf[3..5].copy_from_slice(&self.responder.to_be_bytes());
        buf[5] = self.path_cost;
    }

    fn deserialize(buf: &[u8]) -> Self {
        RrepPayload {
            rreq_id: buf[0],
            originator: u16::from_be_bytes([buf[1], buf[2]]),
            responder: u16::from_be_bytes([buf[3], buf[4]]),
            path_cost: buf[5],
        }
    }

    fn print(&self) -> String {
        format!(
            "Rrep(id={} originator={:#06x} responder={:#06x} cost={})",
            self.rreq_id, self.originator, self.responder, self.path_cost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    #[test]
    fn nwk_header_round_trips_through_a_packet() {
        let header = NwkHeader {
            frame_type: NwkFrameType::Data,
            protocol_version: 2,
            discover_route: DiscoverRoute::Enable,
            multicast: false,
            security: false,
            destination: 0x1234,
            source: 0x5678,
            radius: 5,
            sequence_number: 9,
            non_member_radius: 0,
            max_non_member_radius: 0,
        };
        let mut p = Packet::new();
        p.add_header(&header);
        let restored = p.remove_header::<NwkHeader>();
        assert_eq!(restored.destination, 0x1234);
        assert_eq!(restored.source, 0x5678);
        assert_eq!(restored.radius, 5);
        assert_eq!(restored.sequence_number, 9);
        assert_eq!(restored.discover_route, DiscoverRoute::Enable);
    }
}
