//! APS header wire format (§6): frame control, destination endpoint or
//! group address, cluster/profile ids, source endpoint, APS counter.

use crate::packet::Header;
use crate::zigbee::address::ShortAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApsFrameType {
    Data = 0,
    Command = 1,
    Ack = 2,
    InterPan = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Unicast,
    Broadcast,
    GroupAddressing,
}

#[derive(Debug, Clone, Copy)]
pub struct ApsHeader {
    pub frame_type: ApsFrameType,
    pub delivery_mode: DeliveryMode,
    pub security: bool,
    pub ack_request: bool,
    pub extended_header_present: bool,
    /// Destination endpoint, or the group address when `delivery_mode` is
    /// `GroupAddressing` (the two are mutually exclusive on the wire).
    pub dst_endpoint: u8,
    pub group_addr: ShortAddr,
    pub cluster_id: u16,
    pub profile_id: u16,
    pub src_endpoint: u8,
    pub aps_counter: u8,
}

impl Header for ApsHeader {
    fn serialized_size(&self) -> usize {
        // frame control (1) + dst-endpoint-or-group (2, padded) + cluster (2)
        // + profile (2) + src-endpoint (1) + counter (1)
        9
    }

    fn serialized_size_hint() -> usize {
        9
    }

    fn serialize(&self, buf: &mut [u8]) {
        let mut fc: u8 = match self.frame_type {
            ApsFrameType::Data => 0,
            ApsFrameType::Command => 1,
            ApsFrameType::Ack => 2,
            ApsFrameType::InterPan => 3,
        };
        fc |= match self.delivery_mode {
            DeliveryMode::Unicast => 0,
            DeliveryMode::Broadcast => 2,
            DeliveryMode::GroupAddressing => 3,
        } << 2;
        if self.security {
            fc |= 1 << 5;
        }
        if self.ack_request {
            fc |= 1 << 6;
        }
        if self.extended_header_present {
            fc |= 1 << 7;
        }
        buf[0] = fc;
        if matches!(self.delivery_mode, DeliveryMode::GroupAddressing) {
            buf[1..3].copy_from_slice(&self.group_addr.to_be_bytes());
        } else {
            buf[1] = self.dst_endpoint;
            buf[2] = 0;
        }
        buf[3..5].copy_from_slice(&self.cluster_id.to_be_bytes());
        buf[5..7].copy_from_slice(&self.profile_id.to_be_bytes());
        buf[7] = self.src_endpoint;
        buf[8] = self.aps_counter;
    }

    fn deserialize(buf: &[u8]) -> Self {
        let fc = buf[0];
        let frame_type = match fc & 0x3 {
            0 => ApsFrameType::Data,
            1 => ApsFrameType::Command,
            2 => ApsFrameType::Ack,
            _ => ApsFrameType::InterPan,
        };
        let delivery_mode = match (fc >> 2) & 0x3 {
            0 => DeliveryMode::Unicast,
            3 => DeliveryMode::GroupAddressing,
            _ => DeliveryMode::Broadcast,
        };
        let security = fc & (1 << 5) != 0;
        let ack_request = fc & (1 << 6) != 0;
        let extended_header_present = fc & (1 << 7) != 0;
        let (dst_endpoint, group_addr) = if matches!(delivery_mode, DeliveryMode::GroupAddressing) {
            (0, u16::from_be_bytes([buf[1], buf[2]]))
        } else {
            (buf[1], 0)
        };
        ApsHeader {
            frame_type,
            delivery_mode,
            security,
            ack_request,
            extended_header_present,
            dst_endpoint,
            group_addr,
            cluster_id: u16::from_be_bytes([buf[3], buf[4]]),
            profile_id: u16::from_be_bytes([buf[5], buf[6]]),
            src_endpoint: buf[7],
            aps_counter: buf[8],
        }
    }

    fn print(&self) -> String {
        format!(
            "Aps(type={:?} delivery={:?} srcEp={} counter={})",
            self.frame_type, self.delivery_mode, self.src_endpoint, self.aps_counter
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    #[test]
    fn aps_header_round_trips_group_addressing() {
        let header = ApsHeader {
            frame_type: ApsFrameType::Data,
            delivery_mode: DeliveryMode::GroupAddressing,
            security: false,
            ack_request: false,
            extended_header_present: false,
            dst_endpoint: 0,
            group_addr: 0x0123,
            cluster_id: 6,
            profile_id: 0x0104,
            src_endpoint: 1,
            aps_counter: 42,
        };
        let mut p = Packet::new();
        p.add_header(&header);
        let restored = p.remove_header::<ApsHeader>();
        assert_eq!(restored.group_addr, 0x0123);
        assert!(matches!(restored.delivery_mode, DeliveryMode::GroupAddressing));
        assert_eq!(restored.aps_counter, 42);
    }
}
