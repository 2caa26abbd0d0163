//! MAC frame model: headers, MPDUs and PSDUs as they travel between MacLow and the PHY.
//!
//! Payload octets are not materialised for data frames, only their sizes; management
//! action bodies are carried as encoded octets so they go through the element codecs.

use core::fmt;

use dmg_core::{FrameBuf, FrameParseErr, MacAddr, PacketUid, SimDuration, SimTime, Tid, seq_distance, seq_is_old};
use dmg_elements::{DmgAllocationInfo, DmgTspecElement, StatusCode};

use crate::aggregation::{MpduAggregator, MsduAggregator};

pub const FCS_LEN: u32 = 4;
pub const QOS_DATA_HEADER_LEN: u32 = 26;
pub const MGMT_HEADER_LEN: u32 = 24;

/// Control frame sizes including the FCS
pub const RTS_LEN: u32 = 20;
pub const CTS_LEN: u32 = 14;
pub const ACK_LEN: u32 = 14;
pub const BLOCK_ACK_REQ_LEN: u32 = 24;
/// Compressed Block Ack with a 64-bit bitmap
pub const BLOCK_ACK_LEN: u32 = 32;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Rts,
    Cts,
    Ack,
    BlockAckReq,
    BlockAck,
    QosData,
    Action,
    /// DMG beacon carrying the schedule of the beacon interval
    Beacon,
}

impl FrameType {
    pub fn is_control(self) -> bool {
        matches!(
            self,
            FrameType::Rts | FrameType::Cts | FrameType::Ack | FrameType::BlockAckReq | FrameType::BlockAck
        )
    }
}

/// Ack policy subfield of the QoS control field. `Normal` inside an A-MPDU
/// solicits an immediate Block Ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AckPolicy {
    #[default]
    Normal,
    NoAck,
    BlockAck,
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiMacHeader {
    pub frame_type: FrameType,
    /// Address 1
    pub receiver: MacAddr,
    /// Address 2
    pub transmitter: MacAddr,
    /// Duration/ID field in microseconds
    pub duration_us: u16,
    pub seq: u16,
    pub tid: Tid,
    pub retry: bool,
    pub ack_policy: AckPolicy,
    pub amsdu_present: bool,
}

impl WifiMacHeader {
    pub fn qos_data(receiver: MacAddr, transmitter: MacAddr, tid: Tid) -> Self {
        WifiMacHeader {
            frame_type: FrameType::QosData,
            receiver,
            transmitter,
            duration_us: 0,
            seq: 0,
            tid,
            retry: false,
            ack_policy: AckPolicy::Normal,
            amsdu_present: false,
        }
    }

    pub fn control(frame_type: FrameType, receiver: MacAddr, transmitter: MacAddr, duration_us: u16) -> Self {
        WifiMacHeader {
            frame_type,
            duration_us,
            ..WifiMacHeader::qos_data(receiver, transmitter, 0)
        }
    }

    pub fn action(receiver: MacAddr, transmitter: MacAddr) -> Self {
        WifiMacHeader {
            frame_type: FrameType::Action,
            ..WifiMacHeader::qos_data(receiver, transmitter, 0)
        }
    }

    pub fn beacon(transmitter: MacAddr) -> Self {
        WifiMacHeader {
            frame_type: FrameType::Beacon,
            ack_policy: AckPolicy::NoAck,
            ..WifiMacHeader::qos_data(MacAddr::BROADCAST, transmitter, 0)
        }
    }

    pub fn is_qos_data(&self) -> bool {
        self.frame_type == FrameType::QosData
    }

    pub fn len(&self) -> u32 {
        match self.frame_type {
            FrameType::QosData => QOS_DATA_HEADER_LEN,
            FrameType::Action | FrameType::Beacon => MGMT_HEADER_LEN,
            // Control frames are accounted as a whole in Mpdu::size
            _ => 0,
        }
    }
}

impl fmt::Display for WifiMacHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} -> {}", self.frame_type, self.transmitter, self.receiver)?;
        if !self.frame_type.is_control() {
            write!(f, " seq={} tid={}", self.seq, self.tid)?;
        }
        if self.retry {
            write!(f, " retry")?;
        }
        Ok(())
    }
}


/// Upper-layer packet handed to the MAC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msdu {
    pub uid: PacketUid,
    pub size: u32,
    pub source: MacAddr,
    pub destination: MacAddr,
    pub tid: Tid,
    /// Creation time at the application, for delay statistics
    pub created: SimTime,
    /// Time the MSDU entered the MAC queue, drives lifetime expiry
    pub enqueued: SimTime,
}

impl Msdu {
    pub fn is_expired(&self, now: SimTime, lifetime: SimDuration) -> bool {
        now.since(self.enqueued) >= lifetime
    }
}


/// Starting sequence number plus received bitmap of a compressed Block Ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAckInfo {
    pub tid: Tid,
    pub starting_seq: u16,
    pub bitmap: u64,
}

impl BlockAckInfo {
    /// Sequence numbers before the starting sequence have left the recipient's
    /// window and count as received.
    pub fn is_received(&self, seq: u16) -> bool {
        if seq_is_old(self.starting_seq, seq) {
            return true;
        }
        let offset = seq_distance(self.starting_seq, seq);
        offset < 64 && self.bitmap & (1u64 << offset) != 0
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Empty,
    Msdu(Msdu),
    Amsdu(Vec<Msdu>),
    BlockAckReq { tid: Tid, starting_seq: u16 },
    BlockAck(BlockAckInfo),
    /// Encoded management body: an [`ActionFrame`] or the beacon elements
    Management(Vec<u8>),
}


/// A MAC protocol data unit plus the transmit-side retry count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mpdu {
    pub header: WifiMacHeader,
    pub body: FrameBody,
    pub retries: u32,
}

impl Mpdu {
    pub fn new(header: WifiMacHeader, body: FrameBody) -> Self {
        Mpdu { header, body, retries: 0 }
    }

    pub fn control(frame_type: FrameType, receiver: MacAddr, transmitter: MacAddr, duration_us: u16) -> Self {
        Mpdu::new(WifiMacHeader::control(frame_type, receiver, transmitter, duration_us), FrameBody::Empty)
    }

    /// Octets on air including header and FCS
    pub fn size(&self) -> u32 {
        match self.header.frame_type {
            FrameType::Rts => RTS_LEN,
            FrameType::Cts => CTS_LEN,
            FrameType::Ack => ACK_LEN,
            FrameType::BlockAckReq => BLOCK_ACK_REQ_LEN,
            FrameType::BlockAck => BLOCK_ACK_LEN,
            FrameType::QosData | FrameType::Action | FrameType::Beacon => self.header.len() + self.body_len() + FCS_LEN,
        }
    }

    fn body_len(&self) -> u32 {
        match &self.body {
            FrameBody::Msdu(msdu) => msdu.size,
            FrameBody::Amsdu(msdus) => MsduAggregator::amsdu_size(msdus),
            FrameBody::Management(bytes) => bytes.len() as u32,
            _ => 0,
        }
    }

    /// MSDUs carried by this MPDU, empty for control and management frames
    pub fn msdus(&self) -> &[Msdu] {
        match &self.body {
            FrameBody::Msdu(msdu) => core::slice::from_ref(msdu),
            FrameBody::Amsdu(msdus) => msdus,
            _ => &[],
        }
    }

    pub fn into_msdus(self) -> Vec<Msdu> {
        match self.body {
            FrameBody::Msdu(msdu) => vec![msdu],
            FrameBody::Amsdu(msdus) => msdus,
            _ => Vec::new(),
        }
    }

    /// True once every MSDU in the MPDU outlived the queue lifetime
    pub fn is_expired(&self, now: SimTime, lifetime: SimDuration) -> bool {
        let msdus = self.msdus();
        !msdus.is_empty() && msdus.iter().all(|m| m.is_expired(now, lifetime))
    }
}

impl fmt::Display for Mpdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} size={}]", self.header, self.size())
    }
}


/// PHY service data unit: a single MPDU or an A-MPDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Psdu {
    pub mpdus: Vec<Mpdu>,
    pub is_ampdu: bool,
}

impl Psdu {
    pub fn single(mpdu: Mpdu) -> Self {
        Psdu { mpdus: vec![mpdu], is_ampdu: false }
    }

    pub fn ampdu(mpdus: Vec<Mpdu>) -> Self {
        Psdu { mpdus, is_ampdu: true }
    }

    pub fn size(&self) -> u32 {
        if self.is_ampdu {
            MpduAggregator::ampdu_size(self.mpdus.iter().map(|m| m.size()))
        } else {
            self.mpdus.iter().map(|m| m.size()).sum()
        }
    }
}


const CATEGORY_QOS: u8 = 1;
const QOS_ACTION_ADDTS_REQUEST: u8 = 0;
const QOS_ACTION_ADDTS_RESPONSE: u8 = 1;
const QOS_ACTION_DELTS: u8 = 2;

/// QoS action frames exchanged between the AP and its stations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionFrame {
    AddtsRequest { dialog_token: u8, tspec: DmgTspecElement },
    AddtsResponse { dialog_token: u8, status: StatusCode, tspec: DmgTspecElement },
    Delts { allocation_info: DmgAllocationInfo },
}

impl ActionFrame {
    pub fn to_framebuf(&self, buf: &mut FrameBuf) {
        buf.write_u8(CATEGORY_QOS);
        match self {
            ActionFrame::AddtsRequest { dialog_token, tspec } => {
                buf.write_u8(QOS_ACTION_ADDTS_REQUEST);
                buf.write_u8(*dialog_token);
                tspec.to_framebuf(buf);
            }
            ActionFrame::AddtsResponse { dialog_token, status, tspec } => {
                buf.write_u8(QOS_ACTION_ADDTS_RESPONSE);
                buf.write_u8(*dialog_token);
                buf.write_u16(status.into_raw() as u16);
                tspec.to_framebuf(buf);
            }
            ActionFrame::Delts { allocation_info } => {
                buf.write_u8(QOS_ACTION_DELTS);
                allocation_info.to_framebuf(buf);
            }
        }
    }

    pub fn from_framebuf(buf: &mut FrameBuf) -> Result<Self, FrameParseErr> {
        let category = buf.read_u8("category")?;
        if category != CATEGORY_QOS {
            return Err(FrameParseErr::InvalidValue { field: "category", value: category as u64 });
        }
        let action = buf.read_u8("action")?;
        match action {
            QOS_ACTION_ADDTS_REQUEST => {
                let dialog_token = buf.read_u8("dialog_token")?;
                let tspec = DmgTspecElement::from_framebuf(buf)?;
                Ok(ActionFrame::AddtsRequest { dialog_token, tspec })
            }
            QOS_ACTION_ADDTS_RESPONSE => {
                let dialog_token = buf.read_u8("dialog_token")?;
                let raw = buf.read_u16("status_code")? as u64;
                let status = StatusCode::try_from(raw)
                    .map_err(|_| FrameParseErr::InvalidValue { field: "status_code", value: raw })?;
                let tspec = DmgTspecElement::from_framebuf(buf)?;
                Ok(ActionFrame::AddtsResponse { dialog_token, status, tspec })
            }
            QOS_ACTION_DELTS => {
                let allocation_info = DmgAllocationInfo::from_framebuf(buf)?;
                Ok(ActionFrame::Delts { allocation_info })
            }
            other => Err(FrameParseErr::InvalidValue { field: "action", value: other as u64 }),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = FrameBuf::new();
        self.to_framebuf(&mut buf);
        buf.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameParseErr> {
        ActionFrame::from_framebuf(&mut FrameBuf::from_bytes(bytes))
    }
}


#[cfg(test)]
mod tests {
    use dmg_core::debug;

    use super::*;

    fn msdu(uid: u64, size: u32) -> Msdu {
        Msdu {
            uid,
            size,
            source: MacAddr::from_index(1),
            destination: MacAddr::from_index(0),
            tid: 0,
            created: SimTime::ZERO,
            enqueued: SimTime::ZERO,
        }
    }

    #[test]
    fn test_mpdu_sizes() {
        debug::setup_logging_verbose();
        let hdr = WifiMacHeader::qos_data(MacAddr::from_index(0), MacAddr::from_index(1), 0);
        let single = Mpdu::new(hdr.clone(), FrameBody::Msdu(msdu(1, 1448)));
        assert_eq!(single.size(), 26 + 1448 + 4);

        // Two A-MSDU subframes: 14 + 1448 padded to 1464, then 14 + 1448 unpadded
        let amsdu = Mpdu::new(hdr, FrameBody::Amsdu(vec![msdu(1, 1448), msdu(2, 1448)]));
        assert_eq!(amsdu.size(), 26 + 1464 + 1462 + 4);

        assert_eq!(Mpdu::control(FrameType::Ack, MacAddr::BROADCAST, MacAddr::from_index(0), 0).size(), ACK_LEN);
    }

    #[test]
    fn test_block_ack_bitmap_semantics() {
        debug::setup_logging_verbose();
        let info = BlockAckInfo { tid: 0, starting_seq: 4094, bitmap: 0b101 };
        assert!(info.is_received(4094));
        assert!(!info.is_received(4095));
        assert!(info.is_received(0), "bit 2 wraps to seq 0");
        assert!(info.is_received(4000), "behind the window counts as received");
        assert!(!info.is_received(100));
    }

    #[test]
    fn test_action_frame_codec() {
        debug::setup_logging_verbose();
        let tspec = DmgTspecElement { minimum_allocation: 5000, maximum_allocation: 5000, ..Default::default() };
        let frame = ActionFrame::AddtsResponse { dialog_token: 3, status: StatusCode::Success, tspec };
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 3 + 2 + 16, "category, action, token, status, element");
        assert_eq!(ActionFrame::from_bytes(&bytes).expect("Failed parsing"), frame);

        assert!(matches!(
            ActionFrame::from_bytes(&[CATEGORY_QOS, 9]),
            Err(FrameParseErr::InvalidValue { field: "action", .. })
        ));
    }
}
