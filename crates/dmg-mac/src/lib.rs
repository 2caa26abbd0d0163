//! DMG (IEEE 802.11ad) MAC on top of a simulated shared medium
//!
//! - `mac_low`: frame exchanges, A-MPDU aggregation, Block Ack, and the
//!   suspend/resume of transactions that do not fit in their allocation
//! - `txop`: channel access inside CBAPs and service periods, retries
//! - `dmg_mac`: AP and station MACs following the beacon interval
//! - `network`: a BSS of one AP and its stations driven by one event queue

pub mod aggregation;
pub mod block_ack;
pub mod dmg_mac;
pub mod frame;
pub mod mac_low;
pub mod mac_queue;
pub mod medium;
pub mod network;
pub mod phy;
pub mod station_manager;
pub mod traffic;
pub mod tx_params;
pub mod txop;

pub use dmg_mac::{DmgApMac, DmgMacEntity, DmgStaMac, MacEvent, MacNotification, MacNotificationSender};
pub use frame::{ActionFrame, FrameBody, FrameType, Mpdu, Msdu, Psdu, WifiMacHeader};
pub use mac_low::{MacLow, MacLowEvent, MacLowNotification, ResumeOutcome, SuspendedTransmission, Transaction};
pub use mac_queue::{MacQueue, TxQueue};
pub use medium::{CarrierSense, Medium};
pub use network::{AccessRecord, FlowResult, NetEvent, Network, PacketRecord};
pub use phy::{AirFrame, ChannelPhy, DmgPhy, RxMpdu, RxPsdu};
pub use station_manager::{ConstantRateManager, RemoteStationManager};
pub use traffic::{CbrSource, FlowStats};
pub use tx_params::{AckType, TxParams, TxVector};
pub use txop::{AccessWindow, Txop, TxopEvent, TxopNotification};
