use dmg_core::{DmgMcs, SimDuration};


/// Response MacLow waits for after sending a data or management frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckType {
    None,
    #[default]
    Normal,
    Fast,
    SuperFast,
    /// Compressed Block Ack
    BlockAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxParams {
    pub ack: AckType,
    pub rts: bool,
    /// Upper bound for the whole transaction, set from the remaining allocation time
    pub max_transmission_duration: Option<SimDuration>,
}

impl TxParams {
    pub fn no_ack() -> Self {
        TxParams { ack: AckType::None, ..Default::default() }
    }

    pub fn is_bounded(&self) -> bool {
        self.max_transmission_duration.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxVector {
    pub mcs: DmgMcs,
    pub aggregation: bool,
}

impl TxVector {
    pub fn new(mcs: DmgMcs) -> Self {
        TxVector { mcs, aggregation: false }
    }

    /// Control PHY, used for RTS, CTS, ACK and Block Ack
    pub fn control() -> Self {
        TxVector::new(DmgMcs::CONTROL)
    }
}
