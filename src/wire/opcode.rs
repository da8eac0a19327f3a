use bitflags::bitflags;

/// Wire opcodes used by the query path. Frame opcodes outside this set are
/// still representable on the wire (`Frame.opcode` is a plain `u16`) but have
/// no defined meaning to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Query = 0x01,
    QueryProgress = 0x02,
    QueryResult = 0x03,
    QueryContinue = 0x04,
    QueryNext = 0x05,
    QueryDiscard = 0x06,
    Heartbeat = 0x07,
    Error = 0x08,
    Hello = 0x09,
    HelloAck = 0x0a,
}

impl Opcode {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x01 => Self::Query,
            0x02 => Self::QueryProgress,
            0x03 => Self::QueryResult,
            0x04 => Self::QueryContinue,
            0x05 => Self::QueryNext,
            0x06 => Self::QueryDiscard,
            0x07 => Self::Heartbeat,
            0x08 => Self::Error,
            0x09 => Self::Hello,
            0x0a => Self::HelloAck,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

bitflags! {
    /// Bit assignments for the QUERY frame's `flags` field. Significant for
    /// wire compatibility — do not renumber.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryFlags: u16 {
        const SWITCHDB  = 0x01;
        const PROGRESS  = 0x02;
        const MULTISTMT = 0x04;
    }
}
