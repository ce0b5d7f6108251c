//! MMT/TLV decoding for 4K satellite broadcasts.
//!
//! The stream is a sequence of TLV packets. Signalling (PA messages with
//! PLT/MPT, M2 section messages with MH-EIT/MH-SDT/MH-CDT) travels in MMTP
//! packets of payload type 0x02; TLV-NIT travels in TLV-SI packets.

pub mod mmtp;
pub mod tables;
pub mod tlv;

pub use mmtp::{mmt_tables, MessageAssembler, MmtTable, MmtpPacket, SignallingMessage};
pub use tables::{parse_mh_eit, parse_mh_sdt, MptAsset, MptTable, PltPackage, PltTable};
pub use tlv::{TlvPacket, TLV_SYNC};

/// Packet id of the PA message carrying the PLT.
pub const PLT_PACKET_ID: u16 = 0x0000;

/// MMT-SI table ids.
pub mod table_id {
    /// TLV-NIT (actual).
    pub const TLV_NIT_ACTUAL: u8 = 0x40;
    /// MMT Package Table.
    pub const MPT: u8 = 0x20;
    /// Package List Table.
    pub const PLT: u8 = 0x80;
    /// MH-EIT present/following.
    pub const MH_EIT_PF: u8 = 0x8B;
    /// First MH-EIT schedule table.
    pub const MH_EIT_SCHEDULE_FIRST: u8 = 0x8C;
    /// Last MH-EIT schedule table.
    pub const MH_EIT_SCHEDULE_LAST: u8 = 0x9B;
    /// MH-SDT (actual).
    pub const MH_SDT_ACTUAL: u8 = 0x9F;
    /// MH-CDT.
    pub const MH_CDT: u8 = 0xA2;
}

/// MH descriptor tags.
pub mod mh_descriptor_tag {
    pub const EVENT_GROUP: u16 = 0x800C;
    pub const VIDEO_COMPONENT: u16 = 0x8010;
    pub const CONTENT: u16 = 0x8012;
    pub const AUDIO_COMPONENT: u16 = 0x8014;
    pub const SERIES: u16 = 0x8015;
    pub const SERVICE: u16 = 0x8019;
    pub const LOGO_TRANSMISSION: u16 = 0x8025;
    pub const SHORT_EVENT: u16 = 0xF001;
    pub const EXTENDED_EVENT: u16 = 0xF002;
}
