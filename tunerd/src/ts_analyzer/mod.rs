//! MPEG-TS packet and PSI/SI table decoding.
//!
//! Stateless decoders used by the packet filters and the EPG assembler.
//!
//! # Supported Tables
//! - PAT (Program Association Table) - PID 0x0000
//! - CAT (Conditional Access Table) - PID 0x0001
//! - PMT (Program Map Table) - Variable PIDs from PAT
//! - NIT (Network Information Table) - PID 0x0010
//! - SDT (Service Description Table) - PID 0x0011
//! - EIT (Event Information Table) - PIDs 0x0012, 0x0026, 0x0027
//! - CDT (Common Data Table) - PID 0x0029
//!
//! Timestamps are MJD + BCD in JST, strings are ARIB STD-B24 8-unit code.

pub mod aribstr;
pub mod cat;
pub mod cdt;
pub mod descriptors;
pub mod eit;
pub mod nit;
pub mod packet;
pub mod pat;
pub mod pmt;
pub mod psi;
pub mod sdt;
pub mod time;

#[cfg(test)]
pub mod testutil;

pub use aribstr::decode_arib_string;
pub use cat::CatTable;
pub use cdt::{CdtTable, LogoData};
pub use descriptors::{find_descriptor, Descriptor, DescriptorIter, ExtendedEventDescriptor, TextCodec};
pub use eit::{EitEvent, EitKind, EitSection, EventDescriptor, Track};
pub use nit::{NitTable, NitTransportStream};
pub use packet::{TsHeader, TsPacket, SYNC_BYTE, TS_PACKET_SIZE};
pub use pat::{PatEntry, PatTable};
pub use pmt::{PmtStream, PmtTable};
pub use psi::{crc32_mpeg2, PsiHeader, PsiSection, SectionCollector};
pub use sdt::{SdtService, SdtTable};

/// Well-known PIDs in ARIB MPEG-TS.
pub mod pid {
    /// Program Association Table PID.
    pub const PAT: u16 = 0x0000;
    /// Conditional Access Table PID.
    pub const CAT: u16 = 0x0001;
    /// Network Information Table PID.
    pub const NIT: u16 = 0x0010;
    /// Service Description Table / Bouquet Association Table PID.
    pub const SDT: u16 = 0x0011;
    /// Event Information Table PID.
    pub const EIT: u16 = 0x0012;
    /// Time Offset Table PID.
    pub const TOT: u16 = 0x0014;
    /// Software Download Trigger Table PID.
    pub const SDTT: u16 = 0x0023;
    /// Broadcaster Information Table PID.
    pub const BIT: u16 = 0x0024;
    /// EIT (terrestrial one-segment / additional schedule) PID.
    pub const EIT_SUB1: u16 = 0x0026;
    /// EIT (terrestrial one-segment / additional schedule) PID.
    pub const EIT_SUB2: u16 = 0x0027;
    /// Common Data Table PID.
    pub const CDT: u16 = 0x0029;
    /// TSMF frame header PID.
    pub const TSMF: u16 = 0x002F;
    /// Null packet PID (stuffing).
    pub const NULL: u16 = 0x1FFF;

    /// PIDs always provisioned when narrowing to one service.
    pub const ALWAYS_PROVIDED: [u16; 11] = [
        PAT, CAT, NIT, SDT, EIT, TOT, SDTT, BIT, EIT_SUB1, EIT_SUB2, CDT,
    ];
}

/// Table IDs for PSI/SI tables.
pub mod table_id {
    /// Program Association Section.
    pub const PAT: u8 = 0x00;
    /// Conditional Access Section.
    pub const CAT: u8 = 0x01;
    /// Program Map Section.
    pub const PMT: u8 = 0x02;
    /// Network Information Section - actual.
    pub const NIT_ACTUAL: u8 = 0x40;
    /// Network Information Section - other.
    pub const NIT_OTHER: u8 = 0x41;
    /// Service Description Section - actual.
    pub const SDT_ACTUAL: u8 = 0x42;
    /// Service Description Section - other.
    pub const SDT_OTHER: u8 = 0x46;
    /// Event Information Section p/f - actual.
    pub const EIT_PF_ACTUAL: u8 = 0x4E;
    /// Event Information Section p/f - other.
    pub const EIT_PF_OTHER: u8 = 0x4F;
    /// First Event Information Section schedule - actual.
    pub const EIT_SCHEDULE_ACTUAL_FIRST: u8 = 0x50;
    /// Last Event Information Section schedule - other.
    pub const EIT_SCHEDULE_OTHER_LAST: u8 = 0x6F;
    /// Time Offset Section.
    pub const TOT: u8 = 0x73;
    /// Common Data Section.
    pub const CDT: u8 = 0xC8;
}

/// Descriptor tags used in PSI/SI tables.
pub mod descriptor_tag {
    /// Conditional access descriptor.
    pub const CA: u8 = 0x09;
    /// Network name descriptor.
    pub const NETWORK_NAME: u8 = 0x40;
    /// Service list descriptor.
    pub const SERVICE_LIST: u8 = 0x41;
    /// Service descriptor.
    pub const SERVICE: u8 = 0x48;
    /// Short event descriptor.
    pub const SHORT_EVENT: u8 = 0x4D;
    /// Extended event descriptor.
    pub const EXTENDED_EVENT: u8 = 0x4E;
    /// Component descriptor.
    pub const COMPONENT: u8 = 0x50;
    /// Content descriptor.
    pub const CONTENT: u8 = 0x54;
    /// Audio component descriptor.
    pub const AUDIO_COMPONENT: u8 = 0xC4;
    /// TS information descriptor.
    pub const TS_INFORMATION: u8 = 0xCD;
    /// Logo transmission descriptor.
    pub const LOGO_TRANSMISSION: u8 = 0xCF;
    /// Series descriptor.
    pub const SERIES: u8 = 0xD5;
    /// Event group descriptor.
    pub const EVENT_GROUP: u8 = 0xD6;
    /// Remote control key descriptor (TLV-NIT).
    pub const REMOTE_CONTROL_KEY: u8 = 0xDE;
}
