//! MPEG-TS packet parsing.
//!
//! This module handles parsing of 188-byte MPEG Transport Stream packets.

use tunerd_model::DecodeError;

/// TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte (0x47).
pub const SYNC_BYTE: u8 = 0x47;

/// Parsed TS packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    /// Transport error indicator.
    pub transport_error: bool,
    /// Payload unit start indicator.
    pub payload_unit_start: bool,
    /// Packet Identifier (13 bits).
    pub pid: u16,
    /// Transport scrambling control (2 bits).
    pub scrambling_control: u8,
    /// Adaptation field control (2 bits).
    pub adaptation_field_control: u8,
    /// Continuity counter (4 bits).
    pub continuity_counter: u8,
}

impl TsHeader {
    /// Parse the 4-byte header.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::truncated("TS header", 4, data.len()));
        }
        if data[0] != SYNC_BYTE {
            return Err(DecodeError::InvalidSync(data[0]));
        }
        Ok(TsHeader {
            transport_error: data[1] & 0x80 != 0,
            payload_unit_start: data[1] & 0x40 != 0,
            pid: ((data[1] as u16 & 0x1F) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_control: (data[3] >> 4) & 0x03,
            continuity_counter: data[3] & 0x0F,
        })
    }

    /// Check if packet has adaptation field.
    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control & 0x02 != 0
    }

    /// Check if packet has payload.
    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }

    /// Check if packet is scrambled.
    pub fn is_scrambled(&self) -> bool {
        self.scrambling_control != 0
    }
}

/// A parsed TS packet borrowing its payload.
#[derive(Debug, Clone)]
pub struct TsPacket<'a> {
    /// Packet header.
    pub header: TsHeader,
    /// Discontinuity indicator from the adaptation field.
    pub discontinuity: bool,
    /// Payload data.
    pub payload: &'a [u8],
}

impl<'a> TsPacket<'a> {
    /// Parse a TS packet from at least 188 bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self, DecodeError> {
        if data.len() < TS_PACKET_SIZE {
            return Err(DecodeError::truncated("TS packet", TS_PACKET_SIZE, data.len()));
        }
        let header = TsHeader::parse(data)?;

        let mut offset = 4;
        let mut discontinuity = false;
        if header.has_adaptation_field() {
            let af_length = data[4] as usize;
            if af_length > 0 {
                discontinuity = data[5] & 0x80 != 0;
            }
            offset = 5 + af_length;
        }

        let payload = if header.has_payload() && offset < TS_PACKET_SIZE {
            &data[offset..TS_PACKET_SIZE]
        } else {
            &[]
        };

        Ok(TsPacket {
            header,
            discontinuity,
            payload,
        })
    }
}

/// Find the offset of the first position where `count` consecutive sync
/// bytes appear at 188-byte intervals.
pub fn find_sync_offset(data: &[u8], count: usize) -> Option<usize> {
    if data.len() < TS_PACKET_SIZE * count {
        return None;
    }
    (0..=data.len() - TS_PACKET_SIZE * count).find(|&start| {
        (0..count).all(|i| data[start + i * TS_PACKET_SIZE] == SYNC_BYTE)
    })
}
