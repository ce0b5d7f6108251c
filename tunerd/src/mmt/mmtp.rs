//! MMTP packet header, signalling payload and message reassembly.

use std::collections::HashMap;

use log::trace;
use tunerd_model::DecodeError;

/// MMTP payload type carrying signalling messages.
pub const PAYLOAD_TYPE_SIGNALLING: u8 = 0x02;

/// A borrowed MMTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmtpPacket<'a> {
    pub version: u8,
    pub fec_type: u8,
    pub rap_flag: bool,
    pub payload_type: u8,
    pub packet_id: u16,
    pub timestamp: u32,
    pub sequence_number: u32,
    pub packet_counter: Option<u32>,
    pub payload: &'a [u8],
}

impl<'a> MmtpPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, DecodeError> {
        if data.len() < 12 {
            return Err(DecodeError::truncated("MMTP header", 12, data.len()));
        }
        let counter_flag = data[0] & 0x20 != 0;
        let extension_flag = data[0] & 0x04 != 0;
        let mut offset = 12;

        let packet_counter = if counter_flag {
            let bytes = data
                .get(offset..offset + 4)
                .ok_or(DecodeError::truncated("MMTP counter", offset + 4, data.len()))?;
            offset += 4;
            Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        } else {
            None
        };

        if extension_flag {
            let ext = data
                .get(offset..offset + 4)
                .ok_or(DecodeError::truncated("MMTP extension", offset + 4, data.len()))?;
            offset += 4 + u16::from_be_bytes([ext[2], ext[3]]) as usize;
            if offset > data.len() {
                return Err(DecodeError::truncated("MMTP extension", offset, data.len()));
            }
        }

        Ok(MmtpPacket {
            version: data[0] >> 6,
            fec_type: (data[0] >> 3) & 0x03,
            rap_flag: data[0] & 0x02 != 0,
            payload_type: data[1] & 0x3F,
            packet_id: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            sequence_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            packet_counter,
            payload: &data[offset..],
        })
    }

    pub fn is_signalling(&self) -> bool {
        self.payload_type == PAYLOAD_TYPE_SIGNALLING
    }
}

/// Fragmentation indicator of a signalling payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fragment {
    Complete,
    First,
    Middle,
    Last,
}

/// Header of a signalling message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignallingPayload<'a> {
    pub fragment: Fragment,
    pub length_extension: bool,
    pub aggregation: bool,
    pub fragment_counter: u8,
    pub data: &'a [u8],
}

impl<'a> SignallingPayload<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, DecodeError> {
        if payload.len() < 2 {
            return Err(DecodeError::truncated("signalling payload", 2, payload.len()));
        }
        let fragment = match payload[0] >> 6 {
            0 => Fragment::Complete,
            1 => Fragment::First,
            2 => Fragment::Middle,
            _ => Fragment::Last,
        };
        Ok(SignallingPayload {
            fragment,
            length_extension: payload[0] & 0x02 != 0,
            aggregation: payload[0] & 0x01 != 0,
            fragment_counter: payload[1],
            data: &payload[2..],
        })
    }

    /// Split an aggregated payload into its messages.
    fn split_aggregated(&self) -> Vec<Vec<u8>> {
        let width = if self.length_extension { 4 } else { 2 };
        let mut out = Vec::new();
        let mut rest = self.data;
        while rest.len() >= width {
            let len = if self.length_extension {
                u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize
            } else {
                u16::from_be_bytes([rest[0], rest[1]]) as usize
            };
            let Some(message) = rest.get(width..width + len) else {
                break;
            };
            out.push(message.to_vec());
            rest = &rest[width + len..];
        }
        out
    }
}

#[derive(Debug, Default)]
struct Partial {
    buffer: Vec<u8>,
    next_sequence: u32,
}

/// Reassembles fragmented signalling messages per packet id.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    partial: HashMap<u16, Partial>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one signalling packet; returns the messages it completes.
    pub fn push(&mut self, packet: &MmtpPacket<'_>) -> Result<Vec<Vec<u8>>, DecodeError> {
        let payload = SignallingPayload::parse(packet.payload)?;
        match payload.fragment {
            Fragment::Complete => {
                self.partial.remove(&packet.packet_id);
                if payload.aggregation {
                    Ok(payload.split_aggregated())
                } else {
                    Ok(vec![payload.data.to_vec()])
                }
            }
            Fragment::First => {
                self.partial.insert(
                    packet.packet_id,
                    Partial {
                        buffer: payload.data.to_vec(),
                        next_sequence: packet.sequence_number.wrapping_add(1),
                    },
                );
                Ok(Vec::new())
            }
            Fragment::Middle | Fragment::Last => {
                let Some(partial) = self.partial.get_mut(&packet.packet_id) else {
                    return Ok(Vec::new());
                };
                if partial.next_sequence != packet.sequence_number {
                    trace!(
                        "[Mmtp] Sequence gap on packet_id 0x{:04X}, dropping fragment",
                        packet.packet_id
                    );
                    self.partial.remove(&packet.packet_id);
                    return Ok(Vec::new());
                }
                partial.buffer.extend_from_slice(payload.data);
                partial.next_sequence = packet.sequence_number.wrapping_add(1);
                if payload.fragment == Fragment::Last {
                    let done = self
                        .partial
                        .remove(&packet.packet_id)
                        .map(|p| p.buffer)
                        .unwrap_or_default();
                    Ok(vec![done])
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

/// Signalling message ids.
pub mod message_id {
    /// Package access message.
    pub const PA: u16 = 0x0000;
    /// M2 section message.
    pub const M2_SECTION: u16 = 0x8000;
    /// M2 short section message.
    pub const M2_SHORT_SECTION: u16 = 0x8001;
}

/// A decoded signalling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignallingMessage<'a> {
    /// PA message: MMT tables (MPT, PLT, ...).
    PackageAccess { version: u8, tables: &'a [u8] },
    /// M2 section message: one long-format section.
    Section(&'a [u8]),
    Other(u16),
}

impl<'a> SignallingMessage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, DecodeError> {
        if data.len() < 3 {
            return Err(DecodeError::truncated("signalling message", 3, data.len()));
        }
        let message_id = u16::from_be_bytes([data[0], data[1]]);
        let version = data[2];
        match message_id {
            message_id::PA => {
                let header = data
                    .get(3..8)
                    .ok_or(DecodeError::truncated("PA message", 8, data.len()))?;
                let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
                let body = data
                    .get(7..7 + length)
                    .ok_or(DecodeError::truncated("PA message", 7 + length, data.len()))?;
                // number_of_tables, then (table_id, version, length) per table
                let count = *body.first().ok_or(DecodeError::Malformed("empty PA message"))? as usize;
                let tables = body
                    .get(1 + count * 4..)
                    .ok_or(DecodeError::Malformed("PA message table list"))?;
                Ok(SignallingMessage::PackageAccess { version, tables })
            }
            message_id::M2_SECTION | message_id::M2_SHORT_SECTION => {
                if data.len() < 5 {
                    return Err(DecodeError::truncated("M2 section message", 5, data.len()));
                }
                let length = u16::from_be_bytes([data[3], data[4]]) as usize;
                let body = data
                    .get(5..5 + length)
                    .ok_or(DecodeError::truncated("M2 section message", 5 + length, data.len()))?;
                Ok(SignallingMessage::Section(body))
            }
            other => Ok(SignallingMessage::Other(other)),
        }
    }
}

/// An MMT table (`table_id | version | length (16) | body`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmtTable<'a> {
    pub table_id: u8,
    pub version: u8,
    pub body: &'a [u8],
}

/// Iterate the tables of a PA message body.
pub fn mmt_tables(mut data: &[u8]) -> Vec<MmtTable<'_>> {
    let mut out = Vec::new();
    while data.len() >= 4 {
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let Some(body) = data.get(4..4 + len) else {
            break;
        };
        out.push(MmtTable {
            table_id: data[0],
            version: data[1],
            body,
        });
        data = &data[4 + len..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mmtp(packet_id: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x40, PAYLOAD_TYPE_SIGNALLING];
        out.extend_from_slice(&packet_id.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_parse_header() {
        let raw = mmtp(0x8000, 7, &[0x00, 0x00, 0xAB]);
        let packet = MmtpPacket::parse(&raw).unwrap();
        assert_eq!(packet.version, 1);
        assert!(packet.is_signalling());
        assert_eq!(packet.packet_id, 0x8000);
        assert_eq!(packet.sequence_number, 7);
        assert_eq!(packet.payload, &[0x00, 0x00, 0xAB]);
    }

    #[test]
    fn test_reassemble_fragments() {
        let mut assembler = MessageAssembler::new();
        let first = mmtp(0x10, 1, &[0x40, 0x02, 0x01, 0x02]);
        let middle = mmtp(0x10, 2, &[0x80, 0x01, 0x03]);
        let last = mmtp(0x10, 3, &[0xC0, 0x00, 0x04]);
        assert!(assembler.push(&MmtpPacket::parse(&first).unwrap()).unwrap().is_empty());
        assert!(assembler.push(&MmtpPacket::parse(&middle).unwrap()).unwrap().is_empty());
        let done = assembler.push(&MmtpPacket::parse(&last).unwrap()).unwrap();
        assert_eq!(done, vec![vec![0x01, 0x02, 0x03, 0x04]]);
    }

    #[test]
    fn test_sequence_gap_drops_message() {
        let mut assembler = MessageAssembler::new();
        let first = mmtp(0x10, 1, &[0x40, 0x01, 0x01]);
        let last = mmtp(0x10, 3, &[0xC0, 0x00, 0x02]);
        assembler.push(&MmtpPacket::parse(&first).unwrap()).unwrap();
        assert!(assembler.push(&MmtpPacket::parse(&last).unwrap()).unwrap().is_empty());
    }

    #[test]
    fn test_aggregated_messages() {
        let mut assembler = MessageAssembler::new();
        let raw = mmtp(0x10, 1, &[0x01, 0x00, 0x00, 0x01, 0xAA, 0x00, 0x02, 0xBB, 0xCC]);
        let done = assembler.push(&MmtpPacket::parse(&raw).unwrap()).unwrap();
        assert_eq!(done, vec![vec![0xAA], vec![0xBB, 0xCC]]);
    }

    #[test]
    fn test_pa_message_tables() {
        let table = [0x80, 0x01, 0x00, 0x02, 0xDE, 0xAD];
        let mut body = vec![0x01, 0x80, 0x01, 0x00, 0x06];
        body.extend_from_slice(&table);
        let mut msg = vec![0x00, 0x00, 0x03];
        msg.extend_from_slice(&(body.len() as u32).to_be_bytes());
        msg.extend_from_slice(&body);

        let SignallingMessage::PackageAccess { version, tables } = SignallingMessage::parse(&msg).unwrap() else {
            panic!("expected PA message");
        };
        assert_eq!(version, 3);
        let tables = mmt_tables(tables);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].table_id, 0x80);
        assert_eq!(tables[0].body, &[0xDE, 0xAD]);
    }
}
