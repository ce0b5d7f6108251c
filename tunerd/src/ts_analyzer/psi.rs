//! PSI (Program Specific Information) section parsing.
//!
//! Common section header parsing, CRC validation and reassembly of
//! sections spread over several TS packets.

use crc::{Crc, CRC_32_MPEG_2};
use tunerd_model::DecodeError;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Calculate CRC32 for MPEG-2 (polynomial 0x04C11DB7).
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    CRC.checksum(data)
}

/// PSI section header (common to all PSI tables).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsiHeader {
    /// Table ID.
    pub table_id: u8,
    /// Section syntax indicator.
    pub section_syntax_indicator: bool,
    /// Section length (12 bits).
    pub section_length: u16,
    /// Table ID extension (for long sections).
    pub table_id_extension: u16,
    /// Version number (5 bits).
    pub version_number: u8,
    /// Current/next indicator.
    pub current_next_indicator: bool,
    /// Section number.
    pub section_number: u8,
    /// Last section number.
    pub last_section_number: u8,
}

/// A parsed PSI section.
#[derive(Debug, Clone)]
pub struct PsiSection<'a> {
    /// Section header.
    pub header: PsiHeader,
    /// Section data (after header, before CRC).
    pub data: &'a [u8],
    /// Whole section bytes, table_id through CRC.
    pub raw: &'a [u8],
}

impl<'a> PsiSection<'a> {
    /// Parse a PSI section starting at `table_id`.
    pub fn parse(data: &'a [u8]) -> Result<Self, DecodeError> {
        if data.len() < 3 {
            return Err(DecodeError::truncated("section header", 3, data.len()));
        }

        let table_id = data[0];
        let section_syntax_indicator = data[1] & 0x80 != 0;
        let section_length = ((data[1] as u16 & 0x0F) << 8) | data[2] as u16;

        let total_length = 3 + section_length as usize;
        if data.len() < total_length {
            return Err(DecodeError::truncated("section", total_length, data.len()));
        }

        if !section_syntax_indicator {
            return Ok(PsiSection {
                header: PsiHeader {
                    table_id,
                    section_syntax_indicator,
                    section_length,
                    table_id_extension: 0,
                    version_number: 0,
                    current_next_indicator: true,
                    section_number: 0,
                    last_section_number: 0,
                },
                data: &data[3..total_length],
                raw: &data[..total_length],
            });
        }

        // Long section: 5 header bytes after the length plus 4 CRC bytes.
        if section_length < 9 {
            return Err(DecodeError::Malformed("section length"));
        }

        let header = PsiHeader {
            table_id,
            section_syntax_indicator,
            section_length,
            table_id_extension: ((data[3] as u16) << 8) | data[4] as u16,
            version_number: (data[5] >> 1) & 0x1F,
            current_next_indicator: data[5] & 0x01 != 0,
            section_number: data[6],
            last_section_number: data[7],
        };

        Ok(PsiSection {
            header,
            data: &data[8..total_length - 4],
            raw: &data[..total_length],
        })
    }

    /// Parse and require a valid CRC.
    pub fn parse_checked(data: &'a [u8]) -> Result<Self, DecodeError> {
        let section = Self::parse(data)?;
        if section.header.section_syntax_indicator {
            section.check_crc()?;
        }
        Ok(section)
    }

    /// CRC32 carried at the end of the section.
    pub fn crc32(&self) -> u32 {
        let n = self.raw.len();
        u32::from_be_bytes([self.raw[n - 4], self.raw[n - 3], self.raw[n - 2], self.raw[n - 1]])
    }

    /// Verify CRC32 of the section.
    pub fn verify_crc(&self) -> bool {
        self.check_crc().is_ok()
    }

    fn check_crc(&self) -> Result<(), DecodeError> {
        let n = self.raw.len();
        let actual = crc32_mpeg2(&self.raw[..n - 4]);
        let expected = self.crc32();
        if actual != expected {
            return Err(DecodeError::CrcMismatch { expected, actual });
        }
        Ok(())
    }

    /// Get the total section length including header and CRC.
    pub fn total_length(&self) -> usize {
        self.raw.len()
    }
}

/// Build a long-form section with a freshly computed CRC.
pub fn build_long_section(
    table_id: u8,
    table_id_extension: u16,
    version: u8,
    section_number: u8,
    last_section_number: u8,
    body: &[u8],
) -> Vec<u8> {
    let section_length = 5 + body.len() + 4;
    let mut out = Vec::with_capacity(3 + section_length);
    out.push(table_id);
    out.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    out.push(section_length as u8);
    out.extend_from_slice(&table_id_extension.to_be_bytes());
    out.push(0xC0 | ((version & 0x1F) << 1) | 0x01);
    out.push(section_number);
    out.push(last_section_number);
    out.extend_from_slice(body);
    let crc = crc32_mpeg2(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

/// Reassembles sections from the payloads of one PID.
#[derive(Debug, Default)]
pub struct SectionCollector {
    /// Bytes of the section in progress.
    buffer: Vec<u8>,
    /// Last continuity counter.
    last_cc: Option<u8>,
}

impl SectionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the collector.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.last_cc = None;
    }

    /// Check if collector has partial data.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Add the payload of a TS packet.
    ///
    /// Returns every section completed by this payload, in order.
    pub fn push(&mut self, payload: &[u8], cc: u8, payload_unit_start: bool) -> Vec<Vec<u8>> {
        let mut out = Vec::new();

        if let Some(last) = self.last_cc {
            if cc == last {
                // Duplicate packet.
                return out;
            }
            if cc != (last + 1) & 0x0F {
                self.buffer.clear();
            }
        }
        self.last_cc = Some(cc);

        if payload_unit_start {
            let Some((&pointer, rest)) = payload.split_first() else {
                return out;
            };
            let pointer = pointer as usize;
            if pointer > rest.len() {
                self.buffer.clear();
                return out;
            }
            if !self.buffer.is_empty() {
                self.buffer.extend_from_slice(&rest[..pointer]);
                self.drain_complete(&mut out);
            }
            self.buffer.clear();
            self.buffer.extend_from_slice(&rest[pointer..]);
        } else if !self.buffer.is_empty() {
            self.buffer.extend_from_slice(payload);
        }

        self.drain_complete(&mut out);
        out
    }

    fn drain_complete(&mut self, out: &mut Vec<Vec<u8>>) {
        loop {
            if self.buffer.is_empty() {
                return;
            }
            if self.buffer[0] == 0xFF {
                // Stuffing until the next unit start.
                self.buffer.clear();
                return;
            }
            if self.buffer.len() < 3 {
                return;
            }
            let len = 3 + (((self.buffer[1] as usize & 0x0F) << 8) | self.buffer[2] as usize);
            if self.buffer.len() < len {
                return;
            }
            out.push(self.buffer.drain(..len).collect());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::testutil;

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(crc32_mpeg2(&[]), 0xFFFFFFFF);
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376E6E7);
    }

    #[test]
    fn test_build_and_parse_section() {
        let section = build_long_section(0x42, 0x1234, 7, 0, 1, &[1, 2, 3]);
        let parsed = PsiSection::parse_checked(&section).unwrap();
        assert_eq!(parsed.header.table_id, 0x42);
        assert_eq!(parsed.header.table_id_extension, 0x1234);
        assert_eq!(parsed.header.version_number, 7);
        assert_eq!(parsed.header.last_section_number, 1);
        assert_eq!(parsed.data, &[1, 2, 3]);
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let mut section = build_long_section(0x00, 1, 0, 0, 0, &[0, 1, 0xE1, 0]);
        let n = section.len();
        section[n - 1] ^= 0xFF;
        assert!(matches!(
            PsiSection::parse_checked(&section),
            Err(DecodeError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_collector_multi_packet_section() {
        let body = vec![0xAB; 300];
        let section = build_long_section(0x50, 1, 0, 0, 0, &body);
        let packets = testutil::packetize(0x12, &section, 0);
        assert!(packets.len() >= 2);

        let mut collector = SectionCollector::new();
        let mut sections = Vec::new();
        for p in &packets {
            let pkt = crate::ts_analyzer::TsPacket::parse(p).unwrap();
            sections.extend(collector.push(
                pkt.payload,
                pkt.header.continuity_counter,
                pkt.header.payload_unit_start,
            ));
        }
        assert_eq!(sections, vec![section]);
    }

    #[test]
    fn test_collector_two_sections_in_one_packet() {
        let a = build_long_section(0x4E, 1, 0, 0, 1, &[1; 10]);
        let b = build_long_section(0x4E, 1, 0, 1, 1, &[2; 10]);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&a);
        payload.extend_from_slice(&b);
        payload.resize(184, 0xFF);

        let mut collector = SectionCollector::new();
        let sections = collector.push(&payload, 0, true);
        assert_eq!(sections, vec![a, b]);
        assert!(collector.is_empty());
    }

    #[test]
    fn test_collector_discontinuity_discards_partial() {
        let section = build_long_section(0x50, 1, 0, 0, 0, &vec![0x11; 300]);
        let packets = testutil::packetize(0x12, &section, 0);
        let mut collector = SectionCollector::new();

        let first = crate::ts_analyzer::TsPacket::parse(&packets[0]).unwrap();
        assert!(collector.push(first.payload, 0, true).is_empty());
        // Skip one continuity step.
        let second = crate::ts_analyzer::TsPacket::parse(&packets[1]).unwrap();
        assert!(collector.push(second.payload, 2, false).is_empty());
        assert!(collector.is_empty());
    }
}
