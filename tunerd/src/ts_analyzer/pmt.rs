//! PMT (Program Map Table) parsing.
//!
//! The PMT contains information about a specific program/service,
//! including the PIDs of its elementary streams and ECM PIDs.

use tunerd_model::DecodeError;

use super::descriptors::ca_pids;
use super::psi::PsiSection;
use super::table_id;

/// Stream type constants.
pub mod stream_type {
    /// MPEG-2 Video.
    pub const MPEG2_VIDEO: u8 = 0x02;
    /// MPEG-2 Private Sections (data carousel etc.).
    pub const PRIVATE_SECTIONS: u8 = 0x05;
    /// MPEG-2 PES Private Data (captions).
    pub const PES_PRIVATE_DATA: u8 = 0x06;
    /// AAC Audio (ADTS).
    pub const AAC_AUDIO: u8 = 0x0F;
    /// MPEG-4 Video (H.264/AVC).
    pub const H264_VIDEO: u8 = 0x1B;
    /// HEVC Video (H.265).
    pub const H265_VIDEO: u8 = 0x24;
}

/// A single elementary stream entry in the PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    /// Stream type.
    pub stream_type: u8,
    /// Elementary PID.
    pub elementary_pid: u16,
    /// ES info descriptors.
    pub descriptors: Vec<u8>,
}

impl PmtStream {
    /// Check if this is a video stream.
    pub fn is_video(&self) -> bool {
        matches!(
            self.stream_type,
            stream_type::MPEG2_VIDEO | stream_type::H264_VIDEO | stream_type::H265_VIDEO
        )
    }
}

/// Parsed PMT (Program Map Table).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PmtTable {
    /// Program number (service ID).
    pub program_number: u16,
    /// Version number.
    pub version_number: u8,
    /// PCR PID.
    pub pcr_pid: u16,
    /// Program info descriptors.
    pub program_info: Vec<u8>,
    /// Elementary streams.
    pub streams: Vec<PmtStream>,
}

impl PmtTable {
    /// Parse a PMT from a PSI section.
    pub fn parse(section: &PsiSection) -> Result<Self, DecodeError> {
        if section.header.table_id != table_id::PMT {
            return Err(DecodeError::UnexpectedTableId(section.header.table_id));
        }

        let data = section.data;
        if data.len() < 4 {
            return Err(DecodeError::truncated("PMT", 4, data.len()));
        }

        let pcr_pid = ((data[0] as u16 & 0x1F) << 8) | data[1] as u16;
        let program_info_length = ((data[2] as usize & 0x0F) << 8) | data[3] as usize;
        if data.len() < 4 + program_info_length {
            return Err(DecodeError::Malformed("PMT program info length"));
        }

        let mut pmt = PmtTable {
            program_number: section.header.table_id_extension,
            version_number: section.header.version_number,
            pcr_pid,
            program_info: data[4..4 + program_info_length].to_vec(),
            streams: Vec::new(),
        };

        let mut offset = 4 + program_info_length;
        while offset + 5 <= data.len() {
            let stream_type = data[offset];
            let elementary_pid = ((data[offset + 1] as u16 & 0x1F) << 8) | data[offset + 2] as u16;
            let es_info_length = ((data[offset + 3] as usize & 0x0F) << 8) | data[offset + 4] as usize;
            offset += 5;
            if offset + es_info_length > data.len() {
                break;
            }
            pmt.streams.push(PmtStream {
                stream_type,
                elementary_pid,
                descriptors: data[offset..offset + es_info_length].to_vec(),
            });
            offset += es_info_length;
        }

        Ok(pmt)
    }

    /// ECM PIDs from CA descriptors at program and stream level.
    pub fn ecm_pids(&self) -> Vec<u16> {
        let mut pids = ca_pids(&self.program_info);
        for s in &self.streams {
            pids.extend(ca_pids(&s.descriptors));
        }
        pids
    }

    /// Every PID a consumer of this program needs.
    pub fn program_pids(&self) -> Vec<u16> {
        let mut pids = vec![self.pcr_pid];
        pids.extend(self.streams.iter().map(|s| s.elementary_pid));
        pids.extend(self.ecm_pids());
        pids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::testutil;

    #[test]
    fn test_parse_pmt_with_ecm() {
        let section = testutil::pmt_section(0x0400, 0x01FF, &[(0x02, 0x0111), (0x0F, 0x0112)], Some(0x0901));
        let pmt = PmtTable::parse(&PsiSection::parse_checked(&section).unwrap()).unwrap();
        assert_eq!(pmt.program_number, 0x0400);
        assert_eq!(pmt.pcr_pid, 0x01FF);
        assert_eq!(pmt.streams.len(), 2);
        assert!(pmt.streams[0].is_video());
        assert!(!pmt.streams[1].is_video());
        assert_eq!(pmt.ecm_pids(), vec![0x0901]);
        assert_eq!(pmt.program_pids(), vec![0x01FF, 0x0111, 0x0112, 0x0901]);
    }
}
