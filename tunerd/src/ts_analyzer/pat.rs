//! PAT (Program Association Table) parsing and rewriting.
//!
//! The PAT is transmitted on PID 0x0000 and lists programs with their PMT
//! PIDs. When a stream is narrowed to one service the PAT is rebuilt with
//! only the network entry and the target program.

use tunerd_model::DecodeError;

use super::psi::{build_long_section, PsiSection};
use super::table_id;

/// A single PAT entry (program number and PMT PID).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatEntry {
    /// Program number (0 = NIT, others = service).
    pub program_number: u16,
    /// PID of the PMT for this program (or NIT PID if program_number = 0).
    pub pid: u16,
}

/// Parsed PAT (Program Association Table).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatTable {
    /// Transport stream ID.
    pub transport_stream_id: u16,
    /// Version number.
    pub version_number: u8,
    /// Programs (excluding program 0).
    pub programs: Vec<PatEntry>,
    /// NIT PID (if present in PAT).
    pub nit_pid: Option<u16>,
}

impl PatTable {
    /// Parse a PAT from a PSI section.
    pub fn parse(section: &PsiSection) -> Result<Self, DecodeError> {
        if section.header.table_id != table_id::PAT {
            return Err(DecodeError::UnexpectedTableId(section.header.table_id));
        }
        let data = section.data;
        if data.len() % 4 != 0 {
            return Err(DecodeError::Malformed("PAT program loop"));
        }

        let mut pat = PatTable {
            transport_stream_id: section.header.table_id_extension,
            version_number: section.header.version_number,
            programs: Vec::new(),
            nit_pid: None,
        };
        for chunk in data.chunks_exact(4) {
            let program_number = u16::from_be_bytes([chunk[0], chunk[1]]);
            let pid = ((chunk[2] as u16 & 0x1F) << 8) | chunk[3] as u16;
            if program_number == 0 {
                pat.nit_pid = Some(pid);
            } else {
                pat.programs.push(PatEntry {
                    program_number,
                    pid,
                });
            }
        }
        Ok(pat)
    }

    /// Get PMT PID for a specific program number.
    pub fn get_pmt_pid(&self, program_number: u16) -> Option<u16> {
        self.programs
            .iter()
            .find(|p| p.program_number == program_number)
            .map(|p| p.pid)
    }

    /// Build a PAT section containing only program 0 and `program_number`.
    ///
    /// Returns `None` when the program is not listed.
    pub fn narrowed_section(&self, program_number: u16) -> Option<Vec<u8>> {
        let pmt_pid = self.get_pmt_pid(program_number)?;
        let mut body = Vec::with_capacity(8);
        if let Some(nit_pid) = self.nit_pid {
            body.extend_from_slice(&[0x00, 0x00, 0xE0 | (nit_pid >> 8) as u8, nit_pid as u8]);
        }
        body.extend_from_slice(&program_number.to_be_bytes());
        body.extend_from_slice(&[0xE0 | (pmt_pid >> 8) as u8, pmt_pid as u8]);
        Some(build_long_section(
            table_id::PAT,
            self.transport_stream_id,
            self.version_number,
            0,
            0,
            &body,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::psi::crc32_mpeg2;
    use crate::ts_analyzer::testutil;

    #[test]
    fn test_parse_pat() {
        let section = testutil::pat_section(0x7FE8, 3, &[(0x0400, 0x01F0), (0x0408, 0x01F8)]);
        let pat = PatTable::parse(&PsiSection::parse_checked(&section).unwrap()).unwrap();
        assert_eq!(pat.transport_stream_id, 0x7FE8);
        assert_eq!(pat.version_number, 3);
        assert_eq!(pat.nit_pid, Some(0x0010));
        assert_eq!(pat.get_pmt_pid(0x0408), Some(0x01F8));
        assert_eq!(pat.get_pmt_pid(0x0409), None);
    }

    #[test]
    fn test_narrowed_section_crc() {
        let section = testutil::pat_section(0x7FE8, 3, &[(0x0400, 0x01F0), (0x0408, 0x01F8)]);
        let pat = PatTable::parse(&PsiSection::parse_checked(&section).unwrap()).unwrap();
        let narrowed = pat.narrowed_section(0x0408).unwrap();

        let n = narrowed.len();
        let crc = u32::from_be_bytes([narrowed[n - 4], narrowed[n - 3], narrowed[n - 2], narrowed[n - 1]]);
        assert_eq!(crc, crc32_mpeg2(&narrowed[..n - 4]));

        let reparsed = PatTable::parse(&PsiSection::parse_checked(&narrowed).unwrap()).unwrap();
        assert_eq!(reparsed.nit_pid, Some(0x0010));
        assert_eq!(
            reparsed.programs,
            vec![PatEntry {
                program_number: 0x0408,
                pid: 0x01F8
            }]
        );
        assert_eq!(reparsed.version_number, 3);
        assert!(pat.narrowed_section(0x0001).is_none());
    }
}
