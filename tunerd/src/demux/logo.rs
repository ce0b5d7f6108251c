//! Logo reassembly from CDT / MH-CDT sections.

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use log::debug;

use crate::ts_analyzer::cdt::CdtTable;

/// A fully received logo image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedLogo {
    pub network_id: u16,
    pub logo_id: u16,
    pub logo_type: u8,
    pub data: Bytes,
}

/// `(network_id, logo_id, logo_type, logo_version)`
type LogoKey = (u16, u16, u8, u16);

#[derive(Debug, Default)]
struct PartialLogo {
    data_size: usize,
    last_section_number: u8,
    sections: BTreeMap<u8, Vec<u8>>,
}

impl PartialLogo {
    fn is_complete(&self) -> bool {
        let all_present = (0..=self.last_section_number).all(|n| self.sections.contains_key(&n));
        let received: usize = self.sections.values().map(Vec::len).sum();
        all_present && received >= self.data_size
    }

    fn assemble(&self) -> Bytes {
        let mut data: Vec<u8> = self.sections.values().flatten().copied().collect();
        data.truncate(self.data_size);
        Bytes::from(data)
    }
}

/// Collects logo sections until `0..=last` and the declared size are in.
#[derive(Debug, Default)]
pub struct LogoAssembler {
    partial: HashMap<LogoKey, PartialLogo>,
    done: HashSet<LogoKey>,
}

impl LogoAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cdt: &CdtTable) -> Option<CompletedLogo> {
        let logo = match cdt.logo() {
            Ok(logo) => logo,
            Err(e) => {
                debug!("[Logo] Skipping CDT section: {}", e);
                return None;
            }
        };
        let key = (
            cdt.original_network_id,
            logo.logo_id,
            logo.logo_type,
            logo.logo_version,
        );
        if self.done.contains(&key) {
            return None;
        }

        let partial = self.partial.entry(key).or_default();
        partial.data_size = logo.data_size as usize;
        partial.last_section_number = cdt.last_section_number;
        partial.sections.insert(cdt.section_number, logo.data);
        if !partial.is_complete() {
            return None;
        }

        let data = partial.assemble();
        self.partial.remove(&key);
        self.done.insert(key);
        Some(CompletedLogo {
            network_id: key.0,
            logo_id: key.1,
            logo_type: key.2,
            data,
        })
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::psi::PsiSection;
    use crate::ts_analyzer::testutil;

    fn cdt(section_number: u8, last: u8, data_size: u16, data: &[u8]) -> CdtTable {
        let section = testutil::cdt_section(0xC8, 4, 1, 7, 0x05, section_number, last, data_size, data);
        CdtTable::parse(&PsiSection::parse_checked(&section).unwrap()).unwrap()
    }

    #[test]
    fn test_single_section_logo() {
        let mut assembler = LogoAssembler::new();
        let logo = assembler.push(&cdt(0, 0, 4, b"PNG!")).unwrap();
        assert_eq!(logo.network_id, 4);
        assert_eq!(logo.logo_id, 7);
        assert_eq!(logo.logo_type, 0x05);
        assert_eq!(&logo.data[..], b"PNG!");
        // already delivered
        assert!(assembler.push(&cdt(0, 0, 4, b"PNG!")).is_none());
    }

    #[test]
    fn test_multi_section_logo_out_of_order() {
        let mut assembler = LogoAssembler::new();
        assert!(assembler.push(&cdt(1, 1, 6, b"DEF")).is_none());
        let logo = assembler.push(&cdt(0, 1, 6, b"ABC")).unwrap();
        assert_eq!(&logo.data[..], b"ABCDEF");
    }

    #[test]
    fn test_waits_for_declared_size() {
        let mut assembler = LogoAssembler::new();
        assert!(assembler.push(&cdt(0, 0, 10, b"short")).is_none());
    }
}
