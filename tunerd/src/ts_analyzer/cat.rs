//! CAT (Conditional Access Table) parsing.

use tunerd_model::DecodeError;

use super::descriptors::ca_pids;
use super::psi::PsiSection;
use super::table_id;

/// Parsed CAT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatTable {
    pub version_number: u8,
    /// EMM PIDs from CA descriptors.
    pub emm_pids: Vec<u16>,
}

impl CatTable {
    pub fn parse(section: &PsiSection) -> Result<Self, DecodeError> {
        if section.header.table_id != table_id::CAT {
            return Err(DecodeError::UnexpectedTableId(section.header.table_id));
        }
        Ok(CatTable {
            version_number: section.header.version_number,
            emm_pids: ca_pids(section.data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::psi::build_long_section;

    #[test]
    fn test_parse_cat() {
        let section = build_long_section(
            table_id::CAT,
            0xFFFF,
            1,
            0,
            0,
            &[0x09, 0x04, 0x00, 0x05, 0xE0, 0x20],
        );
        let cat = CatTable::parse(&PsiSection::parse_checked(&section).unwrap()).unwrap();
        assert_eq!(cat.emm_pids, vec![0x0020]);
    }
}
