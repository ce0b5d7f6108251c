//! CDT (Common Data Table) parsing.
//!
//! Broadcasters deliver service logos through CDT (TS, table 0xC8) and
//! MH-CDT (MMT, table 0xA2). Both share this layout.

use tunerd_model::DecodeError;

use super::psi::PsiSection;

/// CDT data type carrying logo data.
pub const DATA_TYPE_LOGO: u8 = 0x01;

/// Parsed CDT section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdtTable {
    pub download_data_id: u16,
    pub version_number: u8,
    pub section_number: u8,
    pub last_section_number: u8,
    pub original_network_id: u16,
    pub data_type: u8,
    pub data_module: Vec<u8>,
}

/// Logo data module header and bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoData {
    pub logo_type: u8,
    pub logo_id: u16,
    pub logo_version: u16,
    /// Declared size of the complete image.
    pub data_size: u16,
    pub data: Vec<u8>,
}

impl CdtTable {
    pub fn parse(section: &PsiSection) -> Result<Self, DecodeError> {
        let data = section.data;
        if data.len() < 5 {
            return Err(DecodeError::truncated("CDT", 5, data.len()));
        }
        let descriptors_length = ((data[3] as usize & 0x0F) << 8) | data[4] as usize;
        if data.len() < 5 + descriptors_length {
            return Err(DecodeError::Malformed("CDT descriptors length"));
        }
        Ok(CdtTable {
            download_data_id: section.header.table_id_extension,
            version_number: section.header.version_number,
            section_number: section.header.section_number,
            last_section_number: section.header.last_section_number,
            original_network_id: u16::from_be_bytes([data[0], data[1]]),
            data_type: data[2],
            data_module: data[5 + descriptors_length..].to_vec(),
        })
    }

    /// Decode the logo data module header.
    pub fn logo(&self) -> Result<LogoData, DecodeError> {
        if self.data_type != DATA_TYPE_LOGO {
            return Err(DecodeError::Malformed("CDT data type"));
        }
        let m = &self.data_module;
        if m.len() < 7 {
            return Err(DecodeError::truncated("logo data module", 7, m.len()));
        }
        Ok(LogoData {
            logo_type: m[0],
            logo_id: ((m[1] as u16 & 0x01) << 8) | m[2] as u16,
            logo_version: ((m[3] as u16 & 0x0F) << 8) | m[4] as u16,
            data_size: u16::from_be_bytes([m[5], m[6]]),
            data: m[7..].to_vec(),
        })
    }
}
