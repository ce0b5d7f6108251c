//! SDT (Service Description Table) parsing.
//!
//! The SDT is transmitted on PID 0x0011 and describes the services of a
//! transport stream. MH-SDT shares the section layout and differs only in
//! its descriptor encoding, so the service loop takes a descriptor decoder.

use tunerd_model::DecodeError;

use super::descriptors::{DescriptorIter, LogoTransmissionDescriptor, ServiceDescriptor};
use super::psi::PsiSection;
use super::{descriptor_tag, table_id};

/// Service entry in the SDT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdtService {
    /// Service ID (program number).
    pub service_id: u16,
    pub eit_schedule_flag: bool,
    pub eit_present_following_flag: bool,
    pub running_status: u8,
    pub free_ca_mode: bool,
    /// Parsed service descriptor.
    pub service_descriptor: Option<ServiceDescriptor>,
    /// Logo id from the logo transmission descriptor.
    pub logo_id: Option<u16>,
}

impl SdtService {
    /// Get service name (from service descriptor).
    pub fn service_name(&self) -> Option<&str> {
        self.service_descriptor
            .as_ref()
            .map(|d| d.service_name.as_str())
    }

    /// Get service type (from service descriptor).
    pub fn service_type(&self) -> Option<u8> {
        self.service_descriptor.as_ref().map(|d| d.service_type)
    }
}

/// Service-level fields decoded from a descriptor loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescriptors {
    pub service: Option<ServiceDescriptor>,
    pub logo_id: Option<u16>,
}

/// Decode the ARIB TS service descriptors.
pub fn ts_service_descriptors(data: &[u8]) -> ServiceDescriptors {
    let mut out = ServiceDescriptors::default();
    for d in DescriptorIter::new(data) {
        match d.tag {
            descriptor_tag::SERVICE => out.service = ServiceDescriptor::parse(d.data).ok(),
            descriptor_tag::LOGO_TRANSMISSION => {
                out.logo_id = LogoTransmissionDescriptor::parse(d.data)
                    .ok()
                    .and_then(|l| l.logo_id);
            }
            _ => {}
        }
    }
    out
}

/// Parsed SDT (Service Description Table).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdtTable {
    pub table_id: u8,
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    pub version_number: u8,
    pub services: Vec<SdtService>,
}

impl SdtTable {
    /// Parse a TS SDT from a PSI section.
    pub fn parse(section: &PsiSection) -> Result<Self, DecodeError> {
        let tid = section.header.table_id;
        if tid != table_id::SDT_ACTUAL && tid != table_id::SDT_OTHER {
            return Err(DecodeError::UnexpectedTableId(tid));
        }
        Self::parse_with(section, ts_service_descriptors)
    }

    /// Parse the SDT layout with a custom descriptor decoder.
    pub fn parse_with(
        section: &PsiSection,
        decode: impl Fn(&[u8]) -> ServiceDescriptors,
    ) -> Result<Self, DecodeError> {
        let data = section.data;
        if data.len() < 3 {
            return Err(DecodeError::truncated("SDT", 3, data.len()));
        }

        let mut sdt = SdtTable {
            table_id: section.header.table_id,
            transport_stream_id: section.header.table_id_extension,
            original_network_id: u16::from_be_bytes([data[0], data[1]]),
            version_number: section.header.version_number,
            services: Vec::new(),
        };

        let mut offset = 3;
        while offset + 5 <= data.len() {
            let service_id = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let flags = data[offset + 2];
            let status = data[offset + 3];
            let descriptors_length = ((status as usize & 0x0F) << 8) | data[offset + 4] as usize;
            offset += 5;
            if offset + descriptors_length > data.len() {
                break;
            }
            let decoded = decode(&data[offset..offset + descriptors_length]);
            offset += descriptors_length;

            sdt.services.push(SdtService {
                service_id,
                eit_schedule_flag: flags & 0x02 != 0,
                eit_present_following_flag: flags & 0x01 != 0,
                running_status: (status >> 5) & 0x07,
                free_ca_mode: status & 0x10 != 0,
                service_descriptor: decoded.service,
                logo_id: decoded.logo_id,
            });
        }

        Ok(sdt)
    }

    /// Find a service by ID.
    pub fn find_service(&self, service_id: u16) -> Option<&SdtService> {
        self.services.iter().find(|s| s.service_id == service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::testutil;

    #[test]
    fn test_parse_sdt() {
        let section = testutil::sdt_section(0x7FE8, 0x7FE8, &[(0x0400, 0x01, "A", Some(5))]);
        let sdt = SdtTable::parse(&PsiSection::parse_checked(&section).unwrap()).unwrap();
        assert_eq!(sdt.original_network_id, 0x7FE8);
        let service = sdt.find_service(0x0400).unwrap();
        assert_eq!(service.service_name(), Some("A"));
        assert_eq!(service.service_type(), Some(0x01));
        assert_eq!(service.logo_id, Some(5));
        assert!(service.eit_present_following_flag);
    }
}
