//! NIT (Network Information Table) parsing.
//!
//! The NIT is transmitted on PID 0x0010 (and as TLV-NIT in TLV-SI packets).
//! The tuner uses it for remote control key ids of services.

use tunerd_model::DecodeError;

use super::descriptors::{
    parse_remote_control_keys, parse_service_list, DescriptorIter, TsInformationDescriptor,
};
use super::psi::PsiSection;
use super::{aribstr::decode_arib_string, descriptor_tag, table_id};

/// Transport stream entry in the NIT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NitTransportStream {
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    /// `(service_id, service_type)` from the service list descriptor.
    pub services: Vec<(u16, u8)>,
    /// Remote control key id from the TS information descriptor.
    pub remote_control_key_id: Option<u8>,
    /// Per-service keys from the remote control key descriptor.
    pub service_remote_keys: Vec<(u16, u8)>,
}

impl NitTransportStream {
    /// Remote control key id of each listed service.
    pub fn remote_keys(&self) -> Vec<(u16, u8)> {
        let mut keys = self.service_remote_keys.clone();
        if let Some(key) = self.remote_control_key_id {
            for &(sid, _) in &self.services {
                if !keys.iter().any(|(s, _)| *s == sid) {
                    keys.push((sid, key));
                }
            }
        }
        keys
    }
}

/// Parsed NIT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NitTable {
    pub network_id: u16,
    pub version_number: u8,
    pub network_name: Option<String>,
    pub transport_streams: Vec<NitTransportStream>,
}

impl NitTable {
    /// Parse a NIT from a PSI section.
    pub fn parse(section: &PsiSection) -> Result<Self, DecodeError> {
        let tid = section.header.table_id;
        if tid != table_id::NIT_ACTUAL && tid != table_id::NIT_OTHER {
            return Err(DecodeError::UnexpectedTableId(tid));
        }

        let data = section.data;
        if data.len() < 2 {
            return Err(DecodeError::truncated("NIT", 2, data.len()));
        }
        let network_descriptors_length = ((data[0] as usize & 0x0F) << 8) | data[1] as usize;
        if data.len() < 2 + network_descriptors_length + 2 {
            return Err(DecodeError::Malformed("NIT network descriptors length"));
        }
        let network_descriptors = &data[2..2 + network_descriptors_length];
        let network_name = DescriptorIter::new(network_descriptors)
            .find(|d| d.tag == descriptor_tag::NETWORK_NAME)
            .map(|d| decode_arib_string(d.data));

        let mut nit = NitTable {
            network_id: section.header.table_id_extension,
            version_number: section.header.version_number,
            network_name,
            transport_streams: Vec::new(),
        };

        let loop_offset = 2 + network_descriptors_length;
        let loop_length = ((data[loop_offset] as usize & 0x0F) << 8) | data[loop_offset + 1] as usize;
        let mut offset = loop_offset + 2;
        let loop_end = (offset + loop_length).min(data.len());

        while offset + 6 <= loop_end {
            let transport_stream_id = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let original_network_id = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
            let desc_len = ((data[offset + 4] as usize & 0x0F) << 8) | data[offset + 5] as usize;
            offset += 6;
            if offset + desc_len > loop_end {
                break;
            }

            let mut ts = NitTransportStream {
                transport_stream_id,
                original_network_id,
                ..Default::default()
            };
            for d in DescriptorIter::new(&data[offset..offset + desc_len]) {
                match d.tag {
                    descriptor_tag::SERVICE_LIST => ts.services = parse_service_list(d.data),
                    descriptor_tag::TS_INFORMATION => {
                        if let Ok(info) = TsInformationDescriptor::parse(d.data) {
                            ts.remote_control_key_id = Some(info.remote_control_key_id);
                        }
                    }
                    descriptor_tag::REMOTE_CONTROL_KEY => {
                        ts.service_remote_keys = parse_remote_control_keys(d.data)
                            .into_iter()
                            .map(|(key, sid)| (sid, key))
                            .collect();
                    }
                    _ => {}
                }
            }
            offset += desc_len;
            nit.transport_streams.push(ts);
        }

        Ok(nit)
    }

    /// Find transport stream by TSID.
    pub fn find_transport_stream(&self, tsid: u16) -> Option<&NitTransportStream> {
        self.transport_streams
            .iter()
            .find(|ts| ts.transport_stream_id == tsid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::testutil;

    #[test]
    fn test_parse_nit_remote_keys() {
        let section = testutil::nit_section(0x7FE8, 0x7FE8, &[0x0400, 0x0401], 3);
        let nit = NitTable::parse(&PsiSection::parse_checked(&section).unwrap()).unwrap();
        assert_eq!(nit.network_id, 0x7FE8);
        let ts = nit.find_transport_stream(0x7FE8).unwrap();
        assert_eq!(ts.services.len(), 2);
        assert_eq!(ts.remote_keys(), vec![(0x0400, 3), (0x0401, 3)]);
    }
}
