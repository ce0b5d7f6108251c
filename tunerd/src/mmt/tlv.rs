//! TLV (Type Length Value) packet framing.
//!
//! A TLV packet is `0x7F | packet_type | data_length (16) | data`. MMTP
//! packets travel inside IP packets, normally header-compressed.

use tunerd_model::DecodeError;

/// Sync byte at the start of every TLV packet.
pub const TLV_SYNC: u8 = 0x7F;

/// Size of the TLV header.
pub const TLV_HEADER_SIZE: usize = 4;

/// TLV packet types.
pub mod packet_type {
    pub const IPV4: u8 = 0x01;
    pub const IPV6: u8 = 0x02;
    pub const COMPRESSED_IP: u8 = 0x03;
    pub const SIGNALLING: u8 = 0xFE;
    pub const NULL: u8 = 0xFF;
}

/// Whether `packet_type` is one the framer accepts during resync.
pub fn is_known_type(packet_type: u8) -> bool {
    matches!(
        packet_type,
        packet_type::IPV4
            | packet_type::IPV6
            | packet_type::COMPRESSED_IP
            | packet_type::SIGNALLING
            | packet_type::NULL
    )
}

/// Total length of the TLV packet starting at `data`, if the header is
/// complete and valid.
pub fn packet_len(data: &[u8]) -> Option<usize> {
    if data.len() < TLV_HEADER_SIZE || data[0] != TLV_SYNC || !is_known_type(data[1]) {
        return None;
    }
    Some(TLV_HEADER_SIZE + u16::from_be_bytes([data[2], data[3]]) as usize)
}

/// A borrowed TLV packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvPacket<'a> {
    pub packet_type: u8,
    pub data: &'a [u8],
}

impl<'a> TlvPacket<'a> {
    /// Parse one complete TLV packet.
    pub fn parse(raw: &'a [u8]) -> Result<Self, DecodeError> {
        if raw.len() < TLV_HEADER_SIZE {
            return Err(DecodeError::truncated("TLV header", TLV_HEADER_SIZE, raw.len()));
        }
        if raw[0] != TLV_SYNC {
            return Err(DecodeError::InvalidSync(raw[0]));
        }
        let len = TLV_HEADER_SIZE + u16::from_be_bytes([raw[2], raw[3]]) as usize;
        if raw.len() < len {
            return Err(DecodeError::truncated("TLV packet", len, raw.len()));
        }
        Ok(TlvPacket {
            packet_type: raw[1],
            data: &raw[TLV_HEADER_SIZE..len],
        })
    }

    /// The MMTP packet carried by this TLV packet, if any.
    ///
    /// Uncompressed IP packets are expected to carry UDP.
    pub fn mmtp_payload(&self) -> Option<&'a [u8]> {
        let data = self.data;
        match self.packet_type {
            packet_type::IPV4 => {
                let ihl = (*data.first()? & 0x0F) as usize * 4;
                data.get(ihl + 8..)
            }
            packet_type::IPV6 => data.get(40 + 8..),
            packet_type::COMPRESSED_IP => {
                // context_id (12) + sequence_number (4), then CID header type
                let header_type = *data.get(2)?;
                let skip = match header_type {
                    0x20 => 20,
                    0x21 => 2,
                    0x60 => 42,
                    0x61 => 0,
                    _ => return None,
                };
                data.get(3 + skip..)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_len() {
        assert_eq!(packet_len(&[0x7F, 0x03, 0x00, 0x05]), Some(9));
        assert_eq!(packet_len(&[0x7F, 0x10, 0x00, 0x05]), None);
        assert_eq!(packet_len(&[0x47, 0x03, 0x00, 0x05]), None);
        assert_eq!(packet_len(&[0x7F, 0x03]), None);
    }

    #[test]
    fn test_compressed_ip_payload() {
        let raw = [0x7F, 0x03, 0x00, 0x05, 0x00, 0x10, 0x61, 0xAA, 0xBB];
        let tlv = TlvPacket::parse(&raw).unwrap();
        assert_eq!(tlv.mmtp_payload(), Some(&[0xAA, 0xBB][..]));

        let raw = [0x7F, 0x03, 0x00, 0x06, 0x00, 0x10, 0x21, 0x00, 0x01, 0xCC];
        let tlv = TlvPacket::parse(&raw).unwrap();
        assert_eq!(tlv.mmtp_payload(), Some(&[0xCC][..]));
    }

    #[test]
    fn test_truncated_packet() {
        let raw = [0x7F, 0xFE, 0x00, 0x10, 0x40];
        assert!(matches!(
            TlvPacket::parse(&raw),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
