//! Descriptor parsing for PSI/SI tables.
//!
//! Descriptor loops are iterated without copying; each parser takes the
//! descriptor body (after tag and length).

use tunerd_model::{AudioInfo, DecodeError, Genre, RelatedItem, RelatedItemType, SeriesInfo, VideoInfo};

use super::aribstr::decode_arib_string;
use super::time::decode_mjd_date;

/// A descriptor borrowed from a descriptor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor<'a> {
    pub tag: u8,
    pub data: &'a [u8],
}

/// Iterator over an 8-bit tag / 8-bit length descriptor loop.
pub struct DescriptorIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Descriptor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + 2 > self.data.len() {
            return None;
        }
        let tag = self.data[self.offset];
        let length = self.data[self.offset + 1] as usize;
        let start = self.offset + 2;
        if start + length > self.data.len() {
            self.offset = self.data.len();
            return None;
        }
        self.offset = start + length;
        Some(Descriptor {
            tag,
            data: &self.data[start..start + length],
        })
    }
}

/// Find a specific descriptor in a descriptor loop.
pub fn find_descriptor(data: &[u8], tag: u8) -> Option<&[u8]> {
    DescriptorIter::new(data).find(|d| d.tag == tag).map(|d| d.data)
}

fn need(what: &'static str, data: &[u8], len: usize) -> Result<(), DecodeError> {
    if data.len() < len {
        return Err(DecodeError::truncated(what, len, data.len()));
    }
    Ok(())
}

fn lang_code(data: &[u8]) -> String {
    String::from_utf8_lossy(&data[..3]).into_owned()
}

/// Service descriptor (0x48).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service_type: u8,
    pub provider_name: String,
    pub service_name: String,
}

impl ServiceDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        need("service descriptor", data, 3)?;
        let service_type = data[0];
        let provider_len = data[1] as usize;
        need("service descriptor", data, 3 + provider_len)?;
        let provider_name = decode_arib_string(&data[2..2 + provider_len]);
        let name_offset = 2 + provider_len;
        let name_len = data[name_offset] as usize;
        need("service descriptor", data, name_offset + 1 + name_len)?;
        let service_name = decode_arib_string(&data[name_offset + 1..name_offset + 1 + name_len]);
        Ok(ServiceDescriptor {
            service_type,
            provider_name,
            service_name,
        })
    }
}

/// Conditional access descriptor (0x09).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaDescriptor {
    pub ca_system_id: u16,
    pub ca_pid: u16,
}

impl CaDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        need("CA descriptor", data, 4)?;
        Ok(CaDescriptor {
            ca_system_id: u16::from_be_bytes([data[0], data[1]]),
            ca_pid: ((data[2] as u16 & 0x1F) << 8) | data[3] as u16,
        })
    }
}

/// Collect CA PIDs from a descriptor loop.
pub fn ca_pids(descriptors: &[u8]) -> Vec<u16> {
    DescriptorIter::new(descriptors)
        .filter(|d| d.tag == super::descriptor_tag::CA)
        .filter_map(|d| CaDescriptor::parse(d.data).ok())
        .map(|ca| ca.ca_pid)
        .collect()
}

/// Logo transmission descriptor (0xCF).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoTransmissionDescriptor {
    pub logo_transmission_type: u8,
    pub logo_id: Option<u16>,
    pub logo_version: Option<u16>,
    pub download_data_id: Option<u16>,
    pub logo_char: Option<String>,
}

impl LogoTransmissionDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        need("logo transmission descriptor", data, 1)?;
        let mut desc = LogoTransmissionDescriptor {
            logo_transmission_type: data[0],
            logo_id: None,
            logo_version: None,
            download_data_id: None,
            logo_char: None,
        };
        match data[0] {
            0x01 => {
                need("logo transmission descriptor", data, 7)?;
                desc.logo_id = Some(((data[1] as u16 & 0x01) << 8) | data[2] as u16);
                desc.logo_version = Some(((data[3] as u16 & 0x0F) << 8) | data[4] as u16);
                desc.download_data_id = Some(u16::from_be_bytes([data[5], data[6]]));
            }
            0x02 => {
                need("logo transmission descriptor", data, 3)?;
                desc.logo_id = Some(((data[1] as u16 & 0x01) << 8) | data[2] as u16);
            }
            0x03 => desc.logo_char = Some(decode_arib_string(&data[1..])),
            _ => {}
        }
        Ok(desc)
    }
}

/// TS information descriptor (0xCD).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TsInformationDescriptor {
    pub remote_control_key_id: u8,
    pub ts_name: String,
}

impl TsInformationDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        need("TS information descriptor", data, 2)?;
        let remote_control_key_id = data[0];
        let ts_name_length = (data[1] >> 2) as usize;
        need("TS information descriptor", data, 2 + ts_name_length)?;
        Ok(TsInformationDescriptor {
            remote_control_key_id,
            ts_name: decode_arib_string(&data[2..2 + ts_name_length]),
        })
    }
}

/// Service list descriptor (0x41): `(service_id, service_type)` pairs.
pub fn parse_service_list(data: &[u8]) -> Vec<(u16, u8)> {
    data.chunks_exact(3)
        .map(|c| (u16::from_be_bytes([c[0], c[1]]), c[2]))
        .collect()
}

/// Remote control key descriptor (0xDE): `(remote_control_key_id, service_id)` pairs.
pub fn parse_remote_control_keys(data: &[u8]) -> Vec<(u8, u16)> {
    let Some((&count, rest)) = data.split_first() else {
        return Vec::new();
    };
    rest.chunks_exact(5)
        .take(count as usize)
        .map(|c| (c[0], u16::from_be_bytes([c[1], c[2]])))
        .collect()
}

/// Short event descriptor (0x4D).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortEventDescriptor {
    pub lang: String,
    pub event_name: String,
    pub text: String,
}

impl ShortEventDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        need("short event descriptor", data, 5)?;
        let name_len = data[3] as usize;
        need("short event descriptor", data, 5 + name_len)?;
        let text_off = 4 + name_len;
        let text_len = data[text_off] as usize;
        need("short event descriptor", data, text_off + 1 + text_len)?;
        Ok(ShortEventDescriptor {
            lang: lang_code(data),
            event_name: decode_arib_string(&data[4..4 + name_len]),
            text: decode_arib_string(&data[text_off + 1..text_off + 1 + text_len]),
        })
    }
}

/// Text encoding of raw descriptor strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCodec {
    /// ARIB STD-B24 8-unit code (MPEG-TS).
    Arib,
    /// UTF-8 (MMT/TLV).
    Utf8,
}

impl TextCodec {
    pub fn decode(self, data: &[u8]) -> String {
        match self {
            TextCodec::Arib => decode_arib_string(data),
            TextCodec::Utf8 => String::from_utf8_lossy(data).into_owned(),
        }
    }
}

/// Extended event descriptor (0x4E). Items are kept raw so that fragments
/// can be concatenated before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedEventDescriptor {
    pub descriptor_number: u8,
    pub last_descriptor_number: u8,
    /// `(item_description, item)` raw byte pairs.
    pub items: Vec<(Vec<u8>, Vec<u8>)>,
    pub codec: TextCodec,
}

impl ExtendedEventDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        need("extended event descriptor", data, 5)?;
        let items_len = data[4] as usize;
        need("extended event descriptor", data, 5 + items_len)?;
        let mut items = Vec::new();
        let mut off = 5;
        let end = 5 + items_len;
        while off < end {
            let desc_len = data[off] as usize;
            if off + 1 + desc_len + 1 > end {
                return Err(DecodeError::Malformed("extended event item"));
            }
            let desc = data[off + 1..off + 1 + desc_len].to_vec();
            off += 1 + desc_len;
            let item_len = data[off] as usize;
            if off + 1 + item_len > end {
                return Err(DecodeError::Malformed("extended event item"));
            }
            let item = data[off + 1..off + 1 + item_len].to_vec();
            off += 1 + item_len;
            items.push((desc, item));
        }
        Ok(ExtendedEventDescriptor {
            descriptor_number: data[0] >> 4,
            last_descriptor_number: data[0] & 0x0F,
            items,
            codec: TextCodec::Arib,
        })
    }
}

/// Video resolution label from a component descriptor's component type.
pub fn video_resolution(component_type: u8) -> Option<&'static str> {
    match component_type >> 4 {
        0x0 => Some("480i"),
        0x9 => Some("2160p"),
        0xA => Some("480p"),
        0xB => Some("1080i"),
        0xC => Some("720p"),
        0xD => Some("240p"),
        0xE => Some("1080p"),
        0xF => Some("180p"),
        _ => None,
    }
}

/// Component descriptor (0x50) into video info.
pub fn parse_component(data: &[u8]) -> Result<VideoInfo, DecodeError> {
    need("component descriptor", data, 6)?;
    let stream_content = data[0] & 0x0F;
    let component_type = data[1];
    let video_type = match stream_content {
        0x01 => Some("mpeg2"),
        0x05 => Some("h.264"),
        0x09 => Some("h.265"),
        _ => None,
    };
    Ok(VideoInfo {
        video_type: video_type.map(str::to_string),
        resolution: video_type
            .and_then(|_| video_resolution(component_type))
            .map(str::to_string),
        stream_content,
        component_type,
    })
}

/// Content descriptor (0x54) into genres.
pub fn parse_content(data: &[u8]) -> Vec<Genre> {
    data.chunks_exact(2)
        .map(|c| Genre {
            lv1: c[0] >> 4,
            lv2: c[0] & 0x0F,
            un1: c[1] >> 4,
            un2: c[1] & 0x0F,
        })
        .collect()
}

/// Audio sampling rate in Hz from the 3-bit code.
pub fn sampling_rate(code: u8) -> u32 {
    match code {
        1 => 16_000,
        2 => 22_050,
        3 => 24_000,
        5 => 32_000,
        6 => 44_100,
        7 => 48_000,
        _ => 0,
    }
}

/// Audio component descriptor (0xC4).
pub fn parse_audio_component(data: &[u8]) -> Result<AudioInfo, DecodeError> {
    need("audio component descriptor", data, 9)?;
    let component_type = data[1];
    let component_tag = data[2] as u16;
    let es_multi_lingual = data[5] & 0x80 != 0;
    let is_main = data[5] & 0x40 != 0;
    let rate = (data[5] >> 1) & 0x07;
    let mut langs = vec![lang_code(&data[6..])];
    if es_multi_lingual {
        need("audio component descriptor", data, 12)?;
        langs.push(lang_code(&data[9..]));
    }
    Ok(AudioInfo {
        component_type,
        component_tag,
        is_main,
        sampling_rate: sampling_rate(rate),
        langs,
    })
}

/// Series descriptor (0xD5).
pub fn parse_series(data: &[u8], codec: TextCodec) -> Result<SeriesInfo, DecodeError> {
    need("series descriptor", data, 8)?;
    let expire_valid = data[2] & 0x01 != 0;
    let expire = u16::from_be_bytes([data[3], data[4]]);
    Ok(SeriesInfo {
        id: u16::from_be_bytes([data[0], data[1]]),
        repeat: data[2] >> 4,
        pattern: (data[2] >> 1) & 0x07,
        expires_at: expire_valid.then(|| decode_mjd_date(expire)),
        episode: ((data[5] as u16) << 4) | (data[6] as u16 >> 4),
        last_episode: ((data[6] as u16 & 0x0F) << 8) | data[7] as u16,
        name: codec.decode(&data[8..]),
    })
}

/// Event group descriptor (0xD6).
pub fn parse_event_group(data: &[u8]) -> Result<Vec<RelatedItem>, DecodeError> {
    need("event group descriptor", data, 1)?;
    let group_type = data[0] >> 4;
    let count = (data[0] & 0x0F) as usize;
    need("event group descriptor", data, 1 + count * 4)?;
    let item_type = match group_type {
        1 => RelatedItemType::Shared,
        2 | 4 => RelatedItemType::Relay,
        3 | 5 => RelatedItemType::Movement,
        _ => return Ok(Vec::new()),
    };

    let mut items: Vec<RelatedItem> = data[1..1 + count * 4]
        .chunks_exact(4)
        .map(|c| RelatedItem {
            item_type,
            network_id: None,
            service_id: u16::from_be_bytes([c[0], c[1]]),
            event_id: u16::from_be_bytes([c[2], c[3]]),
        })
        .collect();

    if group_type == 4 || group_type == 5 {
        for c in data[1 + count * 4..].chunks_exact(8) {
            items.push(RelatedItem {
                item_type,
                network_id: Some(u16::from_be_bytes([c[0], c[1]])),
                service_id: u16::from_be_bytes([c[4], c[5]]),
                event_id: u16::from_be_bytes([c[6], c[7]]),
            });
        }
    }
    Ok(items)
}
