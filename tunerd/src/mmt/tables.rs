//! MMT-SI tables: PLT, MPT and the MH-* sections.
//!
//! MH-EIT, MH-SDT and MH-CDT share their section layout with the TS
//! tables, so they are decoded with the `ts_analyzer` parsers and the MH
//! descriptor decoders below (16-bit tags, UTF-8 strings).

use log::debug;
use tunerd_model::{AudioInfo, DecodeError, VideoInfo};

use crate::ts_analyzer::descriptors::{
    parse_content, parse_event_group, parse_series, sampling_rate, ExtendedEventDescriptor,
    LogoTransmissionDescriptor, ServiceDescriptor, TextCodec,
};
use crate::ts_analyzer::eit::{EitKind, EitSection, EventDescriptor, Track};
use crate::ts_analyzer::psi::PsiSection;
use crate::ts_analyzer::sdt::{SdtTable, ServiceDescriptors};

use super::{mh_descriptor_tag, table_id};

/// An MH descriptor borrowed from a descriptor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MhDescriptor<'a> {
    pub tag: u16,
    pub data: &'a [u8],
}

/// Iterator over a 16-bit tag descriptor loop. Tags from 0xF000 carry a
/// 16-bit length, the rest an 8-bit one.
pub struct MhDescriptorIter<'a> {
    data: &'a [u8],
}

impl<'a> MhDescriptorIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for MhDescriptorIter<'a> {
    type Item = MhDescriptor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 3 {
            return None;
        }
        let tag = u16::from_be_bytes([self.data[0], self.data[1]]);
        let (start, length) = if tag >= 0xF000 {
            if self.data.len() < 4 {
                self.data = &[];
                return None;
            }
            (4, u16::from_be_bytes([self.data[2], self.data[3]]) as usize)
        } else {
            (3, self.data[2] as usize)
        };
        let Some(body) = self.data.get(start..start + length) else {
            self.data = &[];
            return None;
        };
        self.data = &self.data[start + length..];
        Some(MhDescriptor { tag, data: body })
    }
}

fn need(what: &'static str, data: &[u8], len: usize) -> Result<(), DecodeError> {
    if data.len() < len {
        return Err(DecodeError::truncated(what, len, data.len()));
    }
    Ok(())
}

/// MH-short event descriptor: `(event_name, text)`.
pub fn parse_mh_short_event(data: &[u8]) -> Result<(String, String), DecodeError> {
    need("MH-short event descriptor", data, 4)?;
    let name_len = data[3] as usize;
    let text_off = 4 + name_len;
    need("MH-short event descriptor", data, text_off + 2)?;
    let text_len = u16::from_be_bytes([data[text_off], data[text_off + 1]]) as usize;
    need("MH-short event descriptor", data, text_off + 2 + text_len)?;
    Ok((
        TextCodec::Utf8.decode(&data[4..text_off]),
        TextCodec::Utf8.decode(&data[text_off + 2..text_off + 2 + text_len]),
    ))
}

/// MH-extended event descriptor; item lengths are 16 bits.
pub fn parse_mh_extended_event(data: &[u8]) -> Result<ExtendedEventDescriptor, DecodeError> {
    need("MH-extended event descriptor", data, 6)?;
    let items_len = u16::from_be_bytes([data[4], data[5]]) as usize;
    let end = 6 + items_len;
    need("MH-extended event descriptor", data, end)?;
    let mut items = Vec::new();
    let mut off = 6;
    while off < end {
        let desc_len = data[off] as usize;
        if off + 1 + desc_len + 2 > end {
            return Err(DecodeError::Malformed("MH-extended event item"));
        }
        let desc = data[off + 1..off + 1 + desc_len].to_vec();
        off += 1 + desc_len;
        let item_len = u16::from_be_bytes([data[off], data[off + 1]]) as usize;
        if off + 2 + item_len > end {
            return Err(DecodeError::Malformed("MH-extended event item"));
        }
        items.push((desc, data[off + 2..off + 2 + item_len].to_vec()));
        off += 2 + item_len;
    }
    Ok(ExtendedEventDescriptor {
        descriptor_number: data[0] >> 4,
        last_descriptor_number: data[0] & 0x0F,
        items,
        codec: TextCodec::Utf8,
    })
}

/// Vertical resolution of an MH video component resolution code.
pub fn mh_video_lines(code: u8) -> Option<u16> {
    match code {
        1 => Some(180),
        2 => Some(240),
        3 => Some(480),
        4 => Some(720),
        5 => Some(1080),
        6 => Some(2160),
        7 => Some(4320),
        _ => None,
    }
}

/// MH-video component descriptor.
pub fn parse_mh_video_component(data: &[u8]) -> Result<VideoInfo, DecodeError> {
    need("MH-video component descriptor", data, 8)?;
    let progressive = data[1] & 0x80 != 0;
    Ok(VideoInfo {
        video_type: Some("h.265".to_string()),
        resolution: mh_video_lines(data[0] >> 4)
            .map(|lines| format!("{}{}", lines, if progressive { 'p' } else { 'i' })),
        stream_content: 0,
        component_type: data[0],
    })
}

/// MH-audio component descriptor.
pub fn parse_mh_audio_component(data: &[u8]) -> Result<AudioInfo, DecodeError> {
    need("MH-audio component descriptor", data, 10)?;
    let multi_lingual = data[6] & 0x80 != 0;
    let mut langs = vec![String::from_utf8_lossy(&data[7..10]).into_owned()];
    if multi_lingual {
        need("MH-audio component descriptor", data, 13)?;
        langs.push(String::from_utf8_lossy(&data[10..13]).into_owned());
    }
    Ok(AudioInfo {
        component_type: data[1],
        component_tag: u16::from_be_bytes([data[2], data[3]]),
        is_main: data[6] & 0x40 != 0,
        sampling_rate: sampling_rate((data[6] >> 1) & 0x07),
        langs,
    })
}

/// MH-service descriptor (UTF-8 names).
pub fn parse_mh_service(data: &[u8]) -> Result<ServiceDescriptor, DecodeError> {
    need("MH-service descriptor", data, 3)?;
    let provider_len = data[1] as usize;
    let name_off = 2 + provider_len;
    need("MH-service descriptor", data, name_off + 1)?;
    let name_len = data[name_off] as usize;
    need("MH-service descriptor", data, name_off + 1 + name_len)?;
    Ok(ServiceDescriptor {
        service_type: data[0],
        provider_name: TextCodec::Utf8.decode(&data[2..name_off]),
        service_name: TextCodec::Utf8.decode(&data[name_off + 1..name_off + 1 + name_len]),
    })
}

/// Decode MH event descriptors, skipping undecodable ones.
pub fn mh_event_descriptors(data: &[u8]) -> Vec<EventDescriptor> {
    let mut out = Vec::new();
    for d in MhDescriptorIter::new(data) {
        let decoded = match d.tag {
            mh_descriptor_tag::SHORT_EVENT => parse_mh_short_event(d.data)
                .map(|(name, text)| EventDescriptor::Short { name, text }),
            mh_descriptor_tag::EXTENDED_EVENT => {
                parse_mh_extended_event(d.data).map(EventDescriptor::Extended)
            }
            mh_descriptor_tag::VIDEO_COMPONENT => {
                parse_mh_video_component(d.data).map(EventDescriptor::Component)
            }
            mh_descriptor_tag::CONTENT => Ok(EventDescriptor::Content(parse_content(d.data))),
            mh_descriptor_tag::AUDIO_COMPONENT => {
                parse_mh_audio_component(d.data).map(EventDescriptor::Audio)
            }
            mh_descriptor_tag::SERIES => {
                parse_series(d.data, TextCodec::Utf8).map(EventDescriptor::Series)
            }
            mh_descriptor_tag::EVENT_GROUP => parse_event_group(d.data).map(EventDescriptor::Group),
            _ => continue,
        };
        match decoded {
            Ok(desc) => out.push(desc),
            Err(e) => debug!("[Epg] Skipping MH descriptor 0x{:04X}: {}", d.tag, e),
        }
    }
    out
}

/// Decode MH service descriptors.
pub fn mh_service_descriptors(data: &[u8]) -> ServiceDescriptors {
    let mut out = ServiceDescriptors::default();
    for d in MhDescriptorIter::new(data) {
        match d.tag {
            mh_descriptor_tag::SERVICE => out.service = parse_mh_service(d.data).ok(),
            mh_descriptor_tag::LOGO_TRANSMISSION => {
                out.logo_id = LogoTransmissionDescriptor::parse(d.data)
                    .ok()
                    .and_then(|l| l.logo_id);
            }
            _ => {}
        }
    }
    out
}

/// Classify an MH-EIT table id.
pub fn mh_eit_kind(tid: u8) -> Option<EitKind> {
    match tid {
        table_id::MH_EIT_PF => Some(EitKind::PresentFollowing),
        table_id::MH_EIT_SCHEDULE_FIRST..=table_id::MH_EIT_SCHEDULE_LAST => {
            let idx = tid - table_id::MH_EIT_SCHEDULE_FIRST;
            Some(EitKind::Schedule {
                track: if idx < 8 { Track::Basic } else { Track::Extended },
                slot: idx & 0x07,
            })
        }
        _ => None,
    }
}

/// Parse an MH-EIT section.
pub fn parse_mh_eit(section: &PsiSection) -> Result<EitSection, DecodeError> {
    let tid = section.header.table_id;
    let kind = mh_eit_kind(tid).ok_or(DecodeError::UnexpectedTableId(tid))?;
    EitSection::parse_with(
        section,
        kind,
        |last| last.wrapping_sub(table_id::MH_EIT_SCHEDULE_FIRST) & 0x07,
        mh_event_descriptors,
    )
}

/// Parse an MH-SDT section.
pub fn parse_mh_sdt(section: &PsiSection) -> Result<SdtTable, DecodeError> {
    let tid = section.header.table_id;
    if tid != table_id::MH_SDT_ACTUAL {
        return Err(DecodeError::UnexpectedTableId(tid));
    }
    SdtTable::parse_with(section, mh_service_descriptors)
}

/// Read an MMT general location; returns the packet id (if located in
/// the same TLV stream) and the number of bytes consumed.
fn general_location(data: &[u8]) -> Result<(Option<u16>, usize), DecodeError> {
    need("general location", data, 1)?;
    let (packet_id, len) = match data[0] {
        0x00 => {
            need("general location", data, 3)?;
            (Some(u16::from_be_bytes([data[1], data[2]])), 3)
        }
        0x01 => (None, 1 + 12),
        0x02 | 0x04 => (None, 1 + 36),
        0x03 => (None, 1 + 6),
        0x05 => {
            need("general location", data, 2)?;
            (None, 2 + data[1] as usize)
        }
        _ => return Err(DecodeError::Malformed("general location type")),
    };
    need("general location", data, len)?;
    Ok((packet_id, len))
}

/// Low 16 bits of an MMT package id.
fn package_id(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .rev()
        .take(2)
        .rev()
        .fold(0u16, |acc, &b| (acc << 8) | b as u16)
}

/// Package entry of a PLT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PltPackage {
    /// Package id; equals the service id.
    pub package_id: u16,
    /// Packet id carrying the package's MPT.
    pub mpt_packet_id: Option<u16>,
}

/// Package List Table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PltTable {
    pub version: u8,
    pub packages: Vec<PltPackage>,
}

impl PltTable {
    pub fn parse(version: u8, body: &[u8]) -> Result<Self, DecodeError> {
        need("PLT", body, 1)?;
        let count = body[0] as usize;
        let mut packages = Vec::with_capacity(count);
        let mut off = 1;
        for _ in 0..count {
            need("PLT package", body, off + 1)?;
            let id_len = body[off] as usize;
            need("PLT package", body, off + 1 + id_len)?;
            let package_id = package_id(&body[off + 1..off + 1 + id_len]);
            off += 1 + id_len;
            let (mpt_packet_id, used) = general_location(&body[off..])?;
            off += used;
            packages.push(PltPackage {
                package_id,
                mpt_packet_id,
            });
        }
        Ok(PltTable { version, packages })
    }

    pub fn find(&self, service_id: u16) -> Option<&PltPackage> {
        self.packages.iter().find(|p| p.package_id == service_id)
    }
}

/// Asset entry of an MPT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MptAsset {
    /// Four-character asset type (`hev1`, `mp4a`, `stpp`, ...).
    pub asset_type: [u8; 4],
    pub packet_ids: Vec<u16>,
    pub descriptors: Vec<u8>,
}

/// MMT Package Table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MptTable {
    pub version: u8,
    pub mode: u8,
    pub package_id: u16,
    pub descriptors: Vec<u8>,
    pub assets: Vec<MptAsset>,
}

impl MptTable {
    pub fn parse(version: u8, body: &[u8]) -> Result<Self, DecodeError> {
        need("MPT", body, 2)?;
        let mode = body[0] & 0x03;
        let id_len = body[1] as usize;
        need("MPT", body, 2 + id_len + 2)?;
        let package = package_id(&body[2..2 + id_len]);
        let mut off = 2 + id_len;
        let desc_len = u16::from_be_bytes([body[off], body[off + 1]]) as usize;
        need("MPT descriptors", body, off + 2 + desc_len + 1)?;
        let descriptors = body[off + 2..off + 2 + desc_len].to_vec();
        off += 2 + desc_len;

        let count = body[off] as usize;
        off += 1;
        let mut assets = Vec::with_capacity(count);
        for _ in 0..count {
            // identifier_type, asset_id_scheme, asset_id_length
            need("MPT asset", body, off + 6)?;
            let asset_id_len = body[off + 5] as usize;
            off += 6 + asset_id_len;
            need("MPT asset", body, off + 5)?;
            let asset_type = [body[off], body[off + 1], body[off + 2], body[off + 3]];
            let clock_relation = body[off + 4] & 0x01 != 0;
            off += 5;
            if clock_relation {
                need("MPT asset clock", body, off + 2)?;
                let timescale = body[off + 1] & 0x01 != 0;
                off += 2 + if timescale { 4 } else { 0 };
            }
            need("MPT asset locations", body, off + 1)?;
            let location_count = body[off] as usize;
            off += 1;
            let mut packet_ids = Vec::new();
            for _ in 0..location_count {
                let (packet_id, used) = general_location(body.get(off..).unwrap_or_default())?;
                packet_ids.extend(packet_id);
                off += used;
            }
            need("MPT asset descriptors", body, off + 2)?;
            let asset_desc_len = u16::from_be_bytes([body[off], body[off + 1]]) as usize;
            need("MPT asset descriptors", body, off + 2 + asset_desc_len)?;
            let descriptors = body[off + 2..off + 2 + asset_desc_len].to_vec();
            off += 2 + asset_desc_len;
            assets.push(MptAsset {
                asset_type,
                packet_ids,
                descriptors,
            });
        }

        Ok(MptTable {
            version,
            mode,
            package_id: package,
            descriptors,
            assets,
        })
    }

    /// Packet ids of every asset.
    pub fn packet_ids(&self) -> Vec<u16> {
        self.assets
            .iter()
            .flat_map(|a| a.packet_ids.iter().copied())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! MMT table builders for tests.

    use crate::ts_analyzer::psi::build_long_section;

    pub fn plt_body(packages: &[(u16, u16)]) -> Vec<u8> {
        let mut body = vec![packages.len() as u8];
        for &(service_id, mpt_packet_id) in packages {
            body.push(2);
            body.extend_from_slice(&service_id.to_be_bytes());
            body.push(0x00);
            body.extend_from_slice(&mpt_packet_id.to_be_bytes());
        }
        body.push(0);
        body
    }

    pub fn mpt_body(service_id: u16, assets: &[(&[u8; 4], u16)]) -> Vec<u8> {
        let mut body = vec![0xFC, 2];
        body.extend_from_slice(&service_id.to_be_bytes());
        body.extend_from_slice(&[0x00, 0x00]);
        body.push(assets.len() as u8);
        for &(asset_type, packet_id) in assets {
            body.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
            body.extend_from_slice(asset_type);
            body.push(0xFE);
            body.push(1);
            body.push(0x00);
            body.extend_from_slice(&packet_id.to_be_bytes());
            body.extend_from_slice(&[0x00, 0x00]);
        }
        body
    }

    /// MH-short event descriptor.
    pub fn mh_short_event(name: &str, text: &str) -> Vec<u8> {
        let mut body = b"jpn".to_vec();
        body.push(name.len() as u8);
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(&(text.len() as u16).to_be_bytes());
        body.extend_from_slice(text.as_bytes());
        let mut out = vec![0xF0, 0x01];
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// MH-EIT p/f section with one event.
    pub fn mh_eit_pf(service_id: u16, onid: u16, event_id: u16, start: i64, descriptors: &[u8]) -> Vec<u8> {
        let mut body = onid.to_be_bytes().to_vec();
        body.extend_from_slice(&onid.to_be_bytes());
        body.extend_from_slice(&[0x00, super::table_id::MH_EIT_PF]);
        body.extend_from_slice(&event_id.to_be_bytes());
        body.extend_from_slice(&crate::ts_analyzer::time::encode_start_time(start));
        body.extend_from_slice(&[0x01, 0x00, 0x00]);
        body.push(0x80 | (descriptors.len() >> 8) as u8);
        body.push(descriptors.len() as u8);
        body.extend_from_slice(descriptors);
        build_long_section(super::table_id::MH_EIT_PF, service_id, 0, 0, 1, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plt() {
        let plt = PltTable::parse(1, &testutil::plt_body(&[(0x0101, 0x0010), (0x0102, 0x0011)])).unwrap();
        assert_eq!(plt.packages.len(), 2);
        assert_eq!(plt.find(0x0102).unwrap().mpt_packet_id, Some(0x0011));
    }

    #[test]
    fn test_parse_mpt() {
        let body = testutil::mpt_body(0x0101, &[(b"hev1", 0x0100), (b"mp4a", 0x0110)]);
        let mpt = MptTable::parse(0, &body).unwrap();
        assert_eq!(mpt.package_id, 0x0101);
        assert_eq!(mpt.assets[0].asset_type, *b"hev1");
        assert_eq!(mpt.packet_ids(), vec![0x0100, 0x0110]);
    }

    #[test]
    fn test_mh_eit_kind() {
        assert_eq!(mh_eit_kind(0x8B), Some(EitKind::PresentFollowing));
        assert_eq!(
            mh_eit_kind(0x95),
            Some(EitKind::Schedule {
                track: Track::Extended,
                slot: 1
            })
        );
        assert_eq!(mh_eit_kind(0x9C), None);
    }

    #[test]
    fn test_parse_mh_eit_short_event() {
        let desc = testutil::mh_short_event("ニュース", "概要");
        let section = testutil::mh_eit_pf(0x0101, 0x000B, 0x0042, 1_700_000_000_000, &desc);
        let eit = parse_mh_eit(&PsiSection::parse_checked(&section).unwrap()).unwrap();
        assert!(eit.is_present_following());
        assert_eq!(eit.events[0].duration, Some(3_600_000));
        assert_eq!(
            eit.events[0].descriptors,
            vec![EventDescriptor::Short {
                name: "ニュース".into(),
                text: "概要".into()
            }]
        );
    }

    #[test]
    fn test_mh_video_component() {
        let video = parse_mh_video_component(&[0x63, 0x80, 0x00, 0x00, 0x00, b'j', b'p', b'n']).unwrap();
        assert_eq!(video.resolution.as_deref(), Some("2160p"));
        assert_eq!(video.video_type.as_deref(), Some("h.265"));
    }

    #[test]
    fn test_mh_extended_event() {
        let data = [0x00, b'j', b'p', b'n', 0x00, 0x06, 0x01, b'A', 0x00, 0x02, b'B', b'C', 0x00, 0x00];
        let ext = parse_mh_extended_event(&data).unwrap();
        assert_eq!(ext.items, vec![(b"A".to_vec(), b"BC".to_vec())]);
        assert_eq!(ext.codec, TextCodec::Utf8);
    }
}
