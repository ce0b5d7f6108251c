//! EIT (Event Information Table) parsing.
//!
//! Produces a layer-neutral [`EitSection`] consumed by the EPG assembler.
//! MH-EIT (MMT) has the same section layout; only its table id ranges and
//! descriptor encoding differ.

use log::debug;
use tunerd_model::{AudioInfo, DecodeError, Genre, RelatedItem, SeriesInfo, Timestamp, VideoInfo};

use super::descriptors::{
    parse_audio_component, parse_component, parse_content, parse_event_group, parse_series,
    DescriptorIter, ExtendedEventDescriptor, ShortEventDescriptor, TextCodec,
};
use super::psi::PsiSection;
use super::time::{decode_duration, decode_start_time};
use super::{descriptor_tag, table_id};

/// Schedule track: basic (first 8 table ids) or extended (next 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    Basic = 0,
    Extended = 1,
}

/// Role of an EIT section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EitKind {
    PresentFollowing,
    Schedule { track: Track, slot: u8 },
}

/// Descriptor of an event, decoded into catalog terms.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDescriptor {
    Short { name: String, text: String },
    Extended(ExtendedEventDescriptor),
    Component(VideoInfo),
    Content(Vec<Genre>),
    Audio(AudioInfo),
    Series(SeriesInfo),
    Group(Vec<RelatedItem>),
}

/// One event of an EIT section.
#[derive(Debug, Clone, PartialEq)]
pub struct EitEvent {
    pub event_id: u16,
    /// `None` when the start time is undefined.
    pub start_time: Option<Timestamp>,
    /// `None` when the duration is undefined.
    pub duration: Option<i64>,
    pub running_status: u8,
    pub free_ca_mode: bool,
    pub descriptors: Vec<EventDescriptor>,
}

/// A decoded EIT / MH-EIT section.
#[derive(Debug, Clone, PartialEq)]
pub struct EitSection {
    pub table_id: u8,
    pub service_id: u16,
    pub version: u8,
    pub section_number: u8,
    pub last_section_number: u8,
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    pub segment_last_section_number: u8,
    pub last_table_id: u8,
    pub kind: EitKind,
    /// Slot of `last_table_id` within its track.
    pub last_table_slot: u8,
    pub events: Vec<EitEvent>,
}

impl EitSection {
    /// Parse a TS EIT section.
    pub fn parse(section: &PsiSection) -> Result<Self, DecodeError> {
        let tid = section.header.table_id;
        let kind = ts_eit_kind(tid).ok_or(DecodeError::UnexpectedTableId(tid))?;
        Self::parse_with(section, kind, |last| last & 0x07, ts_event_descriptors)
    }

    /// Parse the EIT layout with layer-specific helpers.
    pub fn parse_with(
        section: &PsiSection,
        kind: EitKind,
        last_slot: impl Fn(u8) -> u8,
        descriptors: impl Fn(&[u8]) -> Vec<EventDescriptor>,
    ) -> Result<Self, DecodeError> {
        let data = section.data;
        if data.len() < 6 {
            return Err(DecodeError::truncated("EIT", 6, data.len()));
        }
        let last_table_id = data[5];
        let mut eit = EitSection {
            table_id: section.header.table_id,
            service_id: section.header.table_id_extension,
            version: section.header.version_number,
            section_number: section.header.section_number,
            last_section_number: section.header.last_section_number,
            transport_stream_id: u16::from_be_bytes([data[0], data[1]]),
            original_network_id: u16::from_be_bytes([data[2], data[3]]),
            segment_last_section_number: data[4],
            last_table_id,
            kind,
            last_table_slot: last_slot(last_table_id),
            events: Vec::new(),
        };

        let mut offset = 6;
        while offset + 12 <= data.len() {
            let e = &data[offset..];
            let desc_len = ((e[10] as usize & 0x0F) << 8) | e[11] as usize;
            if offset + 12 + desc_len > data.len() {
                return Err(DecodeError::Malformed("EIT event loop"));
            }
            eit.events.push(EitEvent {
                event_id: u16::from_be_bytes([e[0], e[1]]),
                start_time: decode_start_time(&e[2..7]),
                duration: decode_duration(&e[7..10]),
                running_status: e[10] >> 5,
                free_ca_mode: e[10] & 0x10 != 0,
                descriptors: descriptors(&e[12..12 + desc_len]),
            });
            offset += 12 + desc_len;
        }
        Ok(eit)
    }

    pub fn is_present_following(&self) -> bool {
        self.kind == EitKind::PresentFollowing
    }
}

/// Classify a TS EIT table id.
pub fn ts_eit_kind(tid: u8) -> Option<EitKind> {
    match tid {
        table_id::EIT_PF_ACTUAL | table_id::EIT_PF_OTHER => Some(EitKind::PresentFollowing),
        table_id::EIT_SCHEDULE_ACTUAL_FIRST..=table_id::EIT_SCHEDULE_OTHER_LAST => {
            let idx = tid & 0x0F;
            Some(EitKind::Schedule {
                track: if idx < 8 { Track::Basic } else { Track::Extended },
                slot: idx & 0x07,
            })
        }
        _ => None,
    }
}

/// Decode the ARIB TS event descriptors, skipping undecodable ones.
pub fn ts_event_descriptors(data: &[u8]) -> Vec<EventDescriptor> {
    let mut out = Vec::new();
    for d in DescriptorIter::new(data) {
        let decoded = match d.tag {
            descriptor_tag::SHORT_EVENT => ShortEventDescriptor::parse(d.data).map(|s| {
                EventDescriptor::Short {
                    name: s.event_name,
                    text: s.text,
                }
            }),
            descriptor_tag::EXTENDED_EVENT => {
                ExtendedEventDescriptor::parse(d.data).map(EventDescriptor::Extended)
            }
            descriptor_tag::COMPONENT => parse_component(d.data).map(EventDescriptor::Component),
            descriptor_tag::CONTENT => Ok(EventDescriptor::Content(parse_content(d.data))),
            descriptor_tag::AUDIO_COMPONENT => {
                parse_audio_component(d.data).map(EventDescriptor::Audio)
            }
            descriptor_tag::SERIES => {
                parse_series(d.data, TextCodec::Arib).map(EventDescriptor::Series)
            }
            descriptor_tag::EVENT_GROUP => parse_event_group(d.data).map(EventDescriptor::Group),
            _ => continue,
        };
        match decoded {
            Ok(desc) => out.push(desc),
            Err(e) => debug!("[Epg] Skipping descriptor 0x{:02X}: {}", d.tag, e),
        }
    }
    out
}
