//! Catalog types shared by the tunerd engine.
//!
//! Channels are the physical tuning targets, services are discovered inside
//! a channel, and programs are EPG events belonging to a service.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Service item id (`network_id * 100000 + service_id`).
pub type ServiceItemId = u64;

/// Program item id (`service_item_id * 100000 + event_id`).
pub type ProgramId = u64;

/// Epoch milliseconds.
pub type Timestamp = i64;

/// Derive the stable service item id.
pub fn service_item_id(network_id: u16, service_id: u16) -> ServiceItemId {
    network_id as u64 * 100_000 + service_id as u64
}

/// Derive the stable program id.
pub fn program_id(network_id: u16, service_id: u16, event_id: u16) -> ProgramId {
    service_item_id(network_id, service_id) * 100_000 + event_id as u64
}

/// Broadcast channel type.
///
/// Based on the delivery system of the physical channel:
/// - GR: Digital terrestrial television (地上波)
/// - BS: BS satellite
/// - CS: 110度CS satellite
/// - BS4K: Advanced BS digital, carried as TLV/MMT instead of MPEG-TS
/// - SKY: 124/128度CS and anything else
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelType {
    #[serde(rename = "GR")]
    Gr,
    #[serde(rename = "BS")]
    Bs,
    #[serde(rename = "CS")]
    Cs,
    #[serde(rename = "BS4K")]
    Bs4k,
    #[serde(rename = "SKY")]
    Sky,
}

impl ChannelType {
    /// All channel types.
    pub const ALL: [ChannelType; 5] = [
        ChannelType::Gr,
        ChannelType::Bs,
        ChannelType::Cs,
        ChannelType::Bs4k,
        ChannelType::Sky,
    ];

    /// Whether the channel delivers TLV-encapsulated MMT instead of 188-byte TS packets.
    pub fn is_tlv(&self) -> bool {
        matches!(self, ChannelType::Bs4k)
    }

    /// Short name used in configuration and remote URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Gr => "GR",
            ChannelType::Bs => "BS",
            ChannelType::Cs => "CS",
            ChannelType::Bs4k => "BS4K",
            ChannelType::Sky => "SKY",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GR" => Ok(ChannelType::Gr),
            "BS" => Ok(ChannelType::Bs),
            "CS" => Ok(ChannelType::Cs),
            "BS4K" => Ok(ChannelType::Bs4k),
            "SKY" => Ok(ChannelType::Sky),
            other => Err(format!("unknown channel type: {}", other)),
        }
    }
}

/// LNB polarity for satellite tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    #[serde(rename = "H")]
    Horizontal,
    #[serde(rename = "V")]
    Vertical,
}

impl Polarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Polarity::Horizontal => "H",
            Polarity::Vertical => "V",
        }
    }
}

/// Tuning parameters substituted into capture command templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningParams {
    /// Satellite name (`<satellite>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellite: Option<String>,
    /// Tuning space (`<space>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<u32>,
    /// Frequency (`<freq>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<f64>,
    /// Polarity (`<polarity>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polarity: Option<Polarity>,
}

/// Key of a channel: its type plus the channel string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub channel: String,
}

impl ChannelKey {
    pub fn new(channel_type: ChannelType, channel: impl Into<String>) -> Self {
        Self {
            channel_type,
            channel: channel.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_type, self.channel)
    }
}

/// Physical tuning target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    /// Channel string (e.g. "27", "BS15_0").
    pub channel: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tuning: TuningParams,
    /// Relative TS number inside a TSMF multiplex (CATV relay).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tsmf_rel_ts: Option<u8>,
}

impl Channel {
    pub fn new(channel_type: ChannelType, channel: impl Into<String>) -> Self {
        Self {
            channel_type,
            channel: channel.into(),
            name: String::new(),
            tuning: TuningParams::default(),
            tsmf_rel_ts: None,
        }
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.channel_type, self.channel.clone())
    }

    /// Whether two channels resolve to the same physical tuning.
    pub fn same_tuning(&self, other: &Channel) -> bool {
        self.channel_type == other.channel_type
            && self.channel == other.channel
            && self.tsmf_rel_ts == other.tsmf_rel_ts
    }
}

/// A broadcast service inside a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: ServiceItemId,
    pub service_id: u16,
    pub network_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_stream_id: Option<u16>,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_control_key_id: Option<u8>,
    pub epg_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epg_updated_at: Option<Timestamp>,
    /// Back reference to the owning channel.
    pub channel: ChannelKey,
}

impl Service {
    pub fn new(network_id: u16, service_id: u16, channel: ChannelKey) -> Self {
        Self {
            id: service_item_id(network_id, service_id),
            service_id,
            network_id,
            transport_stream_id: None,
            name: String::new(),
            service_type: 0,
            logo_id: None,
            remote_control_key_id: None,
            epg_ready: false,
            epg_updated_at: None,
            channel,
        }
    }
}

/// Partial update of a service. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServicePatch {
    pub transport_stream_id: Option<u16>,
    pub name: Option<String>,
    pub service_type: Option<u8>,
    pub logo_id: Option<u16>,
    pub remote_control_key_id: Option<u8>,
    pub epg_ready: Option<bool>,
    pub epg_updated_at: Option<Timestamp>,
}

impl ServicePatch {
    /// Apply the patch. Returns true if anything changed.
    pub fn apply(&self, service: &mut Service) -> bool {
        let mut changed = false;
        macro_rules! set {
            ($field:ident) => {
                if let Some(v) = &self.$field {
                    if service.$field != *v {
                        service.$field = v.clone();
                        changed = true;
                    }
                }
            };
            (opt $field:ident) => {
                if let Some(v) = &self.$field {
                    if service.$field.as_ref() != Some(v) {
                        service.$field = Some(v.clone());
                        changed = true;
                    }
                }
            };
        }
        set!(opt transport_stream_id);
        set!(name);
        set!(service_type);
        set!(opt logo_id);
        set!(opt remote_control_key_id);
        set!(epg_ready);
        set!(opt epg_updated_at);
        changed
    }
}

/// Content genre (content descriptor nibbles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genre {
    pub lv1: u8,
    pub lv2: u8,
    pub un1: u8,
    pub un2: u8,
}

/// Video stream information of a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    /// "mpeg2", "h.264" or "h.265".
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub video_type: Option<String>,
    /// "480i", "1080i", "2160p", ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    pub stream_content: u8,
    pub component_type: u8,
}

/// Audio stream information of a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInfo {
    pub component_type: u8,
    pub component_tag: u16,
    pub is_main: bool,
    /// Sampling rate in Hz.
    pub sampling_rate: u32,
    /// ISO 639 language codes.
    pub langs: Vec<String>,
}

/// Series information of a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesInfo {
    pub id: u16,
    pub repeat: u8,
    pub pattern: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
    pub episode: u16,
    pub last_episode: u16,
    pub name: String,
}

/// Relation type of a related event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelatedItemType {
    Shared,
    Relay,
    Movement,
}

/// Event referenced from an event group descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedItem {
    #[serde(rename = "type")]
    pub item_type: RelatedItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<u16>,
    pub service_id: u16,
    pub event_id: u16,
}

/// An EPG event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub id: ProgramId,
    pub event_id: u16,
    pub service_id: u16,
    pub network_id: u16,
    pub start_at: Timestamp,
    /// Duration in milliseconds.
    pub duration: i64,
    pub is_free: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genres: Option<Vec<Genre>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audios: Option<Vec<AudioInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<SeriesInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_items: Option<Vec<RelatedItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub present_flag: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following_flag: Option<bool>,
}

impl Program {
    pub fn new(
        network_id: u16,
        service_id: u16,
        event_id: u16,
        start_at: Timestamp,
        duration: i64,
        is_free: bool,
    ) -> Self {
        Self {
            id: program_id(network_id, service_id, event_id),
            event_id,
            service_id,
            network_id,
            start_at,
            duration,
            is_free,
            name: None,
            description: None,
            genres: None,
            video: None,
            audios: None,
            series: None,
            extended: None,
            related_items: None,
            present_flag: None,
            following_flag: None,
        }
    }

    pub fn end_at(&self) -> Timestamp {
        self.start_at + self.duration
    }

    /// Whether `[start_at, end_at)` intersects the other program's interval.
    pub fn overlaps(&self, other: &Program) -> bool {
        self.start_at < other.end_at() && other.start_at < self.end_at()
    }

    /// Whether the entry was learned from a present/following table.
    pub fn has_pf_confidence(&self) -> bool {
        self.present_flag.is_some() || self.following_flag.is_some()
    }

    pub fn service_item_id(&self) -> ServiceItemId {
        service_item_id(self.network_id, self.service_id)
    }
}

/// Partial update of a program. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramPatch {
    pub start_at: Option<Timestamp>,
    pub duration: Option<i64>,
    pub is_free: Option<bool>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub genres: Option<Vec<Genre>>,
    pub video: Option<VideoInfo>,
    pub audios: Option<Vec<AudioInfo>>,
    pub series: Option<SeriesInfo>,
    pub extended: Option<BTreeMap<String, String>>,
    pub related_items: Option<Vec<RelatedItem>>,
    pub present_flag: Option<bool>,
    pub following_flag: Option<bool>,
}

impl ProgramPatch {
    pub fn is_empty(&self) -> bool {
        *self == ProgramPatch::default()
    }

    /// Apply the patch. Returns true if anything changed.
    pub fn apply(&self, program: &mut Program) -> bool {
        let mut changed = false;
        macro_rules! set {
            ($field:ident) => {
                if let Some(v) = &self.$field {
                    if program.$field != *v {
                        program.$field = v.clone();
                        changed = true;
                    }
                }
            };
            (opt $field:ident) => {
                if let Some(v) = &self.$field {
                    if program.$field.as_ref() != Some(v) {
                        program.$field = Some(v.clone());
                        changed = true;
                    }
                }
            };
        }
        set!(start_at);
        set!(duration);
        set!(is_free);
        set!(opt name);
        set!(opt description);
        set!(opt genres);
        set!(opt video);
        set!(opt audios);
        set!(opt series);
        set!(opt extended);
        set!(opt related_items);
        set!(opt present_flag);
        set!(opt following_flag);
        changed
    }
}

/// Kind of catalog change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Update,
    Remove,
}

/// Change notification pushed by the catalog stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "lowercase")]
pub enum CatalogEvent {
    Service {
        kind: EventKind,
        data: Service,
    },
    Program {
        kind: EventKind,
        data: Program,
    },
}

impl CatalogEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CatalogEvent::Service { kind, .. } | CatalogEvent::Program { kind, .. } => *kind,
        }
    }
}
