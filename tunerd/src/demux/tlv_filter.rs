//! TLV/MMT packet filter.
//!
//! Non-MMTP TLV packets (TLV-SI, plain IP such as NTP) always reach the
//! sink; TLV null packets never do. With a target service, MMTP packets are
//! kept for the PA packet id, the target MPT packet id, the MPT asset
//! packet ids and the SI packet ids.

use std::collections::HashSet;

use log::{debug, warn};
use tokio::time::Instant;
use tunerd_model::FilterError;

use super::filter::{CloseReason, FilterCore, FilterStats};
use super::sink::StreamSink;
use super::{Demuxer, FilterConfig, FilterContext, ProvidePids};
use crate::mmt::mmtp::{mmt_tables, MessageAssembler, MmtTable, MmtpPacket, SignallingMessage};
use crate::mmt::tables::{parse_mh_eit, parse_mh_sdt, MptTable, PltTable};
use crate::mmt::tlv::{is_known_type, packet_len, packet_type, TlvPacket, TLV_SYNC};
use crate::mmt::{table_id, PLT_PACKET_ID};
use crate::ts_analyzer::cdt::CdtTable;
use crate::ts_analyzer::nit::NitTable;
use crate::ts_analyzer::psi::PsiSection;

/// Packet id of CA messages.
const CA_MESSAGE_PACKET_ID: u16 = 0x0001;

/// Packet ids carrying M2 section messages (MH-EIT, MH-SDT, MH-CDT, ...).
fn is_si_packet_id(packet_id: u16) -> bool {
    (0x8000..=0x8FFF).contains(&packet_id)
}

/// Filter for TLV-framed MMT streams.
pub struct TlvFilter {
    core: FilterCore,
    tail: Vec<u8>,
    provide: ProvidePids,
    assembler: MessageAssembler,
    mpt_packet_id: Option<u16>,
    asset_packet_ids: Vec<u16>,
}

impl TlvFilter {
    pub fn new(config: FilterConfig, ctx: FilterContext, sink: Option<Box<dyn StreamSink>>) -> Self {
        let provide = if config.service_id.is_some() {
            ProvidePids::Set(Self::base_packet_ids())
        } else {
            ProvidePids::All
        };
        Self {
            core: FilterCore::new("TlvFilter", config, ctx, sink),
            tail: Vec::new(),
            provide,
            assembler: MessageAssembler::new(),
            mpt_packet_id: None,
            asset_packet_ids: Vec::new(),
        }
    }

    fn base_packet_ids() -> HashSet<u16> {
        [PLT_PACKET_ID, CA_MESSAGE_PACKET_ID].into_iter().collect()
    }

    fn consume<'a>(&mut self, data: &'a [u8], now: Instant) -> &'a [u8] {
        let mut pos = 0;
        while pos < data.len() && !self.core.is_closed() {
            let valid_start = data[pos] == TLV_SYNC
                && data.get(pos + 1).map_or(true, |&t| is_known_type(t));
            if !valid_start {
                let skip = 1 + data[pos + 1..]
                    .iter()
                    .position(|&b| b == TLV_SYNC)
                    .unwrap_or(data.len() - pos - 1);
                self.core.count_resync(skip);
                pos += skip;
                continue;
            }
            let Some(len) = packet_len(&data[pos..]) else {
                break;
            };
            if pos + len > data.len() {
                break;
            }
            self.process_packet(&data[pos..pos + len], now);
            pos += len;
        }
        &data[pos..]
    }

    fn process_packet(&mut self, raw: &[u8], now: Instant) {
        self.core.count_packet();
        let tlv = match TlvPacket::parse(raw) {
            Ok(tlv) => tlv,
            Err(e) => {
                debug!("[TlvFilter] Bad packet: {}", e);
                self.core.count_malformed();
                return;
            }
        };

        match tlv.packet_type {
            packet_type::NULL => {}
            packet_type::SIGNALLING => {
                self.handle_tlv_si(tlv.data);
                self.core.provide(raw);
            }
            packet_type::COMPRESSED_IP => {
                let Some(mmtp) = tlv.mmtp_payload().and_then(|p| MmtpPacket::parse(p).ok()) else {
                    self.core.provide(raw);
                    return;
                };
                if mmtp.is_signalling() {
                    self.handle_signalling(&mmtp, now);
                }
                if !self.core.is_closed() && self.provides(mmtp.packet_id) {
                    self.core.provide(raw);
                }
            }
            _ => self.core.provide(raw),
        }
    }

    fn provides(&self, packet_id: u16) -> bool {
        self.provide.contains(packet_id) || is_si_packet_id(packet_id)
    }

    fn handle_tlv_si(&mut self, data: &[u8]) {
        if !self.core.config().parse_nit {
            return;
        }
        let Ok(section) = PsiSection::parse_checked(data) else {
            return;
        };
        let h = &section.header;
        if h.table_id != table_id::TLV_NIT_ACTUAL {
            return;
        }
        if self
            .core
            .first_sight((h.table_id, h.table_id_extension, h.section_number, h.version_number))
        {
            match NitTable::parse(&section) {
                Ok(nit) => self.core.handle_nit(&nit),
                Err(e) => debug!("[TlvFilter] TLV-NIT: {}", e),
            }
        }
    }

    fn handle_signalling(&mut self, mmtp: &MmtpPacket<'_>, now: Instant) {
        let messages = match self.assembler.push(mmtp) {
            Ok(messages) => messages,
            Err(e) => {
                debug!("[TlvFilter] Signalling payload: {}", e);
                return;
            }
        };
        for message in messages {
            match SignallingMessage::parse(&message) {
                Ok(SignallingMessage::PackageAccess { tables, .. }) => {
                    for table in mmt_tables(tables) {
                        match table.table_id {
                            table_id::PLT => self.on_plt(&table),
                            table_id::MPT => self.on_mpt(&table),
                            _ => {}
                        }
                    }
                }
                Ok(SignallingMessage::Section(section)) => self.handle_section(section, now),
                Ok(SignallingMessage::Other(_)) => {}
                Err(e) => debug!("[TlvFilter] Signalling message: {}", e),
            }
        }
    }

    fn on_plt(&mut self, table: &MmtTable<'_>) {
        let Some(service_id) = self.core.config().service_id else {
            return;
        };
        if !self.core.first_sight((table_id::PLT, 0, 0, table.version)) {
            return;
        }
        let plt = match PltTable::parse(table.version, table.body) {
            Ok(plt) => plt,
            Err(e) => {
                debug!("[TlvFilter] PLT: {}", e);
                return;
            }
        };
        match plt.find(service_id).and_then(|p| p.mpt_packet_id) {
            Some(packet_id) => {
                self.mpt_packet_id = Some(packet_id);
                self.rebuild_provide();
            }
            None => warn!("[TlvFilter] Service {} is not listed in PLT", service_id),
        }
    }

    fn on_mpt(&mut self, table: &MmtTable<'_>) {
        let Some(service_id) = self.core.config().service_id else {
            return;
        };
        let mpt = match MptTable::parse(table.version, table.body) {
            Ok(mpt) => mpt,
            Err(e) => {
                debug!("[TlvFilter] MPT: {}", e);
                return;
            }
        };
        if mpt.package_id != service_id
            || !self.core.first_sight((table_id::MPT, service_id, 0, table.version))
        {
            return;
        }
        self.asset_packet_ids = mpt.packet_ids();
        self.rebuild_provide();
        self.core.set_service_ready();
    }

    fn rebuild_provide(&mut self) {
        let mut ids = Self::base_packet_ids();
        ids.extend(self.mpt_packet_id);
        ids.extend(self.asset_packet_ids.iter().copied());
        self.provide = ProvidePids::Set(ids);
    }

    fn handle_section(&mut self, bytes: &[u8], now: Instant) {
        let section = match PsiSection::parse_checked(bytes) {
            Ok(section) => section,
            Err(e) => {
                debug!("[TlvFilter] Dropping section: {}", e);
                self.core.count_malformed();
                return;
            }
        };
        let h = &section.header;
        let key = (h.table_id, h.table_id_extension, h.section_number, h.version_number);
        let config = self.core.config();

        match h.table_id {
            table_id::MH_EIT_PF..=table_id::MH_EIT_SCHEDULE_LAST => {
                if config.parse_eit || config.event_id.is_some() {
                    match parse_mh_eit(&section) {
                        Ok(eit) => self.core.handle_eit(&eit, now),
                        Err(e) => debug!("[TlvFilter] MH-EIT: {}", e),
                    }
                }
            }
            table_id::MH_SDT_ACTUAL => {
                if config.parse_sdt && self.core.first_sight(key) {
                    match parse_mh_sdt(&section) {
                        Ok(sdt) => self.core.handle_sdt(&sdt),
                        Err(e) => debug!("[TlvFilter] MH-SDT: {}", e),
                    }
                }
            }
            table_id::MH_CDT => {
                if config.parse_logo {
                    match CdtTable::parse(&section) {
                        Ok(cdt) => self.core.handle_cdt(&cdt),
                        Err(e) => debug!("[TlvFilter] MH-CDT: {}", e),
                    }
                }
            }
            _ => {}
        }
    }

    fn release(&mut self) {
        self.assembler.clear();
        self.tail.clear();
    }
}

impl Demuxer for TlvFilter {
    fn write(&mut self, chunk: &[u8]) -> Result<(), FilterError> {
        if self.core.is_closed() {
            return Err(FilterError::Closed);
        }
        let now = Instant::now();
        let tail = std::mem::take(&mut self.tail);
        if tail.is_empty() {
            self.tail = self.consume(chunk, now).to_vec();
        } else {
            let mut data = tail;
            data.extend_from_slice(chunk);
            self.tail = self.consume(&data, now).to_vec();
        }

        if self.core.is_closed() {
            self.release();
        } else {
            self.core.flush();
        }
        Ok(())
    }

    fn on_tick(&mut self, now: Instant) {
        self.core.on_tick(now);
        if self.core.is_closed() {
            self.release();
        }
    }

    fn close(&mut self) {
        self.core.close(CloseReason::Requested);
        self.release();
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    fn stats(&self) -> FilterStats {
        self.core.stats()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tunerd_model::{program_id, ChannelKey, ChannelType};

    use super::*;
    use crate::demux::sink::ChannelSink;
    use crate::demux::testutil::{context, test_config};
    use crate::mmt::tables::testutil::{mh_eit_pf, mh_short_event, mpt_body, plt_body};

    fn tlv(packet_type: u8, data: &[u8]) -> Vec<u8> {
        let mut out = vec![TLV_SYNC, packet_type];
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(data);
        out
    }

    /// Header-compressed IP packet carrying one MMTP packet.
    fn mmtp(packet_id: u16, payload_type: u8, seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0x00, 0x10, 0x61, 0x40, payload_type];
        data.extend_from_slice(&packet_id.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&seq.to_be_bytes());
        data.extend_from_slice(payload);
        tlv(packet_type::COMPRESSED_IP, &data)
    }

    /// Unfragmented signalling packet.
    fn signalling(packet_id: u16, message: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x00, 0x00];
        payload.extend_from_slice(message);
        mmtp(packet_id, 0x02, 0, &payload)
    }

    fn pa_message(tables: &[(u8, &[u8])]) -> Vec<u8> {
        let mut body = vec![tables.len() as u8];
        for (tid, table) in tables {
            body.extend_from_slice(&[*tid, 0x00]);
            body.extend_from_slice(&((table.len() + 4) as u16).to_be_bytes());
        }
        for (tid, table) in tables {
            body.extend_from_slice(&[*tid, 0x00]);
            body.extend_from_slice(&(table.len() as u16).to_be_bytes());
            body.extend_from_slice(table);
        }
        let mut msg = vec![0x00, 0x00, 0x00];
        msg.extend_from_slice(&(body.len() as u32).to_be_bytes());
        msg.extend_from_slice(&body);
        msg
    }

    fn m2_section_message(section: &[u8]) -> Vec<u8> {
        let mut msg = vec![0x80, 0x00, 0x00];
        msg.extend_from_slice(&(section.len() as u16).to_be_bytes());
        msg.extend_from_slice(section);
        msg
    }

    fn tlv_config() -> FilterConfig {
        FilterConfig {
            channel: ChannelKey::new(ChannelType::Bs4k, "BS01_0"),
            ..test_config()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_service_selection_via_plt_and_mpt() {
        let mut config = tlv_config();
        config.service_id = Some(0x0101);
        let (sink, mut rx) = ChannelSink::channel(16);
        let mut filter = TlvFilter::new(config, context(), Some(Box::new(sink)));

        let plt = signalling(
            PLT_PACKET_ID,
            &pa_message(&[(table_id::PLT, &plt_body(&[(0x0101, 0x0010), (0x0102, 0x0011)]))]),
        );
        let mpt = signalling(
            0x0010,
            &pa_message(&[(table_id::MPT, &mpt_body(0x0101, &[(b"hev1", 0x0100), (b"mp4a", 0x0110)]))]),
        );
        let other_mpt = signalling(
            0x0011,
            &pa_message(&[(table_id::MPT, &mpt_body(0x0102, &[(b"hev1", 0x0200)]))]),
        );
        let video = mmtp(0x0100, 0x00, 1, &[0xAA; 8]);
        let other_video = mmtp(0x0200, 0x00, 1, &[0xBB; 8]);
        let null = tlv(packet_type::NULL, &[0xFF; 6]);
        let ntp = tlv(packet_type::IPV4, &[0x45; 28]);

        filter.write(&plt).unwrap();
        assert!(!filter.is_ready());
        for packet in [&mpt, &other_mpt, &video, &other_video, &null, &ntp] {
            filter.write(packet).unwrap();
        }
        assert!(filter.is_ready());

        let expected: Vec<u8> = [plt, mpt, video, ntp].concat();
        assert_eq!(drain(&mut rx), expected);
    }

    #[tokio::test]
    async fn test_reframing_and_null_packets() {
        let (sink, mut rx) = ChannelSink::channel(16);
        let mut filter = TlvFilter::new(tlv_config(), context(), Some(Box::new(sink)));

        let a = mmtp(0x0100, 0x00, 1, &[1; 20]);
        let b = tlv(packet_type::IPV4, &[0x45; 28]);
        let null = tlv(packet_type::NULL, &[0xFF; 4]);
        let mut stream = vec![0x00, TLV_SYNC, 0x10];
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&null);
        stream.extend_from_slice(&b);

        for chunk in stream.chunks(7) {
            filter.write(chunk).unwrap();
        }
        assert_eq!(drain(&mut rx), [a, b].concat());
        let stats = filter.stats();
        assert_eq!(stats.resync_bytes, 3);
        assert_eq!(stats.packets_in, 3);
    }

    #[tokio::test]
    async fn test_mh_eit_reaches_epg() {
        let ctx = context();
        let catalog = ctx.catalog.clone();
        let mut config = tlv_config();
        config.parse_eit = true;
        let mut filter = TlvFilter::new(config, ctx, None);

        let start = chrono::Utc::now().timestamp_millis() / 1000 * 1000;
        let section = mh_eit_pf(0x0101, 4, 7, start, &mh_short_event("News", "Headlines"));
        filter
            .write(&signalling(0x8000, &m2_section_message(&section)))
            .unwrap();

        let program = catalog.programs.get(program_id(4, 0x0101, 7)).unwrap();
        assert_eq!(program.name.as_deref(), Some("News"));
        assert_eq!(program.description.as_deref(), Some("Headlines"));
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let mut filter = TlvFilter::new(tlv_config(), context(), None);
        filter.close();
        filter.close();
        assert_eq!(filter.write(&[TLV_SYNC]), Err(FilterError::Closed));
    }
}
