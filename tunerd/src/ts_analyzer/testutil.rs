//! Packet and section builders for tests.

use super::packet::{SYNC_BYTE, TS_PACKET_SIZE};
use super::psi::build_long_section;
use super::time::encode_start_time;
use super::{descriptor_tag, pid, table_id};

/// Encode ASCII text as ARIB 8-unit code (LS1 + MSZ + alphanumerics).
pub fn arib_ascii(s: &str) -> Vec<u8> {
    let mut out = vec![0x0E, 0x89];
    out.extend_from_slice(s.as_bytes());
    out
}

/// Build one TS packet with the given payload (padded with 0xFF).
pub fn ts_packet(pid: u16, cc: u8, pusi: bool, payload: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(TS_PACKET_SIZE);
    p.push(SYNC_BYTE);
    p.push(((pid >> 8) as u8 & 0x1F) | if pusi { 0x40 } else { 0x00 });
    p.push(pid as u8);
    p.push(0x10 | (cc & 0x0F));
    let take = payload.len().min(TS_PACKET_SIZE - 4);
    p.extend_from_slice(&payload[..take]);
    p.resize(TS_PACKET_SIZE, 0xFF);
    p
}

/// Split a section into TS packets starting at continuity counter `cc`.
pub fn packetize(pid: u16, section: &[u8], cc: u8) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut first = vec![0u8];
    let head = section.len().min(TS_PACKET_SIZE - 5);
    first.extend_from_slice(&section[..head]);
    packets.push(ts_packet(pid, cc, true, &first));

    let mut cc = cc;
    for chunk in section[head..].chunks(TS_PACKET_SIZE - 4) {
        cc = (cc + 1) & 0x0F;
        packets.push(ts_packet(pid, cc, false, chunk));
    }
    packets
}

/// Concatenate packets into one byte stream.
pub fn concat(packets: &[Vec<u8>]) -> Vec<u8> {
    packets.iter().flatten().copied().collect()
}

/// PAT with NIT on 0x0010 and the given `(program_number, pmt_pid)` entries.
pub fn pat_section(tsid: u16, version: u8, programs: &[(u16, u16)]) -> Vec<u8> {
    let mut body = vec![0x00, 0x00, 0xE0, pid::NIT as u8];
    for &(program, pmt_pid) in programs {
        body.extend_from_slice(&program.to_be_bytes());
        body.extend_from_slice(&[0xE0 | (pmt_pid >> 8) as u8, pmt_pid as u8]);
    }
    build_long_section(table_id::PAT, tsid, version, 0, 0, &body)
}

/// PMT with `(stream_type, pid)` streams and an optional program-level ECM PID.
pub fn pmt_section(program: u16, pcr_pid: u16, streams: &[(u8, u16)], ecm_pid: Option<u16>) -> Vec<u8> {
    let mut info = Vec::new();
    if let Some(ecm) = ecm_pid {
        info.extend_from_slice(&[descriptor_tag::CA, 4, 0x00, 0x05, 0xE0 | (ecm >> 8) as u8, ecm as u8]);
    }
    let mut body = vec![0xE0 | (pcr_pid >> 8) as u8, pcr_pid as u8];
    body.extend_from_slice(&[0xF0 | (info.len() >> 8) as u8, info.len() as u8]);
    body.extend_from_slice(&info);
    for &(stream_type, es_pid) in streams {
        body.extend_from_slice(&[stream_type, 0xE0 | (es_pid >> 8) as u8, es_pid as u8, 0xF0, 0x00]);
    }
    build_long_section(table_id::PMT, program, 0, 0, 0, &body)
}

/// NIT with one transport stream listing `services` and a TS information descriptor.
pub fn nit_section(network_id: u16, tsid: u16, services: &[u16], remote_key: u8) -> Vec<u8> {
    let mut ts_desc = vec![descriptor_tag::SERVICE_LIST, (services.len() * 3) as u8];
    for &sid in services {
        ts_desc.extend_from_slice(&sid.to_be_bytes());
        ts_desc.push(0x01);
    }
    ts_desc.extend_from_slice(&[descriptor_tag::TS_INFORMATION, 2, remote_key, 0x00]);

    let mut body = vec![0xF0, 0x00];
    let loop_len = 6 + ts_desc.len();
    body.extend_from_slice(&[0xF0 | (loop_len >> 8) as u8, loop_len as u8]);
    body.extend_from_slice(&tsid.to_be_bytes());
    body.extend_from_slice(&network_id.to_be_bytes());
    body.extend_from_slice(&[0xF0 | (ts_desc.len() >> 8) as u8, ts_desc.len() as u8]);
    body.extend_from_slice(&ts_desc);
    build_long_section(table_id::NIT_ACTUAL, network_id, 0, 0, 0, &body)
}

/// SDT actual with `(service_id, service_type, name, logo_id)` entries.
pub fn sdt_section(tsid: u16, onid: u16, services: &[(u16, u8, &str, Option<u16>)]) -> Vec<u8> {
    let mut body = onid.to_be_bytes().to_vec();
    body.push(0xFF);
    for &(sid, service_type, name, logo_id) in services {
        let name = arib_ascii(name);
        let mut desc = vec![descriptor_tag::SERVICE, (3 + name.len()) as u8, service_type, 0, name.len() as u8];
        desc.extend_from_slice(&name);
        if let Some(logo) = logo_id {
            desc.extend_from_slice(&[descriptor_tag::LOGO_TRANSMISSION, 3, 0x02, 0xFE | (logo >> 8) as u8, logo as u8]);
        }
        body.extend_from_slice(&sid.to_be_bytes());
        body.push(0xFF);
        body.extend_from_slice(&[0x80 | (desc.len() >> 8) as u8, desc.len() as u8]);
        body.extend_from_slice(&desc);
    }
    build_long_section(table_id::SDT_ACTUAL, tsid, 0, 0, 0, &body)
}

/// Event builder for EIT sections.
#[derive(Debug, Clone)]
pub struct TestEvent {
    pub event_id: u16,
    pub start: Option<i64>,
    pub duration_ms: i64,
    pub free_ca: bool,
    pub descriptors: Vec<u8>,
}

impl TestEvent {
    pub fn new(event_id: u16, start: i64, duration_ms: i64) -> Self {
        Self {
            event_id,
            start: Some(start),
            duration_ms,
            free_ca: false,
            descriptors: Vec::new(),
        }
    }

    pub fn unknown_start(mut self) -> Self {
        self.start = None;
        self
    }

    pub fn scrambled(mut self) -> Self {
        self.free_ca = true;
        self
    }

    pub fn raw(mut self, tag: u8, data: &[u8]) -> Self {
        self.descriptors.push(tag);
        self.descriptors.push(data.len() as u8);
        self.descriptors.extend_from_slice(data);
        self
    }

    pub fn short(self, name: &str, text: &str) -> Self {
        let name = arib_ascii(name);
        let text = arib_ascii(text);
        let mut d = b"jpn".to_vec();
        d.push(name.len() as u8);
        d.extend_from_slice(&name);
        d.push(text.len() as u8);
        d.extend_from_slice(&text);
        self.raw(descriptor_tag::SHORT_EVENT, &d)
    }

    /// Extended event fragment; an empty description continues the previous item.
    pub fn extended(self, number: u8, last: u8, items: &[(&str, &str)]) -> Self {
        let mut item_bytes = Vec::new();
        for &(desc, item) in items {
            let desc = if desc.is_empty() { Vec::new() } else { arib_ascii(desc) };
            let item = if item.is_empty() { Vec::new() } else { arib_ascii(item) };
            item_bytes.push(desc.len() as u8);
            item_bytes.extend_from_slice(&desc);
            item_bytes.push(item.len() as u8);
            item_bytes.extend_from_slice(&item);
        }
        let mut d = vec![(number << 4) | (last & 0x0F)];
        d.extend_from_slice(b"jpn");
        d.push(item_bytes.len() as u8);
        d.extend_from_slice(&item_bytes);
        d.push(0);
        self.raw(descriptor_tag::EXTENDED_EVENT, &d)
    }

    pub fn content(self, lv1: u8, lv2: u8) -> Self {
        self.raw(descriptor_tag::CONTENT, &[(lv1 << 4) | lv2, 0xFF])
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = self.event_id.to_be_bytes().to_vec();
        match self.start {
            Some(ts) => out.extend_from_slice(&encode_start_time(ts)),
            None => out.extend_from_slice(&[0xFF; 5]),
        }
        let secs = self.duration_ms / 1000;
        let to_bcd = |v: i64| (((v / 10) << 4) | (v % 10)) as u8;
        out.extend_from_slice(&[to_bcd(secs / 3600), to_bcd(secs / 60 % 60), to_bcd(secs % 60)]);
        let status = 0x80 | if self.free_ca { 0x10 } else { 0x00 };
        out.push(status | (self.descriptors.len() >> 8) as u8);
        out.push(self.descriptors.len() as u8);
        out.extend_from_slice(&self.descriptors);
        out
    }
}

/// EIT section where the segment covers every section and `last_table_id == tid`.
pub fn eit_section(
    tid: u8,
    service_id: u16,
    onid: u16,
    version: u8,
    section_number: u8,
    last_section_number: u8,
    events: &[TestEvent],
) -> Vec<u8> {
    eit_section_full(
        tid,
        service_id,
        onid,
        version,
        section_number,
        last_section_number,
        last_section_number,
        tid,
        events,
    )
}

/// EIT section with explicit segment and table bounds.
#[allow(clippy::too_many_arguments)]
pub fn eit_section_full(
    tid: u8,
    service_id: u16,
    onid: u16,
    version: u8,
    section_number: u8,
    last_section_number: u8,
    segment_last_section_number: u8,
    last_table_id: u8,
    events: &[TestEvent],
) -> Vec<u8> {
    let mut body = onid.to_be_bytes().to_vec(); // transport_stream_id
    body.extend_from_slice(&onid.to_be_bytes());
    body.push(segment_last_section_number);
    body.push(last_table_id);
    for e in events {
        body.extend_from_slice(&e.encode());
    }
    build_long_section(tid, service_id, version, section_number, last_section_number, &body)
}

/// CDT (or MH-CDT) section carrying one logo data module.
#[allow(clippy::too_many_arguments)]
pub fn cdt_section(
    tid: u8,
    onid: u16,
    version: u8,
    logo_id: u16,
    logo_type: u8,
    section_number: u8,
    last_section_number: u8,
    data_size: u16,
    data: &[u8],
) -> Vec<u8> {
    let mut body = onid.to_be_bytes().to_vec();
    body.push(0x01);
    body.extend_from_slice(&[0xF0, 0x00]);
    body.push(logo_type);
    body.extend_from_slice(&[0xFE | (logo_id >> 8) as u8, logo_id as u8]);
    body.extend_from_slice(&[0xF0, 0x01]);
    body.extend_from_slice(&data_size.to_be_bytes());
    body.extend_from_slice(data);
    build_long_section(tid, 0x0001, version, section_number, last_section_number, &body)
}
