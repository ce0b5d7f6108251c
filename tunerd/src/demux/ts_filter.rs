//! MPEG-TS packet filter.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use tokio::time::Instant;
use tunerd_model::FilterError;

use super::filter::{CloseReason, FilterCore, FilterStats};
use super::sink::StreamSink;
use super::tsmf::TsmfSelector;
use super::{Demuxer, FilterConfig, FilterContext, ProvidePids};
use crate::ts_analyzer::packet::{TsPacket, SYNC_BYTE, TS_PACKET_SIZE};
use crate::ts_analyzer::psi::{PsiSection, SectionCollector};
use crate::ts_analyzer::{pid, table_id};
use crate::ts_analyzer::{CatTable, CdtTable, EitSection, NitTable, PatTable, PmtTable, SdtTable};

/// Filter for 188-byte transport streams.
pub struct TsFilter {
    core: FilterCore,
    tail: Vec<u8>,
    tsmf: Option<TsmfSelector>,
    provide: ProvidePids,
    collectors: HashMap<u16, SectionCollector>,
    last_cc: HashMap<u16, u8>,
    pmt_pid: Option<u16>,
    program_pids: Vec<u16>,
    emm_pids: Vec<u16>,
    narrowed_pat: Option<Vec<u8>>,
    pat_cc: u8,
}

impl TsFilter {
    pub fn new(config: FilterConfig, ctx: FilterContext, sink: Option<Box<dyn StreamSink>>) -> Self {
        let provide = if config.service_id.is_some() {
            ProvidePids::Set(pid::ALWAYS_PROVIDED.into_iter().collect())
        } else {
            ProvidePids::All
        };
        let tsmf = config.tsmf_rel_ts.map(TsmfSelector::new);
        Self {
            core: FilterCore::new("TsFilter", config, ctx, sink),
            tail: Vec::with_capacity(TS_PACKET_SIZE),
            tsmf,
            provide,
            collectors: HashMap::new(),
            last_cc: HashMap::new(),
            pmt_pid: None,
            program_pids: Vec::new(),
            emm_pids: Vec::new(),
            narrowed_pat: None,
            pat_cc: 0,
        }
    }

    /// Process every whole packet of `data`; returns the unconsumed tail.
    fn consume<'a>(&mut self, data: &'a [u8], now: Instant) -> &'a [u8] {
        let mut pos = 0;
        while pos < data.len() && !self.core.is_closed() {
            if data[pos] != SYNC_BYTE {
                let skip = data[pos..]
                    .iter()
                    .position(|&b| b == SYNC_BYTE)
                    .unwrap_or(data.len() - pos);
                self.core.count_resync(skip);
                pos += skip;
                continue;
            }
            if pos + TS_PACKET_SIZE > data.len() {
                break;
            }
            self.process_packet(&data[pos..pos + TS_PACKET_SIZE], now);
            pos += TS_PACKET_SIZE;
        }
        &data[pos..]
    }

    fn process_packet(&mut self, packet: &[u8], now: Instant) {
        self.core.count_packet();
        let ts = match TsPacket::parse(packet) {
            Ok(ts) => ts,
            Err(e) => {
                debug!("[TsFilter] Bad packet: {}", e);
                self.core.count_malformed();
                return;
            }
        };
        let pid = ts.header.pid;

        if let Some(tsmf) = &mut self.tsmf {
            if !tsmf.accept(pid, packet) {
                return;
            }
        }
        if ts.header.transport_error {
            self.core.count_error(pid);
            return;
        }

        let cc = ts.header.continuity_counter;
        if pid != pid::NULL && ts.header.has_payload() {
            if let Some(last) = self.last_cc.insert(pid, cc) {
                if !ts.discontinuity && cc != last && cc != (last + 1) & 0x0F {
                    self.core.count_discontinuity(pid);
                }
            }
        }

        if !ts.payload.is_empty() && self.wants_sections(pid) {
            let sections = self
                .collectors
                .entry(pid)
                .or_default()
                .push(ts.payload, cc, ts.header.payload_unit_start);
            for section in sections {
                self.handle_section(pid, &section, now);
            }
        }
        if self.core.is_closed() {
            return;
        }

        if pid == pid::PAT && self.core.config().service_id.is_some() {
            if ts.header.payload_unit_start {
                if let Some(rewritten) = self.narrowed_pat_packet() {
                    self.core.provide(&rewritten);
                }
            }
            return;
        }
        if self.provide.contains(pid) {
            self.core.provide(packet);
        }
    }

    fn wants_sections(&self, pid: u16) -> bool {
        let config = self.core.config();
        match pid {
            pid::PAT | pid::CAT => true,
            pid::NIT => config.parse_nit,
            pid::SDT => config.parse_sdt,
            pid::EIT | pid::EIT_SUB1 | pid::EIT_SUB2 => {
                config.parse_eit || config.event_id.is_some()
            }
            pid::CDT => config.parse_logo,
            _ => Some(pid) == self.pmt_pid,
        }
    }

    fn handle_section(&mut self, pid: u16, bytes: &[u8], now: Instant) {
        let section = match PsiSection::parse_checked(bytes) {
            Ok(section) => section,
            Err(e) => {
                debug!("[TsFilter] Dropping section on PID 0x{:04X}: {}", pid, e);
                self.core.count_malformed();
                return;
            }
        };
        let h = &section.header;
        let key = (h.table_id, h.table_id_extension, h.section_number, h.version_number);

        match h.table_id {
            table_id::PAT if pid == pid::PAT => {
                if self.core.first_sight(key) {
                    self.on_pat(&section);
                }
            }
            table_id::CAT if pid == pid::CAT => {
                if self.core.first_sight(key) {
                    match CatTable::parse(&section) {
                        Ok(cat) => {
                            self.emm_pids = cat.emm_pids;
                            self.rebuild_provide();
                        }
                        Err(e) => debug!("[TsFilter] CAT: {}", e),
                    }
                }
            }
            table_id::PMT if Some(pid) == self.pmt_pid => {
                if self.core.first_sight(key) {
                    self.on_pmt(&section);
                }
            }
            table_id::NIT_ACTUAL if pid == pid::NIT => {
                if self.core.first_sight(key) {
                    match NitTable::parse(&section) {
                        Ok(nit) => self.core.handle_nit(&nit),
                        Err(e) => debug!("[TsFilter] NIT: {}", e),
                    }
                }
            }
            table_id::SDT_ACTUAL if pid == pid::SDT => {
                if self.core.first_sight(key) {
                    match SdtTable::parse(&section) {
                        Ok(sdt) => self.core.handle_sdt(&sdt),
                        Err(e) => debug!("[TsFilter] SDT: {}", e),
                    }
                }
            }
            table_id::EIT_PF_ACTUAL..=table_id::EIT_SCHEDULE_OTHER_LAST => {
                match EitSection::parse(&section) {
                    Ok(eit) => self.core.handle_eit(&eit, now),
                    Err(e) => debug!("[TsFilter] EIT: {}", e),
                }
            }
            table_id::CDT if pid == pid::CDT => match CdtTable::parse(&section) {
                Ok(cdt) => self.core.handle_cdt(&cdt),
                Err(e) => debug!("[TsFilter] CDT: {}", e),
            },
            _ => {}
        }
    }

    fn on_pat(&mut self, section: &PsiSection) {
        let pat = match PatTable::parse(section) {
            Ok(pat) => pat,
            Err(e) => {
                debug!("[TsFilter] PAT: {}", e);
                return;
            }
        };
        let Some(service_id) = self.core.config().service_id else {
            return;
        };
        let Some(pmt_pid) = pat.get_pmt_pid(service_id) else {
            warn!("[TsFilter] Service {} is not listed in PAT", service_id);
            return;
        };
        if let Some(old) = self.pmt_pid.replace(pmt_pid) {
            if old != pmt_pid {
                self.collectors.remove(&old);
            }
        }
        self.narrowed_pat = pat.narrowed_section(service_id);
        self.rebuild_provide();
    }

    fn on_pmt(&mut self, section: &PsiSection) {
        let pmt = match PmtTable::parse(section) {
            Ok(pmt) => pmt,
            Err(e) => {
                debug!("[TsFilter] PMT: {}", e);
                return;
            }
        };
        if Some(pmt.program_number) != self.core.config().service_id {
            return;
        }
        self.program_pids = pmt.program_pids();
        self.rebuild_provide();
        self.core.set_service_ready();
    }

    fn rebuild_provide(&mut self) {
        if self.core.config().service_id.is_none() {
            return;
        }
        let mut pids: HashSet<u16> = pid::ALWAYS_PROVIDED.into_iter().collect();
        pids.extend(self.pmt_pid);
        pids.extend(self.program_pids.iter().copied());
        pids.extend(self.emm_pids.iter().copied());
        self.provide = ProvidePids::Set(pids);
    }

    /// The narrowed PAT as one packet with the filter's own continuity counter.
    fn narrowed_pat_packet(&mut self) -> Option<[u8; TS_PACKET_SIZE]> {
        let section = self.narrowed_pat.as_ref()?;
        let mut packet = [0xFFu8; TS_PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = 0x40;
        packet[2] = 0x00;
        packet[3] = 0x10 | self.pat_cc;
        packet[4] = 0x00;
        let len = section.len().min(TS_PACKET_SIZE - 5);
        packet[5..5 + len].copy_from_slice(&section[..len]);
        self.pat_cc = (self.pat_cc + 1) & 0x0F;
        Some(packet)
    }

    fn release(&mut self) {
        self.collectors.clear();
        self.tail.clear();
    }
}

impl Demuxer for TsFilter {
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
