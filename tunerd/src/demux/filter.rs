//! State shared by the TS and TLV filters: readiness gate, output queue,
//! event liveness, service discovery and close semantics.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::time::Instant;
use tunerd_model::{service_item_id, ServiceItemId, ServicePatch};

use super::buffer::PacketQueue;
use super::logo::LogoAssembler;
use super::sink::{SinkError, StreamSink};
use super::{FilterConfig, FilterContext};
use crate::ts_analyzer::cdt::CdtTable;
use crate::ts_analyzer::eit::EitSection;
use crate::ts_analyzer::nit::NitTable;
use crate::ts_analyzer::sdt::SdtTable;

/// Why a filter stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    /// The target event left the air.
    EventEnded,
    /// Neither the present nor the following event is the target.
    EventNotOnAir,
    /// No EIT p/f of the target service for too long.
    Stalled,
    /// The consumer went away.
    SinkClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Requested => "requested",
            CloseReason::EventEnded => "event ended",
            CloseReason::EventNotOnAir => "event not on air",
            CloseReason::Stalled => "EIT p/f stalled",
            CloseReason::SinkClosed => "sink closed",
        };
        f.write_str(s)
    }
}

/// Counters of one filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub packets_in: u64,
    pub packets_provided: u64,
    pub resync_bytes: u64,
    pub malformed: u64,
    /// Transport-error packets per PID.
    pub error_packets: BTreeMap<u16, u64>,
    /// Continuity gaps per PID.
    pub discontinuities: BTreeMap<u16, u64>,
    pub dropped_before_ready: u64,
    /// Packets dropped from the backlog after ready.
    pub backlog_dropped: u64,
    pub sink_dropped_chunks: u64,
    pub close_reason: Option<CloseReason>,
}

/// `(table_id, table_id_extension, section_number, version)`
pub type TableKey = (u8, u16, u8, u8);

#[derive(Debug)]
struct Liveness {
    present: Option<u16>,
    following: Option<u16>,
    sections_seen: [bool; 2],
    event_ready: bool,
    ended_at: Option<Instant>,
    last_pf: Instant,
}

impl Liveness {
    fn new(now: Instant) -> Self {
        Self {
            present: None,
            following: None,
            sections_seen: [false; 2],
            event_ready: false,
            ended_at: None,
            last_pf: now,
        }
    }
}

pub struct FilterCore {
    name: &'static str,
    config: FilterConfig,
    ctx: FilterContext,
    sink: Option<Box<dyn StreamSink>>,
    queue: PacketQueue,
    service_ready: bool,
    ready_logged: bool,
    dropped_at_ready: Option<u64>,
    liveness: Liveness,
    closed: bool,
    seen: HashSet<TableKey>,
    remote_keys: HashMap<(u16, u16), u8>,
    logos: LogoAssembler,
    eit_services: HashSet<ServiceItemId>,
    stats: FilterStats,
}

impl FilterCore {
    pub fn new(
        name: &'static str,
        config: FilterConfig,
        ctx: FilterContext,
        sink: Option<Box<dyn StreamSink>>,
    ) -> Self {
        ctx.metrics.stream_opened();
        let service_ready = config.service_id.is_none();
        let queue = PacketQueue::new(Some(config.max_buffer_bytes_before_ready));
        let mut core = Self {
            name,
            config,
            ctx,
            sink,
            queue,
            service_ready,
            ready_logged: false,
            dropped_at_ready: None,
            liveness: Liveness::new(Instant::now()),
            closed: false,
            seen: HashSet::new(),
            remote_keys: HashMap::new(),
            logos: LogoAssembler::new(),
            eit_services: HashSet::new(),
            stats: FilterStats::default(),
        };
        core.update_ready();
        core
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_ready(&self) -> bool {
        !self.closed
            && self.service_ready
            && (self.config.event_id.is_none() || self.liveness.event_ready)
    }

    pub fn stats(&self) -> FilterStats {
        let mut stats = self.stats.clone();
        let dropped = self.queue.dropped_packets();
        let before_ready = self.dropped_at_ready.unwrap_or(dropped);
        stats.dropped_before_ready = before_ready;
        stats.backlog_dropped = dropped - before_ready;
        stats
    }

    /// True the first time a table section is seen.
    pub fn first_sight(&mut self, key: TableKey) -> bool {
        self.seen.insert(key)
    }

    pub fn count_packet(&mut self) {
        self.stats.packets_in += 1;
    }

    pub fn count_resync(&mut self, bytes: usize) {
        self.stats.resync_bytes += bytes as u64;
    }

    pub fn count_malformed(&mut self) {
        self.stats.malformed += 1;
    }

    pub fn count_error(&mut self, pid: u16) {
        *self.stats.error_packets.entry(pid).or_default() += 1;
        self.ctx.metrics.record_dropped(1);
    }

    pub fn count_discontinuity(&mut self, pid: u16) {
        *self.stats.discontinuities.entry(pid).or_default() += 1;
        self.ctx.metrics.record_dropped(1);
    }

    /// Queue a packet for the sink.
    pub fn provide(&mut self, packet: &[u8]) {
        if self.closed || self.sink.is_none() {
            return;
        }
        let dropped = self.queue.dropped_packets();
        self.queue.push(Bytes::copy_from_slice(packet));
        self.stats.packets_provided += 1;
        self.ctx.metrics.record_provisioned(1);
        let overflow = self.queue.dropped_packets() - dropped;
        if overflow > 0 {
            self.ctx.metrics.record_dropped(overflow);
        }
    }

    pub fn set_service_ready(&mut self) {
        if !self.service_ready {
            self.service_ready = true;
            info!("[{}] Service ready", self.name);
            self.update_ready();
        }
    }

    fn update_ready(&mut self) {
        if self.is_ready() && !self.ready_logged {
            self.ready_logged = true;
            self.dropped_at_ready = Some(self.queue.dropped_packets());
            self.queue.set_limit(Some(self.config.max_backlog_bytes));
            debug!(
                "[{}] Ready, flushing {} buffered bytes",
                self.name,
                self.queue.len_bytes()
            );
        }
    }

    /// Write at most one pass worth of queued bytes to the sink.
    pub fn flush(&mut self) {
        if !self.is_ready() {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let Some(chunk) = self.queue.take(self.config.max_output_bytes_per_pass) else {
            return;
        };
        let len = chunk.len();
        match sink.write(chunk) {
            Ok(()) => self.ctx.metrics.record_sent(len as u64),
            Err(SinkError::Full) => {
                self.stats.sink_dropped_chunks += 1;
                self.ctx.metrics.record_dropped((len / 188).max(1) as u64);
            }
            Err(SinkError::Closed) => self.close(CloseReason::SinkClosed),
        }
    }

    fn is_target_service(&self, network_id: u16, service_id: u16) -> bool {
        self.config.service_id == Some(service_id)
            && self.config.network_id.map_or(true, |nid| nid == network_id)
    }

    /// Forward an EIT section to the EPG assembler and track liveness.
    pub fn handle_eit(&mut self, eit: &EitSection, now: Instant) {
        if self.closed {
            return;
        }
        if self.config.parse_eit {
            let wall = chrono::Utc::now().timestamp_millis();
            self.ctx.epg.process(eit, wall);
            self.eit_services
                .insert(service_item_id(eit.original_network_id, eit.service_id));
        }
        if eit.is_present_following()
            && eit.section_number < 2
            && self.is_target_service(eit.original_network_id, eit.service_id)
        {
            self.on_present_following(eit, now);
        }
    }

    fn on_present_following(&mut self, eit: &EitSection, now: Instant) {
        let event = eit.events.first().map(|e| e.event_id);
        let live = &mut self.liveness;
        live.last_pf = now;
        live.sections_seen[eit.section_number as usize] = true;
        if eit.section_number == 0 {
            live.present = event;
        } else {
            live.following = event;
        }

        let Some(target) = self.config.event_id else {
            return;
        };
        if live.present == Some(target) {
            live.ended_at = None;
            if !live.event_ready {
                live.event_ready = true;
                info!("[{}] Event {} on air", self.name, target);
                self.update_ready();
            }
        } else if live.event_ready {
            if live.present.is_some() && live.ended_at.is_none() {
                info!("[{}] Event {} ended, closing after grace", self.name, target);
                live.ended_at = Some(now);
            }
        } else if live.sections_seen == [true, true] && live.following != Some(target) {
            self.close(CloseReason::EventNotOnAir);
            return;
        }
        self.check_timers(now);
    }

    fn check_timers(&mut self, now: Instant) {
        if self.closed || self.config.event_id.is_none() {
            return;
        }
        if let Some(ended_at) = self.liveness.ended_at {
            if now.duration_since(ended_at) >= self.config.event_end_grace {
                self.close(CloseReason::EventEnded);
                return;
            }
        }
        if now.duration_since(self.liveness.last_pf) > self.config.eit_pf_timeout {
            self.close(CloseReason::Stalled);
        }
    }

    pub fn on_tick(&mut self, now: Instant) {
        self.check_timers(now);
        self.flush();
    }

    /// Upsert the services of an SDT actual.
    pub fn handle_sdt(&mut self, sdt: &SdtTable) {
        if !self.config.parse_sdt {
            return;
        }
        let nid = sdt.original_network_id;
        for service in &sdt.services {
            let Some(name) = service.service_name() else {
                continue;
            };
            let patch = ServicePatch {
                transport_stream_id: Some(sdt.transport_stream_id),
                name: Some(name.to_string()),
                service_type: service.service_type(),
                logo_id: service.logo_id,
                remote_control_key_id: self.remote_keys.get(&(nid, service.service_id)).copied(),
                ..Default::default()
            };
            self.ctx
                .catalog
                .services
                .upsert(nid, service.service_id, &self.config.channel, &patch);
        }
    }

    /// Record remote-control keys and apply them to known services.
    pub fn handle_nit(&mut self, nit: &NitTable) {
        if !self.config.parse_nit {
            return;
        }
        for ts in &nit.transport_streams {
            for (sid, key) in ts.remote_keys() {
                let nid = ts.original_network_id;
                self.remote_keys.insert((nid, sid), key);
                if self.ctx.catalog.services.get(nid, sid).is_some() {
                    let patch = ServicePatch {
                        remote_control_key_id: Some(key),
                        ..Default::default()
                    };
                    self.ctx.catalog.services.set(nid, sid, &patch);
                }
            }
        }
    }

    pub fn handle_cdt(&mut self, cdt: &CdtTable) {
        if !self.config.parse_logo {
            return;
        }
        if let Some(logo) = self.logos.push(cdt) {
            self.ctx
                .catalog
                .logos
                .set(logo.network_id, logo.logo_id, logo.logo_type, logo.data);
        }
    }

    /// Idempotent.
    pub fn close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stats.close_reason = Some(reason);
        if let Some(mut sink) = self.sink.take() {
            sink.close();
        }
        self.queue.clear();
        self.logos.clear();
        self.ctx.epg.clear_fragments(&self.eit_services);
        self.ctx.metrics.stream_closed();

        let s = &self.stats;
        if s.error_packets.is_empty() && s.discontinuities.is_empty() {
            info!("[{}] Closed ({}): {} packets in", self.name, reason, s.packets_in);
        } else {
            warn!(
                "[{}] Closed ({}): {} packets in, errors {:?}, discontinuities {:?}",
                self.name, reason, s.packets_in, s.error_packets, s.discontinuities
            );
        }
    }
}
