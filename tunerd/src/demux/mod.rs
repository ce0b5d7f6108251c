//! Packet demultiplexers.
//!
//! A filter consumes raw chunks from a tuner, reframes them into packets,
//! decodes the tables it needs and provisions the packets of the requested
//! service to a [`StreamSink`]. [`TsFilter`] handles MPEG-TS (optionally
//! TSMF-multiplexed) and [`TlvFilter`] handles TLV/MMT. Both share
//! [`FilterCore`] for readiness, liveness and close semantics.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tunerd_model::{ChannelKey, FilterError};

use crate::catalog::Catalog;
use crate::epg::EpgAssembler;
use crate::metrics::StreamMetrics;

mod buffer;
mod filter;
mod logo;
mod sink;
mod tlv_filter;
mod ts_filter;
mod tsmf;

pub use self::buffer::PacketQueue;
pub use self::filter::{CloseReason, FilterCore, FilterStats, TableKey};
pub use self::logo::{CompletedLogo, LogoAssembler};
pub use self::sink::{ChannelSink, DecoderSink, SinkError, StreamSink};
pub use self::tlv_filter::TlvFilter;
pub use self::ts_filter::TsFilter;
pub use self::tsmf::TsmfSelector;

/// Per-stream filter settings.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Channel the stream is tuned to; discovered services are attached to it.
    pub channel: ChannelKey,
    pub network_id: Option<u16>,
    /// Narrow the output to one service.
    pub service_id: Option<u16>,
    /// Hold output until this event is on air and close when it ends.
    pub event_id: Option<u16>,
    pub parse_nit: bool,
    pub parse_sdt: bool,
    pub parse_eit: bool,
    pub parse_logo: bool,
    pub tsmf_rel_ts: Option<u8>,
    pub max_buffer_bytes_before_ready: usize,
    /// Backlog ceiling once ready; the oldest packets are dropped past it.
    pub max_backlog_bytes: usize,
    pub max_output_bytes_per_pass: usize,
    pub event_end_grace: Duration,
    pub eit_pf_timeout: Duration,
}

impl FilterConfig {
    pub const DEFAULT_MAX_BUFFER_BYTES_BEFORE_READY: usize = 8 * 1024 * 1024;
    pub const DEFAULT_MAX_BACKLOG_BYTES: usize = 32 * 1024 * 1024;
    pub const DEFAULT_MAX_OUTPUT_BYTES_PER_PASS: usize = 188 * 4096;
    pub const DEFAULT_EVENT_END_GRACE: Duration = Duration::from_secs(5);
    pub const DEFAULT_EIT_PF_TIMEOUT: Duration = Duration::from_secs(60);

    /// Pass-through settings for `channel`.
    pub fn new(channel: ChannelKey) -> Self {
        Self {
            channel,
            network_id: None,
            service_id: None,
            event_id: None,
            parse_nit: false,
            parse_sdt: false,
            parse_eit: false,
            parse_logo: false,
            tsmf_rel_ts: None,
            max_buffer_bytes_before_ready: Self::DEFAULT_MAX_BUFFER_BYTES_BEFORE_READY,
            max_backlog_bytes: Self::DEFAULT_MAX_BACKLOG_BYTES,
            max_output_bytes_per_pass: Self::DEFAULT_MAX_OUTPUT_BYTES_PER_PASS,
            event_end_grace: Self::DEFAULT_EVENT_END_GRACE,
            eit_pf_timeout: Self::DEFAULT_EIT_PF_TIMEOUT,
        }
    }
}

/// Shared collaborators handed to every filter.
#[derive(Clone)]
pub struct FilterContext {
    pub catalog: Arc<Catalog>,
    pub epg: Arc<EpgAssembler>,
    pub metrics: Arc<StreamMetrics>,
}

/// A packet filter driven by the stream pump.
pub trait Demuxer: Send {
    /// Feed a chunk of raw bytes of any length.
    fn write(&mut self, chunk: &[u8]) -> Result<(), FilterError>;

    /// Run timers and flush pending output.
    fn on_tick(&mut self, now: Instant);

    /// Stop the filter and release its sink. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    fn is_ready(&self) -> bool;

    fn stats(&self) -> FilterStats;
}

/// Build the filter matching the channel's transport.
pub fn new_demuxer(
    config: FilterConfig,
    ctx: FilterContext,
    sink: Option<Box<dyn StreamSink>>,
) -> Box<dyn Demuxer> {
    if config.channel.channel_type.is_tlv() {
        Box::new(TlvFilter::new(config, ctx, sink))
    } else {
        Box::new(TsFilter::new(config, ctx, sink))
    }
}

/// Identifiers (PIDs or MMT packet ids) whose packets reach the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvidePids {
    All,
    Set(HashSet<u16>),
}

impl ProvidePids {
    pub fn contains(&self, id: u16) -> bool {
        match self {
            ProvidePids::All => true,
            ProvidePids::Set(ids) => ids.contains(&id),
        }
    }
}
