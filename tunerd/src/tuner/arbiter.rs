//! Tuner arbiter.
//!
//! Requests are matched to devices in strict tiers:
//!
//! 1. **Join** a device already tuned to the channel.
//! 2. **Remote** shortcut: sink-less requests are served by a remote host's API.
//! 3. **Cold** start on a free device.
//! 4. **Replace** the session of a device nobody is consuming.
//! 5. **Preempt** the lowest-priority in-use device the requester outranks.
//!
//! When no tier matches, selection is retried every `retry_interval` up to
//! `max_attempts` times before failing with [`TunerError::NoAvailableTuners`].
//! The choice is made on snapshots; [`TunerDevice::start_stream`] re-checks
//! it under the device lock, and a lost race counts as a failed attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tunerd_model::{Channel, ChannelKey, TunerError};

use crate::demux::{new_demuxer, FilterConfig, FilterContext, FilterStats};

use super::decoder::build_sink;
use super::device::{DeviceSnapshot, DeviceStatus, TunerDevice};
use super::stream::{spawn_pump, TunerStream};
use super::{priority, Consumer};

/// Selection tier, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Join,
    Remote,
    Cold,
    Replace,
    Preempt,
}

/// Pick a device for `channel`. Returns the tier and the device index.
pub fn select_tier(
    snapshots: &[DeviceSnapshot],
    channel: &ChannelKey,
    priority: i32,
    wants_sink: bool,
) -> Option<(Tier, usize)> {
    let candidates: Vec<&DeviceSnapshot> = snapshots
        .iter()
        .filter(|s| s.available && s.supports(channel.channel_type))
        .collect();

    if let Some(s) = candidates
        .iter()
        .find(|s| s.channel.as_ref() == Some(channel))
    {
        return Some((Tier::Join, s.index));
    }

    if !wants_sink {
        if let Some(s) = candidates.iter().find(|s| s.remote) {
            return Some((Tier::Remote, s.index));
        }
    }

    if let Some(s) = candidates.iter().find(|s| s.status == DeviceStatus::Free) {
        return Some((Tier::Cold, s.index));
    }

    if let Some(s) = candidates.iter().find(|s| s.consumers == 0) {
        return Some((Tier::Replace, s.index));
    }

    if priority < 0 {
        return None;
    }
    let mut in_use: Vec<&&DeviceSnapshot> =
        candidates.iter().filter(|s| s.consumers > 0).collect();
    in_use.sort_by_key(|s| s.max_priority.unwrap_or(i32::MIN));
    in_use
        .into_iter()
        .find(|s| s.max_priority.map_or(true, |holder| holder < priority))
        .map(|s| (Tier::Preempt, s.index))
}

/// Filter settings applied to every stream the arbiter opens.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Chunks buffered towards the consumer.
    pub output_capacity: usize,
    pub tick_interval: Duration,
    pub parse_eit: bool,
    pub parse_logo: bool,
    pub max_buffer_bytes_before_ready: usize,
    pub max_backlog_bytes: usize,
    pub max_output_bytes_per_pass: usize,
    pub event_end_grace: Duration,
    pub eit_pf_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            output_capacity: 1024,
            tick_interval: Duration::from_millis(100),
            parse_eit: true,
            parse_logo: true,
            max_buffer_bytes_before_ready: FilterConfig::DEFAULT_MAX_BUFFER_BYTES_BEFORE_READY,
            max_backlog_bytes: FilterConfig::DEFAULT_MAX_BACKLOG_BYTES,
            max_output_bytes_per_pass: FilterConfig::DEFAULT_MAX_OUTPUT_BYTES_PER_PASS,
            event_end_grace: FilterConfig::DEFAULT_EVENT_END_GRACE,
            eit_pf_timeout: FilterConfig::DEFAULT_EIT_PF_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArbiterSettings {
    pub retry_interval: Duration,
    pub max_attempts: u32,
    /// Upper bound of one local EPG sweep.
    pub gather_timeout: Duration,
    pub gather_poll_interval: Duration,
    pub stream: StreamSettings,
}

impl Default for ArbiterSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(250),
            max_attempts: 40,
            gather_timeout: Duration::from_secs(10 * 60),
            gather_poll_interval: Duration::from_secs(1),
            stream: StreamSettings::default(),
        }
    }
}

/// Parameters of [`TunerArbiter::open_stream`].
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub channel: ChannelKey,
    pub network_id: Option<u16>,
    pub service_id: Option<u16>,
    pub event_id: Option<u16>,
    pub priority: i32,
    pub disable_decoder: bool,
    /// Who is asking, for logs.
    pub target: String,
}

impl StreamRequest {
    pub fn new(channel: ChannelKey) -> Self {
        let target = format!("stream {}", channel);
        Self {
            channel,
            network_id: None,
            service_id: None,
            event_id: None,
            priority: priority::VIEWING,
            disable_decoder: false,
            target,
        }
    }
}

/// Result of [`TunerArbiter::gather_epg`].
#[derive(Debug, Clone, PartialEq)]
pub enum GatherOutcome {
    /// Every service of the channel reported a complete schedule.
    Complete { stats: Option<FilterStats> },
    /// The sweep ran out of time.
    TimedOut { stats: Option<FilterStats> },
    /// Programs were imported from a remote host.
    Remote { imported: usize },
}

enum Acquired {
    Local {
        device: Arc<TunerDevice>,
        consumer_id: u64,
        rx: broadcast::Receiver<Bytes>,
    },
    Remote(Arc<TunerDevice>),
}

/// Shares a pool of [`TunerDevice`]s between streams and EPG sweeps.
pub struct TunerArbiter {
    devices: Vec<Arc<TunerDevice>>,
    ctx: FilterContext,
    settings: ArbiterSettings,
    next_consumer_id: AtomicU64,
}

impl TunerArbiter {
    pub fn new(devices: Vec<Arc<TunerDevice>>, ctx: FilterContext, settings: ArbiterSettings) -> Self {
        info!("[Arbiter] Managing {} tuner device(s)", devices.len());
        Self {
            devices,
            ctx,
            settings,
            next_consumer_id: AtomicU64::new(1),
        }
    }

    pub fn devices(&self) -> &[Arc<TunerDevice>] {
        &self.devices
    }

    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        join_all(self.devices.iter().map(|d| d.snapshot())).await
    }

    fn device(&self, index: usize) -> Option<&Arc<TunerDevice>> {
        self.devices.iter().find(|d| d.index() == index)
    }

    fn resolve(&self, key: &ChannelKey) -> Result<Channel, TunerError> {
        self.ctx
            .catalog
            .channels
            .get_by_key(key)
            .ok_or(TunerError::ChannelNotFound)
    }

    async fn acquire(
        &self,
        channel: &Channel,
        priority: i32,
        disable_decoder: bool,
        target: &str,
        wants_sink: bool,
    ) -> Result<Acquired, TunerError> {
        let key = channel.key();
        for attempt in 1..=self.settings.max_attempts {
            let snapshots = self.snapshots().await;
            if let Some((tier, index)) = select_tier(&snapshots, &key, priority, wants_sink) {
                let Some(device) = self.device(index) else {
                    continue;
                };
                if tier == Tier::Remote {
                    info!("[Arbiter] {} served by remote device #{}", target, index);
                    return Ok(Acquired::Remote(Arc::clone(device)));
                }

                let consumer = Consumer {
                    id: self.next_consumer_id.fetch_add(1, Ordering::SeqCst),
                    priority,
                    disable_decoder,
                    target: target.to_string(),
                };
                let consumer_id = consumer.id;
                match device.start_stream(channel, consumer).await {
                    Ok(rx) => {
                        info!(
                            "[Arbiter] {} -> device #{} ({:?}, attempt {})",
                            target, index, tier, attempt
                        );
                        return Ok(Acquired::Local {
                            device: Arc::clone(device),
                            consumer_id,
                            rx,
                        });
                    }
                    Err(
                        e @ (TunerError::PriorityConflict { .. }
                        | TunerError::DeviceFault(_)
                        | TunerError::NoAvailableTuners),
                    ) => {
                        debug!("[Arbiter] {:?} on device #{} lost: {}", tier, index, e);
                    }
                    Err(e) => return Err(e),
                }
            }

            if attempt < self.settings.max_attempts {
                tokio::time::sleep(self.settings.retry_interval).await;
            }
        }

        warn!(
            "[Arbiter] No tuner for {} after {} attempts",
            target, self.settings.max_attempts
        );
        Err(TunerError::NoAvailableTuners)
    }

    fn filter_config(&self, channel: &Channel) -> FilterConfig {
        let s = &self.settings.stream;
        FilterConfig {
            parse_nit: true,
            parse_sdt: true,
            parse_eit: s.parse_eit,
            parse_logo: s.parse_logo,
            tsmf_rel_ts: channel.tsmf_rel_ts,
            max_buffer_bytes_before_ready: s.max_buffer_bytes_before_ready,
            max_backlog_bytes: s.max_backlog_bytes,
            max_output_bytes_per_pass: s.max_output_bytes_per_pass,
            event_end_grace: s.event_end_grace,
            eit_pf_timeout: s.eit_pf_timeout,
            ..FilterConfig::new(channel.key())
        }
    }

    /// Open a filtered stream of `request.channel`.
    pub async fn open_stream(&self, request: StreamRequest) -> Result<TunerStream, TunerError> {
        if request.event_id.is_some() && request.service_id.is_none() {
            return Err(TunerError::InvalidRequest(
                "event_id requires service_id".to_string(),
            ));
        }
        let channel = self.resolve(&request.channel)?;
        let acquired = self
            .acquire(
                &channel,
                request.priority,
                request.disable_decoder,
                &request.target,
                true,
            )
            .await?;
        let Acquired::Local {
            device,
            consumer_id,
            rx,
        } = acquired
        else {
            return Err(TunerError::NoAvailableTuners);
        };

        let (sink, output) = match build_sink(
            device.config().decoder.as_deref(),
            request.disable_decoder,
            self.settings.stream.output_capacity,
        ) {
            Ok(built) => built,
            Err(e) => {
                device.stop_stream(consumer_id).await;
                return Err(TunerError::SpawnFailed(format!("decoder: {}", e)));
            }
        };

        let config = FilterConfig {
            network_id: request.network_id,
            service_id: request.service_id,
            event_id: request.event_id,
            ..self.filter_config(&channel)
        };
        let demuxer = new_demuxer(config, self.ctx.clone(), Some(sink));
        let cancel = CancellationToken::new();
        let pump = spawn_pump(
            Arc::clone(&device),
            consumer_id,
            rx,
            demuxer,
            self.settings.stream.tick_interval,
            cancel.clone(),
        );
        Ok(TunerStream::new(
            consumer_id,
            device.index(),
            output,
            cancel,
            pump,
        ))
    }

    fn epg_complete(&self, key: &ChannelKey) -> bool {
        let services = self.ctx.catalog.services.find_by_channel(key);
        !services.is_empty()
            && services
                .iter()
                .filter(|s| is_epg_service(s.service_type))
                .all(|s| self.ctx.epg.is_complete(s.network_id, s.service_id))
    }

    /// Run one EPG sweep of `channel` at background priority.
    pub async fn gather_epg(&self, key: &ChannelKey) -> Result<GatherOutcome, TunerError> {
        let channel = self.resolve(key)?;
        let target = format!("epg {}", key);
        let acquired = self
            .acquire(&channel, priority::EPG_GATHER, true, &target, false)
            .await?;

        let (device, consumer_id, rx) = match acquired {
            Acquired::Remote(device) => {
                let Some(client) = device.remote() else {
                    return Err(TunerError::DeviceFault(device.index()));
                };
                let imported = client.import_programs(&self.ctx.catalog, key).await?;
                return Ok(GatherOutcome::Remote { imported });
            }
            Acquired::Local {
                device,
                consumer_id,
                rx,
            } => (device, consumer_id, rx),
        };

        for service in self.ctx.catalog.services.find_by_channel(key) {
            self.ctx
                .epg
                .restart_tracking(service.network_id, service.service_id);
        }

        let config = FilterConfig {
            parse_eit: true,
            ..self.filter_config(&channel)
        };
        let demuxer = new_demuxer(config, self.ctx.clone(), None);
        let cancel = CancellationToken::new();
        let mut pump = spawn_pump(
            device,
            consumer_id,
            rx,
            demuxer,
            self.settings.stream.tick_interval,
            cancel.clone(),
        );

        let deadline = tokio::time::Instant::now() + self.settings.gather_timeout;
        let mut complete = false;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.gather_poll_interval) => {}
                stats = &mut pump => {
                    let stats = stats.ok();
                    info!("[Arbiter] EPG sweep of {} ended early", key);
                    return Ok(GatherOutcome::TimedOut { stats });
                }
            }
            if self.epg_complete(key) {
                complete = true;
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        cancel.cancel();
        let stats = pump.await.ok();
        if complete {
            info!("[Arbiter] EPG sweep of {} complete", key);
            Ok(GatherOutcome::Complete { stats })
        } else {
            warn!(
                "[Arbiter] EPG sweep of {} timed out after {:?}",
                key, self.settings.gather_timeout
            );
            Ok(GatherOutcome::TimedOut { stats })
        }
    }

    /// Kill every capture.
    pub async fn shutdown(&self) {
        join_all(self.devices.iter().map(|d| d.shutdown())).await;
    }
}

/// Service types that carry a schedule.
fn is_epg_service(service_type: u8) -> bool {
    matches!(service_type, 0x01 | 0x02 | 0xA1 | 0xA2 | 0xA5 | 0xA6 | 0xAD)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tunerd_model::ChannelType;

    use super::*;
    use crate::catalog::{Catalog, ProgramGc};
    use crate::epg::EpgAssembler;
    use crate::metrics::StreamMetrics;
    use crate::ts_analyzer::testutil;
    use crate::tuner::{DeviceSettings, TunerConfig};

    fn snap(index: usize, status: DeviceStatus, channel: Option<&str>, consumers: usize, max: Option<i32>) -> DeviceSnapshot {
        DeviceSnapshot {
            index,
            types: vec![ChannelType::Gr],
            available: true,
            remote: false,
            status,
            channel: channel.map(|c| ChannelKey::new(ChannelType::Gr, c)),
            consumers,
            max_priority: max,
        }
    }

    fn gr(ch: &str) -> ChannelKey {
        ChannelKey::new(ChannelType::Gr, ch)
    }

    #[test]
    fn test_tier_ordering() {
        let pool = vec![
            snap(0, DeviceStatus::Free, None, 0, None),
            snap(1, DeviceStatus::Closing, Some("27"), 0, None),
            snap(2, DeviceStatus::Active, Some("26"), 1, Some(0)),
        ];
        // idle-but-tuned device on the requested channel is joined
        assert_eq!(select_tier(&pool, &gr("27"), 10, true), Some((Tier::Join, 1)));
        // otherwise cold start wins over replace and preempt
        assert_eq!(select_tier(&pool, &gr("25"), 10, true), Some((Tier::Cold, 0)));

        let busy = vec![pool[1].clone(), pool[2].clone()];
        assert_eq!(select_tier(&busy, &gr("25"), 10, true), Some((Tier::Replace, 1)));
        assert_eq!(select_tier(&busy[1..], &gr("25"), 10, true), Some((Tier::Preempt, 2)));
    }

    #[test]
    fn test_preempt_picks_lowest_priority_holder() {
        let pool = vec![
            snap(0, DeviceStatus::Active, Some("20"), 2, Some(7)),
            snap(1, DeviceStatus::Active, Some("21"), 1, Some(3)),
            snap(2, DeviceStatus::Active, Some("22"), 1, Some(12)),
        ];
        assert_eq!(select_tier(&pool, &gr("25"), 10, true), Some((Tier::Preempt, 1)));
        assert_eq!(select_tier(&pool, &gr("25"), 3, true), None);
        // negative priority never preempts
        assert_eq!(select_tier(&pool, &gr("25"), -1, false), None);
    }

    #[test]
    fn test_unavailable_and_unsupported_devices_skipped() {
        let mut fault = snap(0, DeviceStatus::Fault, None, 0, None);
        fault.available = false;
        let mut bs_only = snap(1, DeviceStatus::Free, None, 0, None);
        bs_only.types = vec![ChannelType::Bs];
        assert_eq!(select_tier(&[fault, bs_only], &gr("27"), 0, true), None);
    }

    #[test]
    fn test_remote_only_for_sinkless_requests() {
        let mut remote = snap(1, DeviceStatus::Free, None, 0, None);
        remote.remote = true;
        let pool = vec![snap(0, DeviceStatus::Free, None, 0, None), remote];
        assert_eq!(select_tier(&pool, &gr("27"), -1, false), Some((Tier::Remote, 1)));
        assert_eq!(select_tier(&pool, &gr("27"), 0, true), Some((Tier::Cold, 0)));
    }

    fn arbiter(commands: &[&str], max_attempts: u32) -> TunerArbiter {
        let channels = ["25", "26", "27"]
            .iter()
            .map(|ch| Channel::new(ChannelType::Gr, *ch))
            .collect();
        let catalog = Catalog::new(channels, ProgramGc::default());
        let ctx = FilterContext {
            epg: EpgAssembler::new(catalog.clone()),
            catalog,
            metrics: StreamMetrics::new(),
        };
        let device_settings = DeviceSettings {
            release_grace: Duration::from_millis(100),
            kill_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let devices = commands
            .iter()
            .enumerate()
            .map(|(i, command)| {
                let config = TunerConfig {
                    name: format!("tuner{}", i),
                    types: vec![ChannelType::Gr],
                    command: Some(command.to_string()),
                    dvb_device_path: None,
                    remote: None,
                    decoder: None,
                    disabled: false,
                };
                TunerDevice::new(i, config, device_settings.clone())
            })
            .collect();
        let settings = ArbiterSettings {
            retry_interval: Duration::from_millis(10),
            max_attempts,
            gather_timeout: Duration::from_millis(300),
            gather_poll_interval: Duration::from_millis(50),
            ..Default::default()
        };
        TunerArbiter::new(devices, ctx, settings)
    }

    fn request(ch: &str, priority: i32) -> StreamRequest {
        StreamRequest {
            priority,
            ..StreamRequest::new(gr(ch))
        }
    }

    #[tokio::test]
    async fn test_preempts_lower_priority_holder() {
        let arbiter = arbiter(&["sleep 30"], 3);
        let low = arbiter.open_stream(request("27", 5)).await.unwrap();
        let high = arbiter.open_stream(request("26", 10)).await.unwrap();
        assert_eq!(high.device_index(), 0);

        let snapshot = arbiter.snapshots().await.remove(0);
        assert_eq!(snapshot.channel, Some(gr("26")));
        assert_eq!(snapshot.max_priority, Some(10));

        // the preempted stream ends
        let mut low = low;
        let ended = tokio::time::timeout(Duration::from_secs(5), low.recv()).await.unwrap();
        assert!(ended.is_none());
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_higher_priority_holder_exhausts_retries() {
        let arbiter = arbiter(&["sleep 30"], 3);
        let _high = arbiter.open_stream(request("27", 20)).await.unwrap();
        let err = arbiter.open_stream(request("26", 10)).await.err();
        assert_eq!(err, Some(TunerError::NoAvailableTuners));
        assert_eq!(arbiter.snapshots().await[0].channel, Some(gr("27")));
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_channel_joins_and_unknown_channel_rejected() {
        let arbiter = arbiter(&["sleep 30", "sleep 30"], 2);
        let a = arbiter.open_stream(request("27", 0)).await.unwrap();
        let b = arbiter.open_stream(request("27", 0)).await.unwrap();
        assert_eq!(a.device_index(), b.device_index());
        assert_eq!(arbiter.snapshots().await[a.device_index()].consumers, 2);

        let err = arbiter.open_stream(request("99", 0)).await.err();
        assert_eq!(err, Some(TunerError::ChannelNotFound));
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_without_service_rejected() {
        let arbiter = arbiter(&["sleep 30"], 1);
        let mut req = request("27", 0);
        req.event_id = Some(7);
        let err = arbiter.open_stream(req).await.err();
        assert!(matches!(err, Some(TunerError::InvalidRequest(_))));
        assert_eq!(arbiter.snapshots().await[0].status, DeviceStatus::Free);
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_passes_packets_through() {
        let packets: Vec<Vec<u8>> = (0..8u8)
            .map(|cc| testutil::ts_packet(0x100, cc, false, &[cc]))
            .collect();
        let input = testutil::concat(&packets);
        let path: PathBuf = std::env::temp_dir().join(format!("tunerd-arbiter-{}.ts", std::process::id()));
        std::fs::write(&path, &input).unwrap();

        let command = format!("cat {}; sleep 30", path.display());
        let arbiter = arbiter(&[command.as_str()], 2);
        let mut stream = arbiter.open_stream(request("27", 0)).await.unwrap();

        let mut received = Vec::new();
        while received.len() < input.len() {
            let chunk = tokio::time::timeout(Duration::from_secs(5), stream.recv())
                .await
                .unwrap()
                .unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, input);

        let stats = stream.finish().await.unwrap();
        assert_eq!(stats.packets_in, 8);
        // the last detach arms the release timer
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_ne!(arbiter.snapshots().await[0].status, DeviceStatus::Active);
        arbiter.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_gather_times_out_without_services() {
        let arbiter = arbiter(&["sleep 30"], 2);
        let outcome = arbiter.gather_epg(&gr("27")).await.unwrap();
        assert!(matches!(outcome, GatherOutcome::TimedOut { .. }));
        arbiter.shutdown().await;
    }
}
