//! A single tuner device and its capture session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tunerd_model::{Channel, ChannelKey, ChannelType, TunerError};

use super::process::{forward_output, CaptureProcess};
use super::remote::RemoteClient;
use super::{CaptureSource, Consumer, DeviceSettings, TunerConfig};

/// Device lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// No channel bound.
    Free,
    /// Capturing a channel.
    Active,
    /// Last consumer left; the capture is killed after the release grace.
    Closing,
    /// Too many consecutive crashes. Terminal.
    Fault,
}

/// Point-in-time view of a device used for tier selection.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub index: usize,
    pub types: Vec<ChannelType>,
    pub available: bool,
    pub remote: bool,
    pub status: DeviceStatus,
    pub channel: Option<ChannelKey>,
    pub consumers: usize,
    /// Highest priority among attached consumers.
    pub max_priority: Option<i32>,
}

impl DeviceSnapshot {
    pub fn supports(&self, channel_type: ChannelType) -> bool {
        self.types.contains(&channel_type)
    }
}

enum Capture {
    Process {
        process: CaptureProcess,
        reader: JoinHandle<()>,
    },
    Remote {
        task: JoinHandle<()>,
    },
}

impl Capture {
    async fn shutdown(self, settings: &DeviceSettings) {
        match self {
            Capture::Process { process, reader } => {
                reader.abort();
                process.kill(settings.kill_timeout).await;
            }
            Capture::Remote { task } => task.abort(),
        }
    }
}

struct Session {
    channel: Channel,
    tx: broadcast::Sender<Bytes>,
    capture: Option<Capture>,
    /// Identifies the running capture so exits of killed ones are ignored.
    capture_id: u64,
}

struct DeviceState {
    status: DeviceStatus,
    session: Option<Session>,
    consumers: HashMap<u64, Consumer>,
    /// Bumped on every attach/detach; a release timer only fires for its own.
    generation: u64,
    next_capture_id: u64,
}

impl DeviceState {
    fn max_priority(&self) -> Option<i32> {
        self.consumers.values().map(|c| c.priority).max()
    }
}

/// One tuner.
///
/// All state transitions happen under the device's async mutex, which is
/// the exclusive access point for joins, replacement and preemption.
pub struct TunerDevice {
    index: usize,
    config: TunerConfig,
    settings: DeviceSettings,
    source: Option<CaptureSource>,
    state: Mutex<DeviceState>,
    fatal_errors: AtomicU32,
}

impl TunerDevice {
    pub fn new(index: usize, config: TunerConfig, settings: DeviceSettings) -> Arc<Self> {
        let source = config.capture_source();
        if source.is_none() {
            warn!(
                "[TunerDevice#{}] {} has neither command nor remote; it will never be selected",
                index, config.name
            );
        }
        Arc::new(Self {
            index,
            config,
            settings,
            source,
            state: Mutex::new(DeviceState {
                status: DeviceStatus::Free,
                session: None,
                consumers: HashMap::new(),
                generation: 0,
                next_capture_id: 0,
            }),
            fatal_errors: AtomicU32::new(0),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.source, Some(CaptureSource::Remote(_)))
    }

    pub fn remote(&self) -> Option<&RemoteClient> {
        match &self.source {
            Some(CaptureSource::Remote(client)) => Some(client),
            _ => None,
        }
    }

    pub fn fatal_error_count(&self) -> u32 {
        self.fatal_errors.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> DeviceStatus {
        self.state.lock().await.status
    }

    fn is_available(&self, state: &DeviceState) -> bool {
        !self.config.disabled && self.source.is_some() && state.status != DeviceStatus::Fault
    }

    pub async fn snapshot(&self) -> DeviceSnapshot {
        let state = self.state.lock().await;
        DeviceSnapshot {
            index: self.index,
            types: self.config.types.clone(),
            available: self.is_available(&state),
            remote: self.is_remote(),
            status: state.status,
            channel: state.session.as_ref().map(|s| s.channel.key()),
            consumers: state.consumers.len(),
            max_priority: state.max_priority(),
        }
    }

    /// Attach `consumer` to `channel`.
    ///
    /// Joins the running session when the channel matches. Otherwise the
    /// current session is torn down first, which is only allowed when it has
    /// no consumers or when `consumer` outranks all of them.
    pub async fn start_stream(
        self: &Arc<Self>,
        channel: &Channel,
        consumer: Consumer,
    ) -> Result<broadcast::Receiver<Bytes>, TunerError> {
        let mut state = self.state.lock().await;
        if !self.is_available(&state) {
            return Err(TunerError::DeviceFault(self.index));
        }
        if !self.config.types.contains(&channel.channel_type) {
            return Err(TunerError::NoAvailableTuners);
        }

        let joinable = state
            .session
            .as_ref()
            .map(|s| s.channel.same_tuning(channel));
        match joinable {
            Some(true) => {
                debug!(
                    "[TunerDevice#{}] {} joins {}",
                    self.index,
                    consumer.target,
                    channel.key()
                );
            }
            Some(false) => {
                if let Some(holder) = state.max_priority() {
                    if consumer.priority < 0 || consumer.priority <= holder {
                        return Err(TunerError::PriorityConflict {
                            requested: consumer.priority,
                            holder,
                        });
                    }
                    warn!(
                        "[TunerDevice#{}] Preempting {} consumer(s) (priority {}) for {} (priority {})",
                        self.index,
                        state.consumers.len(),
                        holder,
                        consumer.target,
                        consumer.priority
                    );
                    state.consumers.clear();
                }
                self.teardown(&mut state).await;
                if let Err(e) = self.start_session(&mut state, channel) {
                    state.status = DeviceStatus::Free;
                    return Err(e);
                }
            }
            None => self.start_session(&mut state, channel)?,
        }

        let rx = match &state.session {
            Some(session) => session.tx.subscribe(),
            None => return Err(TunerError::DeviceFault(self.index)),
        };
        info!(
            "[TunerDevice#{}] Attached {} (id={}, priority={}) to {}",
            self.index,
            consumer.target,
            consumer.id,
            consumer.priority,
            channel.key()
        );
        state.consumers.insert(consumer.id, consumer);
        state.status = DeviceStatus::Active;
        state.generation += 1;
        Ok(rx)
    }

    /// Detach a consumer. The last detach arms the release timer.
    pub async fn stop_stream(self: &Arc<Self>, consumer_id: u64) {
        let mut state = self.state.lock().await;
        if state.consumers.remove(&consumer_id).is_none() {
            return;
        }
        debug!("[TunerDevice#{}] Detached consumer {}", self.index, consumer_id);
        if !state.consumers.is_empty() || state.session.is_none() {
            return;
        }

        state.status = DeviceStatus::Closing;
        state.generation += 1;
        let generation = state.generation;
        let grace = self.settings.release_grace;
        let device = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            device.on_timeout(generation).await;
        });
    }

    /// Release timer expiry. No-op if anyone re-attached in the meantime.
    pub async fn on_timeout(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.status != DeviceStatus::Closing
            || state.generation != generation
            || !state.consumers.is_empty()
        {
            return;
        }
        info!("[TunerDevice#{}] Release grace elapsed, stopping capture", self.index);
        self.teardown(&mut state).await;
        state.status = DeviceStatus::Free;
    }

    /// Kill the capture and drop every consumer.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.consumers.clear();
        self.teardown(&mut state).await;
        if state.status != DeviceStatus::Fault {
            state.status = DeviceStatus::Free;
        }
    }

    async fn teardown(&self, state: &mut DeviceState) {
        let Some(mut session) = state.session.take() else {
            return;
        };
        if let Some(capture) = session.capture.take() {
            capture.shutdown(&self.settings).await;
        }
        debug!("[TunerDevice#{}] Session for {} closed", self.index, session.channel.key());
    }

    fn start_session(self: &Arc<Self>, state: &mut DeviceState, channel: &Channel) -> Result<(), TunerError> {
        let (tx, _) = broadcast::channel(self.settings.broadcast_capacity);
        state.next_capture_id += 1;
        let capture_id = state.next_capture_id;
        let capture = self.spawn_capture(channel, tx.clone(), capture_id)?;
        state.session = Some(Session {
            channel: channel.clone(),
            tx,
            capture: Some(capture),
            capture_id,
        });
        Ok(())
    }

    fn spawn_capture(
        self: &Arc<Self>,
        channel: &Channel,
        tx: broadcast::Sender<Bytes>,
        capture_id: u64,
    ) -> Result<Capture, TunerError> {
        let device = Arc::clone(self);
        let mut first_chunk = true;
        let on_chunk = move |_: usize| {
            if first_chunk {
                first_chunk = false;
                device.fatal_errors.store(0, Ordering::SeqCst);
            }
        };

        let (process, stdout) = match &self.source {
            Some(CaptureSource::Remote(client)) => {
                let client = client.clone();
                let key = channel.key();
                let device = Arc::clone(self);
                let task = tokio::spawn(async move {
                    let result = match client.open_stream(&key).await {
                        Ok(response) => RemoteClient::forward(response, tx, on_chunk).await,
                        Err(e) => Err(e),
                    };
                    let reason = match result {
                        Ok(bytes) => format!("remote stream ended after {} bytes", bytes),
                        Err(e) => e.to_string(),
                    };
                    device.on_exit(capture_id, reason).await;
                });
                return Ok(Capture::Remote { task });
            }
            Some(CaptureSource::Command(template)) => {
                CaptureProcess::spawn_command(template, channel)?
            }
            Some(CaptureSource::DirectDevice {
                zapper,
                device_path,
            }) => CaptureProcess::spawn_direct(zapper, device_path, channel)?,
            None => return Err(TunerError::DeviceFault(self.index)),
        };

        let device = Arc::clone(self);
        let reader = tokio::spawn(async move {
            let reason = match forward_output(stdout, tx, on_chunk).await {
                Ok(bytes) => format!("EOF after {} bytes", bytes),
                Err(e) => e.to_string(),
            };
            device.on_exit(capture_id, reason).await;
        });
        Ok(Capture::Process { process, reader })
    }

    /// The capture of `capture_id` stopped on its own.
    async fn on_exit(self: &Arc<Self>, capture_id: u64, mut reason: String) {
        let mut state = self.state.lock().await;
        let capture = match state.session.as_mut() {
            Some(session) if session.capture_id == capture_id => session.capture.take(),
            _ => return,
        };
        if let Some(Capture::Process { process, .. }) = capture {
            process.kill(self.settings.kill_timeout).await;
        }

        loop {
            let count = self.fatal_errors.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                "[TunerDevice#{}] Capture exited unexpectedly ({}/{}): {}",
                self.index, count, self.settings.max_fatal_errors, reason
            );

            if count >= self.settings.max_fatal_errors {
                error!(
                    "[TunerDevice#{}] {} consecutive fatal errors, device is now in fault state",
                    self.index, count
                );
                state.status = DeviceStatus::Fault;
                state.session = None;
                state.consumers.clear();
                return;
            }

            if state.consumers.is_empty() {
                state.session = None;
                state.status = DeviceStatus::Free;
                return;
            }

            let (channel, tx) = match &state.session {
                Some(session) => (session.channel.clone(), session.tx.clone()),
                None => return,
            };
            state.next_capture_id += 1;
            let next_id = state.next_capture_id;
            match self.spawn_capture(&channel, tx, next_id) {
                Ok(capture) => {
                    info!(
                        "[TunerDevice#{}] Respawned capture for {} ({} consumer(s))",
                        self.index,
                        channel.key(),
                        state.consumers.len()
                    );
                    if let Some(session) = state.session.as_mut() {
                        session.capture = Some(capture);
                        session.capture_id = next_id;
                    }
                    return;
                }
                Err(e) => reason = e.to_string(),
            }
        }
    }
}
