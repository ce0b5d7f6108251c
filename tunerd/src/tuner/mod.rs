//! Tuner devices and the arbiter that shares them.
//!
//! This module provides:
//! - [`TunerDevice`]: One physical or remote tuner and its capture process
//! - [`TunerArbiter`]: Tiered device selection (join, remote, cold start, replace, preempt)
//! - [`TunerStream`]: Consumer handle returned by [`TunerArbiter::open_stream`]
//! - [`process`]: Capture command spawning and termination
//! - [`remote`]: HTTP forwarding to another instance

pub mod arbiter;
pub mod decoder;
pub mod device;
pub mod process;
pub mod remote;
pub mod stream;

use std::time::Duration;

use serde::Deserialize;
use tunerd_model::ChannelType;

pub use arbiter::{
    select_tier, ArbiterSettings, GatherOutcome, StreamRequest, StreamSettings, Tier, TunerArbiter,
};
pub use device::{DeviceSnapshot, DeviceStatus, TunerDevice};
pub use remote::RemoteClient;
pub use stream::TunerStream;

/// Priority levels for tuner requests.
///
/// Higher values win. Negative values never preempt anyone.
pub mod priority {
    pub const EPG_GATHER: i32 = -1;
    pub const VIEWING: i32 = 0;
    pub const RECORDING: i32 = 2;
}

/// One `[[tuners]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TunerConfig {
    pub name: String,
    /// Channel types this device can receive.
    pub types: Vec<ChannelType>,
    /// Capture command template, or the zapper when `dvb_device_path` is set.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub dvb_device_path: Option<String>,
    /// `host:port` of a remote instance to forward from.
    #[serde(default)]
    pub remote: Option<String>,
    /// Decoder command the stream is piped through.
    #[serde(default)]
    pub decoder: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl TunerConfig {
    pub fn capture_source(&self) -> Option<CaptureSource> {
        if let Some(host) = &self.remote {
            return Some(CaptureSource::Remote(RemoteClient::new(host.clone())));
        }
        let command = self.command.clone()?;
        Some(match &self.dvb_device_path {
            Some(path) => CaptureSource::DirectDevice {
                zapper: command,
                device_path: path.clone(),
            },
            None => CaptureSource::Command(command),
        })
    }
}

/// Where a device gets its stream from.
#[derive(Debug, Clone)]
pub enum CaptureSource {
    Command(String),
    DirectDevice { zapper: String, device_path: String },
    Remote(RemoteClient),
}

/// Lifecycle timing shared by all devices.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// Delay between the last detach and the kill.
    pub release_grace: Duration,
    /// Delay between SIGTERM and SIGKILL.
    pub kill_timeout: Duration,
    /// Consecutive crashes before the device faults.
    pub max_fatal_errors: u32,
    pub broadcast_capacity: usize,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            release_grace: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(3),
            max_fatal_errors: 3,
            broadcast_capacity: 4096,
        }
    }
}

/// A party attached to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    pub id: u64,
    pub priority: i32,
    pub disable_decoder: bool,
    /// Human readable description for logs, e.g. `stream GR/27 sid=1024`.
    pub target: String,
}
