//! Command line arguments and the `tunerd.toml` configuration file.
//!
//! Values given on the command line take precedence over the file; values
//! missing from both use the defaults of the respective settings types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tunerd_model::{Channel, ChannelType};

use crate::catalog::ProgramGc;
use crate::tuner::{priority, ArbiterSettings, DeviceSettings, StreamSettings, TunerConfig};

/// Configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "tunerd.toml";

const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_RETENTION_DAYS: u64 = 7;

/// tunerd - broadcast tuner arbiter with EPG gathering
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    pub config: Option<PathBuf>,

    /// Directory where log files are stored
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    pub log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS)]
    pub log_retention_days: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sweep the EPG of every configured channel periodically
    Gather {
        /// Seconds between sweeps (overrides `[epg] gather_interval_secs`)
        #[arg(long)]
        interval: Option<u64>,

        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },

    /// Open a stream and copy it to stdout or a file
    Stream {
        /// Channel type (GR, BS, CS, BS4K, SKY)
        #[arg(long = "type")]
        channel_type: ChannelType,

        /// Channel key, e.g. 27 or BS15_0
        #[arg(long)]
        channel: String,

        #[arg(long)]
        network_id: Option<u16>,

        /// Narrow the output to one service
        #[arg(long)]
        service_id: Option<u16>,

        /// Wait for this event and stop when it ends
        #[arg(long, requires = "service_id")]
        event_id: Option<u16>,

        #[arg(long, default_value_t = priority::VIEWING, allow_negative_numbers = true)]
        priority: i32,

        /// Skip the tuner's decoder
        #[arg(long)]
        disable_decoder: bool,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub tuner: TunerSection,
    #[serde(default)]
    pub arbiter: ArbiterSection,
    #[serde(default)]
    pub epg: EpgSection,
    #[serde(default)]
    pub tuners: Vec<TunerConfig>,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StreamSection {
    pub output_capacity: Option<usize>,
    pub tick_interval_ms: Option<u64>,
    pub parse_eit: Option<bool>,
    pub parse_logo: Option<bool>,
    pub max_buffer_bytes_before_ready: Option<usize>,
    pub max_backlog_bytes: Option<usize>,
    pub max_output_bytes_per_pass: Option<usize>,
    pub event_end_grace_secs: Option<u64>,
    pub eit_pf_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TunerSection {
    pub release_grace_ms: Option<u64>,
    pub kill_timeout_ms: Option<u64>,
    pub max_fatal_errors: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ArbiterSection {
    pub retry_interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct EpgSection {
    pub gather_interval_secs: Option<u64>,
    pub gather_timeout_secs: Option<u64>,
    pub gc_interval_secs: Option<u64>,
    pub program_grace_secs: Option<u64>,
    pub program_horizon_days: Option<u64>,
}

pub fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Explicit path, else `tunerd.toml` if it exists.
pub fn find_config(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    })
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_dir: PathBuf,
    pub log_retention_days: u64,
    pub log_level: Option<String>,
    pub device: DeviceSettings,
    pub arbiter: ArbiterSettings,
    pub program_gc: ProgramGc,
    pub gather_interval: Duration,
    pub gc_interval: Duration,
    pub tuners: Vec<TunerConfig>,
    pub channels: Vec<Channel>,
}

impl Settings {
    pub fn resolve(args: &Args, file: ConfigFile) -> Self {
        // Merge logging configs (command line takes precedence)
        let log_dir = if args.log_dir != Path::new(DEFAULT_LOG_DIR) {
            args.log_dir.clone()
        } else {
            PathBuf::from(file.logging.log_dir.as_deref().unwrap_or(DEFAULT_LOG_DIR))
        };
        let log_retention_days = if args.log_retention_days != DEFAULT_RETENTION_DAYS {
            args.log_retention_days
        } else {
            file.logging.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS)
        };

        let device_defaults = DeviceSettings::default();
        let device = DeviceSettings {
            release_grace: file
                .tuner
                .release_grace_ms
                .map_or(device_defaults.release_grace, Duration::from_millis),
            kill_timeout: file
                .tuner
                .kill_timeout_ms
                .map_or(device_defaults.kill_timeout, Duration::from_millis),
            max_fatal_errors: file
                .tuner
                .max_fatal_errors
                .unwrap_or(device_defaults.max_fatal_errors),
            ..device_defaults
        };

        let s = StreamSettings::default();
        let stream = StreamSettings {
            output_capacity: file.stream.output_capacity.unwrap_or(s.output_capacity),
            tick_interval: file
                .stream
                .tick_interval_ms
                .map_or(s.tick_interval, Duration::from_millis),
            parse_eit: file.stream.parse_eit.unwrap_or(s.parse_eit),
            parse_logo: file.stream.parse_logo.unwrap_or(s.parse_logo),
            max_buffer_bytes_before_ready: file
                .stream
                .max_buffer_bytes_before_ready
                .unwrap_or(s.max_buffer_bytes_before_ready),
            max_backlog_bytes: file.stream.max_backlog_bytes.unwrap_or(s.max_backlog_bytes),
            max_output_bytes_per_pass: file
                .stream
                .max_output_bytes_per_pass
                .unwrap_or(s.max_output_bytes_per_pass),
            event_end_grace: file
                .stream
                .event_end_grace_secs
                .map_or(s.event_end_grace, Duration::from_secs),
            eit_pf_timeout: file
                .stream
                .eit_pf_timeout_secs
                .map_or(s.eit_pf_timeout, Duration::from_secs),
        };

        let a = ArbiterSettings::default();
        let arbiter = ArbiterSettings {
            retry_interval: file
                .arbiter
                .retry_interval_ms
                .map_or(a.retry_interval, Duration::from_millis),
            max_attempts: file.arbiter.max_attempts.unwrap_or(a.max_attempts),
            gather_timeout: file
                .epg
                .gather_timeout_secs
                .map_or(a.gather_timeout, Duration::from_secs),
            gather_poll_interval: a.gather_poll_interval,
            stream,
        };

        let gc = ProgramGc::default();
        let program_gc = ProgramGc {
            grace: file
                .epg
                .program_grace_secs
                .map_or(gc.grace, |s| s as i64 * 1000),
            horizon: file
                .epg
                .program_horizon_days
                .map_or(gc.horizon, |d| d as i64 * 24 * 60 * 60 * 1000),
        };

        let gather_interval = match &args.command {
            Command::Gather {
                interval: Some(secs),
                ..
            } => Duration::from_secs(*secs),
            _ => Duration::from_secs(file.epg.gather_interval_secs.unwrap_or(30 * 60)),
        };

        Self {
            log_dir,
            log_retention_days,
            log_level: file.logging.level,
            device,
            arbiter,
            program_gc,
            gather_interval,
            gc_interval: Duration::from_secs(file.epg.gc_interval_secs.unwrap_or(60 * 60)),
            tuners: file.tuners,
            channels: file.channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[logging]
log_dir = "/var/log/tunerd"
level = "tunerd=debug"

[tuner]
release_grace_ms = 500

[arbiter]
max_attempts = 10

[epg]
gather_interval_secs = 600
program_horizon_days = 3

[[tuners]]
name = "PX-W3U4 T1"
types = ["GR"]
command = "recpt1 --device /dev/px4video2 <channel> - -"
decoder = "arib-b25-stream-test"

[[tuners]]
name = "remote"
types = ["BS", "CS"]
remote = "192.168.0.10:40772"

[[channels]]
type = "GR"
channel = "27"
name = "NHK"

[[channels]]
type = "BS"
channel = "BS15_0"
tuning = { space = 0, freq = 11.7 }
"#;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["tunerd"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_parse_config_file() {
        let file: ConfigFile = toml::from_str(SAMPLE).unwrap();
        assert_eq!(file.tuners.len(), 2);
        assert_eq!(file.tuners[0].types, vec![ChannelType::Gr]);
        assert!(file.tuners[1].capture_source().is_some());
        assert_eq!(file.channels[1].channel_type, ChannelType::Bs);
        assert_eq!(file.channels[1].tuning.space, Some(0));
    }

    #[test]
    fn test_file_values_and_defaults() {
        let file: ConfigFile = toml::from_str(SAMPLE).unwrap();
        let settings = Settings::resolve(&args(&["gather"]), file);
        assert_eq!(settings.log_dir, PathBuf::from("/var/log/tunerd"));
        assert_eq!(settings.log_retention_days, DEFAULT_RETENTION_DAYS);
        assert_eq!(settings.device.release_grace, Duration::from_millis(500));
        assert_eq!(settings.device.max_fatal_errors, 3);
        assert_eq!(settings.arbiter.max_attempts, 10);
        assert_eq!(settings.arbiter.retry_interval, Duration::from_millis(250));
        assert_eq!(settings.gather_interval, Duration::from_secs(600));
        assert_eq!(settings.program_gc.horizon, 3 * 24 * 60 * 60 * 1000);
    }

    #[test]
    fn test_command_line_takes_precedence() {
        let file: ConfigFile = toml::from_str(SAMPLE).unwrap();
        let settings = Settings::resolve(
            &args(&["--log-dir", "/tmp/x", "gather", "--interval", "60"]),
            file,
        );
        assert_eq!(settings.log_dir, PathBuf::from("/tmp/x"));
        assert_eq!(settings.gather_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_stream_subcommand() {
        let parsed = args(&["stream", "--type", "GR", "--channel", "27", "--service-id", "1024", "--priority", "-1"]);
        match parsed.command {
            Command::Stream {
                channel_type,
                channel,
                service_id,
                priority,
                ..
            } => {
                assert_eq!(channel_type, ChannelType::Gr);
                assert_eq!(channel, "27");
                assert_eq!(service_id, Some(1024));
                assert_eq!(priority, -1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_event_id_requires_service_id() {
        let err = Args::try_parse_from(["tunerd", "stream", "--type", "GR", "--channel", "27", "--event-id", "7"]);
        assert!(err.is_err());
        let ok = Args::try_parse_from([
            "tunerd", "stream", "--type", "GR", "--channel", "27", "--service-id", "1024", "--event-id", "7",
        ]);
        assert!(ok.is_ok());
    }
}
