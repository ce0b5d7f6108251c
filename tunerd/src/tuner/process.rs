//! Capture subprocess management.

use std::process::Stdio;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::broadcast;
use tunerd_model::{Channel, TunerError};

/// Read size of the capture reader.
pub const CAPTURE_READ_SIZE: usize = 64 * 1024;

/// Zapper that ignores SIGTERM and must be killed directly.
const SIGKILL_ONLY_COMMAND: &str = "dvbv5-zap";

/// Substitute the channel's tuning parameters into a command template.
///
/// Recognised placeholders are `<channel>`, `<satellite>`, `<space>`,
/// `<freq>` and `<polarity>`. A missing space becomes `0`, other missing
/// values become empty strings.
pub fn substitute_command(template: &str, channel: &Channel) -> String {
    let tuning = &channel.tuning;
    template
        .replace("<channel>", &channel.channel)
        .replace("<satellite>", tuning.satellite.as_deref().unwrap_or(""))
        .replace("<space>", &tuning.space.unwrap_or(0).to_string())
        .replace(
            "<freq>",
            &tuning.freq.map(|f| f.to_string()).unwrap_or_default(),
        )
        .replace(
            "<polarity>",
            tuning.polarity.map(|p| p.as_str()).unwrap_or(""),
        )
}

fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).stdin(Stdio::null()).kill_on_drop(true);
    // Own process group so signals reach every process of a pipeline.
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;

    if let Err(e) = nix::sys::signal::killpg(Pid::from_raw(pid as i32), signal) {
        debug!("[Capture] {:?} failed for group {}: {}", signal, pid, e);
    }
}

/// One running child plus the command line it was started with.
#[derive(Debug)]
struct Proc {
    command: String,
    child: Child,
}

impl Proc {
    async fn kill(mut self, timeout: Duration) {
        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;

            if let Some(pid) = self.child.id() {
                if self.command.contains(SIGKILL_ONLY_COMMAND) {
                    debug!("[Capture] SIGKILL {}", self.command);
                } else {
                    signal_group(pid, Signal::SIGTERM);
                    if tokio::time::timeout(timeout, self.child.wait()).await.is_ok() {
                        return;
                    }
                    warn!(
                        "[Capture] Process did not exit within {:?}, sending SIGKILL: {}",
                        timeout, self.command
                    );
                }
                signal_group(pid, Signal::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        let _ = timeout;

        let _ = self.child.kill().await;
    }
}

/// A spawned capture pipeline.
///
/// For a plain command this is one child whose stdout carries the stream.
/// For a direct device the configured command runs as a zapper and a
/// second child (`cat <device>`) supplies the stream.
#[derive(Debug)]
pub struct CaptureProcess {
    reader: Proc,
    zapper: Option<Proc>,
}

impl CaptureProcess {
    /// Spawn `template` for `channel` and return the process plus its output.
    pub fn spawn_command(
        template: &str,
        channel: &Channel,
    ) -> Result<(Self, ChildStdout), TunerError> {
        let command = substitute_command(template, channel);
        let (reader, stdout) = spawn_reader(&command)?;
        info!("[Capture] Spawned pid={:?}: {}", reader.child.id(), command);
        Ok((
            Self {
                reader,
                zapper: None,
            },
            stdout,
        ))
    }

    /// Spawn the zapper `template` and read the stream from `device_path`.
    pub fn spawn_direct(
        template: &str,
        device_path: &str,
        channel: &Channel,
    ) -> Result<(Self, ChildStdout), TunerError> {
        let zap_command = substitute_command(template, channel);
        let zapper = shell(&zap_command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TunerError::SpawnFailed(format!("{}: {}", zap_command, e)))?;
        let zapper = Proc {
            command: zap_command,
            child: zapper,
        };

        let (reader, stdout) = spawn_reader(&format!("cat {}", device_path))?;
        info!(
            "[Capture] Zapper pid={:?} reading {}: {}",
            zapper.child.id(),
            device_path,
            zapper.command
        );
        Ok((
            Self {
                reader,
                zapper: Some(zapper),
            },
            stdout,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.reader.child.id()
    }

    /// Terminate every child: SIGTERM, then SIGKILL after `timeout`.
    pub async fn kill(self, timeout: Duration) {
        let Self { reader, zapper } = self;
        reader.kill(timeout).await;
        if let Some(zapper) = zapper {
            zapper.kill(timeout).await;
        }
    }
}

fn spawn_reader(command: &str) -> Result<(Proc, ChildStdout), TunerError> {
    let mut child = shell(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| TunerError::SpawnFailed(format!("{}: {}", command, e)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TunerError::SpawnFailed(format!("{}: stdout unavailable", command)))?;
    Ok((
        Proc {
            command: command.to_string(),
            child,
        },
        stdout,
    ))
}

/// Copy `reader` into `tx` in chunks of up to [`CAPTURE_READ_SIZE`] bytes.
///
/// `on_chunk` runs for every chunk before it is broadcast. Returns the
/// total number of bytes read once the reader reaches EOF or fails.
pub async fn forward_output<R, F>(
    mut reader: R,
    tx: broadcast::Sender<Bytes>,
    mut on_chunk: F,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    F: FnMut(usize),
{
    let mut buf = BytesMut::with_capacity(CAPTURE_READ_SIZE);
    let mut total = 0u64;
    loop {
        buf.reserve(CAPTURE_READ_SIZE);
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        on_chunk(n);
        // No receivers is fine; the session may be between consumers.
        let _ = tx.send(buf.split().freeze());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunerd_model::{ChannelType, Polarity, TuningParams};

    #[test]
    fn test_substitute_satellite_channel() {
        let channel = Channel {
            tuning: TuningParams {
                satellite: Some("JCSAT4A".into()),
                space: Some(1),
                freq: Some(12658.0),
                polarity: Some(Polarity::Vertical),
            },
            ..Channel::new(ChannelType::Sky, "CS4")
        };
        let cmd = substitute_command(
            "recpt1 --device <satellite> --space <space> <channel> <freq><polarity> - -",
            &channel,
        );
        assert_eq!(
            cmd,
            "recpt1 --device JCSAT4A --space 1 CS4 12658V - -"
        );
    }

    #[test]
    fn test_substitute_missing_values() {
        let channel = Channel::new(ChannelType::Gr, "27");
        assert_eq!(
            substitute_command("rec <channel> s=<space> f=<freq> p=<polarity>", &channel),
            "rec 27 s=0 f= p="
        );
    }

    #[tokio::test]
    async fn test_forward_output_chunks() {
        let (tx, mut rx) = broadcast::channel(16);
        let (process, stdout) =
            CaptureProcess::spawn_command("printf <channel>", &Channel::new(ChannelType::Gr, "abc"))
                .unwrap();
        let mut seen = 0;
        let total = forward_output(stdout, tx, |n| seen += n).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(seen, 3);
        assert_eq!(&rx.recv().await.unwrap()[..], b"abc");
        process.kill(Duration::from_millis(100)).await;
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        // Zombies count as gone.
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .map(|stat| {
                let state = stat.rsplit(')').next().unwrap_or("").trim_start();
                !state.starts_with('Z')
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_kill_reaches_background_children() {
        use tokio::io::AsyncBufReadExt;

        let (process, stdout) = CaptureProcess::spawn_command(
            "sleep 30 & echo $!; wait",
            &Channel::new(ChannelType::Gr, "27"),
        )
        .unwrap();
        let mut line = String::new();
        tokio::io::BufReader::new(stdout)
            .read_line(&mut line)
            .await
            .unwrap();
        let grandchild: u32 = line.trim().parse().unwrap();
        assert!(is_running(grandchild));

        process.kill(Duration::from_secs(1)).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while is_running(grandchild) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!is_running(grandchild));
    }

    #[tokio::test]
    async fn test_kill_long_running_process() {
        let (process, _stdout) =
            CaptureProcess::spawn_command("sleep 30", &Channel::new(ChannelType::Gr, "27"))
                .unwrap();
        assert!(process.pid().is_some());
        tokio::time::timeout(Duration::from_secs(5), process.kill(Duration::from_secs(1)))
            .await
            .unwrap();
    }
}
