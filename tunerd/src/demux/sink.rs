//! Consumer sinks fed by a filter.
//!
//! [`ChannelSink`] hands chunks to a bounded `mpsc` channel read by the
//! consumer. [`DecoderSink`] pipes them through an external decoder process
//! first and forwards its stdout.

use std::process::Stdio;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

const DECODER_READ_SIZE: usize = 64 * 1024;
const DECODER_INPUT_CAPACITY: usize = 256;
const DECODER_EXIT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    /// The consumer went away.
    #[error("Sink closed")]
    Closed,
    /// The consumer is not keeping up; the chunk was discarded.
    #[error("Sink full")]
    Full,
}

/// Destination of the bytes a filter provisions.
pub trait StreamSink: Send {
    fn write(&mut self, data: Bytes) -> Result<(), SinkError>;
    fn close(&mut self);
}

fn try_send(tx: &Option<mpsc::Sender<Bytes>>, data: Bytes) -> Result<(), SinkError> {
    let Some(tx) = tx else {
        return Err(SinkError::Closed);
    };
    tx.try_send(data).map_err(|e| match e {
        TrySendError::Full(_) => SinkError::Full,
        TrySendError::Closed(_) => SinkError::Closed,
    })
}

/// Sink writing into a bounded channel.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Create a sink and the receiver for its consumer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl StreamSink for ChannelSink {
    fn write(&mut self, data: Bytes) -> Result<(), SinkError> {
        try_send(&self.tx, data)
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

/// Sink that pipes chunks through a decoder process (`sh -c <command>`).
pub struct DecoderSink {
    input: Option<mpsc::Sender<Bytes>>,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
}

impl DecoderSink {
    /// Spawn the decoder; its stdout is forwarded to `output`.
    pub fn spawn(command: &str, output: mpsc::Sender<Bytes>) -> std::io::Result<Self> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (input, mut rx) = mpsc::channel::<Bytes>(DECODER_INPUT_CAPACITY);

        if let Some(mut stdin) = stdin {
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    if let Err(e) = stdin.write_all(&chunk).await {
                        debug!("[Decoder] stdin closed: {}", e);
                        break;
                    }
                }
            });
        }

        let reader = stdout.map(|mut stdout| {
            tokio::spawn(async move {
                let mut buf = BytesMut::with_capacity(DECODER_READ_SIZE);
                loop {
                    buf.reserve(DECODER_READ_SIZE);
                    match stdout.read_buf(&mut buf).await {
                        Ok(0) => break,
                        Ok(_) => {
                            if output.send(buf.split().freeze()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("[Decoder] Read error: {}", e);
                            break;
                        }
                    }
                }
            })
        });

        debug!("[Decoder] Spawned: {}", command);
        Ok(Self {
            input: Some(input),
            child: Some(child),
            reader,
        })
    }
}

impl StreamSink for DecoderSink {
    fn write(&mut self, data: Bytes) -> Result<(), SinkError> {
        try_send(&self.input, data)
    }

    fn close(&mut self) {
        self.input = None;
        let Some(mut child) = self.child.take() else {
            return;
        };
        let reader = self.reader.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if tokio::time::timeout(DECODER_EXIT_TIMEOUT, child.wait())
                        .await
                        .is_err()
                    {
                        let _ = child.kill().await;
                    }
                    if let Some(mut reader) = reader {
                        // let the tail of the decoder output drain
                        if tokio::time::timeout(DECODER_EXIT_TIMEOUT, &mut reader)
                            .await
                            .is_err()
                        {
                            reader.abort();
                        }
                    }
                });
            }
            Err(_) => {
                let _ = child.start_kill();
            }
        }
    }
}

impl Drop for DecoderSink {
    fn drop(&mut self) {
        self.close();
    }
}
