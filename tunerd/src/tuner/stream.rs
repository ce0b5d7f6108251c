//! Consumer handle and the pump task that feeds a demuxer from a device.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::demux::{Demuxer, FilterStats};

use super::device::TunerDevice;

/// An open stream.
///
/// Dropping the handle closes the stream and detaches it from its device.
pub struct TunerStream {
    consumer_id: u64,
    device_index: usize,
    rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<FilterStats>>,
}

impl TunerStream {
    pub(crate) fn new(
        consumer_id: u64,
        device_index: usize,
        rx: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
        pump: JoinHandle<FilterStats>,
    ) -> Self {
        Self {
            consumer_id,
            device_index,
            rx,
            cancel,
            pump: Some(pump),
        }
    }

    pub fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    /// Next chunk of output, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Request the stream to stop. Pending output can still be received.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Stop the stream and wait for the pump to finish.
    pub async fn finish(mut self) -> Option<FilterStats> {
        self.cancel.cancel();
        let pump = self.pump.take()?;
        pump.await.ok()
    }
}

impl Drop for TunerStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Drive `demuxer` from a device's broadcast until cancelled, the source
/// closes or the demuxer closes itself. Detaches `consumer_id` on exit.
pub(crate) fn spawn_pump(
    device: Arc<TunerDevice>,
    consumer_id: u64,
    mut rx: broadcast::Receiver<Bytes>,
    mut demuxer: Box<dyn Demuxer>,
    tick: Duration,
    cancel: CancellationToken,
) -> JoinHandle<FilterStats> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[Pump] Consumer {} cancelled", consumer_id);
                    break;
                }
                received = rx.recv() => match received {
                    Ok(chunk) => {
                        if demuxer.write(&chunk).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "[Pump] Consumer {} lagging behind device #{}, {} chunks skipped",
                            consumer_id,
                            device.index(),
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => {
                        info!("[Pump] Device #{} stopped feeding consumer {}", device.index(), consumer_id);
                        break;
                    }
                },
                _ = interval.tick() => demuxer.on_tick(Instant::now()),
            }
            if demuxer.is_closed() {
                break;
            }
        }

        demuxer.close();
        device.stop_stream(consumer_id).await;
        demuxer.stats()
    })
}
