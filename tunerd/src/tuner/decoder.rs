//! Consumer sink construction.

use bytes::Bytes;
use log::debug;
use tokio::sync::mpsc;

use crate::demux::{ChannelSink, DecoderSink, StreamSink};

/// Build the sink a stream writes to and the receiver the consumer reads.
///
/// When the device has a decoder and the consumer did not opt out, output
/// is piped through the decoder process first.
pub fn build_sink(
    decoder: Option<&str>,
    disable_decoder: bool,
    capacity: usize,
) -> std::io::Result<(Box<dyn StreamSink>, mpsc::Receiver<Bytes>)> {
    match decoder.filter(|_| !disable_decoder) {
        Some(command) => {
            let (tx, rx) = mpsc::channel(capacity);
            let sink = DecoderSink::spawn(command, tx)?;
            Ok((Box::new(sink), rx))
        }
        None => {
            debug!("[Decoder] Raw output (decoder disabled: {})", disable_decoder);
            let (sink, rx) = ChannelSink::channel(capacity);
            Ok((Box::new(sink), rx))
        }
    }
}
