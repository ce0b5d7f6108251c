//! Output queue between packet classification and the sink.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// FIFO of provisioned packets.
///
/// While a byte limit is set the oldest packets are dropped to stay under
/// it; [`PacketQueue::take`] drains in arrival order.
#[derive(Debug, Default)]
pub struct PacketQueue {
    packets: VecDeque<Bytes>,
    bytes: usize,
    limit: Option<usize>,
    dropped_packets: u64,
    dropped_bytes: u64,
}

impl PacketQueue {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
        self.enforce_limit();
    }

    pub fn push(&mut self, packet: Bytes) {
        self.bytes += packet.len();
        self.packets.push_back(packet);
        self.enforce_limit();
    }

    fn enforce_limit(&mut self) {
        let Some(limit) = self.limit else {
            return;
        };
        while self.bytes > limit {
            let Some(oldest) = self.packets.pop_front() else {
                break;
            };
            self.bytes -= oldest.len();
            self.dropped_packets += 1;
            self.dropped_bytes += oldest.len() as u64;
        }
    }

    /// Remove up to `max_bytes` from the front as one contiguous chunk.
    /// At least one packet is taken if any is queued.
    pub fn take(&mut self, max_bytes: usize) -> Option<Bytes> {
        let first = self.packets.pop_front()?;
        self.bytes -= first.len();
        if self.packets.front().map_or(true, |p| first.len() + p.len() > max_bytes) {
            return Some(first);
        }

        let mut out = BytesMut::with_capacity(max_bytes.min(first.len() + self.bytes));
        out.extend_from_slice(&first);
        while let Some(next) = self.packets.front() {
            if out.len() + next.len() > max_bytes {
                break;
            }
            out.extend_from_slice(next);
            self.bytes -= next.len();
            self.packets.pop_front();
        }
        Some(out.freeze())
    }

    pub fn clear(&mut self) {
        self.packets.clear();
        self.bytes = 0;
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }
}
