//! TSMF (multi-stream frame) slot selection.
//!
//! A frame is one header packet on PID 0x002F followed by 52 slot packets.
//! The header lists the relative stream number of every slot as a nibble,
//! starting at packet byte 73.

use crate::ts_analyzer::packet::TS_PACKET_SIZE;
use crate::ts_analyzer::pid;

const FRAME_SYNC_A: u16 = 0x1A86;
const FRAME_SYNC_B: u16 = 0x0579;
const SLOTS_PER_FRAME: usize = 52;
const SLOT_TABLE_OFFSET: usize = 73;

/// Keeps only packets of one relative stream.
#[derive(Debug)]
pub struct TsmfSelector {
    rel_ts: u8,
    slots: Option<[u8; SLOTS_PER_FRAME]>,
    position: usize,
}

impl TsmfSelector {
    pub fn new(rel_ts: u8) -> Self {
        Self {
            rel_ts,
            slots: None,
            position: 0,
        }
    }

    fn parse_header(packet: &[u8]) -> Option<[u8; SLOTS_PER_FRAME]> {
        if packet.len() < TS_PACKET_SIZE {
            return None;
        }
        let sync = ((packet[4] as u16 & 0x1F) << 8) | packet[5] as u16;
        if sync != FRAME_SYNC_A && sync != FRAME_SYNC_B {
            return None;
        }
        let mut slots = [0u8; SLOTS_PER_FRAME];
        for (i, slot) in slots.iter_mut().enumerate() {
            let byte = packet[SLOT_TABLE_OFFSET + i / 2];
            *slot = if i % 2 == 0 { byte >> 4 } else { byte & 0x0F };
        }
        Some(slots)
    }

    /// Whether `packet` (with its PID) belongs to the selected stream.
    /// Frame headers are consumed and never kept.
    pub fn accept(&mut self, pid: u16, packet: &[u8]) -> bool {
        if pid == pid::TSMF {
            if let Some(slots) = Self::parse_header(packet) {
                self.slots = Some(slots);
                self.position = 0;
            }
            return false;
        }
        let Some(slots) = &self.slots else {
            return false;
        };
        let Some(&slot) = slots.get(self.position) else {
            return false;
        };
        self.position += 1;
        slot == self.rel_ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::testutil;

    fn header(slots: &[u8; SLOTS_PER_FRAME]) -> Vec<u8> {
        let mut payload = vec![0u8; 184];
        payload[0] = 0x1A;
        payload[1] = 0x86;
        for (i, &s) in slots.iter().enumerate() {
            let b = &mut payload[SLOT_TABLE_OFFSET - 4 + i / 2];
            if i % 2 == 0 {
                *b |= s << 4;
            } else {
                *b |= s;
            }
        }
        testutil::ts_packet(pid::TSMF, 0, false, &payload)
    }

    #[test]
    fn test_selects_slots_of_relative_stream() {
        let mut slots = [1u8; SLOTS_PER_FRAME];
        slots[1] = 2;
        slots[3] = 2;
        let mut selector = TsmfSelector::new(2);

        let data = testutil::ts_packet(0x100, 0, false, &[]);
        // nothing passes before a frame header
        assert!(!selector.accept(0x100, &data));

        let h = header(&slots);
        assert!(!selector.accept(pid::TSMF, &h));
        let kept: Vec<bool> = (0..5).map(|_| selector.accept(0x100, &data)).collect();
        assert_eq!(kept, vec![false, true, false, true, false]);

        // a new header restarts the slot counter
        assert!(!selector.accept(pid::TSMF, &h));
        assert!(!selector.accept(0x100, &data));
        assert!(selector.accept(0x100, &data));
    }

    #[test]
    fn test_invalid_frame_sync_ignored() {
        let mut selector = TsmfSelector::new(1);
        let mut h = header(&[1u8; SLOTS_PER_FRAME]);
        h[4] = 0;
        h[5] = 0;
        assert!(!selector.accept(pid::TSMF, &h));
        assert!(!selector.accept(0x100, &testutil::ts_packet(0x100, 0, false, &[])));
    }
}
