//! EIT schedule sweep completeness.
//!
//! Each schedule table (flag slot) covers 32 segments of 3 hours with up to
//! 8 sections each. A bit in `flag` marks a section as observed, a bit in
//! `ignore` marks one that need not be observed.

use tunerd_model::Timestamp;

use crate::ts_analyzer::eit::{EitKind, EitSection, Track};
use crate::ts_analyzer::time::jst_segment_of_day;

const SEGMENTS: usize = 32;
const SLOTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlagSlot {
    flag: [u8; SEGMENTS],
    ignore: [u8; SEGMENTS],
    version: Option<u8>,
}

impl Default for FlagSlot {
    fn default() -> Self {
        Self {
            flag: [0; SEGMENTS],
            ignore: [0; SEGMENTS],
            version: None,
        }
    }
}

impl FlagSlot {
    fn reset(&mut self) {
        self.flag = [0; SEGMENTS];
        self.ignore = [0; SEGMENTS];
    }

    fn ignore_all(&mut self) {
        self.ignore = [0xFF; SEGMENTS];
    }

    fn is_complete(&self) -> bool {
        self.flag
            .iter()
            .zip(self.ignore.iter())
            .all(|(f, i)| f | i == 0xFF)
    }
}

/// Completeness bitmaps of one service: basic and extended tracks.
#[derive(Debug, Clone, Default)]
pub struct ServiceCompleteness {
    tracks: [[FlagSlot; SLOTS]; 2],
}

impl ServiceCompleteness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a schedule section. Present/following sections are ignored.
    pub fn update(&mut self, eit: &EitSection, now: Timestamp) {
        let EitKind::Schedule { track, slot } = eit.kind else {
            return;
        };
        let slots = &mut self.tracks[track as usize];

        for later in slots.iter_mut().skip(eit.last_table_slot as usize + 1) {
            later.ignore_all();
        }

        let current = &mut slots[slot as usize];
        match current.version {
            Some(v) if v != eit.version && eit.version != (v + 1) & 0x1F => current.reset(),
            _ => {}
        }
        current.version = Some(eit.version);

        let last_segment = (eit.last_section_number >> 3) as usize;
        for ignore in current.ignore.iter_mut().skip(last_segment + 1) {
            *ignore = 0xFF;
        }

        let segment = (eit.section_number >> 3) as usize;
        let segment_last = eit.segment_last_section_number & 0x07;
        current.ignore[segment] |= !(0xFFu8 >> (7 - segment_last));
        current.flag[segment] |= 1 << (eit.section_number & 0x07);

        if slot == 0 {
            let past = jst_segment_of_day(now) as usize;
            for ignore in current.ignore.iter_mut().take(past) {
                *ignore = 0xFF;
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.tracks
            .iter()
            .all(|slots| slots.iter().all(FlagSlot::is_complete))
    }

    /// Number of complete slots, for progress logging.
    pub fn complete_slots(&self, track: Track) -> usize {
        self.tracks[track as usize]
            .iter()
            .filter(|s| s.is_complete())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::eit::EitSection;

    /// Schedule section for `track`/`slot` with one table per track and
    /// `segments` segments of one section each.
    fn section(track: Track, section_number: u8, last_section_number: u8, version: u8) -> EitSection {
        let base = if track == Track::Basic { 0x50 } else { 0x58 };
        EitSection {
            table_id: base,
            service_id: 1,
            version,
            section_number,
            last_section_number,
            transport_stream_id: 1,
            original_network_id: 1,
            segment_last_section_number: section_number,
            last_table_id: base,
            kind: EitKind::Schedule { track, slot: 0 },
            last_table_slot: 0,
            events: Vec::new(),
        }
    }

    // 1970-01-01 00:00 JST, segment 0 of the day.
    const MIDNIGHT_JST: Timestamp = -9 * 3_600_000;

    #[test]
    fn test_ready_after_full_coverage() {
        let mut c = ServiceCompleteness::new();
        let last = 8 * 3; // four segments
        for seg in 0..4u8 {
            c.update(&section(Track::Basic, seg * 8, last, 0), MIDNIGHT_JST);
            assert!(!c.is_ready());
        }
        for seg in 0..3u8 {
            c.update(&section(Track::Extended, seg * 8, last, 0), MIDNIGHT_JST);
            assert!(!c.is_ready());
        }
        c.update(&section(Track::Extended, 24, last, 0), MIDNIGHT_JST);
        assert!(c.is_ready());
        assert_eq!(c.complete_slots(Track::Basic), SLOTS);
    }

    #[test]
    fn test_version_jump_resets_slot() {
        let mut c = ServiceCompleteness::new();
        c.update(&section(Track::Basic, 0, 8, 0), MIDNIGHT_JST);
        c.update(&section(Track::Extended, 0, 0, 0), MIDNIGHT_JST);
        // +1 keeps the observed segment
        c.update(&section(Track::Basic, 8, 8, 1), MIDNIGHT_JST);
        assert!(c.is_ready());

        let mut c = ServiceCompleteness::new();
        c.update(&section(Track::Basic, 0, 8, 0), MIDNIGHT_JST);
        c.update(&section(Track::Extended, 0, 0, 0), MIDNIGHT_JST);
        // +3 discards it
        c.update(&section(Track::Basic, 8, 8, 3), MIDNIGHT_JST);
        assert!(!c.is_ready());
    }

    #[test]
    fn test_past_segments_ignored_in_first_slot() {
        let mut c = ServiceCompleteness::new();
        // 06:00 JST: segments 0 and 1 are in the past
        let now = MIDNIGHT_JST + 6 * 3_600_000;
        c.update(&section(Track::Basic, 16, 16, 0), now);
        c.update(&section(Track::Extended, 16, 16, 0), now);
        assert!(c.is_ready());
    }

    #[test]
    fn test_partial_segment_not_ready() {
        let mut c = ServiceCompleteness::new();
        let mut s = section(Track::Basic, 0, 0, 0);
        s.segment_last_section_number = 1;
        c.update(&s, MIDNIGHT_JST);
        c.update(&section(Track::Extended, 0, 0, 0), MIDNIGHT_JST);
        assert!(!c.is_ready());
        let mut s = section(Track::Basic, 1, 1, 0);
        s.segment_last_section_number = 1;
        c.update(&s, MIDNIGHT_JST);
        assert!(c.is_ready());
    }
}
