//! Per-event version gate and extended-event fragment buffer.

use crate::ts_analyzer::eit::{EitKind, Track};
use crate::ts_analyzer::ExtendedEventDescriptor;

/// Class of the table a fragment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableClass {
    PresentFollowing = 0,
    ScheduleBasic = 1,
    ScheduleExtended = 2,
}

impl TableClass {
    pub fn of(kind: EitKind) -> Self {
        match kind {
            EitKind::PresentFollowing => TableClass::PresentFollowing,
            EitKind::Schedule {
                track: Track::Basic,
                ..
            } => TableClass::ScheduleBasic,
            EitKind::Schedule {
                track: Track::Extended,
                ..
            } => TableClass::ScheduleExtended,
        }
    }
}

/// `(table_id, version)` of an applied fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableVersion {
    pub table_id: u8,
    pub version: u8,
}

/// Program field groups gated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Schedule = 0,
    Short = 1,
    Extended = 2,
    Component = 3,
    Content = 4,
    Audio = 5,
    Series = 6,
    Group = 7,
}

const FIELD_KINDS: usize = 8;
const CLASSES: usize = 3;

/// Last applied table version per field kind and table class.
#[derive(Debug, Clone, Default)]
pub struct VersionGate {
    records: [[Option<TableVersion>; CLASSES]; FIELD_KINDS],
}

impl VersionGate {
    /// Whether a fragment of `class` at `version` should be applied to `field`.
    pub fn check(&self, field: FieldKind, class: TableClass, version: TableVersion) -> bool {
        let records = &self.records[field as usize];
        if class != TableClass::PresentFollowing
            && records[TableClass::PresentFollowing as usize].is_some()
        {
            return false;
        }
        match records[class as usize] {
            None => true,
            Some(last) if last.table_id != version.table_id => true,
            Some(last) if last.version == version.version => false,
            Some(last) => {
                let behind = last.version.wrapping_sub(version.version) & 0x1F;
                !(2..=15).contains(&behind)
            }
        }
    }

    pub fn commit(&mut self, field: FieldKind, class: TableClass, version: TableVersion) {
        self.records[field as usize][class as usize] = Some(version);
    }

    /// `check` followed by `commit` when it passes.
    pub fn admit(&mut self, field: FieldKind, class: TableClass, version: TableVersion) -> bool {
        if self.check(field, class, version) {
            self.commit(field, class, version);
            true
        } else {
            false
        }
    }
}

/// Extended event descriptors collected until `0..=last` are present.
#[derive(Debug, Clone, Default)]
pub struct ExtendedBuffer {
    source: Option<TableVersion>,
    fragments: Vec<Option<ExtendedEventDescriptor>>,
}

impl ExtendedBuffer {
    /// Store a fragment; returns all fragments in order once complete.
    pub fn push(
        &mut self,
        source: TableVersion,
        fragment: ExtendedEventDescriptor,
    ) -> Option<Vec<ExtendedEventDescriptor>> {
        let expected = fragment.last_descriptor_number as usize + 1;
        if self.source != Some(source) || self.fragments.len() != expected {
            self.source = Some(source);
            self.fragments = vec![None; expected];
        }
        let index = fragment.descriptor_number as usize;
        if index >= expected {
            return None;
        }
        self.fragments[index] = Some(fragment);
        if self.fragments.iter().all(Option::is_some) {
            self.source = None;
            return std::mem::take(&mut self.fragments).into_iter().collect();
        }
        None
    }

    pub fn clear(&mut self) {
        self.source = None;
        self.fragments.clear();
    }

    pub fn is_pending(&self) -> bool {
        !self.fragments.is_empty()
    }
}

/// Transient state of one event.
#[derive(Debug, Clone, Default)]
pub struct EventState {
    pub gate: VersionGate,
    pub extended: ExtendedBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::descriptors::TextCodec;

    fn tv(table_id: u8, version: u8) -> TableVersion {
        TableVersion { table_id, version }
    }

    #[test]
    fn test_gate_versions() {
        let mut gate = VersionGate::default();
        let class = TableClass::ScheduleBasic;
        assert!(gate.admit(FieldKind::Short, class, tv(0x50, 5)));
        assert!(!gate.check(FieldKind::Short, class, tv(0x50, 5)));
        assert!(gate.check(FieldKind::Short, class, tv(0x50, 6)));
        assert!(gate.check(FieldKind::Short, class, tv(0x50, 4)));
        assert!(!gate.check(FieldKind::Short, class, tv(0x50, 3)));
        assert!(gate.check(FieldKind::Short, class, tv(0x51, 3)));
        // wraps modulo 32
        gate.commit(FieldKind::Short, class, tv(0x50, 1));
        assert!(!gate.check(FieldKind::Short, class, tv(0x50, 30)));
        assert!(gate.check(FieldKind::Short, class, tv(0x50, 0)));
        // other kinds are independent
        assert!(gate.check(FieldKind::Content, class, tv(0x50, 1)));
    }

    #[test]
    fn test_present_following_outranks_schedule() {
        let mut gate = VersionGate::default();
        assert!(gate.admit(FieldKind::Schedule, TableClass::PresentFollowing, tv(0x4E, 0)));
        assert!(!gate.check(FieldKind::Schedule, TableClass::ScheduleBasic, tv(0x50, 9)));
        assert!(gate.check(FieldKind::Schedule, TableClass::PresentFollowing, tv(0x4E, 1)));
    }

    fn fragment(number: u8, last: u8) -> ExtendedEventDescriptor {
        ExtendedEventDescriptor {
            descriptor_number: number,
            last_descriptor_number: last,
            items: vec![(vec![number], vec![number])],
            codec: TextCodec::Arib,
        }
    }

    #[test]
    fn test_extended_buffer_completes_in_order() {
        let mut buffer = ExtendedBuffer::default();
        assert!(buffer.push(tv(0x58, 1), fragment(1, 2)).is_none());
        assert!(buffer.push(tv(0x58, 1), fragment(0, 2)).is_none());
        let done = buffer.push(tv(0x58, 1), fragment(2, 2)).unwrap();
        let numbers: Vec<u8> = done.iter().map(|f| f.descriptor_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
        assert!(!buffer.is_pending());
    }

    #[test]
    fn test_extended_buffer_resets_on_new_version() {
        let mut buffer = ExtendedBuffer::default();
        assert!(buffer.push(tv(0x58, 1), fragment(0, 1)).is_none());
        assert!(buffer.push(tv(0x58, 2), fragment(1, 1)).is_none());
        assert!(buffer.push(tv(0x58, 2), fragment(0, 1)).is_some());
    }
}
