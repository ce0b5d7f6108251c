//! Folds EIT / MH-EIT sections into catalog programs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use tunerd_model::{
    program_id, service_item_id, AudioInfo, Genre, Program, ProgramId, ProgramPatch, RelatedItem,
    SeriesInfo, ServiceItemId, ServicePatch, Timestamp, VideoInfo,
};

use crate::catalog::Catalog;
use crate::ts_analyzer::eit::{EitEvent, EitSection, EventDescriptor};
use crate::ts_analyzer::ExtendedEventDescriptor;

use super::completeness::ServiceCompleteness;
use super::state::{EventState, FieldKind, TableClass, TableVersion};

/// Descriptors of one event grouped by kind.
#[derive(Default)]
struct Collected<'a> {
    short: Option<(&'a str, &'a str)>,
    extended: Vec<&'a ExtendedEventDescriptor>,
    video: Option<&'a VideoInfo>,
    genres: Vec<Genre>,
    audios: BTreeMap<u16, AudioInfo>,
    series: Option<&'a SeriesInfo>,
    related: Vec<RelatedItem>,
}

impl<'a> Collected<'a> {
    fn gather(descriptors: &'a [EventDescriptor]) -> Self {
        let mut c = Collected::default();
        for d in descriptors {
            match d {
                EventDescriptor::Short { name, text } => c.short = Some((name.as_str(), text.as_str())),
                EventDescriptor::Extended(ext) => c.extended.push(ext),
                EventDescriptor::Component(video) => {
                    c.video.get_or_insert(video);
                }
                EventDescriptor::Content(genres) => c.genres.extend_from_slice(genres),
                EventDescriptor::Audio(audio) => {
                    c.audios.entry(audio.component_tag).or_insert_with(|| audio.clone());
                }
                EventDescriptor::Series(series) => {
                    c.series.get_or_insert(series);
                }
                EventDescriptor::Group(items) => c.related.extend_from_slice(items),
            }
        }
        c
    }
}

/// Merge complete extended event fragments into a key/text map.
///
/// Item bytes are concatenated per key before decoding; an item with an
/// empty description continues the previous key.
pub fn merge_extended(fragments: &[ExtendedEventDescriptor]) -> BTreeMap<String, String> {
    let Some(codec) = fragments.first().map(|f| f.codec) else {
        return BTreeMap::new();
    };
    let mut items: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for (desc, item) in fragments.iter().flat_map(|f| f.items.iter()) {
        let target = if desc.is_empty() {
            items.len().checked_sub(1)
        } else {
            items.iter().position(|(d, _)| d == desc)
        };
        match target {
            Some(i) => items[i].1.extend_from_slice(item),
            None => items.push((desc.clone(), item.clone())),
        }
    }
    items
        .into_iter()
        .map(|(desc, item)| (codec.decode(&desc), codec.decode(&item)))
        .collect()
}

#[derive(Default)]
struct Inner {
    events: HashMap<ProgramId, EventState>,
    completeness: HashMap<ServiceItemId, ServiceCompleteness>,
    completed: HashSet<ServiceItemId>,
}

/// EPG assembler shared by every filter feeding the same catalog.
pub struct EpgAssembler {
    catalog: Arc<Catalog>,
    inner: Mutex<Inner>,
}

impl EpgAssembler {
    pub fn new(catalog: Arc<Catalog>) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Apply one EIT / MH-EIT section.
    pub fn process(&self, eit: &EitSection, now: Timestamp) {
        let mut inner = self.inner.lock();
        let class = TableClass::of(eit.kind);
        let source = TableVersion {
            table_id: eit.table_id,
            version: eit.version,
        };
        for event in &eit.events {
            self.apply_event(&mut inner, eit, event, class, source);
        }
        if !eit.is_present_following() {
            self.track_completeness(&mut inner, eit, now);
        }
    }

    fn apply_event(
        &self,
        inner: &mut Inner,
        eit: &EitSection,
        event: &EitEvent,
        class: TableClass,
        source: TableVersion,
    ) {
        let nid = eit.original_network_id;
        let sid = eit.service_id;
        let id = program_id(nid, sid, event.event_id);
        let programs = &self.catalog.programs;
        let pf = (class == TableClass::PresentFollowing).then_some(eit.section_number);

        let current = programs.get(id);
        if current.is_none() && event.start_time.is_none() {
            return;
        }
        let state = inner.events.entry(id).or_default();
        let mut patch = ProgramPatch::default();
        let mut time_changed = false;

        match &current {
            None => {
                let Some(start) = event.start_time else {
                    return;
                };
                let mut program = Program::new(
                    nid,
                    sid,
                    event.event_id,
                    start,
                    event.duration.unwrap_or(1),
                    !event.free_ca_mode,
                );
                if let Some(section) = pf {
                    program.present_flag = Some(section == 0);
                    program.following_flag = Some(section == 1);
                }
                state.gate.commit(FieldKind::Schedule, class, source);
                programs.add(program);
                time_changed = true;
            }
            Some(existing) => {
                if state.gate.admit(FieldKind::Schedule, class, source) {
                    patch.start_at = event.start_time;
                    patch.duration = event.duration;
                    patch.is_free = Some(!event.free_ca_mode);
                    if let Some(section) = pf {
                        patch.present_flag = Some(section == 0);
                        patch.following_flag = Some(section == 1);
                    }
                    time_changed = patch.start_at.is_some_and(|s| s != existing.start_at)
                        || patch.duration.is_some_and(|d| d != existing.duration);
                }
            }
        }

        let collected = Collected::gather(&event.descriptors);
        if let Some((name, text)) = collected.short {
            if state.gate.admit(FieldKind::Short, class, source) {
                patch.name = Some(name.to_string());
                patch.description = Some(text.to_string());
            }
        }
        if !collected.extended.is_empty() && state.gate.check(FieldKind::Extended, class, source) {
            let mut complete = None;
            for fragment in collected.extended {
                if let Some(fragments) = state.extended.push(source, fragment.clone()) {
                    complete = Some(fragments);
                }
            }
            if let Some(fragments) = complete {
                state.gate.commit(FieldKind::Extended, class, source);
                patch.extended = Some(merge_extended(&fragments));
            }
        }
        if let Some(video) = collected.video {
            if state.gate.admit(FieldKind::Component, class, source) {
                patch.video = Some(video.clone());
            }
        }
        if !collected.genres.is_empty() && state.gate.admit(FieldKind::Content, class, source) {
            patch.genres = Some(collected.genres);
        }
        if !collected.audios.is_empty() && state.gate.admit(FieldKind::Audio, class, source) {
            patch.audios = Some(collected.audios.into_values().collect());
        }
        if let Some(series) = collected.series {
            if state.gate.admit(FieldKind::Series, class, source) {
                patch.series = Some(series.clone());
            }
        }
        if !collected.related.is_empty() && state.gate.admit(FieldKind::Group, class, source) {
            patch.related_items = Some(collected.related);
        }

        if !patch.is_empty() {
            programs.set(id, &patch);
        }
        if time_changed {
            self.evict_overlaps(inner, id);
        }
    }

    /// Remove programs overlapping `id` so that one survives per interval.
    fn evict_overlaps(&self, inner: &mut Inner, id: ProgramId) {
        let programs = &self.catalog.programs;
        let Some(program) = programs.get(id) else {
            return;
        };
        let overlapping = programs.find_overlapping(&program);
        if !program.has_pf_confidence() {
            if let Some(other) = overlapping.iter().find(|o| o.has_pf_confidence()) {
                debug!(
                    "[Epg] Dropping event {} overlapping p/f event {}",
                    program.event_id, other.event_id
                );
                programs.remove(program.id);
                inner.events.remove(&program.id);
                return;
            }
        }
        for other in overlapping {
            debug!(
                "[Epg] Evicting event {} overlapped by event {}",
                other.event_id, program.event_id
            );
            programs.remove(other.id);
            inner.events.remove(&other.id);
        }
    }

    fn track_completeness(&self, inner: &mut Inner, eit: &EitSection, now: Timestamp) {
        let nid = eit.original_network_id;
        let sid = eit.service_id;
        let key = service_item_id(nid, sid);
        if inner.completed.contains(&key) {
            return;
        }
        let tracker = inner.completeness.entry(key).or_default();
        tracker.update(eit, now);
        if !tracker.is_ready() {
            return;
        }

        if self.catalog.services.get(nid, sid).is_none() {
            debug!("[Epg] nid={} sid={} complete but not in catalog yet", nid, sid);
            return;
        }
        inner.completeness.remove(&key);
        inner.completed.insert(key);
        info!("[Epg] EPG complete for nid={} sid={}", nid, sid);
        self.catalog.services.set(
            nid,
            sid,
            &ServicePatch {
                epg_ready: Some(true),
                epg_updated_at: Some(now),
                ..Default::default()
            },
        );
    }

    /// Start a new completeness sweep for a service.
    pub fn restart_tracking(&self, network_id: u16, service_id: u16) {
        let key = service_item_id(network_id, service_id);
        let mut inner = self.inner.lock();
        inner.completed.remove(&key);
        inner.completeness.remove(&key);
    }

    pub fn is_complete(&self, network_id: u16, service_id: u16) -> bool {
        self.inner
            .lock()
            .completed
            .contains(&service_item_id(network_id, service_id))
    }

    /// Drop buffered extended event fragments of the given services.
    pub fn clear_fragments(&self, services: &HashSet<ServiceItemId>) {
        let mut inner = self.inner.lock();
        for (id, state) in inner.events.iter_mut() {
            if services.contains(&(id / 100_000)) {
                state.extended.clear();
            }
        }
    }

    /// Remove expired programs and their event state.
    pub fn gc(&self, now: Timestamp) -> usize {
        let removed = self.catalog.programs.gc(now);
        let mut inner = self.inner.lock();
        for id in &removed {
            inner.events.remove(id);
        }
        inner
            .events
            .retain(|id, _| self.catalog.programs.exists(*id));
        removed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ProgramGc;
    use crate::ts_analyzer::descriptors::TextCodec;
    use crate::ts_analyzer::psi::PsiSection;
    use crate::ts_analyzer::testutil::{self, TestEvent};
    use tunerd_model::{CatalogEvent, ChannelKey, ChannelType, EventKind, Service};

    const HOUR: i64 = 3_600_000;
    const T0: i64 = 1_700_000_000_000;
    const NID: u16 = 0x7FE8;
    const SID: u16 = 0x0400;

    fn setup() -> (Arc<EpgAssembler>, tokio::sync::broadcast::Receiver<CatalogEvent>) {
        let catalog = Catalog::new(Vec::new(), ProgramGc::default());
        let rx = catalog.subscribe();
        (EpgAssembler::new(catalog), rx)
    }

    fn eit(tid: u8, version: u8, section: u8, last: u8, events: &[TestEvent]) -> EitSection {
        let raw = testutil::eit_section(tid, SID, NID, version, section, last, events);
        EitSection::parse(&PsiSection::parse_checked(&raw).unwrap()).unwrap()
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<CatalogEvent>) -> Vec<CatalogEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_create_then_fill() {
        let (epg, mut rx) = setup();
        epg.process(&eit(0x50, 0, 0, 0, &[TestEvent::new(1, T0, HOUR)]), T0);
        epg.process(
            &eit(0x50, 1, 0, 0, &[TestEvent::new(1, T0, HOUR).short("News", "Today").content(0, 1)]),
            T0,
        );
        let program = epg.catalog().programs.get(program_id(NID, SID, 1)).unwrap();
        assert_eq!(program.name.as_deref(), Some("News"));
        assert_eq!(program.description.as_deref(), Some("Today"));
        assert_eq!(program.genres.as_ref().map(Vec::len), Some(1));
        let kinds: Vec<EventKind> = drain(&mut rx).iter().map(CatalogEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::Create, EventKind::Update]);
    }

    #[test]
    fn test_unknown_start_is_skipped() {
        let (epg, _rx) = setup();
        epg.process(&eit(0x50, 0, 0, 0, &[TestEvent::new(1, T0, HOUR).unknown_start()]), T0);
        assert!(epg.catalog().programs.is_empty());
    }

    #[test]
    fn test_identical_replay_is_idempotent() {
        let (epg, mut rx) = setup();
        let section = eit(0x50, 3, 0, 0, &[TestEvent::new(1, T0, HOUR).short("A", "B")]);
        epg.process(&section, T0);
        let first = drain(&mut rx);
        assert!(!first.is_empty());
        epg.process(&section, T0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_stale_version_rejected() {
        let (epg, _rx) = setup();
        epg.process(&eit(0x50, 5, 0, 0, &[TestEvent::new(1, T0, HOUR).short("new", "")]), T0);
        epg.process(&eit(0x50, 2, 0, 0, &[TestEvent::new(1, T0, HOUR).short("old", "")]), T0);
        let program = epg.catalog().programs.get(program_id(NID, SID, 1)).unwrap();
        assert_eq!(program.name.as_deref(), Some("new"));
    }

    #[test]
    fn test_overlap_evicts_older_entry() {
        let (epg, mut rx) = setup();
        epg.process(&eit(0x50, 0, 0, 0, &[TestEvent::new(1, T0, HOUR)]), T0);
        epg.process(&eit(0x50, 1, 0, 0, &[TestEvent::new(2, T0 + HOUR / 2, HOUR)]), T0);

        let programs = &epg.catalog().programs;
        assert!(!programs.exists(program_id(NID, SID, 1)));
        assert!(programs.exists(program_id(NID, SID, 2)));
        let removed: Vec<u16> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                CatalogEvent::Program {
                    kind: EventKind::Remove,
                    data,
                } => Some(data.event_id),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec![1]);
    }

    #[test]
    fn test_present_following_entry_survives_overlap() {
        let (epg, _rx) = setup();
        epg.process(&eit(0x4E, 0, 0, 1, &[TestEvent::new(1, T0, HOUR)]), T0);
        epg.process(&eit(0x50, 0, 0, 0, &[TestEvent::new(2, T0, HOUR)]), T0);

        let programs = &epg.catalog().programs;
        let present = programs.get(program_id(NID, SID, 1)).unwrap();
        assert_eq!(present.present_flag, Some(true));
        assert_eq!(present.following_flag, Some(false));
        assert!(!programs.exists(program_id(NID, SID, 2)));
    }

    #[test]
    fn test_pf_entry_keeps_neighbour_of_dropped_entry() {
        let (epg, _rx) = setup();
        epg.process(&eit(0x50, 0, 0, 0, &[TestEvent::new(2, T0 + HOUR, HOUR)]), T0);
        epg.process(&eit(0x4E, 0, 0, 1, &[TestEvent::new(1, T0, HOUR)]), T0);
        // Overlaps both the p/f entry and the schedule entry after it.
        epg.process(&eit(0x50, 1, 0, 0, &[TestEvent::new(3, T0 + HOUR / 2, HOUR)]), T0);

        let programs = &epg.catalog().programs;
        assert!(programs.exists(program_id(NID, SID, 1)));
        assert!(programs.exists(program_id(NID, SID, 2)));
        assert!(!programs.exists(program_id(NID, SID, 3)));
    }

    #[test]
    fn test_extended_key_carry_forward() {
        let (epg, _rx) = setup();
        let event = TestEvent::new(1, T0, HOUR)
            .extended(0, 1, &[("Cast", "Alice"), ("", " and Bob")])
            .extended(1, 1, &[("", " with Carol"), ("Staff", "Dave")]);
        epg.process(&eit(0x58, 0, 0, 0, &[event]), T0);

        let program = epg.catalog().programs.get(program_id(NID, SID, 1)).unwrap();
        let extended = program.extended.unwrap();
        assert_eq!(extended.get("Cast").map(String::as_str), Some("Alice and Bob with Carol"));
        assert_eq!(extended.get("Staff").map(String::as_str), Some("Dave"));
    }

    #[test]
    fn test_extended_waits_for_all_fragments() {
        let (epg, _rx) = setup();
        let event = TestEvent::new(1, T0, HOUR).extended(1, 1, &[("Cast", "Alice")]);
        epg.process(&eit(0x58, 0, 0, 0, &[event]), T0);
        let program = epg.catalog().programs.get(program_id(NID, SID, 1)).unwrap();
        assert!(program.extended.is_none());
    }

    #[test]
    fn test_merge_extended_utf8() {
        let fragments = vec![ExtendedEventDescriptor {
            descriptor_number: 0,
            last_descriptor_number: 0,
            items: vec![("出演".as_bytes().to_vec(), "太郎".as_bytes().to_vec())],
            codec: TextCodec::Utf8,
        }];
        let merged = merge_extended(&fragments);
        assert_eq!(merged.get("出演").map(String::as_str), Some("太郎"));
    }

    #[test]
    fn test_completeness_marks_service_once() {
        let (epg, mut rx) = setup();
        let channel = ChannelKey::new(ChannelType::Gr, "27");
        epg.catalog().services.add(Service::new(NID, SID, channel));
        drain(&mut rx);

        // One table per track, one segment with one section.
        let basic = eit(0x50, 0, 0, 0, &[]);
        let extended = eit(0x58, 0, 0, 0, &[]);
        let now = -9 * HOUR; // 00:00 JST
        epg.process(&basic, now);
        assert!(!epg.catalog().services.get(NID, SID).unwrap().epg_ready);
        epg.process(&extended, now);
        epg.process(&extended, now);
        epg.process(&basic, now);

        let service = epg.catalog().services.get(NID, SID).unwrap();
        assert!(service.epg_ready);
        assert_eq!(service.epg_updated_at, Some(now));
        let updates = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, CatalogEvent::Service { .. }))
            .count();
        assert_eq!(updates, 1);
        assert!(epg.is_complete(NID, SID));
    }

    #[test]
    fn test_completeness_waits_for_service() {
        let (epg, _rx) = setup();
        let basic = eit(0x50, 0, 0, 0, &[]);
        let extended = eit(0x58, 0, 0, 0, &[]);
        let now = -9 * HOUR;
        epg.process(&basic, now);
        epg.process(&extended, now);
        assert!(!epg.is_complete(NID, SID));

        let channel = ChannelKey::new(ChannelType::Gr, "27");
        epg.catalog().services.add(Service::new(NID, SID, channel));
        epg.process(&basic, now);

        assert!(epg.is_complete(NID, SID));
        assert!(epg.catalog().services.get(NID, SID).unwrap().epg_ready);
    }
}
