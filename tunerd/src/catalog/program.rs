use std::collections::{BTreeSet, HashMap};

use log::debug;
use parking_lot::RwLock;
use tunerd_model::{CatalogEvent, EventKind, Program, ProgramId, ProgramPatch, ServiceItemId, Timestamp};

use super::EventBus;

/// Garbage collection window for programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramGc {
    /// Programs ending more than this long ago are removed (ms).
    pub grace: i64,
    /// Programs starting further than this in the future are removed (ms).
    pub horizon: i64,
}

impl Default for ProgramGc {
    fn default() -> Self {
        Self {
            grace: 60 * 60 * 1000,
            horizon: 9 * 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Default)]
struct Inner {
    programs: HashMap<ProgramId, Program>,
    by_service: HashMap<ServiceItemId, BTreeSet<ProgramId>>,
}

impl Inner {
    fn remove(&mut self, id: ProgramId) -> Option<Program> {
        let program = self.programs.remove(&id)?;
        let service = program.service_item_id();
        if let Some(ids) = self.by_service.get_mut(&service) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_service.remove(&service);
            }
        }
        Some(program)
    }
}

/// EPG programs indexed by id and by service.
pub struct ProgramStore {
    inner: RwLock<Inner>,
    events: EventBus,
    gc: ProgramGc,
}

impl ProgramStore {
    pub(super) fn new(events: EventBus, gc: ProgramGc) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            events,
            gc,
        }
    }

    pub fn exists(&self, id: ProgramId) -> bool {
        self.inner.read().programs.contains_key(&id)
    }

    pub fn get(&self, id: ProgramId) -> Option<Program> {
        self.inner.read().programs.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Programs of a service ordered by start time.
    pub fn find_by_service(&self, service: ServiceItemId) -> Vec<Program> {
        let inner = self.inner.read();
        let mut out: Vec<Program> = inner
            .by_service
            .get(&service)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.programs.get(id).cloned())
            .collect();
        out.sort_by_key(|p| p.start_at);
        out
    }

    /// Other programs of the same service whose interval overlaps `program`.
    pub fn find_overlapping(&self, program: &Program) -> Vec<Program> {
        let inner = self.inner.read();
        inner
            .by_service
            .get(&program.service_item_id())
            .into_iter()
            .flatten()
            .filter(|id| **id != program.id)
            .filter_map(|id| inner.programs.get(id))
            .filter(|p| p.overlaps(program))
            .cloned()
            .collect()
    }

    /// Add a program. An existing entry with the same id is kept.
    pub fn add(&self, program: Program) -> bool {
        {
            let mut inner = self.inner.write();
            if inner.programs.contains_key(&program.id) {
                return false;
            }
            inner
                .by_service
                .entry(program.service_item_id())
                .or_default()
                .insert(program.id);
            inner.programs.insert(program.id, program.clone());
        }
        self.events.emit(CatalogEvent::Program {
            kind: EventKind::Create,
            data: program,
        });
        true
    }

    /// Apply a patch. Returns the updated program if anything changed.
    pub fn set(&self, id: ProgramId, patch: &ProgramPatch) -> Option<Program> {
        let updated = {
            let mut inner = self.inner.write();
            let program = inner.programs.get_mut(&id)?;
            if !patch.apply(program) {
                return None;
            }
            program.clone()
        };
        self.events.emit(CatalogEvent::Program {
            kind: EventKind::Update,
            data: updated.clone(),
        });
        Some(updated)
    }

    pub fn remove(&self, id: ProgramId) -> Option<Program> {
        let removed = self.inner.write().remove(id)?;
        self.events.emit(CatalogEvent::Program {
            kind: EventKind::Remove,
            data: removed.clone(),
        });
        Some(removed)
    }

    /// Replace the programs of a service with an imported set.
    pub fn import(&self, service: ServiceItemId, programs: Vec<Program>) {
        let incoming: BTreeSet<ProgramId> = programs.iter().map(|p| p.id).collect();
        let stale: Vec<ProgramId> = self
            .inner
            .read()
            .by_service
            .get(&service)
            .into_iter()
            .flatten()
            .filter(|id| !incoming.contains(id))
            .copied()
            .collect();
        for id in stale {
            self.remove(id);
        }
        for program in programs.into_iter().filter(|p| p.service_item_id() == service) {
            let replaced = {
                let mut inner = self.inner.write();
                match inner.programs.get_mut(&program.id) {
                    Some(current) if *current == program => continue,
                    Some(current) => {
                        *current = program.clone();
                        true
                    }
                    None => false,
                }
            };
            if replaced {
                self.events.emit(CatalogEvent::Program {
                    kind: EventKind::Update,
                    data: program,
                });
            } else {
                self.add(program);
            }
        }
    }

    /// Remove expired programs and those beyond the future horizon.
    pub fn gc(&self, now: Timestamp) -> Vec<ProgramId> {
        let expired: Vec<ProgramId> = self
            .inner
            .read()
            .programs
            .values()
            .filter(|p| p.end_at() + self.gc.grace < now || p.start_at > now + self.gc.horizon)
            .map(|p| p.id)
            .collect();
        let removed: Vec<ProgramId> = expired.into_iter().filter(|id| self.remove(*id).is_some()).collect();
        if !removed.is_empty() {
            debug!("[Catalog] Program GC removed {} entries", removed.len());
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000;

    fn store() -> (ProgramStore, tokio::sync::broadcast::Receiver<CatalogEvent>) {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        (ProgramStore::new(bus, ProgramGc::default()), rx)
    }

    #[test]
    fn test_add_set_remove() {
        let (store, mut rx) = store();
        let program = Program::new(1, 2, 3, 10 * HOUR, HOUR, true);
        assert!(store.add(program.clone()));
        assert!(!store.add(program.clone()));

        let patch = ProgramPatch {
            name: Some("News".into()),
            ..Default::default()
        };
        assert!(store.set(program.id, &patch).is_some());
        assert!(store.set(program.id, &patch).is_none());
        assert!(store.remove(program.id).is_some());
        assert!(!store.exists(program.id));

        let kinds: Vec<EventKind> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EventKind::Create, EventKind::Update, EventKind::Remove]);
    }

    #[test]
    fn test_find_overlapping() {
        let (store, _rx) = store();
        store.add(Program::new(1, 2, 1, 0, HOUR, true));
        store.add(Program::new(1, 2, 2, HOUR, HOUR, true));
        store.add(Program::new(1, 3, 1, 0, HOUR, true));
        let probe = Program::new(1, 2, 9, HOUR / 2, HOUR, true);
        let mut found: Vec<u16> = store.find_overlapping(&probe).iter().map(|p| p.event_id).collect();
        found.sort();
        assert_eq!(found, vec![1, 2]);
    }

    #[test]
    fn test_gc() {
        let (store, _rx) = store();
        let now = 100 * HOUR;
        store.add(Program::new(1, 2, 1, now - 3 * HOUR, HOUR, true));
        store.add(Program::new(1, 2, 2, now - HOUR, HOUR, true));
        store.add(Program::new(1, 2, 3, now + 10 * 24 * HOUR, HOUR, true));
        let removed = store.gc(now);
        assert_eq!(removed.len(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.find_by_service(tunerd_model::service_item_id(1, 2))[0].event_id, 2);
    }
}
