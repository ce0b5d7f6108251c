use std::collections::BTreeMap;

use log::debug;
use parking_lot::RwLock;
use tunerd_model::{
    service_item_id, CatalogEvent, ChannelKey, EventKind, Service, ServiceItemId, ServicePatch,
};

use super::EventBus;

/// Discovered services. Services are only ever added or updated.
pub struct ServiceStore {
    services: RwLock<BTreeMap<ServiceItemId, Service>>,
    events: EventBus,
}

impl ServiceStore {
    pub(super) fn new(events: EventBus) -> Self {
        Self {
            services: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    pub fn get(&self, network_id: u16, service_id: u16) -> Option<Service> {
        self.get_by_id(service_item_id(network_id, service_id))
    }

    pub fn get_by_id(&self, id: ServiceItemId) -> Option<Service> {
        self.services.read().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Service> {
        self.services.read().values().cloned().collect()
    }

    /// Services discovered on a channel.
    pub fn find_by_channel(&self, channel: &ChannelKey) -> Vec<Service> {
        self.services
            .read()
            .values()
            .filter(|s| &s.channel == channel)
            .cloned()
            .collect()
    }

    /// Add a service. An existing entry with the same id is kept.
    pub fn add(&self, service: Service) -> bool {
        {
            let mut services = self.services.write();
            if services.contains_key(&service.id) {
                return false;
            }
            services.insert(service.id, service.clone());
        }
        debug!(
            "[Catalog] Service added: {} (nid={}, sid={})",
            service.name, service.network_id, service.service_id
        );
        self.events.emit(CatalogEvent::Service {
            kind: EventKind::Create,
            data: service,
        });
        true
    }

    /// Apply a patch to an existing service. Returns true if it changed.
    pub fn set(&self, network_id: u16, service_id: u16, patch: &ServicePatch) -> bool {
        let updated = {
            let mut services = self.services.write();
            let Some(service) = services.get_mut(&service_item_id(network_id, service_id)) else {
                return false;
            };
            if !patch.apply(service) {
                return false;
            }
            service.clone()
        };
        self.events.emit(CatalogEvent::Service {
            kind: EventKind::Update,
            data: updated,
        });
        true
    }

    /// Create the service on `channel` if missing, then apply the patch.
    pub fn upsert(&self, network_id: u16, service_id: u16, channel: &ChannelKey, patch: &ServicePatch) {
        if self.get(network_id, service_id).is_none() {
            let mut service = Service::new(network_id, service_id, channel.clone());
            patch.apply(&mut service);
            if self.add(service) {
                return;
            }
        }
        self.set(network_id, service_id, patch);
    }
}
