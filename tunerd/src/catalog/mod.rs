//! In-memory channel, service, program and logo stores.
//!
//! Every mutation is an idempotent upsert keyed by a derived id and
//! publishes a [`CatalogEvent`] on a broadcast channel. Locks are held only
//! for the duration of one upsert.

mod channel;
mod logo;
mod program;
mod service;

use std::sync::Arc;

use tokio::sync::broadcast;
use tunerd_model::{CatalogEvent, Channel};

pub use channel::ChannelStore;
pub use logo::{Logo, LogoStore};
pub use program::{ProgramGc, ProgramStore};
pub use service::ServiceStore;

const EVENT_CAPACITY: usize = 1024;

/// Sender side of the catalog event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CatalogEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: CatalogEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to all catalog stores, shared by filters, assemblers and the arbiter.
pub struct Catalog {
    pub channels: ChannelStore,
    pub services: ServiceStore,
    pub programs: ProgramStore,
    pub logos: LogoStore,
    events: EventBus,
}

impl Catalog {
    pub fn new(channels: Vec<Channel>, gc: ProgramGc) -> Arc<Self> {
        let events = EventBus::new();
        Arc::new(Self {
            channels: ChannelStore::new(channels),
            services: ServiceStore::new(events.clone()),
            programs: ProgramStore::new(events.clone(), gc),
            logos: LogoStore::new(),
            events,
        })
    }

    /// Subscribe to create/update/remove events.
    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }
}
