use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use log::info;
use parking_lot::RwLock;

/// A service logo image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logo {
    /// ARIB logo type; larger types are larger images.
    pub logo_type: u8,
    pub data: Bytes,
}

/// Logo images keyed by `(network_id, logo_id)`, one per logo type.
#[derive(Default)]
pub struct LogoStore {
    logos: RwLock<HashMap<(u16, u16), BTreeMap<u8, Bytes>>>,
}

impl LogoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a logo. Returns true if the image was new or changed.
    pub fn set(&self, network_id: u16, logo_id: u16, logo_type: u8, data: Bytes) -> bool {
        let mut logos = self.logos.write();
        let entry = logos.entry((network_id, logo_id)).or_default();
        if entry.get(&logo_type) == Some(&data) {
            return false;
        }
        info!(
            "[Catalog] Logo stored: nid={} logo_id={} type={} ({} bytes)",
            network_id,
            logo_id,
            logo_type,
            data.len()
        );
        entry.insert(logo_type, data);
        true
    }

    /// The largest available image of a logo.
    pub fn get(&self, network_id: u16, logo_id: u16) -> Option<Logo> {
        self.logos
            .read()
            .get(&(network_id, logo_id))?
            .iter()
            .next_back()
            .map(|(&logo_type, data)| Logo {
                logo_type,
                data: data.clone(),
            })
    }

    pub fn get_type(&self, network_id: u16, logo_id: u16, logo_type: u8) -> Option<Bytes> {
        self.logos
            .read()
            .get(&(network_id, logo_id))?
            .get(&logo_type)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_largest_type_wins() {
        let store = LogoStore::new();
        assert!(store.set(1, 5, 0x00, Bytes::from_static(b"small")));
        assert!(store.set(1, 5, 0x05, Bytes::from_static(b"large")));
        assert!(!store.set(1, 5, 0x05, Bytes::from_static(b"large")));
        let logo = store.get(1, 5).unwrap();
        assert_eq!(logo.logo_type, 0x05);
        assert_eq!(store.get_type(1, 5, 0x00).unwrap(), Bytes::from_static(b"small"));
        assert!(store.get(2, 5).is_none());
    }
}
