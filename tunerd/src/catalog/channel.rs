use tunerd_model::{Channel, ChannelKey, ChannelType};

/// Configured channels. Immutable after startup.
pub struct ChannelStore {
    channels: Vec<Channel>,
}

impl ChannelStore {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }

    pub fn get(&self, channel_type: ChannelType, channel: &str) -> Option<Channel> {
        self.channels
            .iter()
            .find(|c| c.channel_type == channel_type && c.channel == channel)
            .cloned()
    }

    pub fn get_by_key(&self, key: &ChannelKey) -> Option<Channel> {
        self.get(key.channel_type, &key.channel)
    }

    pub fn all(&self) -> &[Channel] {
        &self.channels
    }

    pub fn of_type(&self, channel_type: ChannelType) -> impl Iterator<Item = &Channel> {
        self.channels
            .iter()
            .filter(move |c| c.channel_type == channel_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let store = ChannelStore::new(vec![
            Channel {
                name: "NHK".into(),
                ..Channel::new(ChannelType::Gr, "27")
            },
            Channel::new(ChannelType::Bs, "BS01_0"),
        ]);
        assert_eq!(store.get(ChannelType::Gr, "27").unwrap().name, "NHK");
        assert!(store.get(ChannelType::Bs, "27").is_none());
        assert_eq!(store.of_type(ChannelType::Bs).count(), 1);
    }
}
