//! Named groups of channels ("fx", "music", ...).
//!
//! Grounded on `mixer.cpp`. Tracks never own channels — the channel pool
//! (`system.rs`) does — they only hold references grouped by id, and
//! auto-unmap when a channel disappears from the pool.

use std::collections::{hash_map::DefaultHasher, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::channel::ChannelId;
use crate::event::{AudienceBus, ChannelsRemapped};

pub struct Track {
    id: String,
    title: String,
    channels: HashSet<ChannelId>,
}

impl Track {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelId> {
        self.channels.iter()
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains(&id)
    }

    fn id_hash(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.id.hash(&mut h);
        h.finish()
    }
}

pub struct Mixer {
    tracks: HashMap<String, Track>,
    events: Arc<AudienceBus>,
}

impl Mixer {
    pub fn new(events: Arc<AudienceBus>) -> Self {
        Self {
            tracks: HashMap::new(),
            events,
        }
    }

    pub fn has_track(&self, id: &str) -> bool {
        !id.is_empty() && self.tracks.contains_key(&id.to_lowercase())
    }

    pub fn try_find_track(&self, id: &str) -> Option<&Track> {
        if id.is_empty() {
            return None;
        }
        self.tracks.get(&id.to_lowercase())
    }

    pub fn try_find_track_mut(&mut self, id: &str) -> Option<&mut Track> {
        if id.is_empty() {
            return None;
        }
        self.tracks.get_mut(&id.to_lowercase())
    }

    /// Idempotent: returns the existing track if `id` is already mapped,
    /// otherwise creates an empty one. If `channel` is given it is added
    /// either way.
    pub fn make_track(&mut self, id: &str, channel: Option<ChannelId>) -> &mut Track {
        assert!(!id.is_empty());
        let key = id.to_lowercase();
        let track = self.tracks.entry(key.clone()).or_insert_with(|| Track {
            id: key,
            title: String::new(),
            channels: HashSet::new(),
        });
        if let Some(ch) = channel {
            Self::add_channel_to(track, ch, &self.events);
        }
        track
    }

    pub fn add_channel(&mut self, track_id: &str, channel: ChannelId) {
        let events = self.events.clone();
        if let Some(track) = self.try_find_track_mut(track_id) {
            Self::add_channel_to(track, channel, &events);
        }
    }

    pub fn remove_channel(&mut self, track_id: &str, channel: ChannelId) {
        let events = self.events.clone();
        if let Some(track) = self.try_find_track_mut(track_id) {
            Self::remove_channel_from(track, channel, &events);
        }
    }

    /// Called when a channel is torn down entirely (outside the normal
    /// fixed-roster lifetime); unmaps it from every track that references it.
    pub fn notify_channel_destroyed(&mut self, channel: ChannelId) {
        let events = self.events.clone();
        for track in self.tracks.values_mut() {
            if track.contains(channel) {
                Self::remove_channel_from(track, channel, &events);
            }
        }
    }

    fn add_channel_to(track: &mut Track, channel: ChannelId, events: &AudienceBus) {
        if track.channels.insert(channel) {
            events.channels_remapped.publish(ChannelsRemapped {
                track_id_hash: track.id_hash(),
            });
        }
    }

    fn remove_channel_from(track: &mut Track, channel: ChannelId, events: &AudienceBus) {
        if track.channels.remove(&channel) {
            events.channels_remapped.publish(ChannelsRemapped {
                track_id_hash: track.id_hash(),
            });
        }
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn for_all_tracks<F: FnMut(&Track)>(&self, mut f: F) {
        for track in self.tracks.values() {
            f(track);
        }
    }

    pub fn clear_tracks(&mut self) {
        self.tracks.clear();
    }
}
