//! Playback channels.
//!
//! The original engine models `Channel` as a base class with `CdChannel`,
//! `MusicChannel`, `SoundChannel` subclasses (`channel.cpp`). Re-expressed
//! per `SPEC_FULL.md` SS9 as a tagged-variant enum: shared behavior goes
//! through the [`ChannelControl`] trait, variant-specific behavior
//! (`SoundChannel::format`, `MusicChannel::bind_file`, ...) is only
//! reachable after matching on the variant.

use std::sync::Arc;

use crate::listener::Vec3;
use crate::sample::Sample;
use crate::stage::EmitterId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Cd,
    Music,
    Sound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Positioning {
    Stereo,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayingMode {
    Once,
    OnceDontDelete,
    Looping,
}

pub trait ChannelControl {
    fn is_playing(&self) -> bool;
    fn stop(&mut self);
    fn set_volume(&mut self, volume: f32);
    fn volume(&self) -> f32;
}

#[derive(Debug, Clone, Default)]
pub struct CdChannelState {
    pub track: Option<u32>,
    pub playing: bool,
    pub paused: bool,
    pub volume: f32,
}

impl ChannelControl for CdChannelState {
    fn is_playing(&self) -> bool {
        self.playing && !self.paused
    }
    fn stop(&mut self) {
        self.playing = false;
        self.paused = false;
    }
    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }
    fn volume(&self) -> f32 {
        self.volume
    }
}

impl CdChannelState {
    pub fn play_track(&mut self, track: u32) {
        self.track = Some(track);
        self.playing = true;
        self.paused = false;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        if self.track.is_some() {
            self.paused = false;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MusicChannelState {
    pub source: Option<String>,
    pub playing: bool,
    pub paused: bool,
    pub volume: f32,
}

impl ChannelControl for MusicChannelState {
    fn is_playing(&self) -> bool {
        self.playing && !self.paused
    }
    fn stop(&mut self) {
        self.playing = false;
        self.source = None;
    }
    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }
    fn volume(&self) -> f32 {
        self.volume
    }
}

impl MusicChannelState {
    pub fn bind_file(&mut self, path: impl Into<String>) {
        self.source = Some(path.into());
        self.playing = false;
    }

    pub fn play(&mut self) {
        if self.source.is_some() {
            self.playing = true;
            self.paused = false;
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }
}

/// A sound-playback channel's format: the tuple channel selection (SS4.7)
/// matches against to decide reuse vs. reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoundFormat {
    pub positioning: Positioning,
    pub bytes_per_sample: u8,
    pub rate_hz: u32,
}

#[derive(Debug, Clone)]
pub struct SoundChannelState {
    pub format: SoundFormat,
    pub loaded_sample: Option<Arc<Sample>>,
    pub mode: PlayingMode,
    pub playing: bool,
    pub volume: f32,
    pub frequency_scale: f32,
    pub pan: f32,
    pub origin: Vec3,
    pub start_tick: i64,
    pub end_tick_ms: u64,
    /// Set on `stop()`; the next `play()` must reload the sample before
    /// starting, matching the original's `Reload` channel flag.
    pub needs_reload: bool,
    /// `OnceDontDelete` channels are suspended rather than stolen by the
    /// priority-preemption search in SS4.7 step 10.
    pub suspended: bool,
    /// Emitter that started the currently-loaded sound, if any. Used to
    /// scope exclusion-group stopping (SS4.7 step 5) to one emitter unless
    /// the effect's definition marks the group globally exclusive.
    pub emitter: Option<EmitterId>,
}

impl SoundChannelState {
    pub fn empty(format: SoundFormat) -> Self {
        Self {
            format,
            loaded_sample: None,
            mode: PlayingMode::Once,
            playing: false,
            volume: 1.0,
            frequency_scale: 1.0,
            pan: 0.0,
            origin: Vec3::ZERO,
            start_tick: 0,
            end_tick_ms: 0,
            needs_reload: false,
            suspended: false,
            emitter: None,
        }
    }

    /// True for an idle channel matching `wanted` exactly in format — the
    /// first two tiers of SS4.7 step 10's search.
    pub fn is_vacant_with_format(&self, wanted: SoundFormat) -> bool {
        !self.playing && self.format == wanted
    }

    pub fn load(&mut self, sample: Arc<Sample>) {
        self.loaded_sample = Some(sample);
        self.needs_reload = false;
    }

    /// Called by `SampleCache` eviction before the backing sample is freed.
    pub fn reset_if_loaded_with(&mut self, effect_id: i32) {
        if self
            .loaded_sample
            .as_ref()
            .map(|s| s.effect_id == effect_id)
            .unwrap_or(false)
        {
            self.playing = false;
            self.loaded_sample = None;
            self.needs_reload = true;
        }
    }

    pub fn reformat(&mut self, format: SoundFormat) {
        if self.format != format {
            self.format = format;
            self.loaded_sample = None;
            self.needs_reload = false;
        }
    }

    /// Starts playback at `now_ms`. `duration_ms` is taken from the loaded
    /// sample by the caller; `Looping` channels get an end-time one ms in
    /// the future, matching `Stage::addSound`'s `Repeat` handling.
    pub fn play(&mut self, mode: PlayingMode, now_ms: u64, now_tick: i64, duration_ms: u64) {
        self.mode = mode;
        self.playing = true;
        self.suspended = false;
        self.start_tick = now_tick;
        self.end_tick_ms = now_ms
            + if matches!(mode, PlayingMode::Looping) {
                1
            } else {
                duration_ms
            };
    }

    /// Suspends an `OnceDontDelete` channel instead of stealing it outright.
    pub fn suspend(&mut self) {
        self.suspended = true;
        self.playing = false;
    }

    /// Advances the state machine: transitions `Playing -> Stopped` once
    /// `now_ms` reaches the end time for non-looping channels.
    pub fn tick(&mut self, now_ms: u64) {
        if self.playing && !matches!(self.mode, PlayingMode::Looping) && now_ms >= self.end_tick_ms
        {
            self.stop();
        }
    }
}

impl ChannelControl for SoundChannelState {
    fn is_playing(&self) -> bool {
        self.playing
    }

    fn stop(&mut self) {
        self.playing = false;
        self.needs_reload = true;
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    fn volume(&self) -> f32 {
        self.volume
    }
}

#[derive(Debug, Clone)]
pub enum Channel {
    Cd(CdChannelState),
    Music(MusicChannelState),
    Sound(SoundChannelState),
}

impl Channel {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Channel::Cd(_) => ChannelKind::Cd,
            Channel::Music(_) => ChannelKind::Music,
            Channel::Sound(_) => ChannelKind::Sound,
        }
    }

    pub fn as_sound(&self) -> Option<&SoundChannelState> {
        match self {
            Channel::Sound(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sound_mut(&mut self) -> Option<&mut SoundChannelState> {
        match self {
            Channel::Sound(s) => Some(s),
            _ => None,
        }
    }
}

impl ChannelControl for Channel {
    fn is_playing(&self) -> bool {
        match self {
            Channel::Cd(c) => c.is_playing(),
            Channel::Music(c) => c.is_playing(),
            Channel::Sound(c) => c.is_playing(),
        }
    }

    fn stop(&mut self) {
        match self {
            Channel::Cd(c) => c.stop(),
            Channel::Music(c) => c.stop(),
            Channel::Sound(c) => c.stop(),
        }
    }

    fn set_volume(&mut self, volume: f32) {
        match self {
            Channel::Cd(c) => c.set_volume(volume),
            Channel::Music(c) => c.set_volume(volume),
            Channel::Sound(c) => c.set_volume(volume),
        }
    }

    fn volume(&self) -> f32 {
        match self {
            Channel::Cd(c) => c.volume(),
            Channel::Music(c) => c.volume(),
            Channel::Sound(c) => c.volume(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt() -> SoundFormat {
        SoundFormat {
            positioning: Positioning::Stereo,
            bytes_per_sample: 1,
            rate_hz: 11025,
        }
    }

    fn sample() -> Arc<Sample> {
        Arc::new(Sample {
            effect_id: 1,
            group: 0,
            bytes_per_sample: 1,
            rate_hz: 11025,
            num_samples: 100,
            data: Arc::from(vec![0u8; 100].into_boxed_slice()),
        })
    }

    #[test]
    fn stop_sets_needs_reload() {
        let mut ch = SoundChannelState::empty(fmt());
        ch.load(sample());
        ch.play(PlayingMode::Once, 0, 0, 100);
        ch.stop();
        assert!(ch.needs_reload);
        assert!(!ch.is_playing());
    }

    #[test]
    fn tick_stops_channel_once_duration_elapses() {
        let mut ch = SoundChannelState::empty(fmt());
        ch.load(sample());
        ch.play(PlayingMode::Once, 1000, 0, 100);
        ch.tick(1050);
        assert!(ch.is_playing());
        ch.tick(1100);
        assert!(!ch.is_playing());
    }

    #[test]
    fn looping_channel_never_auto_stops() {
        let mut ch = SoundChannelState::empty(fmt());
        ch.load(sample());
        ch.play(PlayingMode::Looping, 0, 0, 100);
        ch.tick(1_000_000);
        assert!(ch.is_playing());
    }

    #[test]
    fn reset_if_loaded_with_clears_matching_sample() {
        let mut ch = SoundChannelState::empty(fmt());
        ch.load(sample());
        ch.play(PlayingMode::Once, 0, 0, 100);
        ch.reset_if_loaded_with(1);
        assert!(ch.loaded_sample.is_none());
        assert!(!ch.is_playing());
        assert!(ch.needs_reload);
    }

    #[test]
    fn reset_if_loaded_with_ignores_other_samples() {
        let mut ch = SoundChannelState::empty(fmt());
        ch.load(sample());
        ch.play(PlayingMode::Once, 0, 0, 100);
        ch.reset_if_loaded_with(999);
        assert!(ch.loaded_sample.is_some());
        assert!(ch.is_playing());
    }
}
