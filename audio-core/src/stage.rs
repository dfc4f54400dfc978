//! Logical audio contexts ("soundstages"): the set of currently playing
//! logical sounds plus the listener that hears them.
//!
//! Grounded on `stage.cpp` / `worldstage.cpp`. Channel allocation is
//! deliberately not this module's concern — `Stage` only tracks *that* a
//! sound should be audible and for how long; `system.rs` decides which
//! hardware channel carries it.

use std::sync::Arc;

use crate::cache::SampleCache;
use crate::listener::{Listener, SoundFlags, Vec3};
use crate::sfxdef::SfxDefSource;

pub type EmitterId = u64;

const SOUND_PURGE_INTERVAL_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    DontExclude,
    OnePerEmitter,
}

#[derive(Debug, Clone)]
pub struct SoundParams {
    pub effect_id: i32,
    pub flags: SoundFlags,
    pub volume: f32,
    pub origin: Vec3,
}

#[derive(Debug, Clone)]
pub struct Sound {
    pub effect_id: i32,
    pub flags: SoundFlags,
    pub volume: f32,
    pub origin: Vec3,
    pub emitter: Option<EmitterId>,
    pub start_tick: i64,
    pub end_tick_ms: u64,
}

impl Sound {
    pub fn is_playing(&self, now_ms: u64) -> bool {
        now_ms < self.end_tick_ms
    }
}

pub struct Stage {
    exclusion: Exclusion,
    sounds: Vec<Sound>,
    listener: Listener,
    last_sound_purge_ms: u64,
}

impl Stage {
    pub fn new(exclusion: Exclusion, events: Arc<crate::event::AudienceBus>) -> Self {
        Self {
            exclusion,
            sounds: Vec::new(),
            listener: Listener::new(events),
            last_sound_purge_ms: 0,
        }
    }

    pub fn exclusion(&self) -> Exclusion {
        self.exclusion
    }

    pub fn set_exclusion(&mut self, exclusion: Exclusion) {
        self.exclusion = exclusion;
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut Listener {
        &mut self.listener
    }

    pub fn sounds(&self) -> &[Sound] {
        &self.sounds
    }

    pub fn sound_is_playing(&self, effect_id: i32, emitter: Option<EmitterId>, now_ms: u64) -> bool {
        self.sounds.iter().any(|s| {
            (effect_id <= 0 || s.effect_id == effect_id)
                && s.emitter == emitter
                && s.is_playing(now_ms)
        })
    }

    /// Inserts a new logical sound if the cached waveform has non-zero
    /// duration, applying the stage's exclusion policy first. Returns the
    /// inserted sound's data (cheap to copy) for the caller to drive channel
    /// selection with — mirrors `Stage::addSound` + the `Addition` audience,
    /// collapsed into one call since the caller must act on the result
    /// synchronously (see `crate::event::Addition`'s doc comment).
    ///
    /// `sfxdef` supplies definition-file overrides (SS4.4): a `Repeat` or
    /// `NoVolumeAttenuation` flag there forces the corresponding flag on
    /// regardless of what the caller passed in `params`, and a
    /// `volume_scale` multiplies the caller's volume.
    pub fn play_sound(
        &mut self,
        mut params: SoundParams,
        emitter: Option<EmitterId>,
        cache: &SampleCache,
        sfxdef: &dyn SfxDefSource,
        now_ms: u64,
        now_tick: i64,
    ) -> Option<Sound> {
        if params.volume > 1.0 {
            tracing::warn!(volume = params.volume, "sound volume is too high (> 1.0)");
        }

        if let Some(def) = sfxdef.lookup(params.effect_id) {
            if def.repeat {
                params.flags |= SoundFlags::REPEAT;
            }
            if def.no_volume_attenuation {
                params.flags |= SoundFlags::NO_VOLUME_ATTENUATION;
            }
            if let Some(scale) = def.volume_scale {
                params.volume *= scale;
            }
        }

        let sample = cache.cache(params.effect_id)?;
        let duration_ms = sample.milliseconds();
        if duration_ms == 0 {
            tracing::debug!(effect_id = params.effect_id, "zero-duration sample, dropping");
            return None;
        }

        if let Some(emitter) = emitter {
            if self.exclusion == Exclusion::OnePerEmitter {
                self.sounds.retain(|s| s.emitter != Some(emitter));
            }
        }

        params.volume = params.volume.clamp(0.0, 1.0);
        let end_tick_ms = now_ms
            + if params.flags.contains(SoundFlags::REPEAT) {
                1
            } else {
                duration_ms as u64
            };

        let sound = Sound {
            effect_id: params.effect_id,
            flags: params.flags,
            volume: params.volume,
            origin: params.origin,
            emitter,
            start_tick: now_tick,
            end_tick_ms,
        };
        self.sounds.push(sound.clone());
        Some(sound)
    }

    pub fn remove_all_sounds(&mut self) {
        self.sounds.clear();
    }

    pub fn remove_sounds_by_id(&mut self, effect_id: i32) {
        self.sounds.retain(|s| s.effect_id != effect_id);
    }

    pub fn remove_sounds_with_emitter(&mut self, emitter: EmitterId) {
        self.sounds.retain(|s| s.emitter != Some(emitter));
    }

    pub fn maybe_run_sound_purge(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_sound_purge_ms) < SOUND_PURGE_INTERVAL_MS {
            return;
        }
        self.sounds.retain(|s| s.is_playing(now_ms));
        self.last_sound_purge_ms = now_ms;
    }
}

/// A `Stage` specialized for the game world: additionally clears itself and
/// detaches its listener whenever the world changes (map load/unload).
pub struct WorldStage {
    pub stage: Stage,
}

impl WorldStage {
    pub fn new(exclusion: Exclusion, events: Arc<crate::event::AudienceBus>) -> Self {
        Self {
            stage: Stage::new(exclusion, events),
        }
    }

    /// Call when the host signals a world/map change.
    pub fn on_world_changed(&mut self) {
        self.stage.remove_all_sounds();
        self.stage.listener_mut().set_tracked_object(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{NullSampleSource, RawSample, SampleSource, TargetFormat};
    use crate::event::AudienceBus;
    use crate::refresh::NullRefreshGate;
    use crate::sfxdef::{NullSfxDefSource, SfxDef, SfxDefSource};

    struct FixedSource;
    impl SampleSource for FixedSource {
        fn load(&self, effect_id: i32) -> Option<RawSample> {
            Some(RawSample {
                effect_id,
                group: 0,
                bytes_per_sample: 1,
                rate_hz: 11025,
                num_samples: 11025, // 1000ms
                data: vec![0u8; 11025],
            })
        }
    }

    fn stage_with_cache() -> (Stage, SampleCache) {
        let events = Arc::new(AudienceBus::new());
        let stage = Stage::new(Exclusion::DontExclude, events.clone());
        let cache = SampleCache::new(
            Arc::new(FixedSource),
            TargetFormat::default(),
            Arc::new(NullRefreshGate),
            events,
        );
        (stage, cache)
    }

    fn params(effect_id: i32) -> SoundParams {
        SoundParams {
            effect_id,
            flags: SoundFlags::empty(),
            volume: 1.0,
            origin: Vec3::ZERO,
        }
    }

    #[test]
    fn one_per_emitter_exclusion_keeps_only_latest() {
        let (mut stage, cache) = stage_with_cache();
        stage.set_exclusion(Exclusion::OnePerEmitter);
        stage.play_sound(params(1), Some(42), &cache, &NullSfxDefSource, 0, 0);
        stage.play_sound(params(2), Some(42), &cache, &NullSfxDefSource, 0, 0);
        assert_eq!(stage.sounds().len(), 1);
        assert_eq!(stage.sounds()[0].effect_id, 2);
    }

    #[test]
    fn zero_duration_sample_never_inserted() {
        let events = Arc::new(AudienceBus::new());
        let mut stage = Stage::new(Exclusion::DontExclude, events.clone());
        let cache = SampleCache::new(
            Arc::new(NullSampleSource),
            TargetFormat::default(),
            Arc::new(NullRefreshGate),
            events,
        );
        let added = stage.play_sound(params(1), None, &cache, &NullSfxDefSource, 0, 0);
        assert!(added.is_none());
        assert!(stage.sounds().is_empty());
    }

    #[test]
    fn purge_removes_only_expired_sounds() {
        let (mut stage, cache) = stage_with_cache();
        stage.play_sound(params(1), None, &cache, &NullSfxDefSource, 0, 0);
        stage.maybe_run_sound_purge(SOUND_PURGE_INTERVAL_MS + 1500);
        assert!(stage.sounds().is_empty());
    }

    struct OverrideDefSource;
    impl SfxDefSource for OverrideDefSource {
        fn lookup(&self, _effect_id: i32) -> Option<SfxDef> {
            Some(SfxDef {
                repeat: true,
                volume_scale: Some(0.5),
                ..Default::default()
            })
        }
    }

    #[test]
    fn sfxdef_overrides_repeat_and_scales_volume() {
        let (mut stage, cache) = stage_with_cache();
        let mut p = params(1);
        p.volume = 0.8;
        let sound = stage
            .play_sound(p, None, &cache, &OverrideDefSource, 0, 0)
            .unwrap();
        assert!(sound.flags.contains(SoundFlags::REPEAT));
        assert!((sound.volume - 0.4).abs() < 1e-6);
        // Repeat forces end_tick_ms to now + 1 regardless of sample duration.
        assert_eq!(sound.end_tick_ms, 1);
    }

    #[test]
    fn world_stage_clears_on_world_change() {
        let events = Arc::new(AudienceBus::new());
        let mut world = WorldStage::new(Exclusion::DontExclude, events.clone());
        let cache = SampleCache::new(
            Arc::new(FixedSource),
            TargetFormat::default(),
            Arc::new(NullRefreshGate),
            events,
        );
        world
            .stage
            .play_sound(params(1), None, &cache, &NullSfxDefSource, 0, 0);
        assert_eq!(world.stage.sounds().len(), 1);
        world.on_world_changed();
        assert!(world.stage.sounds().is_empty());
    }
}
