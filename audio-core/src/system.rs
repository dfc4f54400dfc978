//! Composition root: wires drivers, the sample cache, the mixer, the
//! channel pool, and the refresh worker together, and implements the
//! channel-selection algorithm of `SPEC_FULL.md` SS4.7 — the densest piece
//! of logic in this crate, grounded on `system.cpp`'s `stageSoundAdded()`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};

use crate::cache::{SampleCache, SampleSource, TargetFormat};
use crate::channel::{Channel, ChannelControl, ChannelId, ChannelKind, PlayingMode, Positioning, SoundFormat};
use crate::config::AudioConfig;
use crate::driver::{Driver, DriverRegistry, DummyDriver, DriverStatus, HardwareDriver};
use crate::error::AudioError;
use crate::event::AudienceBus;
use crate::listener::{SoundFlags, Vec3};
use crate::mixer::Mixer;
use crate::refresh::{RefreshGate, Refreshable, RefreshWorker};
use crate::sfxdef::{NullSfxDefSource, SfxDef, SfxDefSource};
use crate::stage::{EmitterId, Exclusion, Sound, SoundParams, Stage, WorldStage};
use crate::time::SharedClock;

/// A tiny deterministic xorshift generator used for the +/-N/255
/// pseudo-random pitch shift (SS4.7 step 4). Not cryptographic; just needs
/// to avoid every repeat of the same effect sounding identical.
struct PitchRng {
    state: std::sync::atomic::AtomicU32,
}

impl PitchRng {
    fn new() -> Self {
        Self {
            state: std::sync::atomic::AtomicU32::new(0x9E3779B9),
        }
    }

    /// Returns a value in `[-range, range]`.
    fn next_shift(&self, range: i32) -> i32 {
        let mut x = self.state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state.store(x, Ordering::Relaxed);
        if range <= 0 {
            return 0;
        }
        ((x % (2 * range as u32 + 1)) as i32) - range
    }
}

const FX_TRACK: &str = "fx";
const MUSIC_TRACK: &str = "music";
const CD_TRACK: &str = "cd";

/// The union of sources `playmusic` (SS4.10) accepts: a definition-table
/// lookup and a raw lump name both resolve to the Music channel's file
/// binding upstream of this crate (the definition/lump lookup itself is an
/// external collaborator per SS1); only the CD-track case addresses a
/// distinct channel kind.
#[derive(Debug, Clone)]
pub enum MusicRequest {
    Lump(String),
    File(String),
    CdTrack(u32),
}

struct ChannelPool {
    channels: Vec<Channel>,
}

impl ChannelPool {
    fn new() -> Self {
        Self { channels: Vec::new() }
    }

    fn push(&mut self, channel: Channel) -> ChannelId {
        let id = ChannelId(self.channels.len() as u32);
        self.channels.push(channel);
        id
    }
}

/// A render-thread-readable snapshot of one playing Sound channel's mix
/// inputs. `audio_backend::RenderFn` documents that the real-time audio
/// callback "must never block or allocate" — for the cpal backend
/// (`cpal_backend.rs`) that callback runs on the OS's own hardware thread,
/// not the worker thread that owns the `cpal::Stream`. `render_callback`
/// therefore never touches `pool`'s `parking_lot::Mutex`: it reads an
/// `ArcSwap` snapshot (lock-free load) and advances each voice's cursor
/// through a relaxed atomic, following the same pattern the teacher's own
/// `audio-system` crate uses for its active-voice list
/// (`ActiveSources`/`ArcSwapOption`). The main thread stays the single
/// writer of `sample`/`volume`/`pan`/`frequency_scale`/`looping` — it
/// rebuilds a channel's entry whenever `dispatch_sound_to_channel`,
/// `select_channel`, eviction reset, or `tick()` change its playing state,
/// reusing the existing `Arc<RenderVoice>` (and its in-flight cursor)
/// whenever the channel is still playing the same sample in the same mode.
struct RenderVoice {
    sample: Arc<crate::sample::Sample>,
    volume: f32,
    pan: f32,
    frequency_scale: f32,
    looping: bool,
    /// `f64` cursor bits, in input-sample units (pre-frequency-scale).
    cursor: AtomicU64,
}

struct Inner {
    config: RwLock<AudioConfig>,
    events: Arc<AudienceBus>,
    cache: Arc<SampleCache>,
    drivers: Mutex<DriverRegistry>,
    mixer: Mutex<Mixer>,
    pool: Mutex<ChannelPool>,
    render_voices: ArcSwap<Vec<Option<Arc<RenderVoice>>>>,
    refresh: Arc<RefreshWorker>,
    clock: SharedClock,
    local_stage: Mutex<Stage>,
    world_stage: Mutex<WorldStage>,
    next_order: AtomicU32,
    sfxdefs: RwLock<Arc<dyn SfxDefSource>>,
    pitch_rng: PitchRng,
    /// SS4.7 step 1: new-sound dispatch is dropped while busy-mode (e.g.
    /// asset loading, a level transition) is active. Set via
    /// [`AudioSystem::set_busy_mode`], analogous to `frame_begin`/`frame_end`.
    busy: AtomicBool,
}

impl Inner {
    /// Recomputes the render snapshot for one channel index after a
    /// main-thread mutation to its `playing`/`loaded_sample`/`mode` state.
    /// Reuses the existing `RenderVoice` (preserving its cursor) when the
    /// channel is still playing the same sample in the same mode, so a
    /// mutation to an unrelated channel index never resets another
    /// channel's playback position.
    fn sync_render_voice(&self, idx: usize, pool: &ChannelPool) {
        let mut voices: Vec<Option<Arc<RenderVoice>>> = (*self.render_voices.load_full()).clone();
        if voices.len() != pool.channels.len() {
            voices.resize(pool.channels.len(), None);
        }
        voices[idx] = match pool.channels.get(idx) {
            Some(Channel::Sound(s)) if s.playing => s.loaded_sample.as_ref().map(|sample| {
                let reusable = voices[idx].as_ref().filter(|v| {
                    Arc::ptr_eq(&v.sample, sample) && v.looping == matches!(s.mode, PlayingMode::Looping)
                });
                reusable.cloned().unwrap_or_else(|| {
                    Arc::new(RenderVoice {
                        sample: sample.clone(),
                        volume: s.volume,
                        pan: s.pan,
                        frequency_scale: s.frequency_scale,
                        looping: matches!(s.mode, PlayingMode::Looping),
                        cursor: AtomicU64::new(0),
                    })
                })
            }),
            _ => None,
        };
        self.render_voices.store(Arc::new(voices));
    }

    fn reset_render_voices(&self, len: usize) {
        self.render_voices.store(Arc::new(vec![None; len]));
    }
}

impl Refreshable for Inner {
    fn refresh_all(&self) {
        let now_ms = self.clock.now_ms();
        let mut pool = self.pool.lock();
        for idx in 0..pool.channels.len() {
            let became_stopped = if let Channel::Sound(s) = &mut pool.channels[idx] {
                let was_playing = s.playing;
                s.tick(now_ms);
                was_playing && !s.playing
            } else {
                false
            };
            if became_stopped {
                self.sync_render_voice(idx, &pool);
            }
        }
    }
}

/// Top-level handle. Cheap to clone (wraps an `Arc`); clones share all
/// state, matching the original engine's process-wide singleton without
/// requiring one (see `SPEC_FULL.md` SS9).
#[derive(Clone)]
pub struct AudioSystem {
    inner: Arc<Inner>,
}

impl AudioSystem {
    pub fn new(source: Arc<dyn SampleSource>, config: AudioConfig) -> Self {
        let events = Arc::new(AudienceBus::new());
        let format = TargetFormat {
            rate_hz: config.sound_rate_hz,
            bytes_per_sample: if config.sound_16bit { 2 } else { 1 },
        };
        let refresh = Arc::new(RefreshWorker::new());
        let inner = Arc::new(Inner {
            config: RwLock::new(config),
            events: events.clone(),
            cache: Arc::new(SampleCache::new(source, format, refresh.clone(), events.clone())),
            drivers: Mutex::new(DriverRegistry::new()),
            mixer: Mutex::new(Mixer::new(events.clone())),
            pool: Mutex::new(ChannelPool::new()),
            render_voices: ArcSwap::from_pointee(Vec::new()),
            refresh,
            clock: SharedClock::new(),
            local_stage: Mutex::new(Stage::new(Exclusion::DontExclude, events.clone())),
            world_stage: Mutex::new(WorldStage::new(Exclusion::DontExclude, events)),
            next_order: AtomicU32::new(0),
            sfxdefs: RwLock::new(Arc::new(NullSfxDefSource)),
            pitch_rng: PitchRng::new(),
            busy: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner.events.sample_remove.subscribe(move |ev| {
            let Some(inner) = weak.upgrade() else { return };
            let mut pool = inner.pool.lock();
            for idx in 0..pool.channels.len() {
                let became_stopped = if let Channel::Sound(s) = &mut pool.channels[idx] {
                    let was_playing = s.playing;
                    s.reset_if_loaded_with(ev.effect_id);
                    was_playing && !s.playing
                } else {
                    false
                };
                if became_stopped {
                    inner.sync_render_voice(idx, &pool);
                }
            }
        });

        Self { inner }
    }

    /// Sets whether busy-mode (asset loading, a level transition, ...) is
    /// active. SS4.7 step 1: while busy, every new-sound dispatch is
    /// dropped before it reaches channel selection. Analogous to
    /// [`AudioSystem::frame_begin`]/[`AudioSystem::frame_end`] — the host
    /// calls this whenever its own busy-mode flag changes.
    pub fn set_busy_mode(&self, busy: bool) {
        self.inner.busy.store(busy, Ordering::Relaxed);
    }

    /// Installs the sound-definition table the channel-selection algorithm
    /// (SS4.7 steps 4/5/8) consults for per-effect overrides. Defaults to
    /// [`NullSfxDefSource`], under which every override is a no-op.
    pub fn set_sfx_def_source(&self, source: Arc<dyn SfxDefSource>) {
        *self.inner.sfxdefs.write() = source;
    }

    /// Installs the dummy driver and activates it for every channel type,
    /// builds the fixed channel roster, and starts the refresh worker.
    /// Equivalent to [`AudioSystem::initialize_with_preferences`] with every
    /// list empty — hosts that parsed `-icd`/`-imusic`/`-isfx` (SS6) should
    /// call that instead so the user's preferred interfaces actually get a
    /// chance to activate before the dummy fallback.
    pub fn initialize(&self) {
        self.initialize_with_preferences(&crate::config::CliInterfacePreferences::default());
    }

    /// Installs the dummy driver, then activates the user's preferred
    /// interface per channel type (SS4.5 Activation): each of `prefs`'
    /// `;`-delimited lists is tried first, with `dummy` always appended so
    /// there is never a channel type left with no active interface at all.
    pub fn initialize_with_preferences(&self, prefs: &crate::config::CliInterfacePreferences) {
        if self.inner.config.read().no_audio {
            tracing::info!("audio disabled via config, skipping driver load");
            return;
        }

        {
            let mut drivers = self.inner.drivers.lock();
            if drivers.install(Arc::new(DummyDriver::new())).is_err() {
                // Re-initializing an already-initialized system; nothing to do.
                return;
            }
            for (kind, preference) in [
                (ChannelKind::Cd, &prefs.cd),
                (ChannelKind::Music, &prefs.music),
                (ChannelKind::Sound, &prefs.sfx),
            ] {
                drivers.activate_preference_list(kind, &format!("{preference}dummy"));
            }
        }

        let channel_count = self.inner.config.read().sfx_channel_count;
        self.rebuild_channel_pool(channel_count);

        self.inner.refresh.start(self.inner.clone() as Arc<dyn Refreshable>);
        tracing::info!(channel_count, "audio system initialized");
    }

    /// Installs a real hardware output device (`audio-backend`'s cpal or
    /// mock backend) under `identity_key` and wires its render callback to
    /// this system's own [`AudioSystem::render_callback`]. Call after
    /// [`AudioSystem::initialize`] and before activating it for a channel
    /// type with [`AudioSystem::set_config_var`]-driven interface
    /// preferences (SS4.5) — the dummy driver installed by `initialize`
    /// always remains available as a fallback.
    /// Installs an arbitrary driver (a plugin driver resolved via
    /// [`crate::driver::DriverRegistry::load_plugin`], or any other
    /// `Driver` impl a host constructs directly) ahead of
    /// [`AudioSystem::initialize_with_preferences`], so its identity key can
    /// appear in a `-icd`/`-imusic`/`-isfx` preference list and win
    /// activation over the dummy fallback.
    pub fn install_driver(&self, driver: Arc<dyn Driver>) -> Result<(), AudioError> {
        self.inner.drivers.lock().install(driver)
    }

    pub fn install_hardware_driver(&self, identity_key: &str) -> Result<(), AudioError> {
        let driver = Arc::new(HardwareDriver::new(identity_key, audio_backend::create_audio_backend));
        self.inner.drivers.lock().install(driver.clone())?;
        driver.initialize()?;

        let weak = Arc::downgrade(&self.inner);
        driver.with_backend(move |backend| {
            let channels = backend.channels().max(1) as usize;
            let render: audio_backend::RenderFn = Arc::new(move |out, rate, _frames| {
                if let Some(inner) = weak.upgrade() {
                    AudioSystem { inner }.render_callback(out, rate, channels);
                } else {
                    out.fill(0.0);
                }
            });
            if let Err(e) = backend.start(render) {
                tracing::warn!(identity_key, error = %e, "failed to start hardware backend");
            }
        });
        Ok(())
    }

    fn rebuild_channel_pool(&self, sfx_channels: u16) {
        let mut pool = self.inner.pool.lock();
        let mut mixer = self.inner.mixer.lock();
        pool.channels.clear();
        mixer.clear_tracks();

        let (no_music, no_sfx) = {
            let config = self.inner.config.read();
            (config.no_music, config.no_sfx)
        };

        let drivers = self.inner.drivers.lock();

        if !no_sfx {
            if let Some(sound_iface) = drivers.active_for(ChannelKind::Sound).first().copied().cloned() {
                if let Some(driver) = drivers.find_driver(
                    sound_iface.identity_key.split('.').next().unwrap_or(&sound_iface.identity_key),
                ) {
                    mixer.make_track(FX_TRACK, None);
                    for _ in 0..sfx_channels {
                        let channel = driver.make_channel(ChannelKind::Sound);
                        let id = pool.push(channel);
                        mixer.add_channel(FX_TRACK, id);
                    }
                }
            }
        }

        if no_music {
            self.inner.reset_render_voices(pool.channels.len());
            return;
        }

        if let Some(music_iface) = drivers.active_for(ChannelKind::Music).first() {
            if let Some(driver) =
                drivers.find_driver(music_iface.identity_key.split('.').next().unwrap_or(&music_iface.identity_key))
            {
                let channel = driver.make_channel(ChannelKind::Music);
                let id = pool.push(channel);
                mixer.make_track(MUSIC_TRACK, Some(id));
            }
        }
        if let Some(cd_iface) = drivers.active_for(ChannelKind::Cd).first() {
            if let Some(driver) =
                drivers.find_driver(cd_iface.identity_key.split('.').next().unwrap_or(&cd_iface.identity_key))
            {
                let channel = driver.make_channel(ChannelKind::Cd);
                let id = pool.push(channel);
                mixer.make_track(CD_TRACK, Some(id));
            }
        }
        self.inner.reset_render_voices(pool.channels.len());
    }

    fn find_channel_index(pool: &ChannelPool, kind: ChannelKind) -> Option<usize> {
        pool.channels.iter().position(|c| c.kind() == kind)
    }

    /// Starts music playback per `SPEC_FULL.md` SS4.10's `playmusic` console
    /// command: a lump name or external file path plays on the Music
    /// channel, a CD track number plays on the Cd channel. Returns `false`
    /// (the "0/None" failure behavior SS7 describes) if no channel of the
    /// needed kind was ever built — e.g. no driver activated that interface.
    pub fn play_music(&self, request: MusicRequest) -> bool {
        let mut pool = self.inner.pool.lock();
        match request {
            MusicRequest::Lump(name) | MusicRequest::File(name) => {
                let Some(idx) = Self::find_channel_index(&pool, ChannelKind::Music) else {
                    return false;
                };
                if let Channel::Music(m) = &mut pool.channels[idx] {
                    m.bind_file(name);
                    m.play();
                }
                true
            }
            MusicRequest::CdTrack(track) => {
                let Some(idx) = Self::find_channel_index(&pool, ChannelKind::Cd) else {
                    return false;
                };
                if let Channel::Cd(c) = &mut pool.channels[idx] {
                    c.play_track(track);
                }
                true
            }
        }
    }

    /// Stops whichever of the Music/Cd channels is currently carrying music.
    pub fn stop_music(&self) -> bool {
        let mut pool = self.inner.pool.lock();
        let mut stopped = false;
        for channel in pool.channels.iter_mut() {
            match channel {
                Channel::Music(m) if m.is_playing() => {
                    m.stop();
                    stopped = true;
                }
                Channel::Cd(c) if c.is_playing() => {
                    c.stop();
                    stopped = true;
                }
                _ => {}
            }
        }
        stopped
    }

    pub fn pause_music(&self) -> bool {
        let mut pool = self.inner.pool.lock();
        let mut paused = false;
        for channel in pool.channels.iter_mut() {
            match channel {
                Channel::Music(m) if m.is_playing() => {
                    m.pause();
                    paused = true;
                }
                Channel::Cd(c) if c.is_playing() => {
                    c.pause();
                    paused = true;
                }
                _ => {}
            }
        }
        paused
    }

    pub fn resume_music(&self) -> bool {
        let mut pool = self.inner.pool.lock();
        let mut resumed = false;
        for channel in pool.channels.iter_mut() {
            match channel {
                Channel::Music(m) if m.paused => {
                    m.play();
                    resumed = true;
                }
                Channel::Cd(c) if c.paused => {
                    c.resume();
                    resumed = true;
                }
                _ => {}
            }
        }
        resumed
    }

    pub fn deinitialize(&self) {
        self.inner.refresh.stop();
        self.inner.drivers.lock().deinitialize_all();
        self.inner.pool.lock().channels.clear();
        self.inner.mixer.lock().clear_tracks();
        self.inner.reset_render_voices(0);
    }

    pub fn config(&self) -> AudioConfig {
        self.inner.config.read().clone()
    }

    pub fn set_config_var(&self, name: &str, value: &str) {
        let mut config = self.inner.config.write();
        config.set_by_name(name, value);
        if name == "sound-rate" || name == "sound-16bit" {
            let format = TargetFormat {
                rate_hz: config.sound_rate_hz,
                bytes_per_sample: if config.sound_16bit { 2 } else { 1 },
            };
            drop(config);
            self.inner.cache.set_target_format(format);
            let channel_count = self.inner.config.read().sfx_channel_count;
            self.rebuild_channel_pool(channel_count);
        }
    }

    pub fn world_stage(&self) -> &Mutex<WorldStage> {
        &self.inner.world_stage
    }

    pub fn local_stage(&self) -> &Mutex<Stage> {
        &self.inner.local_stage
    }

    pub fn cache(&self) -> &Arc<SampleCache> {
        &self.inner.cache
    }

    pub fn events(&self) -> &Arc<AudienceBus> {
        &self.inner.events
    }

    /// Call once per frame, before game logic runs.
    pub fn frame_begin(&self) {
        self.inner.clock.mark_frame();
    }

    /// Call once per frame, after game logic runs: purges stale cache
    /// entries and logical sounds, and delivers queued audience events.
    pub fn frame_end(&self) {
        let now_ms = self.inner.clock.now_ms();
        {
            let pool = self.inner.pool.lock();
            let is_playing = |effect_id: i32| {
                pool.channels.iter().any(|c| {
                    c.as_sound()
                        .map(|s| s.playing && s.loaded_sample.as_ref().map(|sm| sm.effect_id) == Some(effect_id))
                        .unwrap_or(false)
                })
            };
            self.inner.cache.maybe_run_purge(now_ms, &is_playing);
        }
        self.inner.local_stage.lock().maybe_run_sound_purge(now_ms);
        self.inner.world_stage.lock().stage.maybe_run_sound_purge(now_ms);
        self.inner.events.drain();
    }

    /// Plays a sound on the world stage (3D, attenuated) or the local stage
    /// (always audible, e.g. UI sounds), then immediately performs channel
    /// selection (SS4.7) — this cannot be deferred to the next
    /// [`AudioSystem::frame_end`] drain because callers expect to know
    /// synchronously whether playback started.
    pub fn play_sound(&self, on_world_stage: bool, params: SoundParams, emitter: Option<EmitterId>) -> bool {
        // SS4.7 step 1: busy-mode, zero master volume, and zero sound volume
        // all drop the dispatch before it reaches channel selection.
        if self.inner.busy.load(Ordering::Relaxed) {
            tracing::debug!(effect_id = params.effect_id, "busy-mode active, dropping sound");
            return false;
        }
        let config = self.inner.config.read().clone();
        if config.no_sfx || config.sound_volume == 0 || params.volume <= 0.0 {
            return false;
        }

        let now_ms = self.inner.clock.now_ms();
        let now_tick = self.inner.clock.now_tick();

        if on_world_stage
            && !params.flags.contains(SoundFlags::NO_ORIGIN)
            && !params.flags.contains(SoundFlags::NO_VOLUME_ATTENUATION)
        {
            let world = self.inner.world_stage.lock();
            if !world.stage.listener().in_audible_range_of(params.origin) {
                tracing::debug!(effect_id = params.effect_id, "sound outside audible range, dropping");
                return false;
            }
        }

        let sfxdef = self.inner.sfxdefs.read().clone();
        let sound = if on_world_stage {
            let mut world = self.inner.world_stage.lock();
            world
                .stage
                .play_sound(params, emitter, &self.inner.cache, sfxdef.as_ref(), now_ms, now_tick)
        } else {
            let mut local = self.inner.local_stage.lock();
            local.play_sound(params, emitter, &self.inner.cache, sfxdef.as_ref(), now_ms, now_tick)
        };
        let Some(sound) = sound else { return false };

        self.inner.events.addition.publish(crate::event::Addition { effect_id: sound.effect_id });
        let def = sfxdef.lookup(sound.effect_id);
        self.dispatch_sound_to_channel(sound, def, now_ms, now_tick)
    }

    fn dispatch_sound_to_channel(&self, sound: Sound, def: Option<SfxDef>, now_ms: u64, now_tick: i64) -> bool {
        let config = self.inner.config.read().clone();

        let priority = {
            let world = self.inner.world_stage.lock();
            world
                .stage
                .listener()
                .rate_sound_priority(now_tick, sound.start_tick, sound.volume, sound.flags, sound.origin)
        };

        // Step 8: per-effect channel cap. While the count of channels
        // currently playing this effect id is at or past the cap, stop the
        // lowest-priority such instance whose priority <= the candidate's,
        // freeing a slot; if none qualifies, drop the new sound outright.
        if let Some(def) = def {
            if def.channel_cap > 0 {
                loop {
                    let mut pool = self.inner.pool.lock();
                    let playing = pool
                        .channels
                        .iter()
                        .filter(|c| {
                            c.as_sound()
                                .map(|s| s.playing && s.loaded_sample.as_ref().map(|sm| sm.effect_id) == Some(sound.effect_id))
                                .unwrap_or(false)
                        })
                        .count();
                    if (playing as u32) < def.channel_cap {
                        break;
                    }
                    let mut lowest: Option<(usize, f32)> = None;
                    for (i, ch) in pool.channels.iter().enumerate() {
                        if let Channel::Sound(s) = ch {
                            let same_effect = s.playing
                                && s.loaded_sample.as_ref().map(|sm| sm.effect_id) == Some(sound.effect_id);
                            if !same_effect {
                                continue;
                            }
                            let p = self.channel_priority(s, priority);
                            if p <= priority {
                                match lowest {
                                    Some((_, lowest_p)) if lowest_p <= p => {}
                                    _ => lowest = Some((i, p)),
                                }
                            }
                        }
                    }
                    match lowest {
                        Some((i, _)) => {
                            if let Channel::Sound(s) = &mut pool.channels[i] {
                                s.stop();
                            }
                            self.inner.sync_render_voice(i, &pool);
                        }
                        None => {
                            tracing::debug!(
                                effect_id = sound.effect_id,
                                cap = def.channel_cap,
                                "per-effect channel cap reached, nothing eligible to preempt"
                            );
                            return false;
                        }
                    }
                }
            }
        }

        let positioning = if config.sound_3d && !sound.flags.contains(SoundFlags::NO_ORIGIN) {
            Positioning::Absolute
        } else {
            Positioning::Stereo
        };
        let format = SoundFormat {
            positioning,
            bytes_per_sample: if config.sound_16bit { 2 } else { 1 },
            rate_hz: config.sound_rate_hz,
        };

        self.inner.cache.hit(sound.effect_id, now_ms);
        let Some(sample) = self.inner.cache.cache(sound.effect_id) else {
            return false;
        };

        self.inner.refresh.pause();

        // Step 5: exclusion group. The effect's definition can name a group
        // explicitly; otherwise the sample's own `group` field is used, with
        // 0 meaning "ungrouped" (the default for samples whose source never
        // set one). Any channel already playing a sample in the same group
        // is stopped before the new sound is dispatched, scoped to this
        // emitter unless the effect's definition marks the group globally
        // exclusive.
        let exclusion_group = def.and_then(|d| d.exclusion_group).or_else(|| {
            if sample.group > 0 {
                Some(sample.group)
            } else {
                None
            }
        });
        if let Some(group) = exclusion_group {
            let global = def.map(|d| d.global_exclude).unwrap_or(false);
            let mut pool = self.inner.pool.lock();
            let mut stopped = Vec::new();
            for (i, ch) in pool.channels.iter_mut().enumerate() {
                if let Channel::Sound(s) = ch {
                    let same_group = s
                        .loaded_sample
                        .as_ref()
                        .map(|sm| sm.group == group)
                        .unwrap_or(false);
                    let in_scope = global || s.emitter == sound.emitter;
                    if s.playing && same_group && in_scope {
                        s.stop();
                        stopped.push(i);
                    }
                }
            }
            for i in stopped {
                self.inner.sync_render_voice(i, &pool);
            }
        }

        // Step 4: frequency scale / random pitch. `random_shift2` takes
        // precedence over `random_shift` when both are set on the effect's
        // definition.
        let frequency_scale = if config.random_pitch {
            let range = match def {
                Some(d) if d.random_shift2 => Some(15),
                Some(d) if d.random_shift => Some(7),
                _ => None,
            };
            range
                .map(|r| 1.0 + self.inner.pitch_rng.next_shift(r) as f32 / 255.0)
                .unwrap_or(1.0)
        } else {
            1.0
        };

        let selected = self.select_channel(sound.effect_id, format, priority);
        let Some(idx) = selected else {
            self.inner.refresh.resume();
            tracing::debug!(effect_id = sound.effect_id, "no channel available, dropping sound");
            return false;
        };

        let dont_stop = def.map(|d| d.dont_stop).unwrap_or(false);
        let mode = if sound.flags.contains(SoundFlags::REPEAT) {
            PlayingMode::Looping
        } else if dont_stop {
            PlayingMode::OnceDontDelete
        } else {
            PlayingMode::Once
        };

        // Absolute-positioned (3D) channels derive a stereo pan from the
        // listener's bearing to the sound's origin; Stereo channels are
        // centered, matching the original's 2D fallback.
        let pan = if matches!(positioning, Positioning::Absolute) {
            let world = self.inner.world_stage.lock();
            let angle = world.stage.listener().angle_from(sound.origin);
            (angle.to_radians()).sin()
        } else {
            0.0
        };

        {
            let mut pool = self.inner.pool.lock();
            if let Channel::Sound(ch) = &mut pool.channels[idx] {
                ch.reformat(format);
                ch.load(sample.clone());
                ch.set_volume(sound.volume);
                ch.origin = sound.origin;
                ch.frequency_scale = frequency_scale;
                ch.emitter = sound.emitter;
                ch.pan = pan;
                ch.play(mode, now_ms, now_tick, sample.milliseconds() as u64);
            }
            self.inner.sync_render_voice(idx, &pool);
        }
        self.inner.refresh.resume();
        true
    }

    /// SS4.7 step 10: first-success search across four tiers, called with
    /// the refresh worker already paused.
    fn select_channel(&self, effect_id: i32, format: SoundFormat, candidate_priority: f32) -> Option<usize> {
        let mut pool = self.inner.pool.lock();

        // Tier 1: vacant, already loaded with this sample, matching format.
        for (i, ch) in pool.channels.iter().enumerate() {
            if let Channel::Sound(s) = ch {
                if !s.playing
                    && s.format == format
                    && s.loaded_sample.as_ref().map(|sm| sm.effect_id) == Some(effect_id)
                {
                    return Some(i);
                }
            }
        }
        // Tier 2: vacant, no sample loaded, matching format.
        for (i, ch) in pool.channels.iter().enumerate() {
            if let Channel::Sound(s) = ch {
                if !s.playing && s.format == format && s.loaded_sample.is_none() {
                    return Some(i);
                }
            }
        }
        // Tier 3: any vacant channel with matching format.
        for (i, ch) in pool.channels.iter().enumerate() {
            if let Channel::Sound(s) = ch {
                if !s.playing && s.format == format {
                    return Some(i);
                }
            }
        }
        // Tier 4: steal the lowest-priority playing channel with compatible
        // positioning whose priority is <= the candidate's. Insertion-order
        // iteration preserves the original's tie-break (first-encountered
        // wins among equal priorities).
        let mut best: Option<(usize, f32)> = None;
        for (i, ch) in pool.channels.iter().enumerate() {
            if let Channel::Sound(s) = ch {
                if s.playing && s.format.positioning == format.positioning {
                    let p = self.channel_priority(s, candidate_priority);
                    if p <= candidate_priority {
                        match best {
                            Some((_, best_p)) if best_p <= p => {}
                            _ => best = Some((i, p)),
                        }
                    }
                }
            }
        }
        if let Some((i, _)) = best {
            if let Channel::Sound(s) = &mut pool.channels[i] {
                if matches!(s.mode, PlayingMode::OnceDontDelete) {
                    s.suspend();
                } else {
                    s.stop();
                }
            }
            self.inner.sync_render_voice(i, &pool);
            return Some(i);
        }
        None
    }

    /// A playing channel's own priority is recomputed from its stored sound
    /// state each time, rather than cached, since it decays with age.
    fn channel_priority(&self, channel: &crate::channel::SoundChannelState, _candidate_priority: f32) -> f32 {
        let now_tick = self.inner.clock.now_tick();
        let world = self.inner.world_stage.lock();
        world.stage.listener().rate_sound_priority(
            now_tick,
            channel.start_tick,
            channel.volume,
            SoundFlags::empty(),
            channel.origin,
        )
    }

    /// Real-time render callback: mixes every playing sound channel's PCM
    /// into `out` (interleaved `channels`-wide f32), applying per-channel
    /// volume and a simple stereo pan derived from panning position.
    /// Frequency scaling uses nearest-neighbor resampling — adequate given
    /// this crate's sample-accurate correctness is already spent in the
    /// cache's upsampling step (SS4.1); this is just the final mix.
    ///
    /// Never locks `pool`'s `parking_lot::Mutex` — see [`RenderVoice`]. Reads
    /// a lock-free `ArcSwap` snapshot and advances each voice's cursor
    /// through a relaxed atomic; a voice that runs off the end of its sample
    /// just stops mixing (silence) for the rest of this and every later
    /// buffer until the next refresh tick (SS4.9, ~200ms) or dispatch
    /// observes it stopped and rebuilds the snapshot without it.
    pub fn render_callback(&self, out: &mut [f32], _sample_rate: u32, out_channels: usize) {
        out.fill(0.0);
        let voices = self.inner.render_voices.load_full();
        let frames = out.len() / out_channels.max(1);

        for voice in voices.iter().flatten() {
            let step = voice.frequency_scale.max(0.0001) as f64;
            let (gain_l, gain_r) = pan_gains(voice.pan);
            let mut cursor = f64::from_bits(voice.cursor.load(Ordering::Relaxed));

            for frame in 0..frames {
                let idx = cursor as usize;
                if idx >= voice.sample.num_samples as usize {
                    if voice.looping {
                        cursor = 0.0;
                        continue;
                    } else {
                        break;
                    }
                }
                let v = read_sample_as_f32(&voice.sample, idx) * voice.volume;
                let base = frame * out_channels;
                if out_channels >= 2 {
                    out[base] += v * gain_l;
                    out[base + 1] += v * gain_r;
                } else if out_channels == 1 {
                    out[base] += v;
                }
                cursor += step;
            }
            voice.cursor.store(cursor.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn list_drivers(&self) -> Vec<String> {
        self.inner.drivers.lock().drivers().iter().map(|d| d.title()).collect()
    }

    pub fn describe(&self) -> String {
        let drivers = self.inner.drivers.lock();
        format!(
            "{} driver(s) installed, {} interface(s) active",
            drivers.drivers().len(),
            drivers.active_interfaces().len()
        )
    }

    pub fn inspect_driver(&self, identity_key: &str) -> Result<String, AudioError> {
        let drivers = self.inner.drivers.lock();
        let driver = drivers
            .find_driver(identity_key)
            .ok_or_else(|| AudioError::MissingDriver(identity_key.to_string()))?;
        Ok(format!(
            "{}: {} ({} interface(s))",
            driver.title(),
            match driver.status() {
                DriverStatus::Loaded => "loaded",
                DriverStatus::Initialized => "initialized",
            },
            driver.list_interfaces().len()
        ))
    }
}

fn pan_gains(pan: f32) -> (f32, f32) {
    let p = pan.clamp(-1.0, 1.0);
    ((1.0 - p.max(0.0)).sqrt(), (1.0 + p.min(0.0)).sqrt())
}

fn read_sample_as_f32(sample: &crate::sample::Sample, idx: usize) -> f32 {
    if sample.bytes_per_sample == 2 {
        let off = idx * 2;
        if off + 1 >= sample.data.len() {
            return 0.0;
        }
        i16::from_le_bytes([sample.data[off], sample.data[off + 1]]) as f32 / 32768.0
    } else {
        if idx >= sample.data.len() {
            return 0.0;
        }
        (sample.data[idx] as f32 - 128.0) / 128.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RawSample;

    struct ToneSource;
    impl SampleSource for ToneSource {
        fn load(&self, effect_id: i32) -> Option<RawSample> {
            Some(RawSample {
                effect_id,
                group: 0,
                bytes_per_sample: 1,
                rate_hz: 11025,
                num_samples: 1102, // ~100ms
                data: vec![200u8; 1102],
            })
        }
    }

    fn system() -> AudioSystem {
        let sys = AudioSystem::new(Arc::new(ToneSource), AudioConfig::default());
        sys.initialize();
        sys
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
    fn basic_playback_allocates_a_channel() {
        let sys = system();
        assert!(sys.play_sound(false, params(1), None));
        let pool = sys.inner.pool.lock();
        assert!(pool.channels.iter().any(|c| c.as_sound().map(|s| s.playing).unwrap_or(false)));
    }

    #[test]
    fn zero_volume_sound_never_allocates() {
        let sys = system();
        let mut p = params(1);
        p.volume = 0.0;
        assert!(!sys.play_sound(false, p, None));
    }

    #[test]
    fn priority_preemption_steals_lowest_priority_channel_when_full() {
        let sys = system();
        let count = sys.inner.config.read().sfx_channel_count as i32;
        for id in 1..=count {
            let mut p = params(id);
            p.volume = 0.05; // low priority, ages out fast relative to a louder sound
            assert!(sys.play_sound(false, p, None));
        }
        let mut loud = params(9999);
        loud.volume = 1.0;
        assert!(sys.play_sound(false, loud, None));
    }

    #[test]
    fn all_channels_full_with_equal_or_higher_priority_drops_new_sound() {
        let sys = system();
        let count = sys.inner.config.read().sfx_channel_count as i32;
        for id in 1..=count {
            let mut p = params(id);
            p.volume = 1.0;
            assert!(sys.play_sound(false, p, None));
        }
        let mut quiet = params(9999);
        quiet.volume = 0.01;
        assert!(!sys.play_sound(false, quiet, None));
    }

    #[test]
    fn render_callback_produces_nonzero_output_while_playing() {
        let sys = system();
        assert!(sys.play_sound(false, params(1), None));
        let mut buf = vec![0.0f32; 256];
        sys.render_callback(&mut buf, 11025, 2);
        assert!(buf.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn set_config_var_sound_rate_clears_cache_and_rebuilds_pool() {
        let sys = system();
        sys.play_sound(false, params(1), None);
        assert!(sys.inner.cache.item_count() > 0);
        sys.set_config_var("sound-rate", "22050");
        assert_eq!(sys.inner.cache.item_count(), 0);
        assert_eq!(sys.config().sound_rate_hz, 22050);
    }

    struct GroupedSource;
    impl SampleSource for GroupedSource {
        fn load(&self, effect_id: i32) -> Option<RawSample> {
            Some(RawSample {
                effect_id,
                group: 7, // every effect in this fixture shares one exclusion group
                bytes_per_sample: 1,
                rate_hz: 11025,
                num_samples: 11025, // 1000ms, long enough to still be playing
                data: vec![200u8; 11025],
            })
        }
    }

    #[test]
    fn exclusion_group_stops_earlier_channel_for_same_emitter() {
        let sys = AudioSystem::new(Arc::new(GroupedSource), AudioConfig::default());
        sys.initialize();
        assert!(sys.play_sound(false, params(1), Some(42)));
        assert!(sys.play_sound(false, params(2), Some(42)));
        let pool = sys.inner.pool.lock();
        let playing: Vec<_> = pool
            .channels
            .iter()
            .filter_map(Channel::as_sound)
            .filter(|s| s.playing)
            .collect();
        assert_eq!(playing.len(), 1);
        assert_eq!(playing[0].loaded_sample.as_ref().unwrap().effect_id, 2);
    }

    #[test]
    fn exclusion_group_ignores_other_emitters() {
        let sys = AudioSystem::new(Arc::new(GroupedSource), AudioConfig::default());
        sys.initialize();
        assert!(sys.play_sound(false, params(1), Some(1)));
        assert!(sys.play_sound(false, params(2), Some(2)));
        let pool = sys.inner.pool.lock();
        let playing_count = pool
            .channels
            .iter()
            .filter_map(Channel::as_sound)
            .filter(|s| s.playing)
            .count();
        assert_eq!(playing_count, 2);
    }

    struct CappingDefSource;
    impl SfxDefSource for CappingDefSource {
        fn lookup(&self, _effect_id: i32) -> Option<SfxDef> {
            Some(SfxDef {
                channel_cap: 1,
                ..Default::default()
            })
        }
    }

    #[test]
    fn per_effect_channel_cap_preempts_a_stoppable_instance() {
        let sys = system();
        sys.set_sfx_def_source(Arc::new(CappingDefSource));
        assert!(sys.play_sound(false, params(5), None));
        // Same priority as the first instance, so it qualifies for
        // preemption rather than being rejected outright.
        assert!(sys.play_sound(false, params(5), None));
        let pool = sys.inner.pool.lock();
        let playing = pool
            .channels
            .iter()
            .filter_map(Channel::as_sound)
            .filter(|s| s.playing && s.loaded_sample.as_ref().map(|sm| sm.effect_id) == Some(5))
            .count();
        assert_eq!(playing, 1, "the cap still holds after preemption");
    }

    #[test]
    fn per_effect_channel_cap_drops_when_nothing_can_be_preempted() {
        let sys = system();
        sys.set_sfx_def_source(Arc::new(CappingDefSource));
        let mut loud = params(5);
        loud.volume = 1.0;
        assert!(sys.play_sound(false, loud, None));
        let mut quiet = params(5);
        quiet.volume = 0.01;
        assert!(!sys.play_sound(false, quiet, None));
    }

    struct PitchDefSource;
    impl SfxDefSource for PitchDefSource {
        fn lookup(&self, _effect_id: i32) -> Option<SfxDef> {
            Some(SfxDef {
                random_shift2: true,
                ..Default::default()
            })
        }
    }

    #[test]
    fn random_pitch_scales_frequency_within_expected_band() {
        let sys = system();
        sys.set_sfx_def_source(Arc::new(PitchDefSource));
        assert!(sys.play_sound(false, params(1), None));
        let pool = sys.inner.pool.lock();
        let scale = pool
            .channels
            .iter()
            .filter_map(Channel::as_sound)
            .find(|s| s.playing)
            .unwrap()
            .frequency_scale;
        assert!((1.0 - 15.0 / 255.0..=1.0 + 15.0 / 255.0).contains(&scale));
    }

    #[test]
    fn disabling_random_pitch_keeps_frequency_scale_unchanged() {
        let sys = system();
        sys.set_sfx_def_source(Arc::new(PitchDefSource));
        sys.inner.config.write().random_pitch = false;
        assert!(sys.play_sound(false, params(1), None));
        let pool = sys.inner.pool.lock();
        let scale = pool
            .channels
            .iter()
            .filter_map(Channel::as_sound)
            .find(|s| s.playing)
            .unwrap()
            .frequency_scale;
        assert_eq!(scale, 1.0);
    }

    #[test]
    fn sample_eviction_resets_channel_that_had_it_loaded() {
        let sys = system();
        assert!(sys.play_sound(false, params(1), None));
        sys.inner.cache.clear();
        sys.inner.events.drain();
        let pool = sys.inner.pool.lock();
        assert!(pool.channels.iter().filter_map(Channel::as_sound).all(|s| !s.playing));
    }

    #[test]
    fn rebuild_channel_pool_populates_mixer_tracks() {
        let sys = system();
        let mixer = sys.inner.mixer.lock();
        assert!(mixer.try_find_track("fx").unwrap().channel_count() > 0);
        assert!(mixer.try_find_track("music").unwrap().channel_count() > 0);
    }

    #[test]
    fn nomusic_flag_skips_attaching_music_and_cd_channels() {
        let mut config = AudioConfig::default();
        config.no_music = true;
        let sys = AudioSystem::new(Arc::new(ToneSource), config);
        sys.initialize();
        let mixer = sys.inner.mixer.lock();
        assert!(mixer.try_find_track("fx").unwrap().channel_count() > 0);
        assert!(mixer.try_find_track("music").is_none());
        assert!(mixer.try_find_track("cd").is_none());
    }

    #[test]
    fn nosfx_flag_skips_attaching_sound_channels() {
        let mut config = AudioConfig::default();
        config.no_sfx = true;
        let sys = AudioSystem::new(Arc::new(ToneSource), config);
        sys.initialize();
        let mixer = sys.inner.mixer.lock();
        assert!(mixer.try_find_track("fx").is_none());
        assert!(mixer.try_find_track("music").unwrap().channel_count() > 0);
    }

    #[test]
    fn play_music_binds_and_starts_the_music_channel() {
        let sys = system();
        assert!(sys.play_music(MusicRequest::Lump("d_runnin".to_string())));
        let pool = sys.inner.pool.lock();
        let music = pool.channels.iter().find_map(|c| match c {
            Channel::Music(m) => Some(m),
            _ => None,
        });
        assert!(music.unwrap().is_playing());
    }

    #[test]
    fn pause_then_resume_music_round_trips() {
        let sys = system();
        assert!(sys.play_music(MusicRequest::File("theme.ogg".to_string())));
        assert!(sys.pause_music());
        assert!(sys.resume_music());
        let pool = sys.inner.pool.lock();
        let music = pool.channels.iter().find_map(|c| match c {
            Channel::Music(m) => Some(m),
            _ => None,
        });
        assert!(music.unwrap().is_playing());
    }

    #[test]
    fn stop_music_clears_playing_state() {
        let sys = system();
        assert!(sys.play_music(MusicRequest::Lump("d_runnin".to_string())));
        assert!(sys.stop_music());
        assert!(!sys.stop_music(), "nothing left to stop the second time");
    }

    #[test]
    fn cd_track_request_plays_on_the_cd_channel() {
        let sys = system();
        assert!(sys.play_music(MusicRequest::CdTrack(3)));
        let pool = sys.inner.pool.lock();
        let cd = pool.channels.iter().find_map(|c| match c {
            Channel::Cd(c) => Some(c),
            _ => None,
        });
        assert_eq!(cd.unwrap().track, Some(3));
    }

    struct NamedDriver {
        key: String,
        inner: DummyDriver,
    }

    impl Driver for NamedDriver {
        fn identity_keys(&self) -> Vec<String> {
            vec![self.key.clone()]
        }
        fn title(&self) -> String {
            format!("Named Driver ({})", self.key)
        }
        fn status(&self) -> DriverStatus {
            self.inner.status()
        }
        fn initialize(&self) -> Result<(), AudioError> {
            self.inner.initialize()
        }
        fn deinitialize(&self) {
            self.inner.deinitialize()
        }
        fn list_interfaces(&self) -> Vec<crate::driver::InterfaceRecord> {
            vec![crate::driver::InterfaceRecord {
                identity_key: format!("{}.sfx", self.key),
                channel_type: ChannelKind::Sound,
            }]
        }
        fn make_channel(&self, kind: ChannelKind) -> Channel {
            self.inner.make_channel(kind)
        }
        fn allow_refresh(&self, allow: bool) {
            self.inner.allow_refresh(allow)
        }
    }

    #[test]
    fn preference_list_activates_installed_driver_over_dummy_fallback() {
        let sys = AudioSystem::new(Arc::new(ToneSource), AudioConfig::default());
        sys.install_driver(Arc::new(NamedDriver {
            key: "customdrv".to_string(),
            inner: DummyDriver::new(),
        }))
        .unwrap();
        sys.initialize_with_preferences(&crate::config::CliInterfacePreferences {
            sfx: "customdrv;".to_string(),
            ..Default::default()
        });
        let drivers = sys.inner.drivers.lock();
        let active = drivers.active_for(ChannelKind::Sound);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].identity_key, "customdrv.sfx");
    }

    #[test]
    fn empty_preference_list_falls_back_to_dummy() {
        let sys = system();
        let drivers = sys.inner.drivers.lock();
        let active = drivers.active_for(ChannelKind::Sound);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].identity_key, "dummy.sfx");
    }

    #[cfg(feature = "mock-audio")]
    #[test]
    fn install_hardware_driver_registers_and_initializes() {
        let sys = system();
        sys.install_hardware_driver("mockdev").unwrap();
        let drivers = sys.inner.drivers.lock();
        let driver = drivers.find_driver("mockdev").unwrap();
        assert_eq!(driver.status(), DriverStatus::Initialized);
    }
}
