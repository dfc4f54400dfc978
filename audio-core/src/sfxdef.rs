//! Sound-definition overrides consulted by `Stage::play_sound` and
//! `AudioSystem`'s channel-selection algorithm (`SPEC_FULL.md` SS4.4/SS4.7).
//!
//! Definition-file parsing is an external collaborator (SS1): the game's
//! asset layer owns the on-disk format and hands the core `SfxDef` records by
//! lookup, the same way `cache::SampleSource` hands it raw PCM bytes. This
//! module only defines the shape of that record and the trait used to fetch
//! it; `NullSfxDefSource` is the default when no definition table has been
//! configured, so every override degrades to "use the caller's own params".

/// Per-effect overrides sourced from the (external) sound-definition table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SfxDef {
    /// Forces looping playback regardless of the caller's own flags.
    pub repeat: bool,
    /// Forces `NoVolumeAttenuation` regardless of the caller's own flags.
    pub no_volume_attenuation: bool,
    /// Multiplies the caller-supplied volume if set.
    pub volume_scale: Option<f32>,
    /// Upper bound on concurrently playing channels for this effect id.
    /// `0` means uncapped.
    pub channel_cap: u32,
    /// Channels playing any effect in the same exclusion group are stopped
    /// when this effect starts (SS4.7 step 5). `None` disables the policy.
    pub exclusion_group: Option<i32>,
    /// When set, exclusion-group stopping ignores emitter identity and stops
    /// every channel in the group process-wide.
    pub global_exclude: bool,
    /// Played in `OnceDontDelete` mode: preemption suspends rather than
    /// steals the channel (SS4.7 step 10, SS4.8).
    pub dont_stop: bool,
    /// +/-7/255 pseudo-random pitch shift (SS4.7 step 4).
    pub random_shift: bool,
    /// +/-15/255 pseudo-random pitch shift; takes precedence over
    /// `random_shift` if both are set.
    pub random_shift2: bool,
}

/// Supplies [`SfxDef`] overrides by effect id. Implemented by whatever asset
/// layer sits above this crate; `NullSfxDefSource` is used in tests and when
/// no definition table has been configured.
pub trait SfxDefSource: Send + Sync {
    fn lookup(&self, effect_id: i32) -> Option<SfxDef>;
}

pub struct NullSfxDefSource;

impl SfxDefSource for NullSfxDefSource {
    fn lookup(&self, _effect_id: i32) -> Option<SfxDef> {
        None
    }
}
