//! The logical "ears" of a [`crate::stage::Stage`] — position, orientation,
//! tracked world object, and the derived 3D attenuation/priority math.
//!
//! Grounded on `listener.cpp`. The original observes BSP-leaf and sector
//! events directly on the tracked map object; this crate instead receives
//! position/environment updates pushed in by the host (world geometry is
//! out of scope, see `SPEC_FULL.md` SS1) and republishes change on its own
//! `AudienceBus::environment_change` audience.

use std::sync::Arc;

use crate::event::{AudienceBus, EnvironmentChange};
use crate::time::TICKRATE;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn distance_to(&self, other: Vec3) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Pushed in by the world layer whenever the listener's containing acoustic
/// space changes; the listener applies the global reverb multiplier on read.
#[derive(Debug, Clone, Copy, Default)]
pub struct Environment {
    pub volume: f32,
    pub decay: f32,
    pub damping: f32,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SoundFlags: u8 {
        const NO_ORIGIN = 1 << 0;
        const NO_VOLUME_ATTENUATION = 1 << 1;
        const REPEAT = 1 << 2;
    }
}

/// Valid range a channel's distance-based attenuation is computed over.
/// `near`/`far` in original-engine map units; left as a cvar-adjustable pair
/// per SS6 rather than compiled-in constants, even though the default
/// matches the original's `Ranged(256, 2025)`.
#[derive(Debug, Clone, Copy)]
pub struct AttenuationRange {
    pub near: f32,
    pub far: f32,
}

impl Default for AttenuationRange {
    fn default() -> Self {
        Self { near: 256.0, far: 2025.0 }
    }
}

pub struct Listener {
    tracked: Option<TrackedObject>,
    use_environment: bool,
    raw_environment: Environment,
    reverb_strength: f32,
    attenuation: AttenuationRange,
    events: Arc<AudienceBus>,
}

/// What the host tells us about the object this listener follows. World
/// geometry lookups (BSP leaf, sector) live entirely on the host side; this
/// crate only needs the derived pose and an opaque identity for dedup.
#[derive(Debug, Clone, Copy)]
pub struct TrackedObject {
    pub id: u64,
    pub position: Vec3,
    pub velocity: Vec3,
    pub yaw_deg: f32,
    pub pitch_deg: f32,
}

impl Listener {
    pub fn new(events: Arc<AudienceBus>) -> Self {
        Self {
            tracked: None,
            use_environment: false,
            raw_environment: Environment::default(),
            reverb_strength: 0.5,
            attenuation: AttenuationRange::default(),
            events,
        }
    }

    pub fn set_tracked_object(&mut self, object: Option<TrackedObject>) {
        self.tracked = object;
    }

    pub fn update_tracked_pose(&mut self, position: Vec3, velocity: Vec3, yaw_deg: f32, pitch_deg: f32) {
        if let Some(t) = &mut self.tracked {
            t.position = position;
            t.velocity = velocity;
            t.yaw_deg = yaw_deg;
            t.pitch_deg = pitch_deg;
        }
    }

    pub fn set_use_environment(&mut self, enabled: bool) {
        if self.use_environment != enabled {
            self.use_environment = enabled;
            self.notify_environment_changed();
        }
    }

    pub fn use_environment(&self) -> bool {
        self.use_environment
    }

    /// Pushed in by the host when the tracked object's containing acoustic
    /// space reports new reverb parameters.
    pub fn set_raw_environment(&mut self, env: Environment) {
        self.raw_environment = env;
        if self.use_environment {
            self.notify_environment_changed();
        }
    }

    pub fn set_reverb_strength(&mut self, strength: f32) {
        self.reverb_strength = strength.clamp(0.0, 1.5);
    }

    /// The effective environment: the raw value scaled by the global reverb
    /// cvar, matching `Listener::environment()`'s `env.volume *= reverbStrength`.
    pub fn environment(&self) -> Environment {
        if !self.use_environment || self.tracked.is_none() {
            return Environment::default();
        }
        let mut env = self.raw_environment;
        env.volume *= self.reverb_strength;
        env
    }

    fn notify_environment_changed(&self) {
        self.events.environment_change.publish(EnvironmentChange);
    }

    pub fn position(&self) -> Vec3 {
        self.tracked.map(|t| t.position).unwrap_or(Vec3::ZERO)
    }

    pub fn velocity(&self) -> Vec3 {
        self.tracked.map(|t| t.velocity).unwrap_or(Vec3::ZERO)
    }

    pub fn orientation(&self) -> (f32, f32) {
        self.tracked.map(|t| (t.yaw_deg, t.pitch_deg)).unwrap_or((0.0, 0.0))
    }

    pub fn distance_from(&self, point: Vec3) -> f64 {
        match &self.tracked {
            Some(t) => t.position.distance_to(point),
            None => 0.0,
        }
    }

    /// Bearing of `point` relative to the listener's facing, in
    /// `[0, 360)` degrees, 0 = dead ahead, 90 = to the right. Used to derive
    /// a stereo pan for `Absolute`-positioned channels; zero vector (and no
    /// tracked object) always reports 0.
    pub fn angle_from(&self, point: Vec3) -> f32 {
        let Some(t) = &self.tracked else { return 0.0 };
        let dx = point.x - t.position.x;
        let dy = point.y - t.position.y;
        if dx == 0.0 && dy == 0.0 {
            return 0.0;
        }
        let world_deg = dy.atan2(dx).to_degrees() as f32;
        let relative = world_deg - t.yaw_deg;
        relative.rem_euclid(360.0)
    }

    pub fn in_audible_range_of(&self, point: Vec3) -> bool {
        if self.tracked.is_none() {
            return true;
        }
        self.distance_from(point) <= self.attenuation.far as f64
    }

    pub fn attenuation_range(&self) -> AttenuationRange {
        self.attenuation
    }

    pub fn set_attenuation_range(&mut self, range: AttenuationRange) {
        self.attenuation = range;
    }

    /// `priority = 1000*volume - distance/2 - 1000*(now_tick - start_tick)/(5*TICKRATE)`,
    /// dropping the distance term for origin-less sounds or when nothing is
    /// tracked. Decays to ~0 after five seconds. Lower priority is stolen
    /// first; see `SPEC_FULL.md` SS4.3/SS4.7.
    pub fn rate_sound_priority(
        &self,
        now_tick: i64,
        start_tick: i64,
        volume: f32,
        flags: SoundFlags,
        origin: Vec3,
    ) -> f32 {
        let timeoff = 1000.0 * (now_tick - start_tick) as f32 / (5.0 * TICKRATE as f32);
        if self.tracked.is_none() || flags.contains(SoundFlags::NO_ORIGIN) {
            1000.0 * volume - timeoff
        } else {
            1000.0 * volume - (self.distance_from(origin) / 2.0) as f32 - timeoff
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener_with_tracker(pos: Vec3) -> Listener {
        let mut l = Listener::new(Arc::new(AudienceBus::new()));
        l.set_tracked_object(Some(TrackedObject {
            id: 1,
            position: pos,
            velocity: Vec3::ZERO,
            yaw_deg: 0.0,
            pitch_deg: 0.0,
        }));
        l
    }

    #[test]
    fn priority_drops_distance_term_without_origin() {
        let l = listener_with_tracker(Vec3 { x: 100.0, y: 0.0, z: 0.0 });
        let p = l.rate_sound_priority(0, 0, 1.0, SoundFlags::NO_ORIGIN, Vec3::ZERO);
        assert_eq!(p, 1000.0);
    }

    #[test]
    fn priority_decays_to_roughly_zero_after_five_seconds() {
        let l = listener_with_tracker(Vec3::ZERO);
        let now_tick = 5 * TICKRATE as i64;
        let p = l.rate_sound_priority(now_tick, 0, 1.0, SoundFlags::empty(), Vec3::ZERO);
        assert!(p.abs() < 1.0, "expected near-zero decay, got {p}");
    }

    #[test]
    fn priority_without_tracked_object_ignores_distance() {
        let l = Listener::new(Arc::new(AudienceBus::new()));
        let p = l.rate_sound_priority(0, 0, 0.5, SoundFlags::empty(), Vec3 { x: 9999.0, y: 0.0, z: 0.0 });
        assert_eq!(p, 500.0);
    }

    #[test]
    fn environment_applies_reverb_strength() {
        let mut l = listener_with_tracker(Vec3::ZERO);
        l.set_use_environment(true);
        l.set_reverb_strength(0.5);
        l.set_raw_environment(Environment { volume: 1.0, decay: 0.0, damping: 0.0 });
        assert_eq!(l.environment().volume, 0.5);
    }

    #[test]
    fn without_tracked_object_in_audible_range_is_always_true() {
        let l = Listener::new(Arc::new(AudienceBus::new()));
        assert!(l.in_audible_range_of(Vec3 { x: 1_000_000.0, y: 0.0, z: 0.0 }));
    }

    #[test]
    fn angle_from_is_zero_dead_ahead() {
        let l = listener_with_tracker(Vec3::ZERO);
        assert_eq!(l.angle_from(Vec3 { x: 100.0, y: 0.0, z: 0.0 }), 0.0);
    }

    #[test]
    fn angle_from_wraps_into_0_360() {
        let l = listener_with_tracker(Vec3::ZERO);
        let angle = l.angle_from(Vec3 { x: 0.0, y: -100.0, z: 0.0 });
        assert!((0.0..360.0).contains(&angle));
    }

    #[test]
    fn angle_from_without_tracked_object_is_zero() {
        let l = Listener::new(Arc::new(AudienceBus::new()));
        assert_eq!(l.angle_from(Vec3 { x: 5.0, y: 5.0, z: 0.0 }), 0.0);
    }
}
