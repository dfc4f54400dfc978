//! Configuration variables and CLI flags (`SPEC_FULL.md` SS6).
//!
//! Modeled as a typed struct with validating setters, rather than loose
//! cvars scattered across translation units as in the original engine —
//! but registered under the same string names external tooling expects, via
//! [`AudioConfig::set_by_name`].

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MusicSource {
    Lump,
    ExternalFile,
    Cd,
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sound_volume: u8,
    pub music_volume: u8,
    pub reverb_volume: f32,
    pub sound_rate_hz: u32,
    pub sound_16bit: bool,
    pub sound_3d: bool,
    pub overlap_stop: bool,
    pub music_source: MusicSource,
    pub music_soundfont: Option<String>,
    pub sfx_channel_count: u16,
    pub random_pitch: bool,
    pub no_audio: bool,
    pub no_music: bool,
    pub no_sfx: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sound_volume: 255,
            music_volume: 255,
            reverb_volume: 0.5,
            sound_rate_hz: 11025,
            sound_16bit: false,
            sound_3d: false,
            overlap_stop: false,
            music_source: MusicSource::Lump,
            music_soundfont: None,
            sfx_channel_count: 16,
            random_pitch: true,
            no_audio: false,
            no_music: false,
            no_sfx: false,
        }
    }
}

impl AudioConfig {
    /// `sound-rate` only accepts 11025/22050/44100; anything else is
    /// corrected to 11025 with a warning, matching SS6.
    pub fn set_sound_rate(&mut self, hz: u32) {
        self.sound_rate_hz = match hz {
            11025 | 22050 | 44100 => hz,
            other => {
                tracing::warn!(requested = other, "invalid sound-rate, falling back to 11025");
                11025
            }
        };
    }

    pub fn set_reverb_volume(&mut self, v: f32) {
        self.reverb_volume = v.clamp(0.0, 1.5);
    }

    pub fn set_sfx_channel_count(&mut self, n: u16) {
        self.sfx_channel_count = n.clamp(1, 256);
    }

    /// Applies a config variable by its registered string name. Unknown
    /// names and malformed values are logged and ignored rather than
    /// propagated as an error, matching the console-variable system's
    /// tolerance for bad input from the user.
    pub fn set_by_name(&mut self, name: &str, value: &str) {
        match name {
            "sound-volume" => self.apply_u8(name, value, |c, v| c.sound_volume = v),
            "music-volume" => self.apply_u8(name, value, |c, v| c.music_volume = v),
            "sound-reverb-volume" => self.apply_f32(name, value, |c, v| c.set_reverb_volume(v)),
            "sound-rate" => self.apply_u32(name, value, |c, v| c.set_sound_rate(v)),
            "sound-16bit" => self.apply_bool(name, value, |c, v| c.sound_16bit = v),
            "sound-3d" => self.apply_bool(name, value, |c, v| c.sound_3d = v),
            "sound-overlap-stop" => self.apply_bool(name, value, |c, v| c.overlap_stop = v),
            "music-source" => self.apply_music_source(value),
            "music-soundfont" => self.music_soundfont = Some(value.to_string()),
            _ => tracing::warn!(name, "unknown audio config variable"),
        }
    }

    fn apply_u8(&mut self, name: &str, value: &str, f: impl FnOnce(&mut Self, u8)) {
        match value.parse::<u8>() {
            Ok(v) => f(self, v),
            Err(_) => tracing::warn!(name, value, "expected integer 0-255"),
        }
    }

    fn apply_u32(&mut self, name: &str, value: &str, f: impl FnOnce(&mut Self, u32)) {
        match value.parse::<u32>() {
            Ok(v) => f(self, v),
            Err(_) => tracing::warn!(name, value, "expected integer"),
        }
    }

    fn apply_f32(&mut self, name: &str, value: &str, f: impl FnOnce(&mut Self, f32)) {
        match value.parse::<f32>() {
            Ok(v) => f(self, v),
            Err(_) => tracing::warn!(name, value, "expected floating point"),
        }
    }

    fn apply_bool(&mut self, name: &str, value: &str, f: impl FnOnce(&mut Self, bool)) {
        match value {
            "0" | "false" => f(self, false),
            "1" | "true" => f(self, true),
            _ => tracing::warn!(name, value, "expected 0/1"),
        }
    }

    fn apply_music_source(&mut self, value: &str) {
        self.music_source = match value {
            "0" => MusicSource::Lump,
            "1" => MusicSource::ExternalFile,
            "2" => MusicSource::Cd,
            _ => {
                tracing::warn!(value, "expected 0, 1, or 2 for music-source");
                return;
            }
        };
    }
}

/// Parses the subset of CLI flags this crate owns out of a full argument
/// list. Unrecognized arguments are left for the host to interpret.
pub fn parse_cli_flags(args: &[String]) -> AudioConfig {
    let mut config = AudioConfig::default();

    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-noaudio" | "-nosound" => config.no_audio = true,
            "-nomusic" => config.no_music = true,
            "-nosfx" => config.no_sfx = true,
            "-norndpitch" => config.random_pitch = false,
            // Interface preference lists are collected separately by
            // `parse_interface_preferences`; just skip over the value here.
            "-icd" | "-imusic" | "-isfx" => {
                iter.next();
            }
            "-sfxchan" => {
                if let Some(v) = iter.peek().and_then(|s| s.parse::<u16>().ok()) {
                    config.set_sfx_channel_count(v);
                }
            }
            _ => {}
        }
    }

    config
}

/// The driver-preference lists parsed out of `-icd`/`-imusic`/`-isfx`,
/// separate from [`AudioConfig`] since they're consumed once at driver
/// activation time rather than polled every frame.
#[derive(Debug, Default, Clone)]
pub struct CliInterfacePreferences {
    pub cd: String,
    pub music: String,
    pub sfx: String,
}

pub fn parse_interface_preferences(args: &[String]) -> CliInterfacePreferences {
    let mut prefs = CliInterfacePreferences::default();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-icd" => {
                if let Some(v) = iter.next() {
                    prefs.cd.push_str(v);
                    prefs.cd.push(';');
                }
            }
            "-imusic" => {
                if let Some(v) = iter.next() {
                    prefs.music.push_str(v);
                    prefs.music.push(';');
                }
            }
            "-isfx" => {
                if let Some(v) = iter.next() {
                    prefs.sfx.push_str(v);
                    prefs.sfx.push(';');
                }
            }
            _ => {}
        }
    }
    prefs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sound_rate_corrects_to_11025() {
        let mut c = AudioConfig::default();
        c.set_sound_rate(48000);
        assert_eq!(c.sound_rate_hz, 11025);
        c.set_sound_rate(22050);
        assert_eq!(c.sound_rate_hz, 22050);
    }

    #[test]
    fn reverb_volume_clamped_to_valid_range() {
        let mut c = AudioConfig::default();
        c.set_reverb_volume(5.0);
        assert_eq!(c.reverb_volume, 1.5);
    }

    #[test]
    fn set_by_name_applies_known_and_ignores_unknown() {
        let mut c = AudioConfig::default();
        c.set_by_name("sound-volume", "100");
        assert_eq!(c.sound_volume, 100);
        c.set_by_name("not-a-real-cvar", "1");
    }

    #[test]
    fn cli_flags_collect_interface_preferences() {
        let args: Vec<String> = vec!["-isfx".into(), "openal;dummy".into(), "-nomusic".into()];
        let config = parse_cli_flags(&args);
        assert!(config.no_music);
        let prefs = parse_interface_preferences(&args);
        assert_eq!(prefs.sfx, "openal;dummy;");
    }
}
