//! Concurrent, driver-pluggable sound and music runtime for a game engine.
//!
//! This crate is the core described in `SPEC_FULL.md`: a [`stage::Stage`]
//! holding logical sounds and a [`listener::Listener`], a [`cache::SampleCache`]
//! that converts and bounds waveform memory, a [`mixer::Mixer`] grouping
//! [`channel::Channel`]s owned by a [`driver::Driver`], a background
//! [`refresh::RefreshWorker`], and [`system::AudioSystem`] tying all of it
//! together behind the channel-selection algorithm in `system.rs`.
//!
//! Nothing here resolves file paths, decodes WAV/lump bytes, or parses
//! sound-definition files — those are external collaborators the host
//! supplies through the [`cache::SampleSource`] and [`sfxdef::SfxDefSource`]
//! traits (see `SPEC_FULL.md` SS1).

pub mod cache;
pub mod channel;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod listener;
pub mod mixer;
pub mod refresh;
pub mod sample;
pub mod sfxdef;
pub mod stage;
pub mod system;
pub mod time;

pub use error::AudioError;
pub use system::{AudioSystem, MusicRequest};
