//! Raw hardware output device abstraction.
//!
//! This crate knows nothing about sounds, channels, or mixing policy — it
//! only owns a real-time output stream and calls back into a render
//! function supplied by the driver layer above it (see `audio-core::driver`).
//! Keeping this split means audio-core's channel-selection and refresh logic
//! can be exercised against `mock-audio` without ever touching a sound card.

use std::fmt;
use std::sync::Arc;

#[cfg(feature = "mock-audio")]
pub mod mock_backend;

#[cfg(not(feature = "mock-audio"))]
pub mod cpal_backend;

/// Failure modes a backend can report. Never propagated to gameplay code —
/// `audio-core::driver` logs these and falls back to the dummy driver.
#[derive(Debug)]
pub enum BackendError {
    DeviceNotFound,
    UnsupportedFormat(String),
    StreamCreationFailed,
    PlaybackError(String),
    Other(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::DeviceNotFound => write!(f, "no output device found"),
            BackendError::UnsupportedFormat(s) => write!(f, "unsupported format: {s}"),
            BackendError::StreamCreationFailed => write!(f, "stream creation failed"),
            BackendError::PlaybackError(s) => write!(f, "playback error: {s}"),
            BackendError::Other(s) => write!(f, "{s}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Called on the real-time audio thread to fill the interleaved output buffer.
/// Must never block or allocate.
pub type RenderFn = Arc<dyn Fn(&mut [f32], u32, usize) + Send + Sync + 'static>;

/// Non-realtime diagnostics, delivered from a worker thread, never from the
/// audio callback itself.
#[derive(Debug, Clone)]
pub enum DiagnosticEvent {
    XRun { count: u32 },
    DeviceRemoved,
    BufferSizeChanged { frames: usize },
    Other(String),
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticEvent::XRun { count } => write!(f, "XRun(count={count})"),
            DiagnosticEvent::DeviceRemoved => write!(f, "DeviceRemoved"),
            DiagnosticEvent::BufferSizeChanged { frames } => {
                write!(f, "BufferSizeChanged(frames={frames})")
            }
            DiagnosticEvent::Other(s) => write!(f, "Other({s})"),
        }
    }
}

pub type DiagnosticsCb = Arc<dyn Fn(DiagnosticEvent) + Send + Sync + 'static>;

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub sample_rate: u32,
    pub buffer_size: usize,
    pub channels: u16,
    pub device_name: Option<String>,
}

pub trait DeviceInfoProvider {
    fn get_device_name(&self) -> Option<&str>;
}

/// The contract a hardware output device must satisfy.
pub trait AudioBackend: Send {
    fn start(&mut self, render: RenderFn) -> Result<(), BackendError>;
    fn stop(&mut self) -> Result<(), BackendError>;
    fn sample_rate(&self) -> u32;
    fn buffer_size(&self) -> usize;
    fn channels(&self) -> u16;
    /// Frames written since the last `start`. 0 if not running.
    fn frames_since_start(&self) -> u64;
    fn set_diagnostics_callback(&mut self, cb: Option<DiagnosticsCb>);
    fn as_device_info_provider(&self) -> Option<&dyn DeviceInfoProvider>;
}

#[cfg(not(feature = "mock-audio"))]
pub fn create_audio_backend() -> Result<Box<dyn AudioBackend>, BackendError> {
    let backend = cpal_backend::CpalAudioBackend::new()?;
    tracing::info!(
        sample_rate = backend.sample_rate(),
        buffer_size = backend.buffer_size(),
        channels = backend.channels(),
        "cpal backend initialized"
    );
    Ok(Box::new(backend))
}

#[cfg(feature = "mock-audio")]
pub fn create_audio_backend() -> Result<Box<dyn AudioBackend>, BackendError> {
    let backend = mock_backend::MockAudioBackend::new();
    tracing::info!("mock backend initialized");
    Ok(Box::new(backend))
}

/// Lets dependent crates' tests confirm which variant was compiled in.
pub fn is_mock_backend_enabled() -> bool {
    cfg!(feature = "mock-audio")
}
