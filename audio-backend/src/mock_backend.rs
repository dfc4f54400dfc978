use crate::DeviceInfoProvider;
use crate::{AudioBackend, BackendError, DeviceInfo, DiagnosticsCb, RenderFn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A Send-safe stand-in device used by tests and headless hosts. Every call
/// succeeds; nothing is ever actually played.
pub struct MockAudioBackend {
    info: DeviceInfo,
    render: Arc<Mutex<Option<RenderFn>>>,
    frames: AtomicU64,
    diagnostics: Option<DiagnosticsCb>,
}

impl MockAudioBackend {
    pub fn new() -> Self {
        Self {
            info: DeviceInfo {
                sample_rate: 44100,
                buffer_size: 512,
                channels: 2,
                device_name: Some("mock-device".to_string()),
            },
            render: Arc::new(Mutex::new(None)),
            frames: AtomicU64::new(0),
            diagnostics: None,
        }
    }

    /// Test hook: synchronously pump one render callback, as the real device
    /// would from its hardware thread.
    pub fn pump(&self, buf: &mut [f32]) {
        let guard = self.render.lock().unwrap();
        if let Some(render) = guard.as_ref() {
            let frames = buf.len() / self.info.channels as usize;
            render(buf, self.info.sample_rate, frames);
            self.frames.fetch_add(frames as u64, Ordering::Relaxed);
        }
    }
}

impl Default for MockAudioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for MockAudioBackend {
    fn start(&mut self, render: RenderFn) -> Result<(), BackendError> {
        *self.render.lock().unwrap() = Some(render);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        *self.render.lock().unwrap() = None;
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }
    fn buffer_size(&self) -> usize {
        self.info.buffer_size
    }
    fn channels(&self) -> u16 {
        self.info.channels
    }
    fn frames_since_start(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
    fn set_diagnostics_callback(&mut self, cb: Option<DiagnosticsCb>) {
        self.diagnostics = cb;
    }
    fn as_device_info_provider(&self) -> Option<&dyn DeviceInfoProvider> {
        Some(self)
    }
}

impl DeviceInfoProvider for MockAudioBackend {
    fn get_device_name(&self) -> Option<&str> {
        self.info.device_name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn start_then_pump_invokes_render() {
        let mut backend = MockAudioBackend::new();
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        backend
            .start(Arc::new(move |buf: &mut [f32], _rate, _frames| {
                called2.store(true, Ordering::SeqCst);
                buf.iter_mut().for_each(|s| *s = 1.0);
            }))
            .unwrap();
        let mut buf = vec![0.0f32; 4];
        backend.pump(&mut buf);
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(backend.frames_since_start(), 2);
    }

    #[test]
    fn stop_silences_further_pumps() {
        let mut backend = MockAudioBackend::new();
        backend
            .start(Arc::new(|buf: &mut [f32], _r, _f| buf.fill(1.0)))
            .unwrap();
        backend.stop().unwrap();
        let mut buf = vec![0.0f32; 4];
        backend.pump(&mut buf);
        assert_eq!(buf, vec![0.0; 4]);
    }
}
